//! Peer wire protocol messages.
//!
//! Every message on the wire is a length-prefixed frame:
//!
//! ```text
//! <length: u32 big-endian><id: u8><payload: length - 1 bytes>
//! ```
//!
//! A frame with length 0 carries no id and no payload and is a keep-alive;
//! it is represented as `None` everywhere a message can appear.
//!
//! | ID | Name           | Payload                          |
//! |----|----------------|----------------------------------|
//! | 0  | CHOKE          | empty                            |
//! | 1  | UNCHOKE        | empty                            |
//! | 2  | INTERESTED     | empty                            |
//! | 3  | NOT INTERESTED | empty                            |
//! | 4  | HAVE           | piece index (u32)                |
//! | 5  | BITFIELD       | one bit per piece, MSB-first     |
//! | 6  | REQUEST        | index, begin, length (u32 each)  |
//! | 7  | PIECE          | index, begin (u32 each), data    |
//! | 8  | CANCEL         | index, begin, length (u32 each)  |

use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;

/// Wire frame of a keep-alive: a zero length prefix and nothing else.
#[allow(dead_code)]
pub const KEEP_ALIVE_FRAME: [u8; 4] = [0; 4];

/// Ways a message can fail to parse.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("expected message id {expected}, got {actual}")]
    WrongKind { expected: MessageId, actual: MessageId },
    #[error("message payload of {len} bytes has the wrong size")]
    BadPayload { len: usize },
    #[error("piece message is for piece {actual}, expected piece {expected}")]
    IndexMismatch { expected: u32, actual: u32 },
    #[error("block at offset {begin} with {len} bytes does not fit in a piece of {piece_len} bytes")]
    OutOfRange {
        begin: usize,
        len: usize,
        piece_len: usize,
    },
    #[error("connection closed mid-frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A non-keep-alive peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message with no payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a message with a payload.
    pub fn new_with_payload(id: MessageId, payload: Vec<u8>) -> Self {
        Message { id, payload }
    }

    /// Build a REQUEST for `length` bytes of piece `index` starting at `begin`.
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());
        Message::new_with_payload(MESSAGE_REQUEST, payload)
    }

    /// Build a HAVE announcing piece `index`.
    pub fn have(index: u32) -> Self {
        Message::new_with_payload(MESSAGE_HAVE, index.to_be_bytes().to_vec())
    }

    /// Serialize into a length-prefixed frame.
    pub fn serialize(&self) -> Vec<u8> {
        let message_len = 1 + self.payload.len();

        let mut frame = Vec::with_capacity(4 + message_len);
        frame.extend_from_slice(&(message_len as u32).to_be_bytes());
        frame.push(self.id);
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Extract the piece index from a HAVE message.
    pub fn parse_have(&self) -> Result<u32, MessageError> {
        if self.id != MESSAGE_HAVE {
            return Err(MessageError::WrongKind {
                expected: MESSAGE_HAVE,
                actual: self.id,
            });
        }
        if self.payload.len() != 4 {
            return Err(MessageError::BadPayload {
                len: self.payload.len(),
            });
        }

        let mut cursor = Cursor::new(&self.payload);
        Ok(cursor.read_u32::<BigEndian>()?)
    }

    /// Copy the block carried by a PIECE message into `buf` at the offset the
    /// message names, returning the number of bytes written.
    ///
    /// The message must be for piece `expected_index` and the block must lie
    /// entirely within `buf`. A block that arrives twice overwrites the same
    /// range, so duplicates are harmless.
    pub fn parse_piece(&self, expected_index: u32, buf: &mut [u8]) -> Result<usize, MessageError> {
        if self.id != MESSAGE_PIECE {
            return Err(MessageError::WrongKind {
                expected: MESSAGE_PIECE,
                actual: self.id,
            });
        }
        if self.payload.len() < 8 {
            return Err(MessageError::BadPayload {
                len: self.payload.len(),
            });
        }

        let mut cursor = Cursor::new(&self.payload[..8]);
        let index = cursor.read_u32::<BigEndian>()?;
        if index != expected_index {
            return Err(MessageError::IndexMismatch {
                expected: expected_index,
                actual: index,
            });
        }

        let begin = cursor.read_u32::<BigEndian>()? as usize;
        let block = &self.payload[8..];
        if begin >= buf.len() || begin + block.len() > buf.len() {
            return Err(MessageError::OutOfRange {
                begin,
                len: block.len(),
                piece_len: buf.len(),
            });
        }

        buf[begin..begin + block.len()].copy_from_slice(block);
        Ok(block.len())
    }
}

/// Read one frame from the peer. `None` is a keep-alive.
pub fn read(reader: &mut impl Read) -> Result<Option<Message>, MessageError> {
    let message_len = reader.read_u32::<BigEndian>().map_err(truncated)? as usize;

    // Keep-alive
    if message_len == 0 {
        return Ok(None);
    }

    let mut frame = vec![0; message_len];
    reader.read_exact(&mut frame).map_err(truncated)?;

    let payload = frame.split_off(1);
    Ok(Some(Message::new_with_payload(frame[0], payload)))
}

fn truncated(error: io::Error) -> MessageError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        MessageError::Truncated
    } else {
        MessageError::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_framing() {
        assert_eq!(KEEP_ALIVE_FRAME, [0x00, 0x00, 0x00, 0x00]);

        let mut reader = Cursor::new(KEEP_ALIVE_FRAME);
        assert!(read(&mut reader).unwrap().is_none());
    }

    #[test]
    fn request_serialization() {
        let frame = Message::request(1, 2, 3).serialize();
        assert_eq!(
            frame,
            [
                0x00, 0x00, 0x00, 0x0D, // length
                0x06, // id
                0x00, 0x00, 0x00, 0x01, // index
                0x00, 0x00, 0x00, 0x02, // begin
                0x00, 0x00, 0x00, 0x03, // length of block
            ]
        );
    }

    #[test]
    fn read_round_trips_serialize() {
        let messages = [
            Message::new(MESSAGE_UNCHOKE),
            Message::have(1234),
            Message::request(7, 16384, 16384),
            Message::new_with_payload(MESSAGE_BITFIELD, vec![0xFF, 0xA0]),
            Message::new_with_payload(MESSAGE_PIECE, vec![0; 24]),
        ];
        for message in messages {
            let frame = message.serialize();
            let mut reader = Cursor::new(&frame);
            assert_eq!(read(&mut reader).unwrap(), Some(message));
        }
    }

    #[test]
    fn read_fails_on_short_frame() {
        let mut frame = Message::have(1).serialize();
        frame.truncate(6);
        let mut reader = Cursor::new(&frame);
        assert!(matches!(read(&mut reader), Err(MessageError::Truncated)));
    }

    #[test]
    fn parse_have_extracts_index() {
        let message = Message::new_with_payload(MESSAGE_HAVE, vec![0x00, 0x00, 0x00, 0x04]);
        assert_eq!(message.parse_have().unwrap(), 4);
    }

    #[test]
    fn parse_have_round_trips_have() {
        for index in [0, 1, 16384, u32::MAX] {
            assert_eq!(Message::have(index).parse_have().unwrap(), index);
        }
    }

    #[test]
    fn parse_have_rejects_other_kinds() {
        let message = Message::new_with_payload(MESSAGE_REQUEST, vec![0x00, 0x00, 0x00, 0x04]);
        assert!(matches!(
            message.parse_have(),
            Err(MessageError::WrongKind {
                expected: MESSAGE_HAVE,
                actual: MESSAGE_REQUEST,
            })
        ));
    }

    #[test]
    fn parse_have_rejects_short_payload() {
        let message = Message::new_with_payload(MESSAGE_HAVE, vec![0x00, 0x00, 0x04]);
        assert!(matches!(
            message.parse_have(),
            Err(MessageError::BadPayload { len: 3 })
        ));
    }

    fn piece_message(index: u32, begin: u32, block: &[u8]) -> Message {
        let mut payload = Vec::new();
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(block);
        Message::new_with_payload(MESSAGE_PIECE, payload)
    }

    #[test]
    fn parse_piece_copies_block_at_offset() {
        let mut buf = vec![0; 10];
        let message = piece_message(4, 2, &[0xAA, 0xBB]);

        let n = message.parse_piece(4, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf, [0, 0, 0xAA, 0xBB, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn parse_piece_overwrites_duplicate_blocks() {
        let mut buf = vec![0; 4];
        piece_message(0, 0, &[1, 2]).parse_piece(0, &mut buf).unwrap();
        piece_message(0, 0, &[3, 4]).parse_piece(0, &mut buf).unwrap();
        assert_eq!(buf, [3, 4, 0, 0]);
    }

    #[test]
    fn parse_piece_rejects_wrong_index() {
        let mut buf = vec![0; 10];
        let message = piece_message(5, 0, &[0xAA]);
        assert!(matches!(
            message.parse_piece(4, &mut buf),
            Err(MessageError::IndexMismatch {
                expected: 4,
                actual: 5,
            })
        ));
    }

    #[test]
    fn parse_piece_rejects_block_past_the_end() {
        let mut buf = vec![0; 4];

        let message = piece_message(0, 4, &[0xAA]);
        assert!(matches!(
            message.parse_piece(0, &mut buf),
            Err(MessageError::OutOfRange { begin: 4, .. })
        ));

        let message = piece_message(0, 2, &[0xAA, 0xBB, 0xCC]);
        assert!(matches!(
            message.parse_piece(0, &mut buf),
            Err(MessageError::OutOfRange { begin: 2, .. })
        ));
    }

    #[test]
    fn parse_piece_rejects_payload_without_header() {
        let mut buf = vec![0; 4];
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0; 7]);
        assert!(matches!(
            message.parse_piece(0, &mut buf),
            Err(MessageError::BadPayload { len: 7 })
        ));
    }
}
