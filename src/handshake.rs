//! Peer protocol handshake.
//!
//! The handshake is the first thing either side sends after the TCP
//! connection opens, in a fixed layout:
//!
//! ```text
//! offset 0:  1 byte   pstrlen (19)
//! offset 1:  19 bytes "BitTorrent protocol"
//! offset 20: 8 bytes  reserved, zero on send, ignored on receive
//! offset 28: 20 bytes info_hash
//! offset 48: 20 bytes peer_id
//! ```
//!
//! The info-hash is what ties a connection to one torrent; the session layer
//! drops any peer that echoes back a different one.

use std::io::{self, Read};

use thiserror::Error;

const PROTOCOL_ID: &str = "BitTorrent protocol";
const RESERVED_LEN: usize = 8;

/// Ways a handshake can fail to parse.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake has an empty protocol string")]
    EmptyProtocol,
    #[error("connection closed mid-handshake")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One side's half of the handshake exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pstr: Vec<u8>,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build a standard-protocol handshake for the given torrent and identity.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.as_bytes().to_vec(),
            info_hash,
            peer_id,
        }
    }

    /// Serialize into `1 + pstrlen + 48` bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.pstr.len() + 48);
        buf.push(self.pstr.len() as u8);
        buf.extend_from_slice(&self.pstr);
        buf.extend_from_slice(&[0; RESERVED_LEN]);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Read a handshake off the wire. The reserved bytes are discarded.
    pub fn read(reader: &mut impl Read) -> Result<Handshake, HandshakeError> {
        let mut pstrlen = [0; 1];
        reader.read_exact(&mut pstrlen).map_err(truncated)?;

        let pstrlen = pstrlen[0] as usize;
        if pstrlen == 0 {
            return Err(HandshakeError::EmptyProtocol);
        }

        let mut buf = vec![0; pstrlen + 48];
        reader.read_exact(&mut buf).map_err(truncated)?;

        let pstr = buf[..pstrlen].to_vec();
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[pstrlen + RESERVED_LEN..pstrlen + RESERVED_LEN + 20]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[pstrlen + RESERVED_LEN + 20..]);

        Ok(Handshake {
            pstr,
            info_hash,
            peer_id,
        })
    }
}

fn truncated(error: io::Error) -> HandshakeError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        HandshakeError::Truncated
    } else {
        HandshakeError::Io(error)
    }
}
