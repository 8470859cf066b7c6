//! Peer addresses and the tracker's compact peer encoding.
//!
//! Trackers answering a compact announce pack each peer into 6 bytes: a
//! 4-byte IPv4 address followed by a big-endian u16 port, with no framing
//! between entries.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

const COMPACT_PEER_LEN: usize = 6;

/// Compact peer list whose length is not a multiple of 6.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("compact peer list of {0} bytes is not a multiple of 6")]
pub struct MalformedPeers(pub usize);

/// Address of one peer in the swarm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Decode a compact peer list.
pub fn from_compact(bytes: &[u8]) -> Result<Vec<Peer>, MalformedPeers> {
    if !bytes.len().is_multiple_of(COMPACT_PEER_LEN) {
        return Err(MalformedPeers(bytes.len()));
    }

    let peers = bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|entry| Peer {
            ip: Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]),
            port: u16::from_be_bytes([entry[4], entry[5]]),
        })
        .collect();

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_entries() {
        let bytes = [192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x04, 0xD2];
        let peers = from_compact(&bytes).unwrap();

        assert_eq!(
            peers,
            vec![
                Peer {
                    ip: Ipv4Addr::new(192, 168, 1, 1),
                    port: 6881,
                },
                Peer {
                    ip: Ipv4Addr::new(10, 0, 0, 2),
                    port: 1234,
                },
            ]
        );
    }

    #[test]
    fn round_trips_through_compact_form() {
        let peers = vec![
            Peer {
                ip: Ipv4Addr::new(1, 2, 3, 4),
                port: 80,
            },
            Peer {
                ip: Ipv4Addr::new(255, 255, 255, 255),
                port: 65535,
            },
        ];

        let mut bytes = Vec::new();
        for peer in &peers {
            bytes.extend_from_slice(&peer.ip.octets());
            bytes.extend_from_slice(&peer.port.to_be_bytes());
        }

        assert_eq!(from_compact(&bytes).unwrap(), peers);
    }

    #[test]
    fn empty_list_is_valid() {
        assert_eq!(from_compact(&[]).unwrap(), vec![]);
    }

    #[test]
    fn rejects_trailing_bytes() {
        let bytes = [192, 168, 1, 1, 0x1A, 0xE1, 10];
        assert_eq!(from_compact(&bytes), Err(MalformedPeers(7)));
    }
}
