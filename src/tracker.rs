//! Tracker announce over HTTP.
//!
//! The announce is a plain GET of the tracker URL with the torrent identity
//! and transfer counters in the query string. `info_hash` and `peer_id` are
//! raw 20-byte strings, so they are percent-encoded byte by byte rather than
//! through a URL library's string encoder. The tracker answers with a
//! bencoded dictionary holding the reannounce `interval` and a compact
//! `peers` list.
//!
//! Announce tiers are walked in order and the first tracker that answers
//! with a non-empty peer list wins.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use crate::peer::{self, Peer};

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Bencoded tracker answer to an announce.
#[derive(Debug, Deserialize)]
struct TrackerResponse {
    // Seconds the tracker wants us to wait before the next announce
    interval: u32,
    // Compact peer list, 6 bytes per peer
    peers: ByteBuf,
}

/// Ask the trackers for a swarm.
///
/// Fails only when every tracker in every tier has been tried without
/// producing a single peer.
pub fn request_peers(
    tiers: &[Vec<String>],
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    length: u32,
) -> Result<Vec<Peer>> {
    for tier in tiers {
        for announce in tier {
            let url = match announce_url(announce, info_hash, peer_id, port, length) {
                Ok(url) => url,
                Err(error) => {
                    debug!("Skipping tracker {}: {:#}", announce, error);
                    continue;
                }
            };

            match announce_once(&url) {
                Ok(peers) if !peers.is_empty() => {
                    info!("Tracker {} answered with {} peers", announce, peers.len());
                    return Ok(peers);
                }
                Ok(_) => debug!("Tracker {} answered with no peers", announce),
                Err(error) => debug!("Skipping tracker {}: {:#}", announce, error),
            }
        }
    }

    Err(anyhow!("could not get peers from any tracker"))
}

/// One GET against one tracker.
fn announce_once(url: &str) -> Result<Vec<Peer>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(ANNOUNCE_TIMEOUT)
        .build()?;

    let response = client.get(url).send()?.bytes()?;
    let tracker: TrackerResponse = de::from_bytes(&response)?;
    debug!("Tracker asks for reannounce every {}s", tracker.interval);

    Ok(peer::from_compact(&tracker.peers)?)
}

/// Build the announce URL for one tracker.
fn announce_url(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    length: u32,
) -> Result<String> {
    // Parse first so an unusable announce entry is rejected up front.
    let base = Url::parse(announce).map_err(|_| anyhow!("could not parse tracker url {announce:?}"))?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
        percent_encode_bytes(info_hash),
        percent_encode_bytes(peer_id),
        port,
        length,
    );

    let mut url = base.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}

/// Encode raw bytes as %XX triplets, one per byte.
fn percent_encode_bytes(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";

    let mut encoded = String::with_capacity(data.len() * 3);
    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_url_carries_the_leecher_query() {
        let url = announce_url(
            "http://tracker.local/announce",
            &[0x01; 20],
            &[0xAB; 20],
            6881,
            32768,
        )
        .unwrap();

        assert!(url.starts_with("http://tracker.local/announce?"));
        assert!(url.contains(&format!("info_hash={}", "%01".repeat(20))));
        assert!(url.contains(&format!("peer_id={}", "%AB".repeat(20))));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&uploaded=0"));
        assert!(url.contains("&downloaded=0"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&left=32768"));
    }

    #[test]
    fn announce_url_appends_to_an_existing_query() {
        let url = announce_url("http://tracker.local/announce?key=1", &[0; 20], &[0; 20], 6881, 1)
            .unwrap();
        assert!(url.contains("announce?key=1&info_hash="));
    }

    #[test]
    fn announce_url_rejects_garbage() {
        assert!(announce_url("not a url", &[0; 20], &[0; 20], 6881, 1).is_err());
    }

    #[test]
    fn tracker_response_decodes_compact_peers() {
        let body = b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let tracker: TrackerResponse = de::from_bytes(body).unwrap();

        assert_eq!(tracker.interval, 1800);
        let peers = peer::from_compact(&tracker.peers).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].to_string(), "127.0.0.1:6881");
    }
}
