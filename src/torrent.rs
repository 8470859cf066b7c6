//! Torrent metainfo and download coordination.
//!
//! A `Torrent` is built from a metainfo file: the bencoded `info` dictionary
//! is re-encoded and hashed to produce the info-hash that identifies the
//! torrent to trackers and peers, and the concatenated piece digests are
//! split into one 20-byte hash per piece.
//!
//! `download` is the assembler: it pre-fills a bounded work queue with one
//! entry per piece, spawns one worker thread per peer, and then drains the
//! results channel, writing each verified piece at its absolute offset in
//! the output. The results channel has no capacity, so workers hand over
//! pieces at the assembler's pace.

use crate::peer::*;
use crate::piece::*;
use crate::tracker;
use crate::worker::*;

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use boring::sha::Sha1;
use crossbeam_channel::bounded;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;

// Port announced to trackers. Nothing listens on it; this client only
// leeches.
const PORT: u16 = 6881;

const SHA1_LEN: usize = 20;

/// A single-file torrent, ready to download.
pub struct Torrent {
    info_hash: [u8; 20],
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u32,
    length: u32,
    name: String,
    peer_id: [u8; 20],
    peers: Vec<Peer>,
}

/// The `info` dictionary of the metainfo file.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenated 20-byte SHA-1 digests, one per piece
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    length: u32,
    name: String,
}

#[derive(Deserialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    info: BencodeInfo,
}

impl BencodeInfo {
    /// SHA-1 of the re-encoded info dictionary, identifying the torrent.
    fn hash(&self) -> Result<[u8; 20]> {
        let encoded = ser::to_bytes(self)?;

        let mut hasher = Sha1::new();
        hasher.update(&encoded);
        Ok(hasher.finish())
    }

    /// Split the concatenated digests into one hash per piece.
    fn split_piece_hashes(&self) -> Result<Vec<[u8; 20]>> {
        if !self.pieces.len().is_multiple_of(SHA1_LEN) {
            bail!(
                "torrent is invalid: pieces field of {} bytes is not a multiple of {}",
                self.pieces.len(),
                SHA1_LEN
            );
        }

        let hashes = self
            .pieces
            .chunks_exact(SHA1_LEN)
            .map(|chunk| {
                let mut hash = [0; SHA1_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Ok(hashes)
    }
}

impl Torrent {
    /// Decode a metainfo file and announce to its trackers.
    pub fn open(filepath: &Path) -> Result<Torrent> {
        let buf = fs::read(filepath)
            .with_context(|| format!("could not read torrent file {filepath:?}"))?;
        let bencode =
            de::from_bytes::<BencodeTorrent>(&buf).context("could not decode torrent file")?;

        let info_hash = bencode.info.hash()?;
        let piece_hashes = bencode.info.split_piece_hashes()?;
        let piece_length = bencode.info.piece_length;
        let length = bencode.info.length;

        if piece_length == 0 {
            bail!("torrent is invalid: piece length is zero");
        }
        if piece_hashes.len() != length.div_ceil(piece_length) as usize {
            bail!(
                "torrent is invalid: {} pieces cannot cover {} bytes",
                piece_hashes.len(),
                length
            );
        }

        let mut rng = rand::thread_rng();

        // Announce tiers per BEP 12: shuffled announce-list when present,
        // otherwise the single announce URL.
        let mut tiers = if !bencode.announce_list.is_empty() {
            bencode.announce_list
        } else if !bencode.announce.is_empty() {
            vec![vec![bencode.announce]]
        } else {
            bail!("torrent has no announce or announce-list");
        };
        for tier in &mut tiers {
            tier.shuffle(&mut rng);
        }

        let mut peer_id = [0; 20];
        rng.fill(&mut peer_id[..]);

        let peers = tracker::request_peers(&tiers, &info_hash, &peer_id, PORT, length)?;

        Ok(Torrent {
            info_hash,
            piece_hashes,
            piece_length,
            length,
            name: bencode.info.name,
            peer_id,
            peers,
        })
    }

    /// The suggested filename from the metainfo.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Download every piece and write it at its offset in `writer`.
    ///
    /// Spawns one worker per peer; the assembler stays on the calling thread
    /// and is the only writer. Returns once every piece has been received,
    /// verified, and written.
    pub fn download<W: Write + Seek>(&self, writer: &mut W) -> Result<()> {
        let piece_count = self.piece_hashes.len();
        info!("Downloading {:?} ({} pieces)", self.name, piece_count);

        let (work_tx, work_rx) = bounded::<PieceWork>(piece_count);
        let (result_tx, result_rx) = bounded::<PieceResult>(0);

        for (index, hash) in self.piece_hashes.iter().enumerate() {
            let index = index as u32;
            let work = PieceWork::new(index, *hash, self.piece_size(index));
            work_tx
                .send(work)
                .map_err(|_| anyhow!("could not fill the work queue"))?;
        }

        let active_workers = Arc::new(AtomicUsize::new(0));
        for peer in &self.peers {
            let worker = Worker::new(
                peer.clone(),
                self.peer_id,
                self.info_hash,
                (work_tx.clone(), work_rx.clone()),
                result_tx.clone(),
                Arc::clone(&active_workers),
            );
            thread::spawn(move || worker.run());
        }

        // Keep no channel ends here: once the last worker exits, a stalled
        // swarm shows up as a disconnect instead of a silent hang.
        drop(work_tx);
        drop(work_rx);
        drop(result_tx);

        let progress = ProgressBar::new(self.length as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
                .progress_chars("#>-"),
        );

        let mut downloaded_pieces = 0;
        while downloaded_pieces < piece_count {
            let result = result_rx
                .recv()
                .map_err(|_| anyhow!("all peers dropped out with pieces still missing"))?;

            writer.seek(SeekFrom::Start(self.piece_offset(result.index)))?;
            writer.write_all(&result.data)?;
            progress.inc(result.data.len() as u64);
            downloaded_pieces += 1;

            let percent = downloaded_pieces as f64 / piece_count as f64 * 100.0;
            info!(
                "({:.2}%) Downloaded piece #{} from {} peers",
                percent,
                result.index,
                active_workers.load(Ordering::Relaxed)
            );
        }

        progress.finish();
        Ok(())
    }

    /// Absolute byte offset where piece `index` starts.
    fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Size of piece `index`: `piece_length` except for the final piece,
    /// which only runs to the end of the file.
    fn piece_size(&self, index: u32) -> u32 {
        let begin = self.piece_offset(index);
        let end = (begin + self.piece_length as u64).min(self.length as u64);
        (end - begin) as u32
    }
}
