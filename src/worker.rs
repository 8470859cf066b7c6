//! Per-peer download worker.
//!
//! Each worker owns one peer session and runs on its own thread. Workers pull
//! pieces from a shared work queue, download them block by block with a
//! pipelined request window, and hand verified pieces to the assembler over
//! the results channel.
//!
//! The work queue doubles as the retry list: a piece the peer does not have,
//! or that fails mid-download or fails its hash check, goes back on the queue
//! for another worker. A session error poisons the connection, so the worker
//! re-queues its current piece and exits; the remaining swarm absorbs the
//! loss.

use crate::client::*;
use crate::message::*;
use crate::peer::*;
use crate::piece::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use boring::sha::Sha1;
use crossbeam_channel::{Receiver, Sender};

/// Most requests allowed in flight on one connection at a time.
const MAX_BACKLOG: u32 = 10;

/// Most bytes asked for in a single request.
const MAX_BLOCK_SIZE: u32 = 16384;

/// Deadline for one whole piece attempt.
const PIECE_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloads pieces from a single peer.
pub struct Worker {
    peer: Peer,
    peer_id: [u8; 20],
    info_hash: [u8; 20],
    work: (Sender<PieceWork>, Receiver<PieceWork>),
    results: Sender<PieceResult>,
    active: Arc<AtomicUsize>,
}

impl Worker {
    /// Build a worker for one peer. The worker counts as active from
    /// construction until it is dropped.
    pub fn new(
        peer: Peer,
        peer_id: [u8; 20],
        info_hash: [u8; 20],
        work: (Sender<PieceWork>, Receiver<PieceWork>),
        results: Sender<PieceResult>,
        active: Arc<AtomicUsize>,
    ) -> Worker {
        active.fetch_add(1, Ordering::Relaxed);
        Worker {
            peer,
            peer_id,
            info_hash,
            work,
            results,
            active,
        }
    }

    /// Serve the work queue until it drains or the session dies.
    pub fn run(&self) {
        let mut client = match Client::connect(&self.peer, self.peer_id, self.info_hash) {
            Ok(client) => client,
            Err(error) => {
                info!("Dropping peer {}: {:#}", self.peer, error);
                return;
            }
        };

        // Peers start out choking us; reciprocate the courtesy first.
        if client.send_unchoke().is_err() || client.send_interested().is_err() {
            return;
        }

        while let Ok(work) = self.work.1.recv() {
            // A peer without the piece must never hold the item.
            if !client.has_piece(work.index) {
                if self.requeue(work).is_err() {
                    return;
                }
                continue;
            }

            let data = match self.download_piece(&mut client, &work) {
                Ok(data) => data,
                Err(error) => {
                    info!("Dropping peer {}: {:#}", self.peer, error);
                    let _ = self.requeue(work);
                    return;
                }
            };

            if !verify_integrity(&work, &data) {
                warn!(
                    "Piece #{} from peer {} failed its hash check",
                    work.index, self.peer
                );
                if self.requeue(work).is_err() {
                    return;
                }
                continue;
            }

            // Best-effort advertisement; the piece is good either way.
            if let Err(error) = client.send_have(work.index) {
                debug!(
                    "Could not advertise piece #{} to peer {}: {:#}",
                    work.index, self.peer, error
                );
            }

            let result = PieceResult {
                index: work.index,
                data,
            };
            if self.results.send(result).is_err() {
                // The assembler is gone; nothing left to download for.
                return;
            }
        }
    }

    fn requeue(&self, work: PieceWork) -> Result<(), crossbeam_channel::SendError<PieceWork>> {
        self.work.0.send(work)
    }

    /// Download one piece over the session, driving the request pipeline.
    ///
    /// Requests are issued while the peer has us unchoked, up to
    /// [`MAX_BACKLOG`] outstanding, then the loop blocks on the next message.
    /// A choke leaves the backlog in place: the peer is expected to resume
    /// serving the outstanding window once it unchokes us again.
    fn download_piece(&self, client: &mut Client, work: &PieceWork) -> Result<Vec<u8>> {
        let mut state = PieceProgress::new(work.length);

        // One deadline covers the whole attempt, cleared when the guard
        // drops on completion or error.
        let _deadline = client.deadline(PIECE_TIMEOUT)?;

        while state.downloaded < work.length {
            if !client.is_choked() {
                while state.backlog < MAX_BACKLOG && state.requested < work.length {
                    let block_size = MAX_BLOCK_SIZE.min(work.length - state.requested);

                    client.send_request(work.index, state.requested, block_size)?;
                    state.backlog += 1;
                    state.requested += block_size;
                }
            }

            match client.read()? {
                // Keep-alive
                None => {}
                Some(message) => match message.id {
                    MESSAGE_CHOKE => client.mark_choked(),
                    MESSAGE_UNCHOKE => client.mark_unchoked(),
                    MESSAGE_HAVE => {
                        let index = message.parse_have()?;
                        client.record_have(index);
                    }
                    MESSAGE_PIECE => {
                        let n = message.parse_piece(work.index, &mut state.buf)?;
                        state.downloaded += n as u32;
                        state.backlog -= 1;
                    }
                    _ => {}
                },
            }
        }

        Ok(state.buf)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Whether `data` hashes to the digest the metainfo promises for this piece.
fn verify_integrity(work: &PieceWork, data: &[u8]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finish() == work.hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_integrity_matches_sha1() {
        let data = b"rarest first";
        let mut hasher = Sha1::new();
        hasher.update(data);

        let work = PieceWork::new(0, hasher.finish(), data.len() as u32);
        assert!(verify_integrity(&work, data));
        assert!(!verify_integrity(&work, b"rarest worst"));
    }
}
