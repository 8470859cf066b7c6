//! Piece bookkeeping for the download pipeline.
//!
//! A `PieceWork` is the unit that circulates on the work queue; it may pass
//! through any number of workers before one of them turns it into a verified
//! `PieceResult`. `PieceProgress` is the per-attempt state one worker keeps
//! while a piece is in flight.

/// One piece waiting to be downloaded.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of the piece in the torrent.
    pub index: u32,
    /// Expected SHA-1 digest of the piece.
    pub hash: [u8; 20],
    /// Size of the piece in bytes. Only the last piece may be short.
    pub length: u32,
}

impl PieceWork {
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

/// In-flight state of one piece attempt on one session.
///
/// `downloaded <= requested <= buf.len()` and `backlog` counts requests sent
/// but not yet answered.
pub struct PieceProgress {
    pub buf: Vec<u8>,
    pub downloaded: u32,
    pub requested: u32,
    pub backlog: u32,
}

impl PieceProgress {
    pub fn new(length: u32) -> PieceProgress {
        PieceProgress {
            buf: vec![0; length as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }
}

/// A piece that downloaded completely and passed its hash check.
#[derive(Debug)]
pub struct PieceResult {
    pub index: u32,
    pub data: Vec<u8>,
}
