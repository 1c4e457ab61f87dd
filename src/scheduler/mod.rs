//! Piece scheduler: the single shared owner of download progress. Tracks
//! which pieces are missing, in flight, or done; hands out block requests
//! rarest-first; verifies and commits completed pieces to disk.
//!
//! Per the concurrency model, the scheduler is never locked: it is owned by
//! the download driver as an `Rc<RefCell<Scheduler>>` and mutated only
//! between the `.await` points of the single-threaded runtime, so every
//! method here can assume exclusive access for its whole body.
pub mod bitfield;
pub mod piece;

pub use bitfield::{BitField, BitFieldError};
pub use piece::{Block, BlockRef, BlockRequest, BlockStatus, PendingRequest, Piece};

use crate::config::Config;
use crate::torrent::Torrent;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// A remote peer's handshake-advertised identity, used as the scheduler's
/// key for per-peer bitfields and pending-request attribution.
pub type PeerId = [u8; 20];

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block ({piece}, {offset}) does not belong to any known piece")]
    UnknownBlock { piece: usize, offset: u32 },
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

pub struct Scheduler {
    piece_length: u64,
    total_size: u64,
    max_pending_ms: u64,
    pieces: Vec<Piece>,
    missing: Vec<usize>,
    ongoing: Vec<usize>,
    have: Vec<usize>,
    peer_bitfields: HashMap<PeerId, BitField>,
    pending: Vec<PendingRequest>,
    file: File,
}

impl Scheduler {
    /// Creates the scheduler for `torrent`, allocating (but not yet
    /// writing) the output file at `output_dir/torrent.output_name`, sized
    /// to `total_size` up front so positional writes never extend it.
    #[instrument(skip(torrent, config), fields(total_pieces = torrent.total_pieces()))]
    pub fn new(torrent: &Torrent, config: &Config, output_dir: &Path) -> SchedulerResult<Self> {
        let path = output_dir.join(&torrent.output_name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.set_len(torrent.total_size)?;

        let total_pieces = torrent.total_pieces();
        let pieces = (0..total_pieces)
            .map(|index| {
                Piece::new(
                    index,
                    torrent.piece_hashes[index],
                    torrent.piece_size(index),
                    config.request_size,
                )
            })
            .collect();

        Ok(Self {
            piece_length: torrent.piece_length,
            total_size: torrent.total_size,
            max_pending_ms: config.max_pending_ms,
            pieces,
            missing: (0..total_pieces).collect(),
            ongoing: Vec::new(),
            have: Vec::new(),
            peer_bitfields: HashMap::new(),
            pending: Vec::new(),
            file,
        })
    }

    pub fn add_peer(&mut self, id: PeerId, bitfield: BitField) {
        debug!(peer = ?hex::encode(id), pieces = bitfield.iter().count(), "peer bitfield registered");
        self.peer_bitfields.insert(id, bitfield);
    }

    /// Records a `Have` announcement, creating an empty bitfield for the
    /// peer first if this is the first message received from it (a peer
    /// may send `Have` messages without ever sending a `Bitfield`).
    pub fn update_peer(&mut self, id: PeerId, piece_index: usize) {
        let bitfield = self
            .peer_bitfields
            .entry(id)
            .or_insert_with(|| BitField::empty(self.pieces.len()));
        bitfield.set(piece_index);
    }

    pub fn remove_peer(&mut self, id: PeerId) {
        self.peer_bitfields.remove(&id);
    }

    /// Selects the next block to request from `id`, per the four-tier
    /// priority order: expired re-request, continue an ongoing piece,
    /// start the rarest new piece the peer has, or none.
    pub fn next_request(&mut self, id: PeerId, now_ms: u64) -> Option<BlockRequest> {
        let max_pending_ms = self.max_pending_ms;
        if let Some(pending) = self.pending.iter_mut().find(|p| {
            p.is_expired(now_ms, max_pending_ms)
                && has_piece_static(&self.peer_bitfields, id, p.block.piece)
        }) {
            pending.issued_at_ms = now_ms;
            let piece = &self.pieces[pending.block.piece];
            let block = piece
                .blocks
                .iter()
                .find(|b| b.offset == pending.block.offset)
                .expect("pending request refers to a real block");
            return Some(BlockRequest {
                piece: pending.block.piece,
                offset: block.offset,
                length: block.length,
            });
        }

        let ongoing = self.ongoing.clone();
        for index in ongoing {
            if !has_piece_static(&self.peer_bitfields, id, index) {
                continue;
            }
            if let Some(request) = self.claim_next_block(index, now_ms) {
                return Some(request);
            }
        }

        let mut best: Option<(usize, usize)> = None; // (missing-list position, rarity count)
        for (pos, &index) in self.missing.iter().enumerate() {
            if !has_piece_static(&self.peer_bitfields, id, index) {
                continue;
            }
            let count = self
                .peer_bitfields
                .values()
                .filter(|bf| bf.has(index))
                .count();
            if best.is_none_or(|(_, best_count)| count < best_count) {
                best = Some((pos, count));
            }
        }
        if let Some((pos, _)) = best {
            let index = self.missing.remove(pos);
            self.ongoing.push(index);
            return self.claim_next_block(index, now_ms);
        }

        None
    }

    /// Marks the given ongoing piece's next missing block `Pending` and
    /// records a fresh `PendingRequest` for it.
    fn claim_next_block(&mut self, piece_index: usize, now_ms: u64) -> Option<BlockRequest> {
        let piece = &mut self.pieces[piece_index];
        let block = piece.next_missing()?;
        block.status = BlockStatus::Pending;
        let request = BlockRequest {
            piece: piece_index,
            offset: block.offset,
            length: block.length,
        };
        self.pending.push(PendingRequest {
            block: BlockRef {
                piece: piece_index,
                offset: request.offset,
            },
            issued_at_ms: now_ms,
        });
        Some(request)
    }

    /// Records a block's payload. If this completes its piece, verifies
    /// the hash and either commits it to disk (moving it to `have`) or
    /// resets it for re-fetch (leaving it in `ongoing`).
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn block_received(
        &mut self,
        _id: PeerId,
        piece_index: usize,
        offset: u32,
        data: Bytes,
    ) -> SchedulerResult<()> {
        if let Some(pos) = self
            .pending
            .iter()
            .position(|p| p.block.piece == piece_index && p.block.offset == offset)
        {
            self.pending.remove(pos);
        }

        let piece = self
            .pieces
            .get_mut(piece_index)
            .ok_or(SchedulerError::UnknownBlock {
                piece: piece_index,
                offset,
            })?;
        let block = piece
            .blocks
            .iter_mut()
            .find(|b| b.offset == offset)
            .ok_or(SchedulerError::UnknownBlock {
                piece: piece_index,
                offset,
            })?;
        block.status = BlockStatus::Retrieved;
        block.data = Some(data);

        if !piece.is_complete() {
            return Ok(());
        }

        let bytes = piece.assemble();
        let digest = Sha1::digest(&bytes);
        if digest.as_slice() == piece.hash.as_slice() {
            let file_offset = piece_index as u64 * self.piece_length;
            self.file.write_at(&bytes, file_offset)?;
            piece.blocks.clear();
            self.ongoing.retain(|&i| i != piece_index);
            self.have.push(piece_index);
            debug!(piece = piece_index, "piece verified and written");
        } else {
            warn!(piece = piece_index, "hash mismatch, resetting piece");
            piece.reset();
        }

        Ok(())
    }

    pub fn total_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn complete(&self) -> bool {
        self.have.len() == self.pieces.len()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        let full = self.have.len() as u64 * self.piece_length;
        // the scheduler's own bookkeeping already tracks the last piece's
        // real size via `piece_size`, but `have` only stores indices; a
        // piece-length-rounded total matches spec.md's explicitly tolerated
        // last-piece rounding.
        full.min(self.total_size)
    }

    /// Always zero: this client never seeds, so nothing is ever uploaded.
    /// Still reported to the tracker (see `Tracker::announce`'s `uploaded`
    /// parameter) and kept here as the single source of truth for it.
    pub fn bytes_uploaded(&self) -> u64 {
        0
    }

    pub fn close(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

fn has_piece_static(bitfields: &HashMap<PeerId, BitField>, id: PeerId, index: usize) -> bool {
    bitfields.get(&id).is_some_and(|bf| bf.has(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Torrent;

    fn digest_of(bytes: &[u8]) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&Sha1::digest(bytes));
        out
    }

    fn torrent_fixture() -> Torrent {
        Torrent {
            announce_url: "http://tracker/announce".into(),
            info_hash: [0u8; 20],
            piece_length: 4,
            total_size: 10,
            piece_hashes: vec![digest_of(b"abcd"), digest_of(b"efgh"), digest_of(b"ij")],
            output_name: "out.bin".into(),
        }
    }

    fn config_fixture() -> Config {
        Config {
            request_size: 4,
            ..Config::default()
        }
    }

    #[test]
    fn rarest_first_picks_minimum_count_piece() {
        let torrent = torrent_fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = Scheduler::new(&torrent, &config_fixture(), dir.path()).unwrap();

        let peer_a = [1u8; 20];
        let peer_b = [2u8; 20];
        scheduler.add_peer(peer_a, BitField::from_bytes(&[0b1100_0000], 3).unwrap());
        scheduler.add_peer(peer_b, BitField::from_bytes(&[0b0110_0000], 3).unwrap());

        // piece 0: held by peer_a only (count 1); piece 1: held by both (count 2).
        let request = scheduler.next_request(peer_a, 0).unwrap();
        assert_eq!(request.piece, 0);
    }

    #[test]
    fn expired_pending_request_is_reissued_without_duplication() {
        let torrent = torrent_fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = Scheduler::new(&torrent, &config_fixture(), dir.path()).unwrap();
        let peer = [1u8; 20];
        scheduler.add_peer(peer, BitField::from_bytes(&[0b1000_0000], 3).unwrap());

        let first = scheduler.next_request(peer, 0).unwrap();
        assert_eq!((first.piece, first.offset), (0, 0));
        assert_eq!(scheduler.pending.len(), 1);

        // not yet expired at t = max_pending_ms exactly
        let still_pending = scheduler.next_request(peer, scheduler.max_pending_ms);
        assert!(still_pending.is_none());
        assert_eq!(scheduler.pending.len(), 1);

        let reissued = scheduler
            .next_request(peer, scheduler.max_pending_ms + 1)
            .unwrap();
        assert_eq!((reissued.piece, reissued.offset), (0, 0));
        assert_eq!(scheduler.pending.len(), 1);
    }

    #[test]
    fn completing_a_piece_with_correct_hash_moves_it_to_have() {
        let torrent = torrent_fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = Scheduler::new(&torrent, &config_fixture(), dir.path()).unwrap();
        let peer = [1u8; 20];
        scheduler.add_peer(peer, BitField::from_bytes(&[0b1000_0000], 3).unwrap());

        scheduler.next_request(peer, 0).unwrap();
        scheduler
            .block_received(peer, 0, 0, Bytes::from_static(b"abcd"))
            .unwrap();

        assert!(scheduler.have.contains(&0));
        assert!(!scheduler.ongoing.contains(&0));
        assert_eq!(scheduler.bytes_downloaded(), 4);
    }

    #[test]
    fn completing_a_piece_with_wrong_hash_resets_it() {
        let torrent = torrent_fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = Scheduler::new(&torrent, &config_fixture(), dir.path()).unwrap();
        let peer = [1u8; 20];
        scheduler.add_peer(peer, BitField::from_bytes(&[0b1000_0000], 3).unwrap());

        scheduler.next_request(peer, 0).unwrap();
        scheduler
            .block_received(peer, 0, 0, Bytes::from_static(b"xxxx"))
            .unwrap();

        assert!(!scheduler.have.contains(&0));
        assert!(scheduler.ongoing.contains(&0));
        assert_eq!(scheduler.pieces[0].blocks[0].status, BlockStatus::Missing);
    }

    #[test]
    fn next_request_returns_none_for_unknown_peer() {
        let torrent = torrent_fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = Scheduler::new(&torrent, &config_fixture(), dir.path()).unwrap();
        assert!(scheduler.next_request([9u8; 20], 0).is_none());
    }
}
