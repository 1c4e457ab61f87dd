//! Piece and block bookkeeping: the scheduler's view of how a single piece
//! decomposes into fixed-size requestable blocks.
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Missing,
    Pending,
    Retrieved,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub piece: usize,
    pub offset: u32,
    pub length: u32,
    pub status: BlockStatus,
    pub data: Option<Bytes>,
}

impl Block {
    fn new(piece: usize, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
            status: BlockStatus::Missing,
            data: None,
        }
    }
}

/// Identifies a block without carrying its payload, used to key pending
/// requests and to match incoming `Piece` messages back to the block they
/// satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub piece: usize,
    pub offset: u32,
}

/// What `Scheduler::next_request` hands back to a session: enough to
/// serialize a wire `Request` message, without exposing the scheduler's
/// internal `Block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece: usize,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub block: BlockRef,
    pub issued_at_ms: u64,
}

impl PendingRequest {
    pub fn is_expired(&self, now_ms: u64, max_pending_ms: u64) -> bool {
        now_ms.saturating_sub(self.issued_at_ms) > max_pending_ms
    }
}

#[derive(Debug, Clone)]
pub struct Piece {
    pub index: usize,
    pub hash: [u8; 20],
    pub blocks: Vec<Block>,
}

impl Piece {
    /// Lays out a piece of `piece_size` bytes into blocks of `request_size`
    /// bytes, with a short final block if `piece_size` isn't a multiple of
    /// `request_size`.
    pub fn new(index: usize, hash: [u8; 20], piece_size: u64, request_size: u32) -> Self {
        let mut blocks = Vec::new();
        let mut offset: u64 = 0;
        while offset < piece_size {
            let remaining = piece_size - offset;
            let length = remaining.min(request_size as u64) as u32;
            blocks.push(Block::new(index, offset as u32, length));
            offset += length as u64;
        }
        Self {
            index,
            hash,
            blocks,
        }
    }

    /// The first block still `Missing`, in offset order.
    pub fn next_missing(&mut self) -> Option<&mut Block> {
        self.blocks
            .iter_mut()
            .find(|b| b.status == BlockStatus::Missing)
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.status == BlockStatus::Retrieved)
    }

    /// Concatenates block payloads in ascending offset order. Panics if
    /// called before `is_complete` — callers must check first.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.blocks.iter().map(|b| b.length as usize).sum());
        for block in &self.blocks {
            out.extend_from_slice(
                block
                    .data
                    .as_deref()
                    .expect("assemble called on incomplete piece"),
            );
        }
        out
    }

    /// Resets every block to `Missing` and drops payloads, used after a
    /// hash-verification failure so the piece can be re-fetched.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.status = BlockStatus::Missing;
            block.data = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lays_out_full_blocks() {
        let piece = Piece::new(0, [0u8; 20], 32 * 1024, 16 * 1024);
        assert_eq!(piece.blocks.len(), 2);
        assert_eq!(piece.blocks[0].offset, 0);
        assert_eq!(piece.blocks[0].length, 16 * 1024);
        assert_eq!(piece.blocks[1].offset, 16 * 1024);
        assert_eq!(piece.blocks[1].length, 16 * 1024);
    }

    #[test]
    fn short_final_block() {
        let piece = Piece::new(0, [0u8; 20], 20 * 1024, 16 * 1024);
        assert_eq!(piece.blocks.len(), 2);
        assert_eq!(piece.blocks[1].length, 4 * 1024);
    }

    #[test]
    fn reset_clears_progress() {
        let mut piece = Piece::new(0, [0u8; 20], 4, 4);
        piece.blocks[0].status = BlockStatus::Retrieved;
        piece.blocks[0].data = Some(Bytes::from_static(b"abcd"));
        piece.reset();
        assert_eq!(piece.blocks[0].status, BlockStatus::Missing);
        assert!(piece.blocks[0].data.is_none());
    }
}
