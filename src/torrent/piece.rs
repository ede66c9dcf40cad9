//! Piece runtime state and the selection policy.

use hashbrown::HashSet;
use rand::Rng;

use crate::{
    bitfield::{Bitfield, PieceBitfield},
    wire::{BlockInfo, BLOCK_LEN},
};

/// While fewer pieces than this are verified, selection is uniformly
/// random; after that it switches to rarest-first.
pub const RANDOM_FIRST_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceState {
    #[default]
    NotStarted,
    InProgress,
    /// Every block received, hash not checked yet.
    Complete,
    /// Hash checked out. Terminal.
    Verified,
}

/// One block of a piece and its request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSlot {
    pub begin: u32,
    pub len: u32,
    pub requested: bool,
    pub received: bool,
}

/// A piece being downloaded: its block table and reassembly buffer.
///
/// The buffer lives from the first scheduled block until the piece is
/// written to disk, where it is released.
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: usize,
    pub state: PieceState,
    pub blocks: Vec<BlockSlot>,
    pub buf: Vec<u8>,
}

impl Piece {
    pub fn new(index: usize, size: u32) -> Self {
        let count = size.div_ceil(BLOCK_LEN) as usize;
        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            let begin = i as u32 * BLOCK_LEN;
            blocks.push(BlockSlot {
                begin,
                len: BLOCK_LEN.min(size - begin),
                requested: false,
                received: false,
            });
        }

        Self {
            index,
            state: PieceState::NotStarted,
            blocks,
            buf: vec![0u8; size as usize],
        }
    }

    /// A piece restored from the resume store: verified, no buffer.
    pub fn verified(index: usize) -> Self {
        Self {
            index,
            state: PieceState::Verified,
            blocks: vec![],
            buf: vec![],
        }
    }

    pub fn block_mut(&mut self, begin: u32) -> Option<&mut BlockSlot> {
        self.blocks.iter_mut().find(|b| b.begin == begin)
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.received)
    }

    /// The blocks still missing, in ascending offset order, marked as
    /// requested on the way out.
    pub fn take_missing_blocks(&mut self) -> Vec<BlockInfo> {
        let index = self.index as u32;
        self.blocks
            .iter_mut()
            .filter(|b| !b.received && !b.requested)
            .map(|b| {
                b.requested = true;
                BlockInfo { index, begin: b.begin, len: b.len }
            })
            .collect()
    }

    /// Forget in-flight requests so another peer can pick the piece up.
    /// Received blocks are kept.
    pub fn clear_requested(&mut self) {
        for block in &mut self.blocks {
            if !block.received {
                block.requested = false;
            }
        }
        if !self.blocks.iter().any(|b| b.received) {
            self.state = PieceState::NotStarted;
        }
    }

    /// Throw away everything downloaded for this piece. Used after a hash
    /// mismatch.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.requested = false;
            block.received = false;
        }
        self.buf.fill(0);
        self.state = PieceState::NotStarted;
    }

    /// Release the reassembly buffer once the piece is on disk.
    pub fn release_buf(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Pick a piece for a peer, or None when it has nothing we need.
///
/// Candidates are pieces the peer has that are neither verified nor
/// assigned elsewhere. Below [`RANDOM_FIRST_COUNT`] verified pieces one is
/// drawn uniformly at random; after that the least available wins, ties
/// broken by the lowest index.
pub fn select_piece(
    pieces: &[Piece],
    availability: &[u32],
    peer_has: &Bitfield,
    assigned: &HashSet<usize>,
    verified_count: usize,
    rng: &mut impl Rng,
) -> Option<usize> {
    let candidates: Vec<usize> = pieces
        .iter()
        .filter(|p| {
            p.state != PieceState::Verified
                && !assigned.contains(&p.index)
                && peer_has.has(p.index)
        })
        .map(|p| p.index)
        .collect();

    if candidates.is_empty() {
        return None;
    }

    if verified_count < RANDOM_FIRST_COUNT {
        return Some(candidates[rng.random_range(0..candidates.len())]);
    }

    candidates
        .into_iter()
        .min_by_key(|&index| (availability[index], index))
}
