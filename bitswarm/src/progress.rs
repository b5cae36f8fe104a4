//! Authoritative download progress of a torrent.
//!
//! Block state lives in two global bit vectors (`available` and `requested`)
//! indexed through a per piece block base. Piece status and the two
//! scheduling sets are derived bit vectors recomputed by every mutator, so the
//! dispatcher can query them without scanning blocks.
//!
//! Every operation takes the single lock guarding the state, and every query
//! returning a set hands out a clone.

use parking_lot::Mutex;

use crate::{Bitfield, PieceIdx, TorrentInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PieceStatus {
    /// Hash confirmed.
    Verified,
    /// Every block available, hash not checked yet.
    Complete,
    PartiallyMissing,
    CompletelyMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReceived {
    /// The block was already available, nothing changed.
    Duplicate,
    /// The piece still misses blocks.
    Partial,
    /// This block was the last missing one, the piece awaits verification.
    PieceComplete,
}

/// Per piece status counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ProgressSummary {
    pub verified: u32,
    pub complete: u32,
    pub partially_missing: u32,
    pub completely_missing: u32,
}

/// Number of blocks of every piece and where each piece starts in the global
/// block vectors.
#[derive(Debug, Clone)]
pub struct ProgressLayout {
    block_base: Vec<u32>,
    block_count: Vec<u32>,
    total_blocks: u32,
}

impl ProgressLayout {
    pub fn new(block_count: Vec<u32>) -> Self {
        assert!(
            block_count.iter().all(|&n| n > 0),
            "every piece must have at least one block"
        );
        let mut block_base = Vec::with_capacity(block_count.len());
        let mut total_blocks = 0u32;
        for &count in block_count.iter() {
            block_base.push(total_blocks);
            total_blocks += count;
        }
        Self {
            block_base,
            block_count,
            total_blocks,
        }
    }

    pub fn from_info(info: &TorrentInfo) -> Self {
        Self::new(info.piece_indices().map(|p| info.blocks_count(p)).collect())
    }

    pub fn pieces_count(&self) -> u32 {
        self.block_count.len() as u32
    }

    pub fn blocks_count(&self, piece: PieceIdx) -> u32 {
        self.block_count[piece.index()]
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    fn block_bit(&self, piece: PieceIdx, block: u32) -> u32 {
        let count = self.blocks_count(piece);
        assert!(
            block < count,
            "block {block} out of range for {piece} with {count} blocks"
        );
        self.block_base[piece.index()] + block
    }

    fn piece_bits(&self, piece: PieceIdx) -> std::ops::Range<u32> {
        let base = self.block_base[piece.index()];
        base..base + self.block_count[piece.index()]
    }
}

#[derive(Debug)]
struct ProgressState {
    available: Bitfield,
    requested: Bitfield,
    available_count: Vec<u32>,
    requested_count: Vec<u32>,

    verified: Bitfield,
    complete: Bitfield,
    partially_missing: Bitfield,
    completely_missing: Bitfield,
    completely_missing_unrequested: Bitfield,
    partially_missing_unrequested: Bitfield,
}

#[derive(Debug)]
pub struct Progress {
    layout: ProgressLayout,
    state: Mutex<ProgressState>,
}

impl Progress {
    /// Empty progress, every piece completely missing.
    pub fn new(layout: ProgressLayout) -> Self {
        let pieces = layout.pieces_count();
        let blocks = layout.total_blocks();
        let mut state = ProgressState {
            available: Bitfield::with_size(blocks),
            requested: Bitfield::with_size(blocks),
            available_count: vec![0; pieces as usize],
            requested_count: vec![0; pieces as usize],
            verified: Bitfield::with_size(pieces),
            complete: Bitfield::with_size(pieces),
            partially_missing: Bitfield::with_size(pieces),
            completely_missing: Bitfield::with_size(pieces),
            completely_missing_unrequested: Bitfield::with_size(pieces),
            partially_missing_unrequested: Bitfield::with_size(pieces),
        };
        for index in 0..pieces {
            state.refresh(&layout, PieceIdx::new(index));
        }
        Self {
            layout,
            state: Mutex::new(state),
        }
    }

    pub fn from_info(info: &TorrentInfo) -> Self {
        Self::new(ProgressLayout::from_info(info))
    }

    /// Progress resumed from a bit vector of pieces verified in an earlier run.
    pub fn with_verified(layout: ProgressLayout, verified: &Bitfield) -> Self {
        let progress = Self::new(layout);
        let pieces = progress.pieces_count().min(verified.len());
        for index in (0..pieces).filter(|&i| verified.get(i)) {
            progress.set_piece_verified(PieceIdx::new(index));
        }
        progress
    }

    pub fn layout(&self) -> &ProgressLayout {
        &self.layout
    }

    pub fn pieces_count(&self) -> u32 {
        self.layout.pieces_count()
    }

    pub fn blocks_count(&self, piece: PieceIdx) -> u32 {
        self.layout.blocks_count(piece)
    }

    /// Mark a block as requested. Refused when the block is already
    /// available or already requested.
    pub fn set_block_requested(&self, piece: PieceIdx, block: u32) -> bool {
        let bit = self.layout.block_bit(piece, block);
        let mut state = self.state.lock();
        if state.available.get(bit) || state.requested.get(bit) {
            return false;
        }
        state.requested.set(bit);
        state.requested_count[piece.index()] += 1;
        state.refresh(&self.layout, piece);
        true
    }

    /// Return a block to the eligible pool. Returns whether it was requested.
    pub fn set_block_not_requested(&self, piece: PieceIdx, block: u32) -> bool {
        let bit = self.layout.block_bit(piece, block);
        let mut state = self.state.lock();
        if !state.requested.get(bit) {
            return false;
        }
        state.requested.unset(bit);
        state.requested_count[piece.index()] -= 1;
        state.refresh(&self.layout, piece);
        true
    }

    /// Pick the lowest eligible block of a piece and mark it requested.
    pub fn request_next_block(&self, piece: PieceIdx) -> Option<u32> {
        let range = self.layout.piece_bits(piece);
        let base = range.start;
        let mut state = self.state.lock();
        if state.verified.has_piece(piece) {
            return None;
        }
        let bit = range
            .into_iter()
            .find(|&bit| !state.available.get(bit) && !state.requested.get(bit))?;
        state.requested.set(bit);
        state.requested_count[piece.index()] += 1;
        state.refresh(&self.layout, piece);
        Some(bit - base)
    }

    pub fn set_block_received(&self, piece: PieceIdx, block: u32) -> BlockReceived {
        let bit = self.layout.block_bit(piece, block);
        let mut state = self.state.lock();
        if state.available.get(bit) {
            return BlockReceived::Duplicate;
        }
        if state.requested.get(bit) {
            state.requested.unset(bit);
            state.requested_count[piece.index()] -= 1;
        }
        state.available.set(bit);
        state.available_count[piece.index()] += 1;
        state.refresh(&self.layout, piece);
        if state.complete.has_piece(piece) {
            BlockReceived::PieceComplete
        } else {
            BlockReceived::Partial
        }
    }

    /// Mark a piece as verified, whatever its block state was.
    pub fn set_piece_verified(&self, piece: PieceIdx) {
        let range = self.layout.piece_bits(piece);
        let mut state = self.state.lock();
        if state.verified.has_piece(piece) {
            return;
        }
        state.available.set_range(range.clone());
        state.requested.unset_range(range);
        state.available_count[piece.index()] = self.layout.blocks_count(piece);
        state.requested_count[piece.index()] = 0;
        state.verified.set_piece(piece);
        state.refresh(&self.layout, piece);
    }

    /// Drop everything known about a piece, it becomes completely missing.
    pub fn set_piece_missing(&self, piece: PieceIdx) {
        let range = self.layout.piece_bits(piece);
        let mut state = self.state.lock();
        state.available.unset_range(range.clone());
        state.requested.unset_range(range);
        state.available_count[piece.index()] = 0;
        state.requested_count[piece.index()] = 0;
        state.verified.unset_piece(piece);
        state.refresh(&self.layout, piece);
    }

    pub fn completely_missing_pieces_with_unrequested_blocks(&self) -> Bitfield {
        self.state.lock().completely_missing_unrequested.clone()
    }

    pub fn partially_missing_pieces_with_unrequested_blocks(&self) -> Bitfield {
        self.state.lock().partially_missing_unrequested.clone()
    }

    /// Every block of the piece is available (Complete or Verified).
    pub fn is_piece_complete(&self, piece: PieceIdx) -> bool {
        let state = self.state.lock();
        state.available_count[piece.index()] == self.layout.blocks_count(piece)
    }

    pub fn is_piece_verified(&self, piece: PieceIdx) -> bool {
        self.state.lock().verified.has_piece(piece)
    }

    pub fn is_all_pieces_verified(&self) -> bool {
        self.state.lock().verified.complete()
    }

    pub fn status(&self, piece: PieceIdx) -> PieceStatus {
        self.state.lock().status(piece)
    }

    pub fn verified_pieces(&self) -> Bitfield {
        self.state.lock().verified.clone()
    }

    pub fn num_verified(&self) -> u32 {
        self.state.lock().verified.num_set()
    }

    pub fn available_blocks(&self, piece: PieceIdx) -> u32 {
        self.state.lock().available_count[piece.index()]
    }

    pub fn requested_blocks(&self, piece: PieceIdx) -> u32 {
        self.state.lock().requested_count[piece.index()]
    }

    /// Fraction of verified pieces.
    pub fn progress(&self) -> f64 {
        let pieces = self.pieces_count();
        if pieces == 0 {
            return 1.0;
        }
        f64::from(self.num_verified()) / f64::from(pieces)
    }

    pub fn summary(&self) -> ProgressSummary {
        let state = self.state.lock();
        ProgressSummary {
            verified: state.verified.num_set(),
            complete: state.complete.num_set(),
            partially_missing: state.partially_missing.num_set(),
            completely_missing: state.completely_missing.num_set(),
        }
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let state = self.state.lock();
        for index in 0..self.pieces_count() {
            let piece = PieceIdx::new(index);
            let range = self.layout.piece_bits(piece);
            let blocks = self.layout.blocks_count(piece);
            let available = state.available.count_range(range.clone());
            let requested = state.requested.count_range(range.clone());
            assert_eq!(available, state.available_count[piece.index()]);
            assert_eq!(requested, state.requested_count[piece.index()]);
            assert!(requested <= blocks);
            assert!(range.clone().all(|b| !(state.available.get(b) && state.requested.get(b))));

            let memberships = [
                state.verified.has_piece(piece),
                state.complete.has_piece(piece),
                state.partially_missing.has_piece(piece),
                state.completely_missing.has_piece(piece),
            ];
            assert_eq!(memberships.iter().filter(|&&m| m).count(), 1, "{piece}");

            let full = available == blocks;
            assert_eq!(full, memberships[0] || memberships[1], "{piece}");

            let eligible = !memberships[0] && available + requested < blocks;
            assert_eq!(
                state.completely_missing_unrequested.has_piece(piece),
                eligible && memberships[3]
            );
            assert_eq!(
                state.partially_missing_unrequested.has_piece(piece),
                eligible && memberships[2]
            );
        }
    }
}

impl ProgressState {
    fn status(&self, piece: PieceIdx) -> PieceStatus {
        if self.verified.has_piece(piece) {
            PieceStatus::Verified
        } else if self.complete.has_piece(piece) {
            PieceStatus::Complete
        } else if self.partially_missing.has_piece(piece) {
            PieceStatus::PartiallyMissing
        } else {
            PieceStatus::CompletelyMissing
        }
    }

    // recompute the derived bits of a single piece
    fn refresh(&mut self, layout: &ProgressLayout, piece: PieceIdx) {
        let index = piece.0;
        let blocks = layout.blocks_count(piece);
        let available = self.available_count[piece.index()];
        let requested = self.requested_count[piece.index()];
        let verified = self.verified.get(index);

        let complete = !verified && available == blocks;
        let partial = !verified && available > 0 && available < blocks;
        let missing = !verified && available == 0;
        let eligible = !verified && available + requested < blocks;

        self.complete.set_to(index, complete);
        self.partially_missing.set_to(index, partial);
        self.completely_missing.set_to(index, missing);
        self.completely_missing_unrequested.set_to(index, eligible && missing);
        self.partially_missing_unrequested.set_to(index, eligible && partial);
    }
}
