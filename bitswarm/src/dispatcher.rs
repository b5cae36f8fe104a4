use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use slotmap::SlotMap;

use crate::{
    Bitfield, BlockReceived, PeerConnection, PeerKey, PieceIdx, Progress, TorrentInfo,
};

pub const MAX_PEER_PENDING_BLOCKS: usize = 32;

/// A block of a piece, identified by its index inside the piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef {
    pub piece: PieceIdx,
    pub block: u32,
}

impl BlockRef {
    pub fn new(piece: PieceIdx, block: u32) -> Self {
        Self { piece, block }
    }
}

/// Where a peer stands with respect to receiving more work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PeerSchedule {
    /// The remote peer is choking us.
    Choked,
    /// Unchoked but the connection is not ready for requests.
    Idle,
    /// Sitting in the ready queue.
    Queued,
    /// Too many outstanding requests, waiting for one to finish.
    AwaitingCompletion,
    /// Nothing this peer holds can be requested right now.
    Starved,
}

#[derive(Clone)]
pub struct PeerSlot {
    conn: Arc<dyn PeerConnection>,
    addr: SocketAddr,
    pieces: Bitfield,
    schedule: PeerSchedule,
    /// requests issued to this peer that have not completed yet
    pending: Vec<BlockRef>,
    /// are we interested in the peer
    interested: bool,
}

impl PeerSlot {
    pub fn conn(&self) -> &Arc<dyn PeerConnection> {
        &self.conn
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn pieces(&self) -> &Bitfield {
        &self.pieces
    }

    pub fn schedule(&self) -> PeerSchedule {
        self.schedule
    }

    pub fn pending(&self) -> &[BlockRef] {
        &self.pending
    }

    pub fn interested(&self) -> bool {
        self.interested
    }

    pub fn set_interested(&mut self, interested: bool) {
        self.interested = interested;
    }
}

impl std::fmt::Debug for PeerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSlot")
            .field("addr", &self.addr)
            .field("schedule", &self.schedule)
            .field("pieces", &self.pieces.num_set())
            .field("pending", &self.pending.len())
            .field("interested", &self.interested)
            .finish()
    }
}

/// A block assigned to a peer. The caller is expected to issue the request
/// and report back with [`Dispatcher::block_completed`].
#[derive(Clone)]
pub struct BlockRequest {
    pub peer: PeerKey,
    pub conn: Arc<dyn PeerConnection>,
    pub piece: PieceIdx,
    pub block: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.piece, self.block)
    }
}

impl std::fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRequest")
            .field("peer", &self.peer)
            .field("piece", &self.piece)
            .field("block", &self.block)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

/// Outcome of a finished block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The block was stored, the piece still misses other blocks.
    Received,
    /// The block was the last missing one, the piece is ready to be verified.
    PieceComplete(PieceIdx),
    /// The block was already available.
    Duplicate,
    /// The request failed and the block can be requested again.
    Released,
    /// The request failed but the block was no longer assigned to this peer.
    Stale,
}

/// Hands out block requests to peers.
///
/// Peers that can take more work wait in a ready queue. Each call to
/// [`Dispatcher::next_request`] pops the next peer and assigns it a block of
/// the rarest piece it holds, preferring pieces that are already partially
/// downloaded. Peers are put back in the queue as long as they have room in
/// their pipeline, the dispatcher being the only consumer of the queue.
#[derive(Debug)]
pub struct Dispatcher {
    info: TorrentInfo,
    progress: Arc<Progress>,
    max_pending: usize,
    peers: SlotMap<PeerKey, PeerSlot>,
    /// number of peers holding each piece
    availability: Vec<u32>,
    ready: VecDeque<PeerKey>,
    /// peer currently responsible for each requested block
    owners: HashMap<BlockRef, PeerKey>,
}

impl Dispatcher {
    pub fn new(info: TorrentInfo, progress: Arc<Progress>, max_pending: usize) -> Self {
        assert_eq!(info.pieces_count(), progress.pieces_count());
        let availability = vec![0; info.pieces_count() as usize];
        Self {
            info,
            progress,
            max_pending: max_pending.max(1),
            peers: Default::default(),
            availability,
            ready: Default::default(),
            owners: Default::default(),
        }
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    pub fn peer(&self, key: PeerKey) -> Option<&PeerSlot> {
        self.peers.get(key)
    }

    pub fn peer_mut(&mut self, key: PeerKey) -> Option<&mut PeerSlot> {
        self.peers.get_mut(key)
    }

    pub fn peers(&self) -> impl Iterator<Item = (PeerKey, &PeerSlot)> {
        self.peers.iter()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = (PeerKey, &mut PeerSlot)> {
        self.peers.iter_mut()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn availability(&self, piece: PieceIdx) -> u32 {
        self.availability[piece.index()]
    }

    /// Peer currently responsible for a requested block.
    pub fn owner(&self, block: BlockRef) -> Option<PeerKey> {
        self.owners.get(&block).copied()
    }

    /// Whether the peer holds a piece that is not verified yet.
    pub fn peer_has_missing_pieces(&self, key: PeerKey) -> bool {
        match self.peers.get(key) {
            Some(peer) => peer.pieces.contains_missing_in(&self.progress.verified_pieces()),
            None => false,
        }
    }

    /// Register a peer. It starts choked and holding nothing.
    pub fn peer_add(&mut self, conn: Arc<dyn PeerConnection>) -> PeerKey {
        let addr = conn.addr();
        let pieces = Bitfield::with_size(self.info.pieces_count());
        let key = self.peers.insert(PeerSlot {
            conn,
            addr,
            pieces,
            schedule: PeerSchedule::Choked,
            pending: Default::default(),
            interested: false,
        });
        tracing::debug!(peer = ?key, addr = %addr, "peer added");
        key
    }

    /// Forget a peer, releasing every block it was responsible for.
    /// Returns the number of released blocks.
    pub fn peer_remove(&mut self, key: PeerKey) -> Option<(PeerSlot, usize)> {
        let peer = self.peers.remove(key)?;
        for piece in peer.pieces.pieces() {
            self.availability[piece.index()] -= 1;
        }
        let mut released = 0;
        for &block in peer.pending.iter() {
            if self.release(key, block) {
                released += 1;
            }
        }
        tracing::debug!(peer = ?key, addr = %peer.addr, released, "peer removed");
        Some((peer, released))
    }

    /// Replace the set of pieces a peer holds.
    /// Returns false if the bitfield does not match the torrent.
    pub fn peer_bitfield(&mut self, key: PeerKey, bitfield: Bitfield) -> bool {
        if bitfield.len() != self.info.pieces_count() {
            return false;
        }
        let peer = match self.peers.get_mut(key) {
            Some(peer) => peer,
            None => return true,
        };
        let previous = std::mem::replace(&mut peer.pieces, bitfield);
        for piece in previous.pieces() {
            self.availability[piece.index()] -= 1;
        }
        for piece in self.peers[key].pieces.pieces() {
            self.availability[piece.index()] += 1;
        }
        self.wake(key);
        true
    }

    /// Record that a peer now holds a piece.
    /// Returns false if the piece index is out of range.
    pub fn peer_have(&mut self, key: PeerKey, piece: PieceIdx) -> bool {
        if !self.info.piece_index_valid(piece) {
            return false;
        }
        let peer = match self.peers.get_mut(key) {
            Some(peer) => peer,
            None => return true,
        };
        if peer.pieces.has_piece(piece) {
            return true;
        }
        peer.pieces.set_piece(piece);
        self.availability[piece.index()] += 1;
        self.wake(key);
        true
    }

    /// The remote peer choked us. Requests already in flight keep their
    /// blocks until they complete or time out.
    pub fn peer_choked(&mut self, key: PeerKey) {
        if let Some(peer) = self.peers.get_mut(key) {
            peer.schedule = PeerSchedule::Choked;
        }
    }

    pub fn peer_unchoked(&mut self, key: PeerKey) {
        if let Some(peer) = self.peers.get(key) {
            if peer.schedule == PeerSchedule::Choked {
                self.enqueue(key);
            }
        }
    }

    /// Put idle peers whose connection became ready back in the queue.
    pub fn refresh_idle(&mut self) {
        let idle = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.schedule == PeerSchedule::Idle
                    && peer.conn.is_ready()
                    && !peer.conn.is_request_pipeline_full()
            })
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in idle {
            self.enqueue(key);
        }
    }

    /// Assign the next block to the next ready peer, if any.
    pub fn next_request(&mut self) -> Option<BlockRequest> {
        while let Some(key) = self.ready.pop_front() {
            let peer = match self.peers.get(key) {
                Some(peer) if peer.schedule == PeerSchedule::Queued => peer,
                _ => continue,
            };

            // a full connection pipeline with nothing of ours in flight gets no
            // completion to wake it, so it is polled again as idle
            let choice = if !peer.conn.is_ready() {
                Err(PeerSchedule::Idle)
            } else if self.pipeline_full(peer) && peer.pending.is_empty() {
                Err(PeerSchedule::Idle)
            } else if self.pipeline_full(peer) {
                Err(PeerSchedule::AwaitingCompletion)
            } else {
                self.pick_piece(&peer.pieces).ok_or(PeerSchedule::Starved)
            };

            let piece = match choice {
                Ok(piece) => piece,
                Err(schedule) => {
                    tracing::trace!(peer = ?key, ?schedule, "peer leaves the ready queue");
                    self.peers[key].schedule = schedule;
                    continue;
                }
            };

            let block = match self.progress.request_next_block(piece) {
                Some(block) => block,
                None => {
                    tracing::debug!(peer = ?key, piece = %piece, "picked piece has no requestable block");
                    self.peers[key].schedule = PeerSchedule::Starved;
                    continue;
                }
            };

            let block_ref = BlockRef::new(piece, block);
            self.owners.insert(block_ref, key);
            let peer = &mut self.peers[key];
            peer.pending.push(block_ref);
            let conn = peer.conn.clone();
            if self.pipeline_full(&self.peers[key]) {
                self.peers[key].schedule = PeerSchedule::AwaitingCompletion;
            } else {
                self.ready.push_back(key);
            }

            return Some(BlockRequest {
                peer: key,
                conn,
                piece,
                block,
                offset: self.info.block_offset(block),
                length: self.info.block_length(piece, block),
            });
        }
        None
    }

    /// Report the end of a request handed out by [`Dispatcher::next_request`].
    ///
    /// A successful block is accepted even if its request was already
    /// released, a failed one only gives the block back if this peer is still
    /// responsible for it.
    pub fn block_completed(&mut self, key: PeerKey, block: BlockRef, success: bool) -> Completion {
        if let Some(peer) = self.peers.get_mut(key) {
            if let Some(position) = peer.pending.iter().position(|b| *b == block) {
                peer.pending.swap_remove(position);
            }
            if peer.schedule == PeerSchedule::AwaitingCompletion {
                self.enqueue(key);
            }
        }

        if success {
            self.owners.remove(&block);
            match self.progress.set_block_received(block.piece, block.block) {
                BlockReceived::Duplicate => Completion::Duplicate,
                BlockReceived::Partial => Completion::Received,
                BlockReceived::PieceComplete => Completion::PieceComplete(block.piece),
            }
        } else if self.release(key, block) {
            Completion::Released
        } else {
            Completion::Stale
        }
    }

    /// Mark a piece as verified and drop any leftover assignment for it.
    pub fn piece_verified(&mut self, piece: PieceIdx) {
        self.progress.set_piece_verified(piece);
        self.owners.retain(|block, _| block.piece != piece);
    }

    /// A piece failed verification, all its blocks must be downloaded again.
    pub fn piece_failed(&mut self, piece: PieceIdx) {
        self.progress.set_piece_missing(piece);
        self.owners.retain(|block, _| block.piece != piece);
        self.wake_holders(piece);
    }

    fn release(&mut self, key: PeerKey, block: BlockRef) -> bool {
        if self.owners.get(&block) != Some(&key) {
            return false;
        }
        self.owners.remove(&block);
        let released = self.progress.set_block_not_requested(block.piece, block.block);
        if released {
            self.wake_holders(block.piece);
        }
        released
    }

    fn pipeline_full(&self, peer: &PeerSlot) -> bool {
        peer.pending.len() >= self.max_pending || peer.conn.is_request_pipeline_full()
    }

    /// Rarest piece held by the peer, partially downloaded pieces first.
    fn pick_piece(&self, pieces: &Bitfield) -> Option<PieceIdx> {
        let partial = self.progress.partially_missing_pieces_with_unrequested_blocks();
        self.rarest(&partial, pieces).or_else(|| {
            let missing = self.progress.completely_missing_pieces_with_unrequested_blocks();
            self.rarest(&missing, pieces)
        })
    }

    fn rarest(&self, candidates: &Bitfield, pieces: &Bitfield) -> Option<PieceIdx> {
        candidates
            .common_pieces(pieces)
            .min_by_key(|piece| (self.availability[piece.index()], *piece))
    }

    fn enqueue(&mut self, key: PeerKey) {
        let peer = &mut self.peers[key];
        if peer.schedule != PeerSchedule::Queued {
            peer.schedule = PeerSchedule::Queued;
            self.ready.push_back(key);
        }
    }

    /// Requeue a starved or idle peer after its pieces changed.
    fn wake(&mut self, key: PeerKey) {
        let schedule = self.peers[key].schedule;
        if matches!(schedule, PeerSchedule::Starved | PeerSchedule::Idle) {
            self.enqueue(key);
        }
    }

    fn wake_holders(&mut self, piece: PieceIdx) {
        let starved = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.schedule == PeerSchedule::Starved && peer.pieces.has_piece(piece)
            })
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in starved {
            tracing::trace!(peer = ?key, piece = %piece, "waking starved peer");
            self.enqueue(key);
        }
    }
}
