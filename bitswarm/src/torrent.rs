use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot, Semaphore,
    },
    task::{AbortHandle, Id as TaskId, JoinError, JoinSet},
    time::MissedTickBehavior,
};

use crate::{
    Bitfield, BlockError, BlockRef, BlockRequest, ChokeDecision, Choker, Completion, Dispatcher,
    NetworkStatsAccum, PeerConnection, PeerEvent, PeerKey, PeerSlot, PieceIdx, PieceVerifier,
    Progress, ProgressLayout, RequestError, Storage, StorageError, TorrentInfo, TorrentView,
    TorrentViewPeer, DEFAULT_OPTIMISTIC_UNCHOKE_TICKS, DEFAULT_UNCHOKE_SLOTS,
    MAX_PEER_PENDING_BLOCKS,
};

const PEER_COUNT_LIMIT: usize = 50;
const CHECK_CONCURRENCY: usize = 4;

type Sender<T> = UnboundedSender<T>;
type Receiver<T> = UnboundedReceiver<T>;

/// Outbound notifications of a torrent.
pub type TorrentEvents = Receiver<TorrentEvent>;

#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// consider every piece verified and skip checking
    pub assume_complete: bool,
    /// pieces verified in a previous run, skips checking
    pub resume: Option<Bitfield>,
    /// pieces hashed at the same time while checking
    pub check_concurrency: usize,
    pub max_peers: usize,
    pub max_peer_pending_blocks: usize,
    pub request_timeout: Duration,
    pub unchoke_interval: Duration,
    pub unchoke_slots: usize,
    /// rotate the optimistic unchoke every this many unchoke rounds
    pub optimistic_unchoke_ticks: u64,
    /// seed for the optimistic unchoke pick, random when unset
    pub rng_seed: Option<u64>,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            assume_complete: false,
            resume: None,
            check_concurrency: CHECK_CONCURRENCY,
            max_peers: PEER_COUNT_LIMIT,
            max_peer_pending_blocks: MAX_PEER_PENDING_BLOCKS,
            request_timeout: Duration::from_secs(30),
            unchoke_interval: Duration::from_secs(10),
            unchoke_slots: DEFAULT_UNCHOKE_SLOTS,
            optimistic_unchoke_ticks: DEFAULT_OPTIMISTIC_UNCHOKE_TICKS,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TorrentMode {
    /// Hashing stored pieces before downloading.
    Checking,
    Downloading,
    /// Every piece is verified.
    Seeding,
    Stopped,
    Failed,
}

impl TorrentMode {
    fn is_finished(&self) -> bool {
        matches!(self, TorrentMode::Stopped | TorrentMode::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentEvent {
    /// A new peer address should be dialed, report back with
    /// [`Torrent::add_peer`] or [`Torrent::connect_failed`].
    Connect(SocketAddr),
    PieceVerified(PieceIdx),
    PieceFailed(PieceIdx),
    Completed,
    Stopped,
    Failed(String),
}

enum TorrentMsg {
    PeerAdd {
        conn: Arc<dyn PeerConnection>,
        response: oneshot::Sender<PeerKey>,
    },
    PeerEvent {
        peer_key: PeerKey,
        event: PeerEvent,
    },
    PeerDiscovered {
        addr: SocketAddr,
    },
    ConnectFailed {
        addr: SocketAddr,
    },
    View {
        response: oneshot::Sender<TorrentView>,
    },
    Stop,
}

/// Handle to a torrent running in its own task.
///
/// The task stops when [`Torrent::stop`] is called, when storage runs out
/// of space or once every handle is dropped.
#[derive(Clone)]
pub struct Torrent {
    sender: Sender<TorrentMsg>,
    info: TorrentInfo,
    progress: Arc<Progress>,
}

impl Torrent {
    pub fn spawn(
        info: TorrentInfo,
        storage: Arc<dyn Storage>,
        config: TorrentConfig,
    ) -> (Torrent, TorrentEvents) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let (event_sender, events) = tokio::sync::mpsc::unbounded_channel();
        let state = TorrentState::new(info.clone(), storage, config, event_sender);
        let torrent = Torrent {
            sender,
            info,
            progress: state.progress.clone(),
        };
        tokio::spawn(state.run(receiver));
        (torrent, events)
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    pub fn completed(&self) -> bool {
        self.progress.is_all_pieces_verified()
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Register a connected peer. Returns `None` if the torrent is no longer
    /// running or the peer limit has been reached.
    pub async fn add_peer(&self, conn: Arc<dyn PeerConnection>) -> Option<PeerKey> {
        let (sender, receiver) = oneshot::channel();
        self.send(TorrentMsg::PeerAdd {
            conn,
            response: sender,
        });
        receiver.await.ok()
    }

    pub fn peer_event(&self, peer_key: PeerKey, event: PeerEvent) {
        self.send(TorrentMsg::PeerEvent { peer_key, event });
    }

    pub fn peer_discovered(&self, addr: SocketAddr) {
        self.send(TorrentMsg::PeerDiscovered { addr });
    }

    pub fn connect_failed(&self, addr: SocketAddr) {
        self.send(TorrentMsg::ConnectFailed { addr });
    }

    pub async fn view(&self) -> Option<TorrentView> {
        let (sender, receiver) = oneshot::channel();
        self.send(TorrentMsg::View { response: sender });
        receiver.await.ok()
    }

    pub fn stop(&self) {
        self.send(TorrentMsg::Stop);
    }

    fn send(&self, message: TorrentMsg) {
        // the task is gone once the torrent stopped or failed
        let _ = self.sender.send(message);
    }
}

impl std::fmt::Debug for Torrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torrent")
            .field("name", &self.info.name())
            .field("running", &self.is_running())
            .finish()
    }
}

#[derive(Debug)]
struct BlockOutcome {
    peer: PeerKey,
    block: BlockRef,
    length: u32,
    result: Result<(), BlockError>,
}

/// A block request task still owned by the actor.
#[derive(Debug)]
struct InFlight {
    peer: PeerKey,
    block: BlockRef,
    handle: AbortHandle,
}

#[derive(Debug)]
struct VerifyOutcome {
    piece: PieceIdx,
    result: Result<bool, StorageError>,
}

struct TorrentState {
    mode: TorrentMode,
    config: TorrentConfig,
    info: TorrentInfo,
    storage: Arc<dyn Storage>,
    progress: Arc<Progress>,
    verifier: PieceVerifier,
    dispatcher: Dispatcher,
    choker: Choker,
    requests: JoinSet<BlockOutcome>,
    in_flight: HashMap<TaskId, InFlight>,
    verifications: JoinSet<VerifyOutcome>,
    verifying: HashMap<TaskId, PieceIdx>,
    /// pieces left to hash while checking
    checking_remaining: u32,
    /// addresses handed out for dialing that did not connect yet
    connecting: HashSet<SocketAddr>,
    network_stats: NetworkStatsAccum,
    events: Sender<TorrentEvent>,
}

impl TorrentState {
    fn new(
        info: TorrentInfo,
        storage: Arc<dyn Storage>,
        config: TorrentConfig,
        events: Sender<TorrentEvent>,
    ) -> Self {
        let layout = ProgressLayout::from_info(&info);
        let progress = match verified_from_config(&info, &config) {
            Some(verified) => Progress::with_verified(layout, &verified),
            None => Progress::new(layout),
        };
        let progress = Arc::new(progress);
        let dispatcher = Dispatcher::new(
            info.clone(),
            progress.clone(),
            config.max_peer_pending_blocks,
        );
        let choker = Choker::new(
            config.unchoke_slots,
            config.optimistic_unchoke_ticks,
            config.rng_seed,
        );
        Self {
            mode: TorrentMode::Checking,
            verifier: PieceVerifier::new(info.clone(), storage.clone()),
            config,
            info,
            storage,
            progress,
            dispatcher,
            choker,
            requests: Default::default(),
            in_flight: Default::default(),
            verifications: Default::default(),
            verifying: Default::default(),
            checking_remaining: 0,
            connecting: Default::default(),
            network_stats: Default::default(),
            events,
        }
    }

    async fn run(mut self, mut receiver: Receiver<TorrentMsg>) {
        self.init();
        let period = self.config.unchoke_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.mode.is_finished() {
            self.request_blocks();
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(message) => self.process(message),
                    None => self.stop(),
                },
                Some(result) = self.requests.join_next_with_id(), if !self.requests.is_empty() => {
                    self.on_block_outcome(result)
                }
                Some(result) = self.verifications.join_next_with_id(),
                    if !self.verifications.is_empty() =>
                {
                    self.on_verify_outcome(result)
                }
                _ = ticker.tick() => self.tick(),
            }
        }
        tracing::debug!(name = self.info.name(), mode = ?self.mode, "torrent task exiting");
    }

    fn init(&mut self) {
        let needs_check = !self.config.assume_complete
            && verified_from_config(&self.info, &self.config).is_none();
        if !needs_check {
            self.checking_done();
            return;
        }

        tracing::info!(name = self.info.name(), "checking torrent");
        self.mode = TorrentMode::Checking;
        self.checking_remaining = self.info.pieces_count();
        let semaphore = Arc::new(Semaphore::new(self.config.check_concurrency.max(1)));
        for piece in self.info.piece_indices() {
            let verifier = self.verifier.clone();
            let semaphore = semaphore.clone();
            let handle = self.verifications.spawn(async move {
                let _permit = semaphore.acquire().await;
                VerifyOutcome {
                    piece,
                    result: verifier.verify(piece).await,
                }
            });
            self.verifying.insert(handle.id(), piece);
        }
    }

    fn process(&mut self, message: TorrentMsg) {
        match message {
            TorrentMsg::PeerAdd { conn, response } => {
                if let Some(key) = self.on_peer_add(conn) {
                    let _ = response.send(key);
                }
            }
            TorrentMsg::PeerEvent { peer_key, event } => self.on_peer_event(peer_key, event),
            TorrentMsg::PeerDiscovered { addr } => self.on_peer_discovered(addr),
            TorrentMsg::ConnectFailed { addr } => {
                if self.connecting.remove(&addr) {
                    tracing::debug!(addr = %addr, "connection failed");
                }
            }
            TorrentMsg::View { response } => {
                let _ = response.send(self.view());
            }
            TorrentMsg::Stop => self.stop(),
        }
    }

    fn view(&self) -> TorrentView {
        let peers = self
            .dispatcher
            .peers()
            .map(|(key, peer)| TorrentViewPeer {
                key,
                addr: peer.addr(),
                upload_rate: peer.conn().upload_rate(),
                download_rate: peer.conn().download_rate(),
                schedule: peer.schedule(),
                interested: peer.interested(),
                unchoked: self.choker.is_unchoked(key),
                pending: peer.pending().len(),
            })
            .collect();

        TorrentView {
            info: self.info.clone(),
            mode: self.mode,
            peers,
            progress: self.progress.progress(),
            summary: self.progress.summary(),
            stats: self.network_stats.stats(),
        }
    }
}

impl TorrentState {
    fn on_peer_add(&mut self, conn: Arc<dyn PeerConnection>) -> Option<PeerKey> {
        let addr = conn.addr();
        self.connecting.remove(&addr);
        if self.dispatcher.peer_count() >= self.config.max_peers {
            tracing::debug!(addr = %addr, "peer limit reached, rejecting peer");
            conn.close();
            return None;
        }
        let key = self.dispatcher.peer_add(conn);
        tracing::info!(addr = %addr, "peer connected");
        Some(key)
    }

    fn on_peer_event(&mut self, peer_key: PeerKey, event: PeerEvent) {
        if self.dispatcher.peer(peer_key).is_none() {
            return;
        }

        match event {
            PeerEvent::Bitfield(bitfield) => {
                if !self.dispatcher.peer_bitfield(peer_key, bitfield) {
                    tracing::warn!(peer = ?peer_key, "peer sent a bitfield of the wrong size");
                    self.disconnect_peer(peer_key);
                    return;
                }
                self.update_interest(peer_key);
            }
            PeerEvent::Have(piece) => {
                if !self.dispatcher.peer_have(peer_key, piece) {
                    tracing::warn!(peer = ?peer_key, piece = %piece, "peer sent have with invalid piece index");
                    self.disconnect_peer(peer_key);
                    return;
                }
                self.update_interest(peer_key);
            }
            PeerEvent::Choke => self.dispatcher.peer_choked(peer_key),
            PeerEvent::Unchoke => self.dispatcher.peer_unchoked(peer_key),
            PeerEvent::Disconnected => self.remove_peer(peer_key),
        }
    }

    fn on_peer_discovered(&mut self, addr: SocketAddr) {
        if self.connecting.contains(&addr) || self.dispatcher.peers().any(|(_, p)| p.addr() == addr)
        {
            return;
        }
        if self.dispatcher.peer_count() + self.connecting.len() >= self.config.max_peers {
            tracing::trace!(addr = %addr, "peer limit reached, ignoring address");
            return;
        }
        self.connecting.insert(addr);
        self.emit(TorrentEvent::Connect(addr));
    }

    fn on_block_outcome(&mut self, result: Result<(TaskId, BlockOutcome), JoinError>) {
        let outcome = match result {
            Ok((id, outcome)) => {
                self.in_flight.remove(&id);
                outcome
            }
            Err(error) => {
                let Some(request) = self.in_flight.remove(&error.id()) else {
                    return;
                };
                let InFlight { peer, block, .. } = request;
                if error.is_panic() {
                    tracing::error!(
                        peer = ?peer,
                        piece = %block.piece,
                        block = block.block,
                        "block request task failed: {error}"
                    );
                }
                self.dispatcher.block_completed(peer, block, false);
                return;
            }
        };
        let BlockOutcome {
            peer,
            block,
            length,
            result,
        } = outcome;

        match result {
            Ok(()) => {
                self.network_stats.add_download(length);
                if let Completion::PieceComplete(piece) =
                    self.dispatcher.block_completed(peer, block, true)
                {
                    self.verify_piece(piece);
                }
            }
            Err(BlockError::Storage(error)) if error.is_fatal() => {
                self.dispatcher.block_completed(peer, block, false);
                self.fail(format!("failed to store block of {}: {error}", block.piece));
            }
            Err(BlockError::Storage(error)) => {
                tracing::warn!(piece = %block.piece, block = block.block, "failed to store block: {error}");
                self.dispatcher.block_completed(peer, block, false);
            }
            Err(BlockError::Request(error)) => {
                tracing::debug!(peer = ?peer, piece = %block.piece, block = block.block, "block request failed: {error}");
                self.dispatcher.block_completed(peer, block, false);
            }
        }
    }

    fn on_verify_outcome(&mut self, result: Result<(TaskId, VerifyOutcome), JoinError>) {
        let (piece, result) = match result {
            Ok((id, VerifyOutcome { piece, result })) => {
                self.verifying.remove(&id);
                (piece, result)
            }
            Err(error) => {
                let Some(piece) = self.verifying.remove(&error.id()) else {
                    return;
                };
                // counts as a hash mismatch so the piece is fetched again
                tracing::error!(piece = %piece, "verification task failed: {error}");
                (piece, Ok(false))
            }
        };

        match self.mode {
            TorrentMode::Checking => {
                self.checking_remaining -= 1;
                match result {
                    Ok(true) => self.dispatcher.piece_verified(piece),
                    Ok(false) => {}
                    Err(error) if error.is_fatal() => {
                        self.fail(format!("failed to check {piece}: {error}"));
                        return;
                    }
                    Err(error) => tracing::debug!(piece = %piece, "failed to read piece: {error}"),
                }
                if self.checking_remaining == 0 {
                    self.checking_done();
                }
            }
            TorrentMode::Downloading => match result {
                Ok(true) => self.on_piece_verified(piece),
                Ok(false) => {
                    tracing::warn!(piece = %piece, "piece failed verification");
                    self.dispatcher.piece_failed(piece);
                    self.emit(TorrentEvent::PieceFailed(piece));
                }
                Err(error) if error.is_fatal() => {
                    self.fail(format!("failed to verify {piece}: {error}"));
                }
                Err(error) => {
                    tracing::warn!(piece = %piece, "failed to read piece for verification: {error}");
                    self.dispatcher.piece_failed(piece);
                    self.emit(TorrentEvent::PieceFailed(piece));
                }
            },
            TorrentMode::Seeding | TorrentMode::Stopped | TorrentMode::Failed => {}
        }
    }

    fn on_piece_verified(&mut self, piece: PieceIdx) {
        self.dispatcher.piece_verified(piece);
        tracing::info!(
            piece = %piece,
            "verified: {}/{}",
            self.progress.num_verified(),
            self.info.pieces_count()
        );
        for (_, peer) in self.dispatcher.peers() {
            if let Err(error) = peer.conn().send_have(piece) {
                tracing::warn!(addr = %peer.addr(), "failed to send have: {error}");
            }
        }
        self.emit(TorrentEvent::PieceVerified(piece));

        if self.progress.is_all_pieces_verified() {
            self.seed();
        } else {
            self.update_interests();
        }
    }

    fn tick(&mut self) {
        if !matches!(self.mode, TorrentMode::Downloading | TorrentMode::Seeding) {
            return;
        }

        let seeding = self.mode == TorrentMode::Seeding;
        let candidates = self
            .dispatcher
            .peers()
            .map(|(key, peer)| {
                let rate = if seeding {
                    peer.conn().upload_rate()
                } else {
                    peer.conn().download_rate()
                };
                (key, rate)
            })
            .collect::<Vec<_>>();

        for (key, decision) in self.choker.tick(&candidates) {
            let peer = match self.dispatcher.peer(key) {
                Some(peer) => peer,
                None => continue,
            };
            let result = match decision {
                ChokeDecision::Choke => peer.conn().send_choke(),
                ChokeDecision::Unchoke => peer.conn().send_unchoke(),
            };
            match result {
                Ok(()) => tracing::debug!(addr = %peer.addr(), ?decision, "choke decision"),
                Err(error) => {
                    tracing::warn!(addr = %peer.addr(), ?decision, "failed to send choke decision: {error}")
                }
            }
        }

        self.update_interests();
    }
}

impl TorrentState {
    fn request_blocks(&mut self) {
        if self.mode != TorrentMode::Downloading {
            return;
        }
        self.dispatcher.refresh_idle();
        while let Some(request) = self.dispatcher.next_request() {
            tracing::trace!(
                peer = ?request.peer,
                piece = %request.piece,
                offset = request.offset,
                "requesting block"
            );
            let storage = self.storage.clone();
            let timeout = self.config.request_timeout;
            let (peer, block) = (request.peer, request.block_ref());
            let handle = self.requests.spawn(fetch_block(request, storage, timeout));
            self.in_flight.insert(handle.id(), InFlight { peer, block, handle });
        }
    }

    fn verify_piece(&mut self, piece: PieceIdx) {
        let verifier = self.verifier.clone();
        let handle = self.verifications.spawn(async move {
            VerifyOutcome {
                piece,
                result: verifier.verify(piece).await,
            }
        });
        self.verifying.insert(handle.id(), piece);
    }

    fn checking_done(&mut self) {
        tracing::info!(
            name = self.info.name(),
            "done checking torrent: {}/{} verified",
            self.progress.num_verified(),
            self.info.pieces_count()
        );
        if self.progress.is_all_pieces_verified() {
            self.seed();
        } else {
            self.mode = TorrentMode::Downloading;
            self.update_interests();
        }
    }

    fn seed(&mut self) {
        tracing::info!(name = self.info.name(), "torrent completed");
        self.mode = TorrentMode::Seeding;
        for (_, peer) in self.dispatcher.peers_mut() {
            peer.set_interested(false);
            if let Err(error) = peer.conn().send_not_interested() {
                tracing::warn!(addr = %peer.addr(), "failed to send not interested: {error}");
            }
        }
        self.emit(TorrentEvent::Completed);
    }

    fn update_interest(&mut self, key: PeerKey) {
        let target =
            self.mode != TorrentMode::Seeding && self.dispatcher.peer_has_missing_pieces(key);
        if let Some(peer) = self.dispatcher.peer_mut(key) {
            set_peer_interest(peer, target);
        }
    }

    fn update_interests(&mut self) {
        let verified = self.progress.verified_pieces();
        let seeding = self.mode == TorrentMode::Seeding;
        for (_, peer) in self.dispatcher.peers_mut() {
            let target = !seeding && peer.pieces().contains_missing_in(&verified);
            set_peer_interest(peer, target);
        }
    }

    fn remove_peer(&mut self, key: PeerKey) {
        self.choker.peer_removed(key);
        // released blocks may go to other peers, a late write must not land on top
        for request in self.in_flight.values().filter(|request| request.peer == key) {
            request.handle.abort();
        }
        if let Some((peer, released)) = self.dispatcher.peer_remove(key) {
            tracing::info!(addr = %peer.addr(), released, "peer disconnected");
        }
    }

    fn disconnect_peer(&mut self, key: PeerKey) {
        if let Some(peer) = self.dispatcher.peer(key) {
            peer.conn().close();
        }
        self.remove_peer(key);
    }

    fn stop(&mut self) {
        tracing::info!(name = self.info.name(), "stopping torrent");
        self.shutdown(TorrentMode::Stopped);
        self.emit(TorrentEvent::Stopped);
    }

    fn fail(&mut self, reason: String) {
        tracing::error!(name = self.info.name(), "torrent failed: {reason}");
        self.shutdown(TorrentMode::Failed);
        self.emit(TorrentEvent::Failed(reason));
    }

    fn shutdown(&mut self, mode: TorrentMode) {
        self.mode = mode;
        self.requests.abort_all();
        self.verifications.abort_all();
        for (_, peer) in self.dispatcher.peers() {
            peer.conn().close();
        }
    }

    fn emit(&self, event: TorrentEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

fn set_peer_interest(peer: &mut PeerSlot, interested: bool) {
    if peer.interested() == interested {
        return;
    }
    peer.set_interested(interested);
    let result = if interested {
        peer.conn().send_interested()
    } else {
        peer.conn().send_not_interested()
    };
    if let Err(error) = result {
        tracing::warn!(addr = %peer.addr(), interested, "failed to send interest: {error}");
    }
}

/// Pieces to start with as verified, if the configuration provides them.
fn verified_from_config(info: &TorrentInfo, config: &TorrentConfig) -> Option<Bitfield> {
    if config.assume_complete {
        let mut verified = Bitfield::with_size(info.pieces_count());
        verified.fill();
        return Some(verified);
    }
    match &config.resume {
        Some(resume) if resume.len() == info.pieces_count() => Some(resume.clone()),
        Some(resume) => {
            tracing::warn!(
                expected = info.pieces_count(),
                actual = resume.len(),
                "ignoring resume data of the wrong size"
            );
            None
        }
        None => None,
    }
}

async fn fetch_block(
    request: BlockRequest,
    storage: Arc<dyn Storage>,
    timeout: Duration,
) -> BlockOutcome {
    let result = fetch_and_store(&request, storage.as_ref(), timeout).await;
    BlockOutcome {
        peer: request.peer,
        block: request.block_ref(),
        length: request.length,
        result,
    }
}

async fn fetch_and_store(
    request: &BlockRequest,
    storage: &dyn Storage,
    timeout: Duration,
) -> Result<(), BlockError> {
    let data = tokio::time::timeout(
        timeout,
        request
            .conn
            .request(request.piece, request.offset, request.length),
    )
    .await
    .map_err(|_| RequestError::Timeout)??;

    if data.len() as u32 != request.length {
        return Err(RequestError::LengthMismatch {
            expected: request.length,
            actual: data.len() as u32,
        }
        .into());
    }
    storage
        .write_block(request.piece, request.offset, data)
        .await?;
    Ok(())
}
