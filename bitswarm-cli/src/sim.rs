use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bitswarm::{Bitfield, PeerConnection, PieceIdx, RateMeter, RequestError, TorrentInfo};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng as _};

const SIM_PIPELINE_LIMIT: usize = 16;

#[derive(Debug, Clone)]
pub struct SwarmOptions {
    pub peers: usize,
    pub latency: Duration,
    /// upload rate of every simulated peer in bytes/sec
    pub rate: u32,
    /// chance of a peer holding any given piece on top of its share
    pub coverage: f64,
    /// add a peer that serves corrupted data
    pub corrupt_peer: bool,
}

/// Remote peer living in memory, serving a slice of the content.
#[derive(Debug)]
pub struct SimPeer {
    addr: SocketAddr,
    info: TorrentInfo,
    content: Bytes,
    pieces: Bitfield,
    latency: Duration,
    rate: u32,
    corrupt: bool,
    in_flight: AtomicUsize,
    uploaded: Mutex<RateMeter>,
    closed: AtomicBool,
}

impl SimPeer {
    pub fn pieces(&self) -> &Bitfield {
        &self.pieces
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    fn transfer_time(&self, length: u32) -> Duration {
        if self.rate == 0 {
            return self.latency;
        }
        self.latency + Duration::from_secs_f64(f64::from(length) / f64::from(self.rate))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnection for SimPeer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn is_request_pipeline_full(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) >= SIM_PIPELINE_LIMIT
    }

    async fn request(
        &self,
        piece: PieceIdx,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, RequestError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RequestError::Disconnected);
        }
        if !self.pieces.has_piece(piece) || !self.info.range_valid(piece, offset, length) {
            return Err(RequestError::Rejected);
        }

        let _in_flight = InFlight::new(&self.in_flight);
        tokio::time::sleep(self.transfer_time(length)).await;

        let start = piece.index() * self.info.piece_length() as usize + offset as usize;
        let data = self.content.slice(start..start + length as usize);
        self.uploaded.lock().record(length);
        if self.corrupt {
            return Ok(data.iter().map(|b| b ^ 0xff).collect());
        }
        Ok(data)
    }

    fn send_have(&self, piece: PieceIdx) -> std::io::Result<()> {
        tracing::trace!(addr = %self.addr, piece = %piece, "have");
        Ok(())
    }

    fn send_choke(&self) -> std::io::Result<()> {
        tracing::trace!(addr = %self.addr, "choke");
        Ok(())
    }

    fn send_unchoke(&self) -> std::io::Result<()> {
        tracing::trace!(addr = %self.addr, "unchoke");
        Ok(())
    }

    fn send_interested(&self) -> std::io::Result<()> {
        tracing::trace!(addr = %self.addr, "interested");
        Ok(())
    }

    fn send_not_interested(&self) -> std::io::Result<()> {
        tracing::trace!(addr = %self.addr, "not interested");
        Ok(())
    }

    fn download_rate(&self) -> u32 {
        self.uploaded.lock().rate()
    }

    fn upload_rate(&self) -> u32 {
        0
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// The set of simulated peers reachable by address.
#[derive(Debug, Default)]
pub struct Swarm {
    peers: HashMap<SocketAddr, Arc<SimPeer>>,
}

impl Swarm {
    /// Spread the content over `options.peers` honest peers so that every
    /// piece is held by at least one of them.
    pub fn generate(
        info: &TorrentInfo,
        content: Bytes,
        options: &SwarmOptions,
        rng: &mut StdRng,
    ) -> Self {
        let honest = options.peers.max(1);
        let total = honest + usize::from(options.corrupt_peer);
        let mut peers = HashMap::with_capacity(total);
        for index in 0..total {
            let corrupt = index >= honest;
            let mut pieces = Bitfield::with_size(info.pieces_count());
            for piece in 0..info.pieces_count() {
                let owner = piece as usize % honest == index;
                if corrupt || owner || rng.gen_bool(options.coverage.clamp(0.0, 1.0)) {
                    pieces.set(piece);
                }
            }
            let host = [10, 0, (index / 250) as u8, (index % 250) as u8 + 1];
            let addr = SocketAddr::from((host, 6881));
            let peer = SimPeer {
                addr,
                info: info.clone(),
                content: content.clone(),
                pieces,
                latency: options.latency,
                rate: options.rate,
                corrupt,
                in_flight: Default::default(),
                uploaded: Default::default(),
                closed: Default::default(),
            };
            peers.insert(addr, Arc::new(peer));
        }
        Self { peers }
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = self.peers.keys().copied().collect::<Vec<_>>();
        addrs.sort();
        addrs
    }

    pub fn connect(&self, addr: SocketAddr) -> Option<Arc<SimPeer>> {
        self.peers.get(&addr).cloned()
    }
}
