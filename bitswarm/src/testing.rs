use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{Bitfield, PeerConnection, PieceIdx, RequestError, TorrentInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    Have(PieceIdx),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer with the real content.
    Serve,
    /// Answer with content that fails verification.
    Corrupt,
    /// Answer with half of the requested bytes.
    Truncate,
    /// Never answer.
    Hang,
    /// Panic on the next request, then serve.
    PanicOnce,
}

/// Scripted peer connection serving a fixed content.
#[derive(Debug)]
pub struct MockPeer {
    addr: SocketAddr,
    info: Option<TorrentInfo>,
    content: Bytes,
    behavior: Mutex<Behavior>,
    ready: AtomicBool,
    pipeline_full: AtomicBool,
    fail_sends: AtomicBool,
    download_rate: AtomicU32,
    upload_rate: AtomicU32,
    latency: Duration,
    sent: Mutex<Vec<Sent>>,
    requests: Mutex<Vec<(PieceIdx, u32, u32)>>,
    closed: AtomicBool,
}

impl MockPeer {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            info: None,
            content: Bytes::new(),
            behavior: Mutex::new(Behavior::Serve),
            ready: AtomicBool::new(true),
            pipeline_full: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            download_rate: AtomicU32::new(0),
            upload_rate: AtomicU32::new(0),
            latency: Duration::ZERO,
            sent: Default::default(),
            requests: Default::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn serving(port: u16, info: &TorrentInfo, content: &[u8]) -> Self {
        Self {
            info: Some(info.clone()),
            content: Bytes::copy_from_slice(content),
            ..Self::new(port)
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_rates(self, download: u32, upload: u32) -> Self {
        self.download_rate.store(download, Ordering::SeqCst);
        self.upload_rate.store(upload, Ordering::SeqCst);
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_pipeline_full(&self, full: bool) {
        self.pipeline_full.store(full, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn requests(&self) -> Vec<(PieceIdx, u32, u32)> {
        self.requests.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, message: Sent) -> std::io::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("send queue closed"));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Bitfield of `size` pieces with the given pieces set.
pub fn bitfield(size: u32, pieces: &[u32]) -> Bitfield {
    let mut bitfield = Bitfield::with_size(size);
    for &piece in pieces {
        bitfield.set(piece);
    }
    bitfield
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_request_pipeline_full(&self) -> bool {
        self.pipeline_full.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        piece: PieceIdx,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, RequestError> {
        self.requests.lock().push((piece, offset, length));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let behavior = *self.behavior.lock();
        match behavior {
            Behavior::Hang => std::future::pending().await,
            Behavior::PanicOnce => {
                *self.behavior.lock() = Behavior::Serve;
                panic!("request handler crashed");
            }
            Behavior::Serve | Behavior::Corrupt | Behavior::Truncate => {
                let info = self.info.as_ref().ok_or(RequestError::Rejected)?;
                let start = piece.index() * info.piece_length() as usize + offset as usize;
                let mut data = self.content[start..start + length as usize].to_vec();
                match behavior {
                    Behavior::Corrupt => data.iter_mut().for_each(|b| *b = !*b),
                    Behavior::Truncate => data.truncate(data.len() / 2),
                    _ => {}
                }
                Ok(Bytes::from(data))
            }
        }
    }

    fn send_have(&self, piece: PieceIdx) -> std::io::Result<()> {
        self.record(Sent::Have(piece))
    }

    fn send_choke(&self) -> std::io::Result<()> {
        self.record(Sent::Choke)
    }

    fn send_unchoke(&self) -> std::io::Result<()> {
        self.record(Sent::Unchoke)
    }

    fn send_interested(&self) -> std::io::Result<()> {
        self.record(Sent::Interested)
    }

    fn send_not_interested(&self) -> std::io::Result<()> {
        self.record(Sent::NotInterested)
    }

    fn download_rate(&self) -> u32 {
        self.download_rate.load(Ordering::SeqCst)
    }

    fn upload_rate(&self) -> u32 {
        self.upload_rate.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
