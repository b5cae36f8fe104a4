use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Bitfield, PieceIdx, RequestError};

slotmap::new_key_type! {
    /// Handle of a peer registered with a torrent.
    pub struct PeerKey;
}

/// A connected remote peer, as seen by the download engine.
///
/// Framing, handshakes and message I/O live behind this trait. Sends are
/// fire and forget: an error only means the message could not be queued and
/// is logged by the caller, liveness is reported separately through
/// [`PeerEvent::Disconnected`].
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    fn addr(&self) -> SocketAddr;

    /// Connected and past the handshake.
    fn is_ready(&self) -> bool {
        true
    }

    /// The connection's own outstanding request limit has been reached.
    fn is_request_pipeline_full(&self) -> bool {
        false
    }

    /// Request `length` bytes at `offset` of a piece and wait for the data.
    async fn request(&self, piece: PieceIdx, offset: u32, length: u32)
        -> Result<Bytes, RequestError>;

    fn send_have(&self, piece: PieceIdx) -> std::io::Result<()>;

    fn send_choke(&self) -> std::io::Result<()>;

    fn send_unchoke(&self) -> std::io::Result<()>;

    fn send_interested(&self) -> std::io::Result<()>;

    fn send_not_interested(&self) -> std::io::Result<()>;

    /// download rate from this peer in bytes/sec
    fn download_rate(&self) -> u32;

    /// upload rate to this peer in bytes/sec
    fn upload_rate(&self) -> u32;

    fn close(&self) {}
}

/// State changes reported by a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Full set of pieces the peer holds, replaces anything announced before.
    Bitfield(Bitfield),
    Have(PieceIdx),
    /// The remote peer is choking us.
    Choke,
    /// The remote peer stopped choking us.
    Unchoke,
    Disconnected,
}
