use std::net::SocketAddr;

use crate::{NetworkStats, PeerKey, PeerSchedule, ProgressSummary, TorrentInfo, TorrentMode};

#[derive(Debug, Clone)]
pub struct TorrentViewPeer {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub upload_rate: u32,
    pub download_rate: u32,
    pub schedule: PeerSchedule,
    /// are we interested in the peer
    pub interested: bool,
    /// are we letting the peer download from us
    pub unchoked: bool,
    /// outstanding block requests
    pub pending: usize,
}

/// Snapshot of a running torrent.
#[derive(Debug, Clone)]
pub struct TorrentView {
    pub info: TorrentInfo,
    pub mode: TorrentMode,
    pub peers: Vec<TorrentViewPeer>,
    pub progress: f64,
    pub summary: ProgressSummary,
    pub stats: NetworkStats,
}

impl TorrentView {
    pub fn complete(&self) -> bool {
        self.summary.verified == self.info.pieces_count()
    }

    pub fn peer(&self, key: PeerKey) -> Option<&TorrentViewPeer> {
        self.peers.iter().find(|peer| peer.key == key)
    }
}
