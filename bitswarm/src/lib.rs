mod hash;
pub use hash::Sha1;

mod piece;
pub use piece::{Bitfield, PieceIdx, BLOCK_LENGTH};

mod error;
pub use error::{BlockError, InfoError, RequestError, StorageError};

mod info;
pub use info::{FileSlice, TorrentFile, TorrentInfo};

mod network_stats;
pub use network_stats::{NetworkStats, NetworkStatsAccum, RateMeter};

mod peer;
pub use peer::{PeerConnection, PeerEvent, PeerKey};

mod storage;
pub use storage::{FileStorage, MemoryStorage, Storage};

mod progress;
pub use progress::{BlockReceived, PieceStatus, Progress, ProgressLayout, ProgressSummary};

mod verifier;
pub use verifier::PieceVerifier;

mod dispatcher;
pub use dispatcher::{
    BlockRef, BlockRequest, Completion, Dispatcher, PeerSchedule, PeerSlot,
    MAX_PEER_PENDING_BLOCKS,
};

mod choker;
pub use choker::{
    ChokeDecision, Choker, DEFAULT_OPTIMISTIC_UNCHOKE_TICKS, DEFAULT_UNCHOKE_SLOTS,
};

mod torrent;
pub use torrent::{Torrent, TorrentConfig, TorrentEvent, TorrentEvents, TorrentMode};

mod view;
pub use view::{TorrentView, TorrentViewPeer};

#[cfg(test)]
mod testing;
