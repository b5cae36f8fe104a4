use thiserror::Error;

use crate::PieceIdx;

#[derive(Debug, Error)]
pub enum InfoError {
    #[error("piece length must be greater than zero")]
    ZeroPieceLength,

    #[error("torrent has no content")]
    Empty,

    #[error("expected {expected} piece hashes, found {actual}")]
    PieceCountMismatch { expected: u32, actual: u32 },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPiece(PieceIdx),

    #[error("invalid block range: {piece} offset {offset} length {length}")]
    InvalidRange {
        piece: PieceIdx,
        offset: u32,
        length: u32,
    },

    #[error("disk full")]
    DiskFull,
}

impl StorageError {
    /// Errors that cannot be recovered from by retrying the block elsewhere.
    pub fn is_fatal(&self) -> bool {
        match self {
            StorageError::DiskFull => true,
            StorageError::Io(error) => error.kind() == std::io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,

    #[error("peer disconnected")]
    Disconnected,

    #[error("peer rejected the request")]
    Rejected,

    #[error("peer sent {actual} bytes, expected {expected}")]
    LengthMismatch { expected: u32, actual: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a block request did not end with the block in storage.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
