use std::sync::Arc;

use crate::{PieceIdx, Sha1, Storage, StorageError, TorrentInfo};

/// Checks stored pieces against the hashes in the metadata.
#[derive(Clone)]
pub struct PieceVerifier {
    info: TorrentInfo,
    storage: Arc<dyn Storage>,
}

impl PieceVerifier {
    pub fn new(info: TorrentInfo, storage: Arc<dyn Storage>) -> Self {
        Self { info, storage }
    }

    /// Whether the stored piece matches its expected hash. A mismatch is a
    /// normal outcome, only failing to read the piece is an error.
    pub async fn verify(&self, piece: PieceIdx) -> Result<bool, StorageError> {
        let expected = self
            .info
            .piece_hash(piece)
            .ok_or(StorageError::InvalidPiece(piece))?;
        let data = self.storage.read_piece(piece).await?;
        if data.len() as u32 != self.info.piece_length_from_index(piece) {
            tracing::warn!(piece = %piece, len = data.len(), "storage returned a piece of the wrong length");
            return Ok(false);
        }
        let hash = Sha1::hash(&data);
        tracing::trace!(piece = %piece, %hash, "hashed piece");
        Ok(hash == expected)
    }
}

impl std::fmt::Debug for PieceVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceVerifier")
            .field("torrent", &self.info.name())
            .finish()
    }
}
