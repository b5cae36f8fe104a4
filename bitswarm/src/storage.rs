use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

use crate::{PieceIdx, StorageError, TorrentInfo};

/// Random access block storage for one torrent.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn read_block(
        &self,
        piece: PieceIdx,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError>;

    async fn write_block(&self, piece: PieceIdx, offset: u32, data: Bytes)
        -> Result<(), StorageError>;

    async fn read_piece(&self, piece: PieceIdx) -> Result<Bytes, StorageError>;
}

fn check_range(
    info: &TorrentInfo,
    piece: PieceIdx,
    offset: u32,
    length: u32,
) -> Result<(), StorageError> {
    if !info.piece_index_valid(piece) {
        return Err(StorageError::InvalidPiece(piece));
    }
    if !info.range_valid(piece, offset, length) {
        return Err(StorageError::InvalidRange {
            piece,
            offset,
            length,
        });
    }
    Ok(())
}

/// Pieces kept in memory, allocated on first write.
///
/// Unwritten ranges read back as zeros, like a sparse file.
#[derive(Debug)]
pub struct MemoryStorage {
    info: TorrentInfo,
    capacity: Option<u64>,
    state: Mutex<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
    pieces: Vec<Option<BytesMut>>,
    allocated: u64,
}

impl MemoryStorage {
    pub fn new(info: TorrentInfo) -> Self {
        let pieces = vec![None; info.pieces_count() as usize];
        Self {
            info,
            capacity: None,
            state: Mutex::new(MemoryState {
                pieces,
                allocated: 0,
            }),
        }
    }

    /// Storage that fails with [`StorageError::DiskFull`] once more than
    /// `capacity` bytes worth of pieces have been allocated.
    pub fn with_capacity(info: TorrentInfo, capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(info)
        }
    }

    /// Storage already holding the full content.
    pub fn with_content(info: TorrentInfo, content: &[u8]) -> Self {
        let storage = Self::new(info);
        {
            let mut state = storage.state.lock();
            let piece_length = storage.info.piece_length() as usize;
            for (index, chunk) in content.chunks(piece_length).enumerate() {
                if let Some(slot) = state.pieces.get_mut(index) {
                    *slot = Some(BytesMut::from(chunk));
                }
            }
            state.allocated = content.len() as u64;
        }
        storage
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_block(
        &self,
        piece: PieceIdx,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        check_range(&self.info, piece, offset, length)?;
        let state = self.state.lock();
        let range = offset as usize..(offset + length) as usize;
        Ok(match &state.pieces[piece.index()] {
            Some(data) => Bytes::copy_from_slice(&data[range]),
            None => Bytes::from(vec![0u8; length as usize]),
        })
    }

    async fn write_block(
        &self,
        piece: PieceIdx,
        offset: u32,
        data: Bytes,
    ) -> Result<(), StorageError> {
        check_range(&self.info, piece, offset, data.len() as u32)?;
        let piece_length = self.info.piece_length_from_index(piece);
        let mut state = self.state.lock();
        if state.pieces[piece.index()].is_none() {
            let allocated = state.allocated + u64::from(piece_length);
            if self.capacity.is_some_and(|capacity| allocated > capacity) {
                return Err(StorageError::DiskFull);
            }
            state.allocated = allocated;
            let mut buffer = BytesMut::new();
            buffer.resize(piece_length as usize, 0);
            state.pieces[piece.index()] = Some(buffer);
        }
        if let Some(buffer) = state.pieces[piece.index()].as_mut() {
            buffer[offset as usize..offset as usize + data.len()].copy_from_slice(&data);
        }
        Ok(())
    }

    async fn read_piece(&self, piece: PieceIdx) -> Result<Bytes, StorageError> {
        let length = self.info.piece_length_from_index(piece);
        self.read_block(piece, 0, length).await
    }
}

/// Content laid out as the torrent's files below a root directory.
#[derive(Debug)]
pub struct FileStorage {
    info: TorrentInfo,
    root: PathBuf,
}

impl FileStorage {
    pub fn new(info: TorrentInfo, root: impl Into<PathBuf>) -> Self {
        Self {
            info,
            root: root.into(),
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_block(
        &self,
        piece: PieceIdx,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        check_range(&self.info, piece, offset, length)?;
        let mut data = BytesMut::new();
        data.resize(length as usize, 0);
        for slice in self.info.files_in_range(piece, offset, length) {
            let path = self.root.join(slice.file.path());
            read_at(&path, slice.file_offset, &mut data[slice.buffer_range()])
                .await
                .map_err(map_io_error)?;
        }
        Ok(data.freeze())
    }

    async fn write_block(
        &self,
        piece: PieceIdx,
        offset: u32,
        data: Bytes,
    ) -> Result<(), StorageError> {
        check_range(&self.info, piece, offset, data.len() as u32)?;
        for slice in self.info.files_in_range(piece, offset, data.len() as u32) {
            let path = self.root.join(slice.file.path());
            write_at(&path, slice.file_offset, &data[slice.buffer_range()])
                .await
                .map_err(map_io_error)?;
        }
        Ok(())
    }

    async fn read_piece(&self, piece: PieceIdx) -> Result<Bytes, StorageError> {
        let length = self.info.piece_length_from_index(piece);
        self.read_block(piece, 0, length).await
    }
}

fn map_io_error(error: std::io::Error) -> StorageError {
    if error.kind() == std::io::ErrorKind::StorageFull {
        StorageError::DiskFull
    } else {
        StorageError::Io(error)
    }
}

async fn read_at(path: &Path, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().read(true).open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.read_exact(buf).await?;
    Ok(())
}

async fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Sha1, BLOCK_LENGTH};

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn memory_roundtrip_and_zero_fill() {
        let data = content(50_000);
        let info = TorrentInfo::from_data("data", 32768, &data).unwrap();
        let storage = MemoryStorage::new(info.clone());

        let block = Bytes::copy_from_slice(&data[16384..32768]);
        storage
            .write_block(PieceIdx::new(0), BLOCK_LENGTH, block.clone())
            .await
            .unwrap();

        let read = storage
            .read_block(PieceIdx::new(0), BLOCK_LENGTH, BLOCK_LENGTH)
            .await
            .unwrap();
        assert_eq!(read, block);

        let first = storage
            .read_block(PieceIdx::new(0), 0, BLOCK_LENGTH)
            .await
            .unwrap();
        assert!(first.iter().all(|&b| b == 0));

        let piece = storage.read_piece(PieceIdx::new(1)).await.unwrap();
        assert_eq!(piece.len(), 50_000 - 32768);
    }

    #[tokio::test]
    async fn memory_rejects_invalid_ranges() {
        let info = TorrentInfo::from_data("data", 32768, &content(40_000)).unwrap();
        let storage = MemoryStorage::new(info);
        let error = storage
            .read_block(PieceIdx::new(1), 7000, 1000)
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::InvalidRange { .. }));
        let error = storage.read_piece(PieceIdx::new(2)).await.unwrap_err();
        assert!(matches!(error, StorageError::InvalidPiece(_)));
    }

    #[tokio::test]
    async fn memory_capacity_reports_disk_full() {
        let info = TorrentInfo::from_data("data", 32768, &content(32768 * 3)).unwrap();
        let storage = MemoryStorage::with_capacity(info, 32768 * 2);
        let block = Bytes::from(vec![1u8; BLOCK_LENGTH as usize]);
        for piece in 0..2 {
            storage
                .write_block(PieceIdx::new(piece), 0, block.clone())
                .await
                .unwrap();
        }
        // writes into already allocated pieces still succeed
        storage
            .write_block(PieceIdx::new(1), BLOCK_LENGTH, block.clone())
            .await
            .unwrap();
        let error = storage
            .write_block(PieceIdx::new(2), 0, block)
            .await
            .unwrap_err();
        assert!(error.is_fatal());
    }

    #[tokio::test]
    async fn file_storage_spans_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = content(70_000);
        let files = vec![
            (PathBuf::from("a.bin"), 1_000),
            (PathBuf::from("nested/b.bin"), 69_000),
        ];
        let pieces = data.chunks(32768).map(Sha1::hash).collect();
        let info = TorrentInfo::new("multi", 32768, files, pieces).unwrap();
        let storage = FileStorage::new(info.clone(), dir.path());

        for piece in info.piece_indices() {
            let start = piece.index() * 32768;
            for block in 0..info.blocks_count(piece) {
                let offset = info.block_offset(block);
                let length = info.block_length(piece, block);
                let begin = start + offset as usize;
                let chunk = Bytes::copy_from_slice(&data[begin..begin + length as usize]);
                storage.write_block(piece, offset, chunk).await.unwrap();
            }
        }

        for piece in info.piece_indices() {
            let read = storage.read_piece(piece).await.unwrap();
            assert_eq!(Sha1::hash(&read), info.piece_hash(piece).unwrap());
        }
        let a = std::fs::read(dir.path().join("a.bin")).unwrap();
        assert_eq!(a, &data[..1_000]);
    }

    #[tokio::test]
    async fn file_storage_missing_file_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let info = TorrentInfo::from_data("data", 32768, &content(1000)).unwrap();
        let storage = FileStorage::new(info, dir.path());
        let error = storage.read_piece(PieceIdx::new(0)).await.unwrap_err();
        assert!(!error.is_fatal());
    }
}
