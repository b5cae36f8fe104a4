use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{InfoError, PieceIdx, Sha1, BLOCK_LENGTH};

struct TorrentInfoInner {
    name: String,
    piece_length: u32,
    total_size: u64,
    pieces: Vec<Sha1>,
    files: Vec<TorrentFile>,
}

impl std::fmt::Debug for TorrentInfoInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Torrent \n\tName : {:?}\n\tPiece length : {:?}\n\tPieces : {:?}\n\tFiles : {:#?}\n",
            self.name,
            self.piece_length,
            self.pieces.len(),
            self.files
        )
    }
}

/// Immutable torrent metadata: piece layout, piece hashes and file layout.
#[derive(Clone)]
pub struct TorrentInfo(Arc<TorrentInfoInner>);

impl std::fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl TorrentInfo {
    /// Build metadata from a file list (path, length) laid out back to back and
    /// the expected hash of every piece.
    pub fn new(
        name: impl Into<String>,
        piece_length: u32,
        files: Vec<(PathBuf, u64)>,
        pieces: Vec<Sha1>,
    ) -> Result<Self, InfoError> {
        if piece_length == 0 {
            return Err(InfoError::ZeroPieceLength);
        }

        let mut offset = 0;
        let files = files
            .into_iter()
            .enumerate()
            .map(|(index, (path, length))| {
                let file = TorrentFile {
                    index,
                    start: offset,
                    length,
                    path,
                };
                offset += length;
                file
            })
            .collect::<Vec<_>>();

        let total_size = offset;
        if total_size == 0 {
            return Err(InfoError::Empty);
        }

        let expected = total_size.div_ceil(u64::from(piece_length)) as u32;
        if pieces.len() as u32 != expected {
            return Err(InfoError::PieceCountMismatch {
                expected,
                actual: pieces.len() as u32,
            });
        }

        Ok(Self(Arc::new(TorrentInfoInner {
            name: name.into(),
            piece_length,
            total_size,
            pieces,
            files,
        })))
    }

    /// Single file torrent whose piece hashes are computed from `data`.
    pub fn from_data(name: &str, piece_length: u32, data: &[u8]) -> Result<Self, InfoError> {
        if piece_length == 0 {
            return Err(InfoError::ZeroPieceLength);
        }
        let pieces = data
            .chunks(piece_length as usize)
            .map(Sha1::hash)
            .collect();
        Self::new(
            name,
            piece_length,
            vec![(PathBuf::from(name), data.len() as u64)],
            pieces,
        )
    }

    pub fn name(&self) -> &str {
        self.0.name.as_str()
    }

    pub fn total_size(&self) -> u64 {
        self.0.total_size
    }

    pub fn piece_length(&self) -> u32 {
        self.0.piece_length
    }

    pub fn pieces_count(&self) -> u32 {
        self.0.pieces.len() as u32
    }

    pub fn piece_indices(&self) -> impl Iterator<Item = PieceIdx> {
        (0..self.pieces_count()).map(PieceIdx::new)
    }

    pub fn piece_index_valid(&self, piece_index: PieceIdx) -> bool {
        piece_index.0 < self.pieces_count()
    }

    /// Length of the given piece, only the last one may be shorter.
    pub fn piece_length_from_index(&self, piece_index: PieceIdx) -> u32 {
        let start = u64::from(piece_index.0) * u64::from(self.piece_length());
        self.total_size()
            .saturating_sub(start)
            .min(u64::from(self.piece_length())) as u32
    }

    pub fn blocks_count(&self, piece_index: PieceIdx) -> u32 {
        self.piece_length_from_index(piece_index)
            .div_ceil(BLOCK_LENGTH)
    }

    pub fn block_offset(&self, block: u32) -> u32 {
        block * BLOCK_LENGTH
    }

    /// Length of a block within a piece, only the last block may be shorter.
    pub fn block_length(&self, piece_index: PieceIdx, block: u32) -> u32 {
        let piece_length = self.piece_length_from_index(piece_index);
        piece_length
            .saturating_sub(self.block_offset(block))
            .min(BLOCK_LENGTH)
    }

    pub fn range_valid(&self, piece_index: PieceIdx, offset: u32, length: u32) -> bool {
        if !self.piece_index_valid(piece_index) {
            return false;
        }
        let piece_length = self.piece_length_from_index(piece_index);
        offset
            .checked_add(length)
            .map(|end| end <= piece_length)
            .unwrap_or(false)
    }

    pub fn piece_hash(&self, piece_index: PieceIdx) -> Option<Sha1> {
        self.0.pieces.get(piece_index.0 as usize).copied()
    }

    pub fn pieces(&self) -> &[Sha1] {
        &self.0.pieces
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.0.files
    }

    /// File slices covered by a whole piece.
    pub fn files_from_piece(&self, piece_index: PieceIdx) -> impl Iterator<Item = FileSlice<'_>> {
        let length = self.piece_length_from_index(piece_index);
        self.files_in_range(piece_index, 0, length)
    }

    /// File slices covered by `length` bytes starting at `offset` inside a piece.
    pub fn files_in_range(
        &self,
        piece_index: PieceIdx,
        offset: u32,
        length: u32,
    ) -> impl Iterator<Item = FileSlice<'_>> {
        let piece_start = u64::from(piece_index.0) * u64::from(self.piece_length());
        let start = piece_start + u64::from(offset);
        let end = start + u64::from(length);
        let first = self.0.files.partition_point(|f| f.end() <= start);
        self.0.files[first..]
            .iter()
            .take_while(move |f| f.start < end)
            .filter(|f| f.length > 0)
            .map(move |file| {
                let from = start.max(file.start);
                let to = end.min(file.end());
                FileSlice {
                    file,
                    file_offset: from - file.start,
                    buffer_offset: (from - start) as u32,
                    length: (to - from) as u32,
                }
            })
    }
}

#[derive(Debug, Clone)]
pub struct TorrentFile {
    index: usize,
    start: u64,
    length: u64,
    path: PathBuf,
}

impl TorrentFile {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Offset of the file within the torrent content.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Part of a byte range that lives in a single file.
#[derive(Debug, Clone)]
pub struct FileSlice<'a> {
    pub file: &'a TorrentFile,
    /// Where in the file the slice starts
    pub file_offset: u64,
    /// Where in the requested range the slice starts
    pub buffer_offset: u32,
    pub length: u32,
}

impl FileSlice<'_> {
    pub fn buffer_range(&self) -> std::ops::Range<usize> {
        self.buffer_offset as usize..(self.buffer_offset + self.length) as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn three_files() -> TorrentInfo {
        let piece_length = 4 * BLOCK_LENGTH;
        let files = vec![
            (PathBuf::from("subs.srt"), 140),
            (PathBuf::from("movie.mp4"), 3 * u64::from(piece_length)),
            (PathBuf::from("poster.jpg"), 5000),
        ];
        let total = 140 + 3 * u64::from(piece_length) + 5000;
        let count = total.div_ceil(u64::from(piece_length)) as usize;
        TorrentInfo::new("movie", piece_length, files, vec![Sha1::default(); count]).unwrap()
    }

    #[test]
    fn piece_and_block_lengths() {
        let info = three_files();
        assert_eq!(info.pieces_count(), 4);
        let last = PieceIdx::new(3);
        assert_eq!(info.piece_length_from_index(PieceIdx::new(0)), 4 * BLOCK_LENGTH);
        assert_eq!(info.piece_length_from_index(last), 5140);
        assert_eq!(info.blocks_count(PieceIdx::new(0)), 4);
        assert_eq!(info.blocks_count(last), 1);
        assert_eq!(info.block_length(last, 0), 5140);
        assert_eq!(info.block_length(PieceIdx::new(1), 3), BLOCK_LENGTH);
    }

    #[test]
    fn uneven_last_block() {
        let data = vec![7u8; 40_000];
        let info = TorrentInfo::from_data("data", 32768, &data).unwrap();
        assert_eq!(info.pieces_count(), 2);
        assert_eq!(info.blocks_count(PieceIdx::new(0)), 2);
        assert_eq!(info.blocks_count(PieceIdx::new(1)), 1);
        assert_eq!(info.block_length(PieceIdx::new(1), 0), 40_000 - 32768);
        assert_eq!(info.piece_hash(PieceIdx::new(0)), Some(Sha1::hash(&data[..32768])));
    }

    #[test]
    fn piece_zero_spans_two_files() {
        let info = three_files();
        let slices = info.files_from_piece(PieceIdx::new(0)).collect::<Vec<_>>();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].file.path(), Path::new("subs.srt"));
        assert_eq!(slices[0].file_offset, 0);
        assert_eq!(slices[0].buffer_offset, 0);
        assert_eq!(slices[0].length, 140);
        assert_eq!(slices[1].file.path(), Path::new("movie.mp4"));
        assert_eq!(slices[1].file_offset, 0);
        assert_eq!(slices[1].buffer_offset, 140);
        assert_eq!(slices[1].length, info.piece_length() - 140);
    }

    #[test]
    fn block_range_inside_one_file() {
        let info = three_files();
        let slices = info
            .files_in_range(PieceIdx::new(1), BLOCK_LENGTH, BLOCK_LENGTH)
            .collect::<Vec<_>>();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].file.index(), 1);
        assert_eq!(
            slices[0].file_offset,
            u64::from(info.piece_length()) + u64::from(BLOCK_LENGTH) - 140
        );
        assert_eq!(slices[0].buffer_range(), 0..BLOCK_LENGTH as usize);
    }

    #[test]
    fn rejects_bad_layouts() {
        assert!(matches!(
            TorrentInfo::new("x", 0, vec![(PathBuf::from("x"), 1)], vec![]),
            Err(InfoError::ZeroPieceLength)
        ));
        assert!(matches!(
            TorrentInfo::new("x", 16, vec![(PathBuf::from("x"), 0)], vec![]),
            Err(InfoError::Empty)
        ));
        assert!(matches!(
            TorrentInfo::new("x", 16, vec![(PathBuf::from("x"), 40)], vec![Sha1::default()]),
            Err(InfoError::PieceCountMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn request_ranges() {
        let info = three_files();
        assert!(info.range_valid(PieceIdx::new(3), 0, 5140));
        assert!(!info.range_valid(PieceIdx::new(3), 1, 5140));
        assert!(!info.range_valid(PieceIdx::new(4), 0, 1));
        assert!(!info.range_valid(PieceIdx::new(0), u32::MAX, 2));
    }
}
