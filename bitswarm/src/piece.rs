use std::ops::Range;

/// Length of a block, the unit of network requests.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct PieceIdx(pub(crate) u32);

impl std::fmt::Display for PieceIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Piece({})", self.0)
    }
}

impl From<PieceIdx> for u32 {
    fn from(value: PieceIdx) -> Self {
        value.0
    }
}

impl From<u32> for PieceIdx {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl PieceIdx {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Fixed size bit vector, most significant bit first within each byte so the
/// byte representation matches the wire bitfield.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Bitfield {
    data: Vec<u8>,
    size: u32,
}

impl Bitfield {
    // size is the number of bits required
    pub fn with_size(size: u32) -> Self {
        let data = vec![0u8; Self::required_vec_capacity(size)];
        Self { data, size }
    }

    /// Build a bitfield from its byte representation, ignoring any bits past `size`.
    pub fn from_bytes(bytes: &[u8], size: u32) -> Self {
        let mut data = bytes.to_vec();
        data.resize(Self::required_vec_capacity(size), 0);
        let mut bitfield = Self { data, size };
        bitfield.clear_spare_bits();
        bitfield
    }

    pub fn get(&self, index: u32) -> bool {
        let (byte_index, bit_index) = self.get_indices(index);
        (self.data[byte_index] & (1 << bit_index)) > 0
    }

    pub fn set(&mut self, index: u32) {
        let (byte_index, bit_index) = self.get_indices(index);
        self.data[byte_index] |= 1 << bit_index;
    }

    pub fn unset(&mut self, index: u32) {
        let (byte_index, bit_index) = self.get_indices(index);
        self.data[byte_index] &= !(1 << bit_index);
    }

    pub fn set_to(&mut self, index: u32, value: bool) {
        if value {
            self.set(index);
        } else {
            self.unset(index);
        }
    }

    pub fn has_piece(&self, index: PieceIdx) -> bool {
        self.get(index.0)
    }

    pub fn set_piece(&mut self, index: PieceIdx) {
        self.set(index.0)
    }

    pub fn unset_piece(&mut self, index: PieceIdx) {
        self.unset(index.0)
    }

    pub fn set_range(&mut self, range: Range<u32>) {
        for i in range {
            self.set(i);
        }
    }

    pub fn unset_range(&mut self, range: Range<u32>) {
        for i in range {
            self.unset(i);
        }
    }

    pub fn count_range(&self, range: Range<u32>) -> u32 {
        range.filter(|&i| self.get(i)).count() as u32
    }

    pub fn num_set(&self) -> u32 {
        self.data.iter().map(|b| b.count_ones()).sum()
    }

    pub fn num_unset(&self) -> u32 {
        self.size - self.num_set()
    }

    pub fn fill(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0xFF);
        self.clear_spare_bits();
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0);
    }

    pub fn complete(&self) -> bool {
        self.num_set() == self.size
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        self.as_ref()
    }

    /// Iterator over the indices of set bits.
    pub fn ones(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.size).filter(move |&i| self.get(i))
    }

    /// Pieces this bitfield contains.
    pub fn pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        self.ones().map(PieceIdx::new)
    }

    pub fn missing_pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.size)
            .filter(move |&i| !self.get(i))
            .map(PieceIdx::new)
    }

    /// Pieces set in `other` but not in `self`.
    pub fn missing_pieces_in<'s>(&'s self, other: &'s Self) -> impl Iterator<Item = PieceIdx> + 's {
        assert_eq!(self.len(), other.len());
        (0..self.len())
            .filter(move |&i| !self.get(i) && other.get(i))
            .map(PieceIdx::new)
    }

    /// Whether `self` holds a piece that `other` lacks.
    pub fn contains_missing_in(&self, other: &Self) -> bool {
        other.missing_pieces_in(self).next().is_some()
    }

    /// Pieces set in both bitfields.
    pub fn common_pieces<'s>(&'s self, other: &'s Self) -> impl Iterator<Item = PieceIdx> + 's {
        assert_eq!(self.len(), other.len());
        self.data
            .iter()
            .zip(other.data.iter())
            .enumerate()
            .filter(|(_, (a, b))| (*a & *b) != 0)
            .flat_map(move |(byte, _)| {
                let start = byte as u32 * 8;
                let end = (start + 8).min(self.size);
                (start..end).filter(move |&i| self.get(i) && other.get(i))
            })
            .map(PieceIdx::new)
    }

    // returns (byte_index, bit_index), panics if index is invalid
    fn get_indices(&self, index: u32) -> (usize, usize) {
        if index >= self.size {
            panic!(
                "bitfield index out of range: {} (size {})",
                index, self.size
            );
        }
        let byte_index = index as usize / 8;
        let bit_index = 7 - index as usize % 8;
        (byte_index, bit_index)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.data.len() as u32 * 8 - self.size;
        if spare > 0 {
            if let Some(last) = self.data.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }

    fn required_vec_capacity(num_bits: u32) -> usize {
        num_bits.div_ceil(8) as usize
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitfield")
            .field("bits", &self.size)
            .field("set", &self.num_set())
            .finish()
    }
}

impl AsRef<[u8]> for Bitfield {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn creation_all_zeros() {
        let bf = Bitfield::with_size(33);
        assert_eq!(bf.bytes().len(), 5);
        assert!(bf.is_empty());
        assert_eq!(bf.num_unset(), 33);
    }

    #[test]
    fn setting_and_removing_bits() {
        let mut bf = Bitfield::with_size(32);
        bf.set(5);
        bf.set(9);
        bf.set(30);
        bf.unset(9);

        assert_eq!(bf.ones().collect::<Vec<_>>(), vec![5, 30]);
        assert_eq!(bf.num_set(), 2);
    }

    #[test]
    fn fill_keeps_spare_bits_clear() {
        let mut bf = Bitfield::with_size(10);
        bf.fill();
        assert!(bf.complete());
        assert_eq!(bf.num_set(), 10);
        assert_eq!(bf.bytes(), &[0xFF, 0xC0]);
    }

    #[test]
    fn from_bytes_truncates() {
        let bf = Bitfield::from_bytes(&[0xFF, 0xFF, 0xFF], 12);
        assert_eq!(bf.bytes(), &[0xFF, 0xF0]);
        assert_eq!(bf.num_set(), 12);
    }

    #[test]
    fn ranges() {
        let mut bf = Bitfield::with_size(20);
        bf.set_range(4..12);
        assert_eq!(bf.count_range(0..8), 4);
        assert_eq!(bf.count_range(8..20), 4);
        bf.unset_range(6..10);
        assert_eq!(bf.ones().collect::<Vec<_>>(), vec![4, 5, 10, 11]);
    }

    #[test]
    fn missing_and_common_pieces() {
        let mut bf0 = Bitfield::with_size(32);
        let mut bf1 = Bitfield::with_size(32);

        bf0.set(5);
        bf0.set(9);
        bf0.set(30);
        bf1.set(9);

        let missing = bf1.missing_pieces_in(&bf0).collect::<Vec<_>>();
        assert_eq!(missing, vec![PieceIdx::new(5), PieceIdx::new(30)]);
        assert!(bf1.contains_missing_in(&bf0));
        assert!(!bf0.contains_missing_in(&bf1));

        let common = bf0.common_pieces(&bf1).collect::<Vec<_>>();
        assert_eq!(common, vec![PieceIdx::new(9)]);
    }

    #[test]
    #[should_panic]
    fn out_of_range_panics() {
        let bf = Bitfield::with_size(8);
        bf.get(8);
    }
}
