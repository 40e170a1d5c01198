//! Piece availability bitfield and its binary encoding

use super::PieceIndex;

/// Errors that can occur when decoding a bitfield.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitfieldError {
    #[error("Bitfield too short: {actual} bytes, need at least 4")]
    TooShort { actual: usize },

    #[error("Bitfield of {bits} bits needs {expected} bytes, got {actual}")]
    LengthMismatch {
        bits: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Bitfield has bits set past piece {bits}")]
    TrailingBitsSet { bits: u32 },
}

/// Bit-indexed set over a torrent's pieces.
///
/// Bit `i` set means piece `i` is available. Bits are stored MSB first within
/// each byte. The binary form is self-describing: a big-endian `u32` bit count
/// followed by the packed bits, with unused trailing bits cleared.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: u32,
}

impl Bitfield {
    /// Creates an empty bitfield for the given number of pieces.
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8) as usize],
            len,
        }
    }

    /// Creates a bitfield with every piece set.
    pub fn full(len: u32) -> Self {
        let mut bits = vec![0xffu8; len.div_ceil(8) as usize];
        let used = len % 8;
        if used != 0
            && let Some(last) = bits.last_mut()
        {
            *last = 0xffu8 << (8 - used);
        }
        Self { bits, len }
    }

    /// Creates a bitfield from per-piece flags.
    pub fn from_bools(flags: &[bool]) -> Self {
        let mut bitfield = Self::new(flags.len() as u32);
        for (index, _) in flags.iter().enumerate().filter(|(_, set)| **set) {
            bitfield.set(PieceIndex::new(index as u32));
        }
        bitfield
    }

    /// Number of pieces tracked.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if the piece is marked available.
    pub fn has(&self, piece: PieceIndex) -> bool {
        let index = piece.as_u32();
        if index >= self.len {
            return false;
        }
        let (byte, mask) = Self::locate(index);
        self.bits[byte] & mask != 0
    }

    /// Marks piece as available. Out-of-range indices are ignored.
    pub fn set(&mut self, piece: PieceIndex) {
        let index = piece.as_u32();
        if index < self.len {
            let (byte, mask) = Self::locate(index);
            self.bits[byte] |= mask;
        }
    }

    /// Marks piece as unavailable. Out-of-range indices are ignored.
    pub fn clear(&mut self, piece: PieceIndex) {
        let index = piece.as_u32();
        if index < self.len {
            let (byte, mask) = Self::locate(index);
            self.bits[byte] &= !mask;
        }
    }

    /// Count of available pieces.
    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// Returns true if every piece is available.
    pub fn is_complete(&self) -> bool {
        self.count_set() == self.len
    }

    /// Indices of available pieces in ascending order.
    pub fn set_pieces(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.len)
            .map(PieceIndex::new)
            .filter(|piece| self.has(*piece))
    }

    /// Encodes the bitfield into its self-describing binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.bits.len());
        out.extend_from_slice(&self.len.to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Decodes a bitfield produced by [`Bitfield::to_bytes`].
    ///
    /// # Errors
    ///
    /// - `BitfieldError::TooShort` - Missing the bit-count header
    /// - `BitfieldError::LengthMismatch` - Byte count disagrees with bit count
    /// - `BitfieldError::TrailingBitsSet` - Padding bits past the last piece are set
    pub fn from_bytes(data: &[u8]) -> Result<Self, BitfieldError> {
        let Some((header, bits)) = data.split_first_chunk::<4>() else {
            return Err(BitfieldError::TooShort { actual: data.len() });
        };

        let len = u32::from_be_bytes(*header);
        let expected = len.div_ceil(8) as usize;
        if bits.len() != expected {
            return Err(BitfieldError::LengthMismatch {
                bits: len,
                expected,
                actual: bits.len(),
            });
        }

        let used = len % 8;
        let padding = bits.last().map_or(0, |last| last & (0xffu8 >> used));
        if used != 0 && padding != 0 {
            return Err(BitfieldError::TrailingBitsSet { bits: len });
        }

        Ok(Self {
            bits: bits.to_vec(),
            len,
        })
    }

    fn locate(index: u32) -> (usize, u8) {
        ((index / 8) as usize, 1u8 << (7 - (index % 8)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitfield_creation() {
        let bitfield = Bitfield::new(100);
        assert_eq!(bitfield.len(), 100);
        assert_eq!(bitfield.bits.len(), 13);
        assert!(!bitfield.has(PieceIndex::new(0)));
        assert!(!bitfield.has(PieceIndex::new(99)));
        assert_eq!(bitfield.count_set(), 0);
    }

    #[test]
    fn test_bitfield_piece_operations() {
        let mut bitfield = Bitfield::new(16);

        bitfield.set(PieceIndex::new(0));
        bitfield.set(PieceIndex::new(7));
        bitfield.set(PieceIndex::new(15));
        bitfield.set(PieceIndex::new(16)); // out of range, ignored

        assert!(bitfield.has(PieceIndex::new(0)));
        assert!(bitfield.has(PieceIndex::new(7)));
        assert!(bitfield.has(PieceIndex::new(15)));
        assert!(!bitfield.has(PieceIndex::new(1)));
        assert!(!bitfield.has(PieceIndex::new(16)));

        bitfield.clear(PieceIndex::new(7));
        assert!(!bitfield.has(PieceIndex::new(7)));
        assert_eq!(bitfield.count_set(), 2);
        assert_eq!(
            bitfield.set_pieces().collect::<Vec<_>>(),
            vec![PieceIndex::new(0), PieceIndex::new(15)]
        );
    }

    #[test]
    fn test_full_bitfield_clears_padding() {
        let bitfield = Bitfield::full(10);
        assert!(bitfield.is_complete());
        assert_eq!(bitfield.bits, vec![0xff, 0b1100_0000]);
        assert_eq!(Bitfield::from_bytes(&bitfield.to_bytes()), Ok(bitfield));
    }

    #[test]
    fn test_from_bools() {
        let bitfield = Bitfield::from_bools(&[true, false, true]);
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield.has(PieceIndex::new(0)));
        assert!(!bitfield.has(PieceIndex::new(1)));
        assert!(bitfield.has(PieceIndex::new(2)));
    }

    #[test]
    fn test_binary_encoding_layout() {
        let bitfield = Bitfield::from_bools(&[true, false, false, false, false, false, false, false, true]);
        assert_eq!(bitfield.to_bytes(), vec![0, 0, 0, 9, 0b1000_0000, 0b1000_0000]);
    }

    #[test]
    fn test_empty_bitfield_encoding() {
        let bitfield = Bitfield::new(0);
        assert!(bitfield.is_empty());
        assert_eq!(bitfield.to_bytes(), vec![0, 0, 0, 0]);
        assert_eq!(Bitfield::from_bytes(&[0, 0, 0, 0]), Ok(bitfield));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert_eq!(
            Bitfield::from_bytes(&[0, 0]),
            Err(BitfieldError::TooShort { actual: 2 })
        );
        assert_eq!(
            Bitfield::from_bytes(&[0, 0, 0, 16, 0xff]),
            Err(BitfieldError::LengthMismatch {
                bits: 16,
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            Bitfield::from_bytes(&[0, 0, 0, 3, 0b1111_0000]),
            Err(BitfieldError::TrailingBitsSet { bits: 3 })
        );
    }
}
