//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece. MSB-first within each byte, as on the wire.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during the handshake.
pub type Reserved = BitArray<[u8; 8], Msb0>;

pub trait PieceBitfield {
    /// An all-zero bitfield sized for `pieces` pieces.
    fn from_piece_count(pieces: usize) -> Bitfield;

    /// Set a bit, growing the vector first if the index is out of bounds.
    /// Some peers announce pieces beyond the bitfield they sent.
    fn grow_and_set(&mut self, index: usize);

    /// True when the bit is set; out of bounds reads as false.
    fn has(&self, index: usize) -> bool;
}

impl PieceBitfield for Bitfield {
    fn from_piece_count(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    fn grow_and_set(&mut self, index: usize) {
        if index >= self.len() {
            self.resize(index + 1, false);
        }
        self.set(index, true);
    }

    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_and_set_resizes() {
        let mut b = Bitfield::from_piece_count(3);
        b.grow_and_set(1);
        assert_eq!(b.len(), 3);
        assert!(b.has(1));

        b.grow_and_set(9);
        assert_eq!(b.len(), 10);
        assert!(b.has(9));
        assert!(!b.has(8));
        assert!(!b.has(100));
    }

    #[test]
    fn msb_first_layout() {
        // first byte 0b1100_0001 means pieces 0, 1 and 7
        let b = Bitfield::from_vec(vec![0b1100_0001]);
        assert!(b.has(0));
        assert!(b.has(1));
        assert!(!b.has(2));
        assert!(b.has(7));
    }
}
