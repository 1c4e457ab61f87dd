//! MSB-first piece bitfield, as exchanged in the peer wire protocol's
//! `Bitfield` message and used internally to track what each peer has.
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitFieldError {
    #[error("bitfield is too short for {num_pieces} pieces ({got} bytes, need at least {need})")]
    TooShort {
        num_pieces: usize,
        got: usize,
        need: usize,
    },
}

/// A fixed-size set of piece indices, one bit per piece, MSB-first within
/// each byte: bit 0 of the field is the high bit of byte 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl BitField {
    /// An all-zero bitfield sized for `num_pieces`.
    pub fn empty(num_pieces: usize) -> Self {
        Self {
            bytes: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Builds a bitfield from a wire-format byte string. Extra trailing
    /// padding bits beyond `num_pieces` are accepted and simply ignored by
    /// every accessor, per the protocol's padding convention — they must
    /// never be interpreted as claiming a piece that doesn't exist.
    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Result<Self, BitFieldError> {
        let need = num_pieces.div_ceil(8);
        if bytes.len() < need {
            return Err(BitFieldError::TooShort {
                num_pieces,
                got: bytes.len(),
                need,
            });
        }
        Ok(Self {
            bytes: bytes[..need].to_vec(),
            num_pieces,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let byte = index / 8;
        let bit = index % 8;
        let mask = 1u8 << (7 - bit);
        self.bytes[byte] & mask != 0
    }

    pub fn set(&mut self, index: usize) {
        if index >= self.num_pieces {
            return;
        }
        let byte = index / 8;
        let bit = index % 8;
        let mask = 1u8 << (7 - bit);
        self.bytes[byte] |= mask;
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(move |&i| self.has(i))
    }

    pub fn is_complete(&self) -> bool {
        (0..self.num_pieces).all(|i| self.has(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_has_round_trip() {
        let mut bf = BitField::empty(10);
        bf.set(0);
        bf.set(9);
        assert!(bf.has(0));
        assert!(bf.has(9));
        assert!(!bf.has(1));
        assert_eq!(bf.iter().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn msb_first_within_byte() {
        let mut bf = BitField::empty(8);
        bf.set(0);
        assert_eq!(bf.to_bytes(), vec![0b1000_0000]);
    }

    #[test]
    fn trailing_padding_bits_are_ignored() {
        // 5 pieces packed into a single byte, with the 3 low padding bits set.
        let bf = BitField::from_bytes(&[0b1111_1111], 5).unwrap();
        assert!((0..5).all(|i| bf.has(i)));
        // indices beyond num_pieces must never report as had, even though
        // the underlying bit is physically set.
        assert!(!bf.has(5));
        assert!(!bf.has(7));
    }

    #[test]
    fn rejects_undersized_bytes() {
        let err = BitField::from_bytes(&[0u8], 9).unwrap_err();
        assert_eq!(
            err,
            BitFieldError::TooShort {
                num_pieces: 9,
                got: 1,
                need: 2
            }
        );
    }
}
