//! The fingerprint type every index in this crate is built over.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const WORD_BITS: usize = 64;

/// A fixed-length bit vector.
///
/// The logical length is carried explicitly: trailing zero bits would
/// otherwise be lost when a fingerprint round-trips through its compact byte
/// encoding. Identity is full bit-content equality; distinct dataset entries
/// may share one fingerprint value.
///
/// Bits past `num_bits` in the last word are always zero; every constructor
/// enforces this.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    words: Vec<u64>,
    num_bits: usize,
}

impl Fingerprint {
    pub fn new(num_bits: usize) -> Self {
        let num_words = (num_bits + WORD_BITS - 1) / WORD_BITS;

        return Self {
            words: vec![0u64; num_words],
            num_bits,
        };
    }

    pub fn from_set_bits(positions: &[usize], num_bits: usize) -> Self {
        let mut fp = Self::new(num_bits);

        for &pos in positions {
            fp.set_bit(pos);
        }

        return fp;
    }

    pub fn num_bits(&self) -> usize {
        return self.num_bits;
    }

    pub fn get_bit(&self, pos: usize) -> bool {
        assert!(pos < self.num_bits);

        return self.words[pos / WORD_BITS] & (1u64 << (pos % WORD_BITS)) != 0;
    }

    pub fn set_bit(&mut self, pos: usize) {
        assert!(pos < self.num_bits);

        self.words[pos / WORD_BITS] |= 1u64 << (pos % WORD_BITS);
    }

    /// Copy of `self` with one additional bit set.
    pub fn with_bit(&self, pos: usize) -> Self {
        let mut fp = self.clone();
        fp.set_bit(pos);

        return fp;
    }

    pub fn count_ones(&self) -> u32 {
        return self.words.iter().map(|w| w.count_ones()).sum();
    }

    pub fn is_empty(&self) -> bool {
        return self.words.iter().all(|w| *w == 0);
    }

    /// True iff every bit set in `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &Fingerprint) -> bool {
        assert!(self.num_bits == other.num_bits);

        return self
            .words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & !b == 0);
    }

    pub fn intersection_count(&self, other: &Fingerprint) -> u32 {
        assert!(self.num_bits == other.num_bits);

        return self
            .words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a & b).count_ones())
            .sum();
    }

    pub fn union_count(&self, other: &Fingerprint) -> u32 {
        assert!(self.num_bits == other.num_bits);

        return self
            .words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a | b).count_ones())
            .sum();
    }

    pub fn xor_count(&self, other: &Fingerprint) -> u32 {
        assert!(self.num_bits == other.num_bits);

        return self
            .words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
    }

    /// Set bit positions in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        return (0..self.num_bits).filter(move |&pos| self.get_bit(pos));
    }

    /// Raw byte representation: byte `i` holds bits `8*i..8*i+8`, least
    /// significant bit first. Length is always `ceil(num_bits / 8)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let num_bytes = (self.num_bits + 7) / 8;
        let mut bytes = vec![0u8; num_bytes];

        for pos in self.ones() {
            bytes[pos / 8] |= 1u8 << (pos % 8);
        }

        return bytes;
    }

    pub fn from_bytes(bytes: &[u8], num_bits: usize) -> Result<Self> {
        let expected = (num_bits + 7) / 8;

        if bytes.len() != expected {
            return Err(Error::Parse(format!(
                "fingerprint payload is {} bytes, expected {} for {} bits",
                bytes.len(),
                expected,
                num_bits
            )));
        }

        let mut fp = Self::new(num_bits);

        for (i, byte) in bytes.iter().enumerate() {
            for j in 0..8 {
                if byte & (1u8 << j) == 0 {
                    continue;
                }

                let pos = i * 8 + j;

                if pos >= num_bits {
                    return Err(Error::Parse(format!(
                        "stray bit at position {} past logical length {}",
                        pos, num_bits
                    )));
                }

                fp.set_bit(pos);
            }
        }

        return Ok(fp);
    }

    /// Random fingerprint with each bit set with probability `density`.
    pub fn random<R: Rng>(num_bits: usize, density: f64, rng: &mut R) -> Self {
        let mut fp = Self::new(num_bits);

        for pos in 0..num_bits {
            if rng.gen_bool(density) {
                fp.set_bit(pos);
            }
        }

        return fp;
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let positions: Vec<String> = self.ones().map(|p| p.to_string()).collect();

        write!(f, "Fingerprint({}: {})", self.num_bits, positions.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn set_and_get_round_trip() {
        let mut fp = Fingerprint::new(130);

        fp.set_bit(0);
        fp.set_bit(63);
        fp.set_bit(64);
        fp.set_bit(129);

        assert!(fp.get_bit(0));
        assert!(fp.get_bit(63));
        assert!(fp.get_bit(64));
        assert!(fp.get_bit(129));
        assert!(!fp.get_bit(1));
        assert_eq!(fp.count_ones(), 4);

        let positions: Vec<usize> = fp.ones().collect();
        assert_eq!(positions, vec![0, 63, 64, 129]);
    }

    #[test]
    fn subset_relation() {
        let small = Fingerprint::from_set_bits(&[0, 1], 8);
        let big = Fingerprint::from_set_bits(&[0, 1, 2], 8);
        let other = Fingerprint::from_set_bits(&[3], 8);
        let empty = Fingerprint::new(8);

        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
        assert!(small.is_subset_of(&small));
        assert!(!other.is_subset_of(&big));
        assert!(empty.is_subset_of(&small));
        assert!(empty.is_subset_of(&empty));
    }

    #[test]
    fn byte_round_trip_preserves_logical_length() {
        let mut rng = StdRng::seed_from_u64(7);

        for num_bits in [1, 7, 8, 9, 64, 65, 166, 2048] {
            for _ in 0..10 {
                let fp = Fingerprint::random(num_bits, 0.3, &mut rng);
                let bytes = fp.to_bytes();

                assert_eq!(bytes.len(), (num_bits + 7) / 8);

                let back = Fingerprint::from_bytes(&bytes, num_bits).unwrap();
                assert_eq!(back, fp);
                assert_eq!(back.num_bits(), num_bits);
            }
        }
    }

    #[test]
    fn from_bytes_rejects_stray_and_short_payloads() {
        // bit 5 is past the logical length of 5
        assert!(Fingerprint::from_bytes(&[0b0010_0000], 5).is_err());
        assert!(Fingerprint::from_bytes(&[0xff], 16).is_err());
        assert!(Fingerprint::from_bytes(&[0x1f], 5).is_ok());
    }

    #[test]
    fn counts_match_brute_force() {
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..20 {
            let a = Fingerprint::random(100, 0.4, &mut rng);
            let b = Fingerprint::random(100, 0.4, &mut rng);

            let inter = (0..100).filter(|&i| a.get_bit(i) && b.get_bit(i)).count();
            let union = (0..100).filter(|&i| a.get_bit(i) || b.get_bit(i)).count();
            let xor = (0..100).filter(|&i| a.get_bit(i) != b.get_bit(i)).count();

            assert_eq!(a.intersection_count(&b) as usize, inter);
            assert_eq!(a.union_count(&b) as usize, union);
            assert_eq!(a.xor_count(&b) as usize, xor);
        }
    }

    #[test]
    fn ordering_is_deterministic() {
        let a = Fingerprint::from_set_bits(&[0], 8);
        let b = Fingerprint::from_set_bits(&[1], 8);

        let mut v = vec![b.clone(), a.clone(), b.clone()];
        v.sort();

        assert_eq!(v[0], a);
        assert_eq!(v[1], b);
        assert_eq!(v[2], b);
    }
}
