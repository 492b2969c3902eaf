//! Bucket hash functions for the LSH index.
//!
//! Both variants are pure and stateless: a fingerprint maps to the same
//! bucket id forever. `RandomProjection` sums per-position random weights
//! over a projected subset of bits modulo a table size; `DisjointProjection`
//! counts the set bits under a mask, which is what the multi-index-hashing
//! queries rely on.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::Fingerprint;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HashFunction {
    RandomProjection {
        modulus: u64,
        projected_bits: Fingerprint,
        weights: Vec<u64>,
    },
    DisjointProjection {
        mask: Fingerprint,
    },
}

impl HashFunction {
    /// Bucket id of a fingerprint. A projection selecting zero bits hashes
    /// everything to bucket 0: one global bucket, no hashing.
    pub fn hash(&self, fp: &Fingerprint) -> u64 {
        match self {
            HashFunction::RandomProjection {
                modulus,
                projected_bits,
                weights,
            } => {
                if projected_bits.count_ones() == 0 {
                    return 0;
                }

                let mut sum: u64 = 0;

                for (i, pos) in projected_bits.ones().enumerate() {
                    if fp.get_bit(pos) {
                        sum = sum.wrapping_add(weights[i]);
                    }
                }

                return sum % modulus;
            }
            HashFunction::DisjointProjection { mask } => {
                return fp.intersection_count(mask) as u64;
            }
        }
    }

    pub fn num_bits(&self) -> usize {
        match self {
            HashFunction::RandomProjection { projected_bits, .. } => projected_bits.num_bits(),
            HashFunction::DisjointProjection { mask } => mask.num_bits(),
        }
    }

    /// Random projection over `num_projected` distinct positions with
    /// weights drawn below `modulus`.
    pub fn random_projection<R: Rng>(
        num_bits: usize,
        num_projected: usize,
        modulus: u64,
        rng: &mut R,
    ) -> Result<Self> {
        if modulus == 0 {
            return Err(Error::Config(
                "random projection modulus must be positive".to_string(),
            ));
        }

        if num_projected > num_bits {
            return Err(Error::Config(format!(
                "cannot project {} of {} bits",
                num_projected, num_bits
            )));
        }

        let mut projected_bits = Fingerprint::new(num_bits);
        let mut chosen = 0usize;

        while chosen < num_projected {
            let pos = rng.gen_range(0..num_bits);

            if !projected_bits.get_bit(pos) {
                projected_bits.set_bit(pos);
                chosen += 1;
            }
        }

        let weights: Vec<u64> = (0..num_projected).map(|_| rng.gen_range(0..modulus)).collect();

        return Ok(HashFunction::RandomProjection {
            modulus,
            projected_bits,
            weights,
        });
    }

    /// `m` disjoint contiguous masks covering every bit position: an
    /// MIH-compliant family by construction.
    pub fn disjoint_partition(num_bits: usize, m: usize) -> Result<Vec<HashFunction>> {
        if m == 0 || m > num_bits {
            return Err(Error::Config(format!(
                "cannot partition {} bits into {} masks",
                num_bits, m
            )));
        }

        let chunk = (num_bits + m - 1) / m;
        let mut functions: Vec<HashFunction> = Vec::with_capacity(m);

        for i in 0..m {
            let start = i * chunk;
            let end = ((i + 1) * chunk).min(num_bits);

            let positions: Vec<usize> = (start..end).collect();

            functions.push(HashFunction::DisjointProjection {
                mask: Fingerprint::from_set_bits(&positions, num_bits),
            });
        }

        return Ok(functions);
    }
}

/// MIH needs the masks to be mutually bit-disjoint and to collectively
/// cover every position; only disjoint-projection functions qualify.
pub fn is_mih_compliant(functions: &[HashFunction], num_bits: usize) -> bool {
    if functions.is_empty() {
        return false;
    }

    let mut covered = Fingerprint::new(num_bits);

    for function in functions {
        let mask = match function {
            HashFunction::DisjointProjection { mask } => mask,
            HashFunction::RandomProjection { .. } => return false,
        };

        if mask.num_bits() != num_bits {
            return false;
        }

        if covered.intersection_count(mask) != 0 {
            return false;
        }

        for pos in mask.ones() {
            covered.set_bit(pos);
        }
    }

    return covered.count_ones() as usize == num_bits;
}
