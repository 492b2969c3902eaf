//! Indexing structures for screening very large collections of fixed-length
//! binary fingerprints.
//!
//! Two index families are provided. [`tree::SubsetTree`] answers exact
//! bit-subset queries ("which stored fingerprints contain every bit of this
//! query?") over a binary tree whose nodes record the bit positions forced to
//! zero and one beneath them. [`lsh::LshIndex`] answers bounded-distance
//! nearest-neighbor queries under Hamming distance and Tanimoto similarity,
//! including a multi-index-hashing mode with a completeness guarantee.
//!
//! Both indexes are built once from a finite dataset (in memory, or streamed
//! from disk for datasets that do not fit) and are immutable afterwards. Leaf
//! and bucket payloads can stay resident, live one-file-per-leaf on disk, or
//! be packed into a single archive file.
//!
//! TODO
//! - [ ] parallelize left/right subtree construction with a bounded pool
//!
pub mod archive;
pub mod config;
pub mod data;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod leaf;
pub mod lsh;
pub mod similarity;
pub mod stream;
pub mod tree;
