//! Crate-wide error type.
//!
//! Construction and query failures propagate as values; disk- and
//! archive-backed reads never log-and-continue.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("archive {archive} has no entry {entry}")]
    MissingArchiveEntry { archive: PathBuf, entry: String },

    #[error("leaf payload missing at {0}")]
    DanglingLeaf(PathBuf),

    #[error("bucket {bucket} of hash function {function} is referenced but its payload is missing")]
    DanglingBucket { function: usize, bucket: u64 },

    #[error("query not supported by this storage mode: {0}")]
    UnsupportedQuery(&'static str),

    #[error("hash functions are not mutually disjoint and bit-covering")]
    NotMihCompliant,

    #[error("fingerprint length {got} does not match index length {expected}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

pub type Result<T> = std::result::Result<T, Error>;
