//! Build configuration for both index families.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a tree leaf's fingerprints are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafStorageMode {
    InMemory,
    PerLeafFiles,
    Archive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Required for `PerLeafFiles` and `Archive` modes.
    pub directory: Option<String>,
    pub num_bits: usize,
    /// Target leaf size. A leaf may exceed it when no usable split bit
    /// remains.
    pub leaf_capacity: usize,
    pub storage_mode: LeafStorageMode,
    /// Seeds the split-bit shuffle; pick one for reproducible tree shapes.
    pub seed: Option<u64>,
    /// Out-of-core build: partitions larger than this many bytes keep
    /// streaming, smaller ones are finished in memory.
    pub partition_memory_limit: u64,
    /// Out-of-core build: fraction of free bit positions sampled as split
    /// candidates per node.
    pub sample_rate: f64,
}

impl TreeConfig {
    pub fn default() -> Self {
        return Self {
            directory: None,
            num_bits: 2048,
            leaf_capacity: 64,
            storage_mode: LeafStorageMode::InMemory,
            seed: None,
            partition_memory_limit: 256 * 1024 * 1024,
            sample_rate: 0.02,
        };
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let serialized = std::fs::read_to_string(path)?;

        let deserialized: Self =
            serde_yaml::from_str(&serialized).map_err(|e| Error::Config(e.to_string()))?;

        return Ok(deserialized);
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let serialized = serde_yaml::to_string(&self).map_err(|e| Error::Config(e.to_string()))?;

        let mut file = File::create(path)?;
        file.write_all(serialized.as_bytes())?;

        return Ok(());
    }

    pub fn directory_path(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(d) => Ok(PathBuf::from(d)),
            None => Err(Error::Config(
                "storage mode requires a directory but none is configured".to_string(),
            )),
        }
    }

    pub fn config_file_path(&self) -> Result<PathBuf> {
        return Ok(self.directory_path()?.join("config.yaml"));
    }

    pub fn tree_file_path(&self) -> Result<PathBuf> {
        return Ok(self.directory_path()?.join("tree.nodes"));
    }

    pub fn archive_file_path(&self) -> Result<PathBuf> {
        return Ok(self.directory_path()?.join("leaves.pack"));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LshConfig {
    pub directory: Option<String>,
    pub num_bits: usize,
    /// Out-of-core build: bucket assignments accumulated in memory before a
    /// flush to the per-bucket files.
    pub batch_size: usize,
    pub seed: Option<u64>,
}

impl LshConfig {
    pub fn default() -> Self {
        return Self {
            directory: None,
            num_bits: 2048,
            batch_size: 100_000,
            seed: None,
        };
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let serialized = std::fs::read_to_string(path)?;

        let deserialized: Self =
            serde_yaml::from_str(&serialized).map_err(|e| Error::Config(e.to_string()))?;

        return Ok(deserialized);
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let serialized = serde_yaml::to_string(&self).map_err(|e| Error::Config(e.to_string()))?;

        let mut file = File::create(path)?;
        file.write_all(serialized.as_bytes())?;

        return Ok(());
    }

    pub fn directory_path(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(d) => Ok(PathBuf::from(d)),
            None => Err(Error::Config(
                "out-of-core LSH build requires a directory but none is configured".to_string(),
            )),
        }
    }

    pub fn config_file_path(&self) -> Result<PathBuf> {
        return Ok(self.directory_path()?.join("config.yaml"));
    }

    pub fn functions_file_path(&self) -> Result<PathBuf> {
        return Ok(self.directory_path()?.join("hash_functions.json"));
    }

    pub fn archive_file_path(&self) -> Result<PathBuf> {
        return Ok(self.directory_path()?.join("buckets.pack"));
    }
}
