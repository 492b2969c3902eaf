//! Leaf payload storage for the subset tree.
//!
//! A leaf is a bounded bag of fingerprints persisted in exactly one of three
//! ways. Disk- and archive-backed leaves are decoded from storage on every
//! access; nothing is cached. That trades query latency for a resident
//! footprint that stays flat no matter how often leaves are revisited.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::archive::{ArchiveWriter, SharedArchive};
use crate::config::{LeafStorageMode, TreeConfig};
use crate::data::Fingerprint;
use crate::encoding;
use crate::error::{Error, Result};

#[derive(Debug)]
pub enum LeafStorage {
    InMemory(Vec<Fingerprint>),
    File(PathBuf),
    ArchiveEntry {
        archive: Arc<SharedArchive>,
        entry: String,
    },
}

impl LeafStorage {
    /// Decode the leaf's fingerprints. `InMemory` clones; the disk-backed
    /// modes re-read storage on every call.
    pub fn load(&self) -> Result<Vec<Fingerprint>> {
        match self {
            LeafStorage::InMemory(fps) => {
                return Ok(fps.clone());
            }
            LeafStorage::File(path) => {
                let contents = match std::fs::read_to_string(path) {
                    Ok(s) => s,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(Error::DanglingLeaf(path.clone()));
                    }
                    Err(e) => return Err(e.into()),
                };

                let line = contents.lines().next().unwrap_or("");

                return encoding::parse_vector_list(line);
            }
            LeafStorage::ArchiveEntry { archive, entry } => {
                let payload = archive.read_entry(entry)?;

                let line = std::str::from_utf8(&payload)
                    .map_err(|_| Error::Parse(format!("leaf entry {} is not utf-8", entry)))?;

                return encoding::parse_vector_list(line.trim_end());
            }
        }
    }

    pub fn len(&self) -> Result<usize> {
        match self {
            LeafStorage::InMemory(fps) => Ok(fps.len()),
            _ => Ok(self.load()?.len()),
        }
    }
}

/// Context the tree builders thread through leaf materialization: the
/// archive writer during an `Archive`-mode build, and the shared handle the
/// finished leaves will read through.
#[derive(Debug)]
pub struct LeafWriter {
    mode: LeafStorageMode,
    directory: Option<PathBuf>,
    writer: Option<ArchiveWriter>,
    archive: Option<Arc<SharedArchive>>,
}

impl LeafWriter {
    pub fn new(config: &TreeConfig) -> Result<Self> {
        match config.storage_mode {
            LeafStorageMode::InMemory => {
                return Ok(Self {
                    mode: config.storage_mode,
                    directory: None,
                    writer: None,
                    archive: None,
                });
            }
            LeafStorageMode::PerLeafFiles => {
                let directory = config.directory_path()?;
                std::fs::create_dir_all(&directory)?;

                return Ok(Self {
                    mode: config.storage_mode,
                    directory: Some(directory),
                    writer: None,
                    archive: None,
                });
            }
            LeafStorageMode::Archive => {
                let directory = config.directory_path()?;
                std::fs::create_dir_all(&directory)?;

                let archive_path = config.archive_file_path()?;
                let writer = ArchiveWriter::create(&archive_path)?;
                let archive = Arc::new(SharedArchive::new(archive_path));

                return Ok(Self {
                    mode: config.storage_mode,
                    directory: Some(directory),
                    writer: Some(writer),
                    archive: Some(archive),
                });
            }
        }
    }

    pub fn shared_archive(&self) -> Option<Arc<SharedArchive>> {
        return self.archive.as_ref().map(Arc::clone);
    }

    /// Persist one leaf's fingerprints under its tree-path label and return
    /// the storage handle the leaf will carry.
    pub fn materialize(&mut self, vectors: Vec<Fingerprint>, label: &str) -> Result<LeafStorage> {
        match self.mode {
            LeafStorageMode::InMemory => {
                return Ok(LeafStorage::InMemory(vectors));
            }
            LeafStorageMode::PerLeafFiles => {
                let directory = match &self.directory {
                    Some(d) => d,
                    None => {
                        return Err(Error::Config(
                            "per-leaf file storage has no directory".to_string(),
                        ))
                    }
                };

                let path = encoding::leaf_file_path(directory, label);

                let mut file = File::create(&path)?;
                file.write_all(encoding::vector_list(&vectors).as_bytes())?;
                file.write_all(b"\n")?;

                return Ok(LeafStorage::File(path));
            }
            LeafStorageMode::Archive => {
                let writer = match &mut self.writer {
                    Some(w) => w,
                    None => {
                        return Err(Error::Config(
                            "archive storage has no open writer".to_string(),
                        ))
                    }
                };

                let entry = encoding::leaf_entry_name(label);
                writer.append(&entry, encoding::vector_list(&vectors).as_bytes())?;

                let archive = match &self.archive {
                    Some(a) => Arc::clone(a),
                    None => {
                        return Err(Error::Config(
                            "archive storage has no shared handle".to_string(),
                        ))
                    }
                };

                return Ok(LeafStorage::ArchiveEntry { archive, entry });
            }
        }
    }

    /// Seal the archive (no-op for the other modes). Must run before any
    /// archive-backed leaf is read.
    pub fn finish(self) -> Result<()> {
        if let Some(writer) = self.writer {
            log::debug!("sealing leaf archive with {} entries", writer.len());
            writer.finish()?;
        }

        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_vectors(n: usize, num_bits: usize, seed: u64) -> Vec<Fingerprint> {
        let mut rng = StdRng::seed_from_u64(seed);

        return (0..n)
            .map(|_| Fingerprint::random(num_bits, 0.3, &mut rng))
            .collect();
    }

    fn temp_config(test: &str, mode: LeafStorageMode) -> TreeConfig {
        let dir = std::env::temp_dir().join(format!("fp_index_leaf_{}", test));
        let _ = std::fs::remove_dir_all(&dir);

        let mut config = TreeConfig::default();
        config.num_bits = 64;
        config.directory = Some(dir.to_string_lossy().to_string());
        config.storage_mode = mode;

        return config;
    }

    #[test]
    fn in_memory_round_trip() {
        let config = temp_config("mem", LeafStorageMode::InMemory);
        let vectors = random_vectors(5, 64, 1);

        let mut writer = LeafWriter::new(&config).unwrap();
        let storage = writer.materialize(vectors.clone(), "r").unwrap();
        writer.finish().unwrap();

        assert_eq!(storage.load().unwrap(), vectors);
        assert_eq!(storage.len().unwrap(), 5);
    }

    #[test]
    fn per_leaf_file_round_trip_rereads_storage() {
        let config = temp_config("file", LeafStorageMode::PerLeafFiles);
        let vectors = random_vectors(4, 64, 2);

        let mut writer = LeafWriter::new(&config).unwrap();
        let storage = writer.materialize(vectors.clone(), "r_0_1").unwrap();
        writer.finish().unwrap();

        // repeated loads hit the file every time and agree
        assert_eq!(storage.load().unwrap(), vectors);
        assert_eq!(storage.load().unwrap(), vectors);

        // deleting the file turns the leaf dangling
        match &storage {
            LeafStorage::File(path) => std::fs::remove_file(path).unwrap(),
            _ => panic!("expected file storage"),
        }

        match storage.load() {
            Err(Error::DanglingLeaf(_)) => {}
            other => panic!("expected DanglingLeaf, got {:?}", other),
        }
    }

    #[test]
    fn archive_round_trip_and_empty_leaf() {
        let config = temp_config("archive", LeafStorageMode::Archive);
        let vectors = random_vectors(6, 64, 3);

        let mut writer = LeafWriter::new(&config).unwrap();
        let full = writer.materialize(vectors.clone(), "r_0").unwrap();
        let empty = writer.materialize(Vec::new(), "r_1").unwrap();
        writer.finish().unwrap();

        assert_eq!(full.load().unwrap(), vectors);
        assert!(empty.load().unwrap().is_empty());
        assert_eq!(empty.len().unwrap(), 0);
    }
}
