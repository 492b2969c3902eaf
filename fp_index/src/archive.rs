//! Single-file pack for many small named payloads.
//!
//! Consolidating leaves or bucket files into one archive keeps very large
//! indexes from drowning the filesystem in tiny files. The layout is an
//! 8-byte BigEndian header holding the index offset, the raw payloads, and a
//! trailing name index:
//!
//! ```text
//! [index_offset: u64] [payload bytes ...] [count: u64,
//!     (name_len: u16, name, offset: u64, len: u64) * count]
//! ```
//!
//! The header stays zero until `finish`, so a reader can tell an unfinished
//! archive from a finished one.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

const HEADER_SIZE: usize = 8;

#[derive(Debug)]
pub struct ArchiveWriter {
    file: File,
    cursor: u64,
    entries: Vec<(String, u64, u64)>,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        file.write_all(&[0u8; HEADER_SIZE])?;

        return Ok(Self {
            file,
            cursor: HEADER_SIZE as u64,
            entries: Vec::new(),
        });
    }

    pub fn append(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.cursor))?;
        self.file.write_all(payload)?;

        self.entries
            .push((name.to_string(), self.cursor, payload.len() as u64));
        self.cursor += payload.len() as u64;

        return Ok(());
    }

    pub fn len(&self) -> usize {
        return self.entries.len();
    }

    /// Writes the name index and patches the header. The archive is not
    /// readable until this has run.
    pub fn finish(mut self) -> Result<()> {
        let index_offset = self.cursor;

        let mut count_arr = [0u8; 8];
        BigEndian::write_u64(&mut count_arr, self.entries.len() as u64);

        self.file.seek(SeekFrom::Start(index_offset))?;
        self.file.write_all(&count_arr)?;

        for (name, offset, len) in self.entries.iter() {
            let name_bytes = name.as_bytes();

            let mut name_len_arr = [0u8; 2];
            BigEndian::write_u16(&mut name_len_arr, name_bytes.len() as u16);
            self.file.write_all(&name_len_arr)?;
            self.file.write_all(name_bytes)?;

            let mut offset_arr = [0u8; 8];
            BigEndian::write_u64(&mut offset_arr, *offset);
            self.file.write_all(&offset_arr)?;

            let mut len_arr = [0u8; 8];
            BigEndian::write_u64(&mut len_arr, *len);
            self.file.write_all(&len_arr)?;
        }

        let mut header_arr = [0u8; HEADER_SIZE];
        BigEndian::write_u64(&mut header_arr, index_offset);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_arr)?;
        self.file.sync_all()?;

        return Ok(());
    }
}

#[derive(Debug)]
pub struct ArchiveReader {
    path: PathBuf,
    file: File,
    index: HashMap<String, (u64, u64)>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).open(path)?;

        let mut header_arr = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_arr)?;

        let index_offset = BigEndian::read_u64(&header_arr);

        if index_offset == 0 {
            return Err(Error::Parse(format!(
                "archive {} was never finished",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(index_offset))?;

        let mut count_arr = [0u8; 8];
        file.read_exact(&mut count_arr)?;
        let count = BigEndian::read_u64(&count_arr);

        let mut index: HashMap<String, (u64, u64)> = HashMap::new();

        for _ in 0..count {
            let mut name_len_arr = [0u8; 2];
            file.read_exact(&mut name_len_arr)?;
            let name_len = BigEndian::read_u16(&name_len_arr) as usize;

            let mut name_bytes = vec![0u8; name_len];
            file.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| Error::Parse("archive entry name is not utf-8".to_string()))?;

            let mut offset_arr = [0u8; 8];
            file.read_exact(&mut offset_arr)?;
            let offset = BigEndian::read_u64(&offset_arr);

            let mut len_arr = [0u8; 8];
            file.read_exact(&mut len_arr)?;
            let len = BigEndian::read_u64(&len_arr);

            index.insert(name, (offset, len));
        }

        return Ok(Self {
            path: path.to_path_buf(),
            file,
            index,
        });
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        return self.index.keys().map(|s| s.as_str());
    }

    pub fn contains(&self, name: &str) -> bool {
        return self.index.contains_key(name);
    }

    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        let (offset, len) = match self.index.get(name) {
            Some(x) => *x,
            None => {
                return Err(Error::MissingArchiveEntry {
                    archive: self.path.clone(),
                    entry: name.to_string(),
                })
            }
        };

        let mut payload = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut payload)?;

        return Ok(payload);
    }
}

/// One archive handle shared by every leaf or bucket that lives in the
/// archive. The reader is opened by whichever query thread gets there first
/// and reused by all later ones; the mutex both guards initialization and
/// serializes the seek/read pairs.
#[derive(Debug)]
pub struct SharedArchive {
    path: PathBuf,
    reader: Mutex<Option<ArchiveReader>>,
}

impl SharedArchive {
    pub fn new(path: PathBuf) -> Self {
        return Self {
            path,
            reader: Mutex::new(None),
        };
    }

    /// Wrap an already-open reader, e.g. right after scanning the entry
    /// index on reload.
    pub fn from_reader(reader: ArchiveReader) -> Self {
        return Self {
            path: reader.path.clone(),
            reader: Mutex::new(Some(reader)),
        };
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let mut guard = match self.reader.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if guard.is_none() {
            *guard = Some(ArchiveReader::open(&self.path)?);
        }

        let reader = guard.as_mut().expect("handle was set above");

        return reader.read(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_archive(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fp_index_archive_tests");
        std::fs::create_dir_all(&dir).unwrap();

        return dir.join(name);
    }

    #[test]
    fn write_and_read_back() {
        let path = temp_archive("round_trip.pack");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.append("data/a.leaf", b"first payload").unwrap();
        writer.append("data/b.leaf", b"").unwrap();
        writer.append("/data/hf_0000000/3.hsb", b"third").unwrap();
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.read("data/a.leaf").unwrap(), b"first payload");
        assert_eq!(reader.read("data/b.leaf").unwrap(), b"");
        assert_eq!(reader.read("/data/hf_0000000/3.hsb").unwrap(), b"third");

        match reader.read("data/missing.leaf") {
            Err(Error::MissingArchiveEntry { entry, .. }) => {
                assert_eq!(entry, "data/missing.leaf");
            }
            other => panic!("expected MissingArchiveEntry, got {:?}", other),
        }
    }

    #[test]
    fn unfinished_archive_is_rejected() {
        let path = temp_archive("unfinished.pack");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.append("x", b"payload").unwrap();
        // no finish()
        drop(writer);

        assert!(ArchiveReader::open(&path).is_err());
    }

    #[test]
    fn shared_archive_concurrent_reads() {
        let path = temp_archive("shared.pack");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        for i in 0..32 {
            writer
                .append(&format!("entry_{}", i), format!("payload {}", i).as_bytes())
                .unwrap();
        }
        writer.finish().unwrap();

        let shared = Arc::new(SharedArchive::new(path));

        let mut handles = Vec::new();
        for t in 0..4 {
            let shared = Arc::clone(&shared);

            handles.push(std::thread::spawn(move || {
                for round in 0..50 {
                    let i = (t * 7 + round) % 32;
                    let payload = shared.read_entry(&format!("entry_{}", i)).unwrap();
                    assert_eq!(payload, format!("payload {}", i).as_bytes());
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
