//! Bucket-hashed index for bounded-distance nearest-neighbor queries.
//!
//! Each hash function owns one bucket table. Tables are built resident (one
//! worker per function, no shared mutable state) or out-of-core in batches
//! appended to per-bucket files, optionally consolidated into a single
//! archive. Once built the index is immutable and safe for any number of
//! concurrent readers.
//!
//! Query surface by storage:
//! - resident: approximate radius search, ranked search, exact brute force,
//!   MIH, Tanimoto top-k
//! - bucket files / archive: MIH only

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;

use crate::archive::{ArchiveReader, ArchiveWriter, SharedArchive};
use crate::config::LshConfig;
use crate::data::Fingerprint;
use crate::encoding;
use crate::error::{Error, Result};
use crate::hash::{self, HashFunction};
use crate::similarity;

/// A Hamming-distance search result. Results order ascending by distance
/// with ties broken by fingerprint content.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub fingerprint: Fingerprint,
    pub distance: u32,
}

/// A Tanimoto search result. Results order descending by similarity with
/// ties broken by fingerprint content.
#[derive(Debug, Clone, PartialEq)]
pub struct TanimotoHit {
    pub fingerprint: Fingerprint,
    pub similarity: f64,
}

/// Keeps the N best hits seen so far, sorted, truncating to N on insert.
#[derive(Debug)]
struct TopHits {
    max_length: usize,
    hits: Vec<Neighbor>,
}

impl TopHits {
    fn new(max_length: usize) -> Self {
        return Self {
            max_length,
            hits: Vec::with_capacity(max_length + 1),
        };
    }

    fn try_add(&mut self, distance: u32, fingerprint: &Fingerprint) {
        if self.max_length == 0 {
            return;
        }

        if self.hits.len() == self.max_length {
            let worst = &self.hits[self.max_length - 1];

            if (distance, fingerprint) >= (worst.distance, &worst.fingerprint) {
                return;
            }
        }

        let insert_index = self
            .hits
            .partition_point(|h| (h.distance, &h.fingerprint) <= (distance, fingerprint));

        self.hits.insert(
            insert_index,
            Neighbor {
                fingerprint: fingerprint.clone(),
                distance,
            },
        );

        self.hits.truncate(self.max_length);
    }

    fn into_vec(self) -> Vec<Neighbor> {
        return self.hits;
    }
}

/// Same bounded list, keyed on descending Tanimoto similarity.
#[derive(Debug)]
struct TanimotoHits {
    max_length: usize,
    hits: Vec<TanimotoHit>,
}

impl TanimotoHits {
    fn new(max_length: usize) -> Self {
        return Self {
            max_length,
            hits: Vec::with_capacity(max_length + 1),
        };
    }

    /// True iff hit `a` ranks strictly before hit `b`. Similarities are
    /// never NaN (two empty fingerprints compare at 0.0), so the order is
    /// total.
    fn ranks_before(a_sim: f64, a_fp: &Fingerprint, b_sim: f64, b_fp: &Fingerprint) -> bool {
        if a_sim != b_sim {
            return a_sim > b_sim;
        }

        return a_fp < b_fp;
    }

    fn try_add(&mut self, similarity: f64, fingerprint: &Fingerprint) {
        if self.max_length == 0 {
            return;
        }

        if self.hits.len() == self.max_length {
            let worst = &self.hits[self.max_length - 1];

            if !Self::ranks_before(similarity, fingerprint, worst.similarity, &worst.fingerprint) {
                return;
            }
        }

        let insert_index = self.hits.partition_point(|h| {
            !Self::ranks_before(similarity, fingerprint, h.similarity, &h.fingerprint)
        });

        self.hits.insert(
            insert_index,
            TanimotoHit {
                fingerprint: fingerprint.clone(),
                similarity,
            },
        );

        self.hits.truncate(self.max_length);
    }

    fn into_vec(self) -> Vec<TanimotoHit> {
        return self.hits;
    }
}

#[derive(Debug)]
enum BucketStorage {
    Resident(Vec<HashMap<u64, Vec<Fingerprint>>>),
    BucketFiles(Vec<HashMap<u64, PathBuf>>),
    Archive {
        archive: Arc<SharedArchive>,
        entries: Vec<HashMap<u64, String>>,
    },
}

#[derive(Debug)]
pub struct LshIndex {
    pub functions: Vec<HashFunction>,
    pub config: LshConfig,
    num_bits: usize,
    storage: BucketStorage,
}

impl LshIndex {
    /// Build a resident index. Hash functions are processed in parallel,
    /// one worker per function; each worker writes only its own bucket
    /// table, so the workers share nothing mutable. `threads == 0` sizes
    /// the pool to the machine.
    pub fn build(
        vectors: Vec<Fingerprint>,
        functions: Vec<HashFunction>,
        threads: usize,
    ) -> Result<Self> {
        let num_bits = validate_functions(&functions)?;

        for v in vectors.iter() {
            if v.num_bits() != num_bits {
                return Err(Error::LengthMismatch {
                    expected: num_bits,
                    got: v.num_bits(),
                });
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;

        log::debug!(
            "hashing {} fingerprints under {} functions",
            vectors.len(),
            functions.len()
        );

        let tables: Vec<HashMap<u64, Vec<Fingerprint>>> = pool.install(|| {
            functions
                .par_iter()
                .map(|function| {
                    let mut table: HashMap<u64, Vec<Fingerprint>> = HashMap::new();

                    for v in vectors.iter() {
                        table
                            .entry(function.hash(v))
                            .or_insert_with(Vec::new)
                            .push(v.clone());
                    }

                    table
                })
                .collect()
        });

        let mut config = LshConfig::default();
        config.num_bits = num_bits;

        return Ok(Self {
            functions,
            config,
            num_bits,
            storage: BucketStorage::Resident(tables),
        });
    }

    /// Build out-of-core from a newline-delimited base64 fingerprint file.
    /// The input is streamed once per hash function; bucket assignments are
    /// accumulated up to `config.batch_size` and appended to per-bucket
    /// files on every flush.
    pub fn build_streaming(
        input: &Path,
        functions: Vec<HashFunction>,
        config: LshConfig,
    ) -> Result<Self> {
        let num_bits = validate_functions(&functions)?;

        if num_bits != config.num_bits {
            return Err(Error::LengthMismatch {
                expected: config.num_bits,
                got: num_bits,
            });
        }

        let directory = config.directory_path()?;
        std::fs::create_dir_all(&directory)?;

        let mut tables: Vec<HashMap<u64, PathBuf>> = Vec::with_capacity(functions.len());

        for (function_index, function) in functions.iter().enumerate() {
            let bucket_dir = directory.join(encoding::bucket_dir_name(function_index));
            std::fs::create_dir_all(&bucket_dir)?;

            let mut paths: HashMap<u64, PathBuf> = HashMap::new();
            let mut pending: HashMap<u64, Vec<Fingerprint>> = HashMap::new();
            let mut pending_count = 0usize;

            // reset the stream to the beginning for every function
            let reader = BufReader::new(File::open(input)?);

            for line in reader.lines() {
                let line = line?;

                if line.trim_end().is_empty() {
                    continue;
                }

                let fp = encoding::parse_line(&line, num_bits)?;

                pending
                    .entry(function.hash(&fp))
                    .or_insert_with(Vec::new)
                    .push(fp);
                pending_count += 1;

                if pending_count >= config.batch_size {
                    flush_buckets(&bucket_dir, &mut pending, &mut paths)?;
                    pending_count = 0;
                }
            }

            flush_buckets(&bucket_dir, &mut pending, &mut paths)?;

            log::debug!(
                "function {}: {} buckets on disk",
                function_index,
                paths.len()
            );

            tables.push(paths);
        }

        let functions_json = serde_json::to_string_pretty(&functions)
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(config.functions_file_path()?, functions_json)?;
        config.to_file(&config.config_file_path()?)?;

        return Ok(Self {
            functions,
            num_bits,
            storage: BucketStorage::BucketFiles(tables),
            config,
        });
    }

    /// Consolidate every per-bucket file of every function into one archive,
    /// one entry per bucket. The bucket files are deleted once packed.
    pub fn pack_to_archive(&mut self) -> Result<()> {
        let tables = match &self.storage {
            BucketStorage::BucketFiles(tables) => tables,
            _ => {
                return Err(Error::UnsupportedQuery(
                    "pack_to_archive needs bucket-file storage",
                ))
            }
        };

        let directory = self.config.directory_path()?;
        let archive_path = self.config.archive_file_path()?;

        let mut writer = ArchiveWriter::create(&archive_path)?;
        let mut entries: Vec<HashMap<u64, String>> = Vec::with_capacity(tables.len());

        for (function_index, paths) in tables.iter().enumerate() {
            let mut entry_map: HashMap<u64, String> = HashMap::new();

            let mut buckets: Vec<(&u64, &PathBuf)> = paths.iter().collect();
            buckets.sort_by_key(|(bucket, _)| **bucket);

            for (bucket, path) in buckets {
                let payload = match std::fs::read(path) {
                    Ok(p) => p,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(Error::DanglingBucket {
                            function: function_index,
                            bucket: *bucket,
                        });
                    }
                    Err(e) => return Err(e.into()),
                };

                let entry = encoding::bucket_entry_name(function_index, *bucket);
                writer.append(&entry, &payload)?;
                entry_map.insert(*bucket, entry);
            }

            entries.push(entry_map);
        }

        log::info!("packed {} bucket files into {}", writer.len(), archive_path.display());
        writer.finish()?;

        for (function_index, paths) in tables.iter().enumerate() {
            for path in paths.values() {
                std::fs::remove_file(path)?;
            }

            std::fs::remove_dir(directory.join(encoding::bucket_dir_name(function_index)))?;
        }

        self.storage = BucketStorage::Archive {
            archive: Arc::new(SharedArchive::new(archive_path)),
            entries,
        };

        return Ok(());
    }

    /// Reload an out-of-core index (bucket files or packed archive) from
    /// its directory.
    pub fn read_from_directory(directory: &Path) -> Result<Self> {
        let mut config = LshConfig::from_file(&directory.join("config.yaml"))?;
        config.directory = Some(directory.to_string_lossy().to_string());

        let functions_json = std::fs::read_to_string(config.functions_file_path()?)?;
        let functions: Vec<HashFunction> =
            serde_json::from_str(&functions_json).map_err(|e| Error::Parse(e.to_string()))?;

        let num_bits = validate_functions(&functions)?;

        if num_bits != config.num_bits {
            return Err(Error::LengthMismatch {
                expected: config.num_bits,
                got: num_bits,
            });
        }

        let archive_path = config.archive_file_path()?;

        let storage = match archive_path.exists() {
            true => {
                let reader = ArchiveReader::open(&archive_path)?;

                let names: Vec<String> = reader.entry_names().map(|s| s.to_string()).collect();
                let mut entries: Vec<HashMap<u64, String>> =
                    vec![HashMap::new(); functions.len()];

                for name in names {
                    let (function_index, bucket) = encoding::parse_bucket_entry_name(&name)?;

                    if function_index >= functions.len() {
                        return Err(Error::Parse(format!(
                            "archive entry {} references hash function {} of {}",
                            name,
                            function_index,
                            functions.len()
                        )));
                    }

                    entries[function_index].insert(bucket, name);
                }

                BucketStorage::Archive {
                    archive: Arc::new(SharedArchive::from_reader(reader)),
                    entries,
                }
            }
            false => {
                let mut tables: Vec<HashMap<u64, PathBuf>> = Vec::with_capacity(functions.len());

                for function_index in 0..functions.len() {
                    let bucket_dir = directory.join(encoding::bucket_dir_name(function_index));
                    let mut paths: HashMap<u64, PathBuf> = HashMap::new();

                    for entry in std::fs::read_dir(&bucket_dir)? {
                        let path = entry?.path();
                        let bucket = parse_bucket_file_name(&path)?;
                        paths.insert(bucket, path);
                    }

                    tables.push(paths);
                }

                BucketStorage::BucketFiles(tables)
            }
        };

        return Ok(Self {
            functions,
            num_bits,
            storage,
            config,
        });
    }

    pub fn num_bits(&self) -> usize {
        return self.num_bits;
    }

    /// Approximate radius search: candidates come only from the query's own
    /// bucket under every function, deduplicated, post-filtered by exact
    /// Hamming distance and capped at `max_results`. Resident storage only.
    pub fn find_all_nearest_neighbors(
        &self,
        query: &Fingerprint,
        radius: u32,
        max_results: usize,
    ) -> Result<Vec<Fingerprint>> {
        self.check_query(query)?;

        let tables = self.resident_tables(
            "approximate radius search needs resident buckets; use the MIH query on disk-backed indexes",
        )?;

        let mut seen: HashSet<Fingerprint> = HashSet::new();
        let mut out: Vec<Fingerprint> = Vec::new();

        if max_results == 0 {
            return Ok(out);
        }

        for (function, table) in self.functions.iter().zip(tables.iter()) {
            let candidates = match table.get(&function.hash(query)) {
                Some(c) => c,
                None => continue,
            };

            for candidate in candidates {
                if seen.contains(candidate) {
                    continue;
                }

                seen.insert(candidate.clone());

                if similarity::hamming(query, candidate) <= radius {
                    out.push(candidate.clone());

                    if out.len() >= max_results {
                        return Ok(out);
                    }
                }
            }
        }

        return Ok(out);
    }

    /// Ranked variant of the approximate search: the `max_results`
    /// smallest-distance candidates within `radius`.
    pub fn find_nearest_neighbors(
        &self,
        query: &Fingerprint,
        radius: u32,
        max_results: usize,
    ) -> Result<Vec<Neighbor>> {
        self.check_query(query)?;

        let tables = self.resident_tables(
            "ranked approximate search needs resident buckets; use the MIH query on disk-backed indexes",
        )?;

        let mut seen: HashSet<Fingerprint> = HashSet::new();
        let mut hits = TopHits::new(max_results);

        for (function, table) in self.functions.iter().zip(tables.iter()) {
            let candidates = match table.get(&function.hash(query)) {
                Some(c) => c,
                None => continue,
            };

            for candidate in candidates {
                if seen.contains(candidate) {
                    continue;
                }

                seen.insert(candidate.clone());

                let distance = similarity::hamming(query, candidate);

                if distance <= radius {
                    hits.try_add(distance, candidate);
                }
            }
        }

        return Ok(hits.into_vec());
    }

    /// Brute-force scan of the whole resident dataset.
    pub fn exact_find_nearest_neighbors(
        &self,
        query: &Fingerprint,
        radius: u32,
        max_results: usize,
    ) -> Result<Vec<Neighbor>> {
        self.check_query(query)?;

        let mut hits = TopHits::new(max_results);

        for candidate in self.resident_dataset("exact search needs resident buckets")? {
            let distance = similarity::hamming(query, candidate);

            if distance <= radius {
                hits.try_add(distance, candidate);
            }
        }

        return Ok(hits.into_vec());
    }

    /// Exact, complete radius search via multi-index hashing. Requires the
    /// functions to be mutually bit-disjoint and to cover every position.
    ///
    /// With `m` disjoint partitions a candidate within `radius` of the
    /// query must, by pigeonhole, sit within `ceil(radius / m)` of the
    /// query's projected value under at least one partition, so scanning
    /// that window of bucket ids per function misses nothing.
    pub fn find_all_nearest_neighbors_mih(
        &self,
        query: &Fingerprint,
        radius: u32,
    ) -> Result<Vec<Fingerprint>> {
        self.check_query(query)?;

        if !hash::is_mih_compliant(&self.functions, self.num_bits) {
            return Err(Error::NotMihCompliant);
        }

        let m = self.functions.len() as u32;
        let sub_radius = (radius + m - 1) / m;

        let mut seen: HashSet<Fingerprint> = HashSet::new();
        let mut out: Vec<Fingerprint> = Vec::new();

        for (function_index, function) in self.functions.iter().enumerate() {
            let query_bucket = function.hash(query);

            let low = query_bucket.saturating_sub(sub_radius as u64);
            let high = query_bucket.saturating_add(sub_radius as u64);

            for bucket in self.bucket_ids(function_index) {
                if bucket < low || bucket > high {
                    continue;
                }

                let candidates = match self.load_bucket(function_index, bucket)? {
                    Some(c) => c,
                    None => continue,
                };

                for candidate in candidates {
                    if seen.contains(&candidate) {
                        continue;
                    }

                    seen.insert(candidate.clone());

                    if similarity::hamming(query, &candidate) <= radius {
                        out.push(candidate);
                    }
                }
            }
        }

        return Ok(out);
    }

    /// Brute-force Tanimoto top-k over the resident dataset, descending
    /// similarity.
    pub fn exact_find_k_nearest_neighbors_tanimoto(
        &self,
        query: &Fingerprint,
        k: usize,
    ) -> Result<Vec<TanimotoHit>> {
        self.check_query(query)?;

        let mut hits = TanimotoHits::new(k);

        for candidate in self.resident_dataset("Tanimoto search needs resident buckets")? {
            hits.try_add(similarity::tanimoto(query, candidate), candidate);
        }

        return Ok(hits.into_vec());
    }

    fn check_query(&self, query: &Fingerprint) -> Result<()> {
        if query.num_bits() != self.num_bits {
            return Err(Error::LengthMismatch {
                expected: self.num_bits,
                got: query.num_bits(),
            });
        }

        return Ok(());
    }

    fn resident_tables(
        &self,
        reason: &'static str,
    ) -> Result<&Vec<HashMap<u64, Vec<Fingerprint>>>> {
        match &self.storage {
            BucketStorage::Resident(tables) => Ok(tables),
            _ => Err(Error::UnsupportedQuery(reason)),
        }
    }

    /// Every stored fingerprint, duplicates included: each vector lands in
    /// exactly one bucket per function, so one function's table is the
    /// whole dataset.
    fn resident_dataset(&self, reason: &'static str) -> Result<Vec<&Fingerprint>> {
        let tables = self.resident_tables(reason)?;

        return Ok(tables[0].values().flatten().collect());
    }

    fn bucket_ids(&self, function_index: usize) -> Vec<u64> {
        match &self.storage {
            BucketStorage::Resident(tables) => tables[function_index].keys().copied().collect(),
            BucketStorage::BucketFiles(tables) => {
                tables[function_index].keys().copied().collect()
            }
            BucketStorage::Archive { entries, .. } => {
                entries[function_index].keys().copied().collect()
            }
        }
    }

    fn load_bucket(&self, function_index: usize, bucket: u64) -> Result<Option<Vec<Fingerprint>>> {
        match &self.storage {
            BucketStorage::Resident(tables) => {
                return Ok(tables[function_index].get(&bucket).cloned());
            }
            BucketStorage::BucketFiles(tables) => {
                let path = match tables[function_index].get(&bucket) {
                    Some(p) => p,
                    None => return Ok(None),
                };

                let contents = match std::fs::read_to_string(path) {
                    Ok(s) => s,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(Error::DanglingBucket {
                            function: function_index,
                            bucket,
                        });
                    }
                    Err(e) => return Err(e.into()),
                };

                return Ok(Some(parse_bucket_lines(&contents, self.num_bits)?));
            }
            BucketStorage::Archive { archive, entries } => {
                let entry = match entries[function_index].get(&bucket) {
                    Some(e) => e,
                    None => return Ok(None),
                };

                let payload = match archive.read_entry(entry) {
                    Ok(p) => p,
                    Err(Error::MissingArchiveEntry { .. }) => {
                        return Err(Error::DanglingBucket {
                            function: function_index,
                            bucket,
                        });
                    }
                    Err(e) => return Err(e),
                };

                let contents = std::str::from_utf8(&payload)
                    .map_err(|_| Error::Parse(format!("bucket entry {} is not utf-8", entry)))?;

                return Ok(Some(parse_bucket_lines(contents, self.num_bits)?));
            }
        }
    }
}

fn validate_functions(functions: &[HashFunction]) -> Result<usize> {
    let first = match functions.first() {
        Some(f) => f,
        None => {
            return Err(Error::Config(
                "an LSH index needs at least one hash function".to_string(),
            ))
        }
    };

    let num_bits = first.num_bits();

    for function in functions.iter() {
        if function.num_bits() != num_bits {
            return Err(Error::LengthMismatch {
                expected: num_bits,
                got: function.num_bits(),
            });
        }
    }

    return Ok(num_bits);
}

fn flush_buckets(
    bucket_dir: &Path,
    pending: &mut HashMap<u64, Vec<Fingerprint>>,
    paths: &mut HashMap<u64, PathBuf>,
) -> Result<()> {
    for (bucket, vectors) in pending.drain() {
        if vectors.is_empty() {
            continue;
        }

        let path = bucket_dir.join(format!("{}{}", bucket, encoding::BUCKET_SUFFIX));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);

        for fp in vectors.iter() {
            writer.write_all(encoding::encode_line(fp).as_bytes())?;
            writer.write_all(b"\n")?;
        }

        writer.flush()?;
        paths.insert(bucket, path);
    }

    return Ok(());
}

fn parse_bucket_lines(contents: &str, num_bits: usize) -> Result<Vec<Fingerprint>> {
    let mut vectors: Vec<Fingerprint> = Vec::new();

    for line in contents.lines() {
        if line.trim_end().is_empty() {
            continue;
        }

        vectors.push(encoding::parse_line(line, num_bits)?);
    }

    return Ok(vectors);
}

fn parse_bucket_file_name(path: &Path) -> Result<u64> {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => {
            return Err(Error::Parse(format!(
                "unreadable bucket file name: {}",
                path.display()
            )))
        }
    };

    let stem = match name.strip_suffix(encoding::BUCKET_SUFFIX) {
        Some(s) => s,
        None => {
            return Err(Error::Parse(format!(
                "unexpected file in bucket directory: {}",
                name
            )))
        }
    };

    return stem
        .parse::<u64>()
        .map_err(|_| Error::Parse(format!("bad bucket id in file name: {}", name)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::write_input_file;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn random_dataset(n: usize, num_bits: usize, seed: u64) -> Vec<Fingerprint> {
        let mut rng = StdRng::seed_from_u64(seed);

        return (0..n)
            .map(|_| Fingerprint::random(num_bits, 0.5, &mut rng))
            .collect();
    }

    fn brute_force_radius(
        dataset: &[Fingerprint],
        query: &Fingerprint,
        radius: u32,
    ) -> BTreeSet<Fingerprint> {
        return dataset
            .iter()
            .filter(|v| similarity::hamming(query, v) <= radius)
            .cloned()
            .collect();
    }

    fn temp_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fp_index_lsh_{}", test));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        return dir;
    }

    #[test]
    fn mih_concrete_two_mask_scenario() {
        // two disjoint 4-bit masks over 8-bit fingerprints
        let functions = HashFunction::disjoint_partition(8, 2).unwrap();

        match &functions[0] {
            HashFunction::DisjointProjection { mask } => {
                assert_eq!(mask, &Fingerprint::from_set_bits(&[0, 1, 2, 3], 8));
            }
            _ => panic!("expected a disjoint projection"),
        }

        let dataset = random_dataset(20, 8, 41);
        let index = LshIndex::build(dataset.clone(), functions, 1).unwrap();

        // 0b01010101: bits 0, 2, 4, 6
        let query = Fingerprint::from_set_bits(&[0, 2, 4, 6], 8);

        let found: BTreeSet<Fingerprint> = index
            .find_all_nearest_neighbors_mih(&query, 2)
            .unwrap()
            .into_iter()
            .collect();

        assert_eq!(found, brute_force_radius(&dataset, &query, 2));
    }

    #[test]
    fn mih_is_exact_for_random_data() {
        let dataset = random_dataset(80, 32, 42);

        for m in [2, 4, 8] {
            let functions = HashFunction::disjoint_partition(32, m).unwrap();
            let index = LshIndex::build(dataset.clone(), functions, 2).unwrap();

            let mut rng = StdRng::seed_from_u64(43);

            for radius in [0u32, 2, 5, 9] {
                for _ in 0..10 {
                    let query = Fingerprint::random(32, 0.5, &mut rng);

                    let found: BTreeSet<Fingerprint> = index
                        .find_all_nearest_neighbors_mih(&query, radius)
                        .unwrap()
                        .into_iter()
                        .collect();

                    assert_eq!(found, brute_force_radius(&dataset, &query, radius));
                }
            }
        }
    }

    #[test]
    fn mih_rejects_non_compliant_functions() {
        let mut rng = StdRng::seed_from_u64(44);

        let functions = vec![
            HashFunction::random_projection(32, 8, 64, &mut rng).unwrap(),
            HashFunction::random_projection(32, 8, 64, &mut rng).unwrap(),
        ];

        let dataset = random_dataset(20, 32, 45);
        let index = LshIndex::build(dataset, functions, 1).unwrap();

        let query = Fingerprint::random(32, 0.5, &mut rng);

        match index.find_all_nearest_neighbors_mih(&query, 3) {
            Err(Error::NotMihCompliant) => {}
            other => panic!("expected NotMihCompliant, got {:?}", other),
        }
    }

    #[test]
    fn approximate_results_are_a_subset_of_exact() {
        let dataset = random_dataset(100, 64, 46);
        let mut rng = StdRng::seed_from_u64(47);

        let functions: Vec<HashFunction> = (0..6)
            .map(|_| HashFunction::random_projection(64, 12, 32, &mut rng).unwrap())
            .collect();

        let index = LshIndex::build(dataset.clone(), functions, 2).unwrap();

        for _ in 0..20 {
            let query = Fingerprint::random(64, 0.5, &mut rng);
            let radius = rng.gen_range(5..20);

            let exact = brute_force_radius(&dataset, &query, radius);

            let approx = index
                .find_all_nearest_neighbors(&query, radius, usize::MAX)
                .unwrap();

            for hit in approx.iter() {
                assert!(exact.contains(hit));
            }
        }
    }

    #[test]
    fn recall_is_non_decreasing_in_the_number_of_functions() {
        let dataset = random_dataset(150, 64, 48);
        let mut rng = StdRng::seed_from_u64(49);

        // one shared pool of functions; prefixes of it give nested indexes
        let pool: Vec<HashFunction> = (0..10)
            .map(|_| HashFunction::random_projection(64, 10, 16, &mut rng).unwrap())
            .collect();

        let queries: Vec<Fingerprint> = (0..15)
            .map(|_| Fingerprint::random(64, 0.5, &mut rng))
            .collect();

        let radius = 16u32;
        let mut last_recall_sum = 0usize;

        for m in [2, 5, 10] {
            let index = LshIndex::build(dataset.clone(), pool[..m].to_vec(), 2).unwrap();

            let mut recall_sum = 0usize;

            for query in queries.iter() {
                recall_sum += index
                    .find_all_nearest_neighbors(query, radius, usize::MAX)
                    .unwrap()
                    .len();
            }

            assert!(recall_sum >= last_recall_sum);
            last_recall_sum = recall_sum;
        }
    }

    #[test]
    fn exact_search_matches_brute_force_ranking() {
        let dataset = random_dataset(80, 32, 50);
        let functions = HashFunction::disjoint_partition(32, 4).unwrap();
        let index = LshIndex::build(dataset.clone(), functions, 1).unwrap();

        let mut rng = StdRng::seed_from_u64(51);

        for _ in 0..10 {
            let query = Fingerprint::random(32, 0.5, &mut rng);

            let hits = index.exact_find_nearest_neighbors(&query, 32, 10).unwrap();

            let mut expected: Vec<(u32, Fingerprint)> = dataset
                .iter()
                .map(|v| (similarity::hamming(&query, v), v.clone()))
                .collect();
            expected.sort();
            expected.truncate(10);

            let got: Vec<(u32, Fingerprint)> = hits
                .into_iter()
                .map(|h| (h.distance, h.fingerprint))
                .collect();

            assert_eq!(got, expected);
        }
    }

    #[test]
    fn ranked_approximate_search_is_ordered_and_capped() {
        let dataset = random_dataset(120, 32, 52);
        let functions = HashFunction::disjoint_partition(32, 4).unwrap();
        let index = LshIndex::build(dataset, functions, 1).unwrap();

        let mut rng = StdRng::seed_from_u64(53);
        let query = Fingerprint::random(32, 0.5, &mut rng);

        let hits = index.find_nearest_neighbors(&query, 32, 7).unwrap();

        assert!(hits.len() <= 7);

        for pair in hits.windows(2) {
            assert!(
                (pair[0].distance, &pair[0].fingerprint)
                    <= (pair[1].distance, &pair[1].fingerprint)
            );
        }

        // ranked hits agree with the unranked candidate set
        let unranked = index
            .find_all_nearest_neighbors(&query, 32, usize::MAX)
            .unwrap();

        for hit in hits.iter() {
            assert!(unranked.contains(&hit.fingerprint));
        }
    }

    #[test]
    fn tanimoto_top_k_matches_brute_force() {
        let dataset = random_dataset(60, 32, 54);
        let functions = HashFunction::disjoint_partition(32, 4).unwrap();
        let index = LshIndex::build(dataset.clone(), functions, 1).unwrap();

        let mut rng = StdRng::seed_from_u64(55);

        for _ in 0..10 {
            let query = Fingerprint::random(32, 0.5, &mut rng);

            let hits = index
                .exact_find_k_nearest_neighbors_tanimoto(&query, 8)
                .unwrap();

            assert_eq!(hits.len(), 8);

            let mut expected: Vec<Fingerprint> = dataset.clone();
            expected.sort_by(|a, b| {
                let sa = similarity::tanimoto(&query, a);
                let sb = similarity::tanimoto(&query, b);

                match sb.partial_cmp(&sa) {
                    Some(std::cmp::Ordering::Equal) => a.cmp(b),
                    Some(order) => order,
                    None => panic!("tanimoto produced NaN"),
                }
            });
            expected.truncate(8);

            let got: Vec<Fingerprint> = hits.into_iter().map(|h| h.fingerprint).collect();

            assert_eq!(got, expected);
        }
    }

    #[test]
    fn out_of_core_build_pack_and_reload() {
        let dataset = random_dataset(90, 32, 56);
        let dir = temp_dir("out_of_core");

        let input = dir.join("input.b64");
        write_input_file(&input, &dataset).unwrap();

        let functions = HashFunction::disjoint_partition(32, 4).unwrap();

        let mut config = LshConfig::default();
        config.num_bits = 32;
        config.batch_size = 16; // force several flushes per function
        config.directory = Some(dir.join("index").to_string_lossy().to_string());

        let mut index =
            LshIndex::build_streaming(&input, functions.clone(), config).unwrap();

        let mut rng = StdRng::seed_from_u64(57);

        let queries: Vec<(Fingerprint, u32)> = (0..10)
            .map(|_| (Fingerprint::random(32, 0.5, &mut rng), rng.gen_range(0..8)))
            .collect();

        let check = |index: &LshIndex| {
            for (query, radius) in queries.iter() {
                let found: BTreeSet<Fingerprint> = index
                    .find_all_nearest_neighbors_mih(query, *radius)
                    .unwrap()
                    .into_iter()
                    .collect();

                assert_eq!(found, brute_force_radius(&dataset, query, *radius));
            }
        };

        // bucket files
        check(&index);

        // the approximate query is not served off disk
        match index.find_all_nearest_neighbors(&queries[0].0, 5, 10) {
            Err(Error::UnsupportedQuery(_)) => {}
            other => panic!("expected UnsupportedQuery, got {:?}", other),
        }

        // reload from bucket files
        let reloaded = LshIndex::read_from_directory(&dir.join("index")).unwrap();
        check(&reloaded);

        // packed archive
        index.pack_to_archive().unwrap();
        check(&index);

        // reload from the archive
        let reloaded = LshIndex::read_from_directory(&dir.join("index")).unwrap();
        check(&reloaded);
    }

    #[test]
    fn dangling_bucket_file_is_an_integrity_error() {
        let dataset = random_dataset(40, 16, 58);
        let dir = temp_dir("dangling");

        let input = dir.join("input.b64");
        write_input_file(&input, &dataset).unwrap();

        let functions = HashFunction::disjoint_partition(16, 2).unwrap();

        let mut config = LshConfig::default();
        config.num_bits = 16;
        config.batch_size = 8;
        config.directory = Some(dir.join("index").to_string_lossy().to_string());

        let index = LshIndex::build_streaming(&input, functions, config).unwrap();

        // delete one bucket file behind the index's back
        let bucket_dir = dir.join("index").join(encoding::bucket_dir_name(0));
        let victim = std::fs::read_dir(&bucket_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::remove_file(victim).unwrap();

        let query = Fingerprint::new(16);

        // scanning every bucket at full radius must hit the dangling one
        match index.find_all_nearest_neighbors_mih(&query, 16) {
            Err(Error::DanglingBucket { .. }) => {}
            other => panic!("expected DanglingBucket, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_fingerprints_survive_in_the_dataset() {
        let v = Fingerprint::from_set_bits(&[1, 2], 16);
        let dataset = vec![v.clone(), v.clone(), v.clone()];

        let functions = HashFunction::disjoint_partition(16, 2).unwrap();
        let index = LshIndex::build(dataset, functions, 1).unwrap();

        let hits = index.exact_find_nearest_neighbors(&v, 0, 10).unwrap();

        // the bag keeps all three copies
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.distance == 0));
    }
}
