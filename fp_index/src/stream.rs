//! Out-of-core tree construction for inputs that do not fit in memory.
//!
//! The input is a newline-delimited file of base64-encoded fingerprints. Each
//! recursion step streams its input twice: once to count lines and gather
//! zero/one statistics for a sampled subset of the free bit positions, and
//! once to partition the lines into two temp files by the chosen split bit.
//! Partitions small enough to load are finished with the in-memory builder;
//! larger ones keep streaming. Partition files are deleted as soon as they
//! are consumed. The caller's input file is left alone.
//!
//! Split candidates are restricted to the sampled positions: statistics for
//! unsampled bits are never gathered, so an unsampled bit can never score
//! above a sampled one. When every sampled candidate is degenerate the
//! dataset becomes an oversized leaf, the same policy the in-memory builder
//! applies when no usable split bit remains.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;

use crate::config::TreeConfig;
use crate::data::Fingerprint;
use crate::encoding;
use crate::error::Result;
use crate::tree::{Node, SubsetTree, TreeBuilder};

#[derive(Debug)]
pub struct StreamingBuilder {
    builder: TreeBuilder,
    temp_dir: PathBuf,
}

impl StreamingBuilder {
    pub fn new(config: TreeConfig, temp_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(temp_dir)?;

        return Ok(Self {
            builder: TreeBuilder::new(config)?,
            temp_dir: temp_dir.to_path_buf(),
        });
    }

    pub fn build(mut self, input: &Path) -> Result<SubsetTree> {
        let num_bits = self.builder.config().num_bits;

        log::info!(
            "streaming tree build from {} ({} bits per fingerprint)",
            input.display(),
            num_bits
        );

        let root = self.build_from_file(
            input,
            Fingerprint::new(num_bits),
            Fingerprint::new(num_bits),
            "r".to_string(),
            false,
        )?;

        return self.builder.finish(root);
    }

    fn build_from_file(
        &mut self,
        path: &Path,
        forced_zero: Fingerprint,
        forced_one: Fingerprint,
        label: String,
        owned: bool,
    ) -> Result<Node> {
        let num_bits = self.builder.config().num_bits;
        let leaf_capacity = self.builder.config().leaf_capacity;
        let sample_rate = self.builder.config().sample_rate;
        let partition_limit = self.builder.config().partition_memory_limit;

        let free: Vec<usize> = (0..num_bits)
            .filter(|&bit| !forced_zero.get_bit(bit) && !forced_one.get_bit(bit))
            .collect();

        let sample_size = ((free.len() as f64 * sample_rate).ceil() as usize)
            .max(1)
            .min(free.len());

        let sampled: Vec<usize> = free
            .choose_multiple(self.builder.rng(), sample_size)
            .copied()
            .collect();

        // pass 1: line count plus one-counts for the sampled bits
        let mut one_counts = vec![0u64; sampled.len()];
        let mut total: u64 = 0;

        {
            let reader = BufReader::new(File::open(path)?);

            for line in reader.lines() {
                let line = line?;

                if line.trim_end().is_empty() {
                    continue;
                }

                let fp = encoding::parse_line(&line, num_bits)?;
                total += 1;

                for (i, &bit) in sampled.iter().enumerate() {
                    if fp.get_bit(bit) {
                        one_counts[i] += 1;
                    }
                }
            }
        }

        if total as usize <= leaf_capacity {
            let vectors = read_all_vectors(path, num_bits)?;
            consume_file(path, owned)?;

            return self
                .builder
                .materialize_leaf(vectors, forced_zero, forced_one, &label);
        }

        let mut best_bit: Option<usize> = None;
        let mut best_score = 0.0f64;

        for (i, &bit) in sampled.iter().enumerate() {
            let p = one_counts[i] as f64 / total as f64;
            let score = p.min(1.0 - p);

            if score > best_score {
                best_score = score;
                best_bit = Some(bit);
            }
        }

        let split_bit = match best_bit {
            Some(bit) => bit,
            None => {
                // oversized leaf: nothing sampled can split the data
                let vectors = read_all_vectors(path, num_bits)?;
                consume_file(path, owned)?;

                return self
                    .builder
                    .materialize_leaf(vectors, forced_zero, forced_one, &label);
            }
        };

        log::debug!(
            "{}: splitting {} fingerprints on bit {} (score {:.3})",
            label,
            total,
            split_bit,
            best_score
        );

        // pass 2: partition into two temp files, tracking byte sizes
        let left_path = self.temp_dir.join(format!("{}_0.part", label));
        let right_path = self.temp_dir.join(format!("{}_1.part", label));

        let mut left_bytes: u64 = 0;
        let mut right_bytes: u64 = 0;

        {
            let reader = BufReader::new(File::open(path)?);
            let mut left_writer = BufWriter::new(File::create(&left_path)?);
            let mut right_writer = BufWriter::new(File::create(&right_path)?);

            for line in reader.lines() {
                let line = line?;

                if line.trim_end().is_empty() {
                    continue;
                }

                let fp = encoding::parse_line(&line, num_bits)?;

                match fp.get_bit(split_bit) {
                    true => {
                        right_writer.write_all(line.as_bytes())?;
                        right_writer.write_all(b"\n")?;
                        right_bytes += line.len() as u64 + 1;
                    }
                    false => {
                        left_writer.write_all(line.as_bytes())?;
                        left_writer.write_all(b"\n")?;
                        left_bytes += line.len() as u64 + 1;
                    }
                }
            }

            left_writer.flush()?;
            right_writer.flush()?;
        }

        consume_file(path, owned)?;

        let left = self.build_partition(
            &left_path,
            left_bytes,
            partition_limit,
            forced_zero.with_bit(split_bit),
            forced_one.clone(),
            encoding::child_label(&label, false),
        )?;

        let right = self.build_partition(
            &right_path,
            right_bytes,
            partition_limit,
            forced_zero.clone(),
            forced_one.with_bit(split_bit),
            encoding::child_label(&label, true),
        )?;

        return Ok(Node::Internal {
            split_bit,
            forced_zero,
            forced_one,
            left: Box::new(left),
            right: Box::new(right),
        });
    }

    fn build_partition(
        &mut self,
        path: &Path,
        byte_size: u64,
        partition_limit: u64,
        forced_zero: Fingerprint,
        forced_one: Fingerprint,
        label: String,
    ) -> Result<Node> {
        if byte_size > partition_limit {
            return self.build_from_file(path, forced_zero, forced_one, label, true);
        }

        // small enough: finish this subtree with the in-memory algorithm
        let num_bits = self.builder.config().num_bits;
        let vectors = read_all_vectors(path, num_bits)?;
        std::fs::remove_file(path)?;

        return self.builder.build_node(vectors, forced_zero, forced_one, label);
    }
}

fn read_all_vectors(path: &Path, num_bits: usize) -> Result<Vec<Fingerprint>> {
    let reader = BufReader::new(File::open(path)?);
    let mut vectors: Vec<Fingerprint> = Vec::new();

    for line in reader.lines() {
        let line = line?;

        if line.trim_end().is_empty() {
            continue;
        }

        vectors.push(encoding::parse_line(&line, num_bits)?);
    }

    return Ok(vectors);
}

fn consume_file(path: &Path, owned: bool) -> Result<()> {
    if owned {
        std::fs::remove_file(path)?;
    }

    return Ok(());
}

/// Write a dataset as the newline-delimited base64 input format.
pub fn write_input_file(path: &Path, vectors: &[Fingerprint]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    for fp in vectors {
        writer.write_all(encoding::encode_line(fp).as_bytes())?;
        writer.write_all(b"\n")?;
    }

    writer.flush()?;

    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeafStorageMode;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_dataset(n: usize, num_bits: usize, seed: u64) -> Vec<Fingerprint> {
        let mut rng = StdRng::seed_from_u64(seed);

        return (0..n)
            .map(|_| Fingerprint::random(num_bits, 0.35, &mut rng))
            .collect();
    }

    fn brute_force_supersets(dataset: &[Fingerprint], query: &Fingerprint) -> Vec<Fingerprint> {
        let mut out: Vec<Fingerprint> = dataset
            .iter()
            .filter(|v| query.is_subset_of(v))
            .cloned()
            .collect();
        out.sort();

        return out;
    }

    fn temp_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fp_index_stream_{}", test));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        return dir;
    }

    #[test]
    fn streaming_build_matches_brute_force() {
        let dataset = random_dataset(120, 48, 21);
        let dir = temp_dir("brute");

        let input = dir.join("input.b64");
        write_input_file(&input, &dataset).unwrap();

        // a tiny partition limit keeps the build streaming all the way
        // down; a huge one switches to memory after the first split
        for partition_limit in [1u64, u64::MAX] {
            let mut config = TreeConfig::default();
            config.num_bits = 48;
            config.leaf_capacity = 8;
            config.seed = Some(1);
            config.partition_memory_limit = partition_limit;

            let builder = StreamingBuilder::new(config, &dir.join("tmp")).unwrap();
            let tree = builder.build(&input).unwrap();

            assert_eq!(tree.count_all().unwrap(), dataset.len());

            let mut rng = StdRng::seed_from_u64(22);

            for _ in 0..20 {
                let query = Fingerprint::random(48, 0.1, &mut rng);

                let mut found = tree.collect_supersets(&query).unwrap();
                found.sort();

                assert_eq!(found, brute_force_supersets(&dataset, &query));
            }
        }

        // the caller's input survives both builds
        assert!(input.exists());
    }

    #[test]
    fn partition_files_are_deleted_once_consumed() {
        let dataset = random_dataset(100, 32, 23);
        let dir = temp_dir("cleanup");

        let input = dir.join("input.b64");
        write_input_file(&input, &dataset).unwrap();

        let mut config = TreeConfig::default();
        config.num_bits = 32;
        config.leaf_capacity = 5;
        config.seed = Some(2);
        config.partition_memory_limit = 1;

        let work_dir = dir.join("tmp");
        let builder = StreamingBuilder::new(config, &work_dir).unwrap();
        let tree = builder.build(&input).unwrap();

        assert_eq!(tree.count_all().unwrap(), dataset.len());

        let leftovers: Vec<_> = std::fs::read_dir(&work_dir).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn streaming_build_with_archive_leaves() {
        let dataset = random_dataset(90, 32, 24);
        let dir = temp_dir("archive");

        let input = dir.join("input.b64");
        write_input_file(&input, &dataset).unwrap();

        let mut config = TreeConfig::default();
        config.num_bits = 32;
        config.leaf_capacity = 6;
        config.seed = Some(3);
        config.partition_memory_limit = 1;
        config.storage_mode = LeafStorageMode::Archive;
        config.directory = Some(dir.join("tree").to_string_lossy().to_string());

        let builder = StreamingBuilder::new(config, &dir.join("tmp")).unwrap();
        let tree = builder.build(&input).unwrap();

        assert_eq!(tree.count_all().unwrap(), dataset.len());

        let mut rng = StdRng::seed_from_u64(25);

        for _ in 0..15 {
            let query = Fingerprint::random(32, 0.1, &mut rng);

            let mut found = tree.collect_supersets(&query).unwrap();
            found.sort();

            assert_eq!(found, brute_force_supersets(&dataset, &query));
        }

        // the archive-backed tree reloads from its directory
        let reloaded = SubsetTree::read_from_directory(&dir.join("tree")).unwrap();
        assert_eq!(reloaded.count_all().unwrap(), dataset.len());
    }

    #[test]
    fn tiny_input_becomes_a_single_leaf() {
        let dataset = random_dataset(4, 32, 26);
        let dir = temp_dir("tiny");

        let input = dir.join("input.b64");
        write_input_file(&input, &dataset).unwrap();

        let mut config = TreeConfig::default();
        config.num_bits = 32;
        config.leaf_capacity = 10;
        config.seed = Some(4);

        let builder = StreamingBuilder::new(config, &dir.join("tmp")).unwrap();
        let tree = builder.build(&input).unwrap();

        assert!(tree.root.is_leaf());
        assert_eq!(tree.count_all().unwrap(), 4);
        assert!(input.exists());
    }
}
