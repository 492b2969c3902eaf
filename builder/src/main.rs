use std::path::{Path, PathBuf};

use clap::Parser;
use kdam::tqdm;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use fp_index::config::{LeafStorageMode, LshConfig, TreeConfig};
use fp_index::data::Fingerprint;
use fp_index::error::Result;
use fp_index::hash::HashFunction;
use fp_index::lsh::LshIndex;
use fp_index::stream::{write_input_file, StreamingBuilder};
use fp_index::tree::TreeBuilder;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    ///Which task to carry out: random-input, build-tree,
    ///build-tree-streaming, build-lsh, pack-lsh
    #[arg(short, long)]
    task: String,

    ///Input fingerprint file (one base64 fingerprint per line)
    #[arg(short, long)]
    input: Option<String>,

    ///Directory the built index lands in
    #[arg(short, long)]
    output_dir: Option<String>,

    ///Fingerprint length in bits
    #[arg(short, long, default_value_t = 2048)]
    num_bits: usize,

    ///Tree leaf capacity
    #[arg(short, long, default_value_t = 64)]
    leaf_capacity: usize,

    ///Leaf storage: memory, files or archive
    #[arg(long, default_value = "archive")]
    storage: String,

    ///Number of disjoint hash functions for build-lsh
    #[arg(long, default_value_t = 8)]
    num_functions: usize,

    ///Number of random fingerprints for random-input
    #[arg(short, long, default_value_t = 100000)]
    count: usize,

    #[arg(short, long)]
    seed: Option<u64>,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    let outcome = match args.task.as_str() {
        "random-input" => random_input(&args),
        "build-tree" => build_tree(&args),
        "build-tree-streaming" => build_tree_streaming(&args),
        "build-lsh" => build_lsh(&args),
        "pack-lsh" => pack_lsh(&args),
        _ => panic!("Unknown task: {}", args.task),
    };

    if let Err(e) = outcome {
        eprintln!("task {} failed: {}", args.task, e);
        std::process::exit(1);
    }
}

fn required<'a>(value: &'a Option<String>, flag: &str) -> &'a str {
    match value {
        Some(v) => v,
        None => panic!("--{} is required for this task", flag),
    }
}

fn storage_mode(args: &Args) -> LeafStorageMode {
    match args.storage.as_str() {
        "memory" => LeafStorageMode::InMemory,
        "files" => LeafStorageMode::PerLeafFiles,
        "archive" => LeafStorageMode::Archive,
        other => panic!("Unknown storage mode: {}", other),
    }
}

fn tree_config(args: &Args) -> TreeConfig {
    let mut config = TreeConfig::default();
    config.num_bits = args.num_bits;
    config.leaf_capacity = args.leaf_capacity;
    config.storage_mode = storage_mode(args);
    config.seed = args.seed;
    config.directory = args.output_dir.clone();

    return config;
}

fn random_input(args: &Args) -> Result<()> {
    let output = required(&args.output_dir, "output-dir");
    std::fs::create_dir_all(output)?;

    let path = PathBuf::from(output).join("random_fingerprints.b64");

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut vectors: Vec<Fingerprint> = Vec::with_capacity(args.count);

    for _ in tqdm!(0..args.count) {
        vectors.push(Fingerprint::random(args.num_bits, 0.1, &mut rng));
    }

    write_input_file(&path, &vectors)?;

    info!("wrote {} fingerprints to {}", args.count, path.display());

    return Ok(());
}

fn build_tree(args: &Args) -> Result<()> {
    let input = required(&args.input, "input");
    let config = tree_config(args);

    // --input may be a glob covering several fingerprint files
    let filenames: Vec<PathBuf> = glob::glob(input)
        .expect("Glob failed")
        .filter_map(|entry| entry.ok())
        .collect();

    if filenames.is_empty() {
        panic!("no input files match {}", input);
    }

    let mut vectors: Vec<Fingerprint> = Vec::new();

    for filename in filenames.iter() {
        let contents = std::fs::read_to_string(filename)?;

        for line in tqdm!(contents.lines()) {
            if line.trim_end().is_empty() {
                continue;
            }

            vectors.push(fp_index::encoding::parse_line(line, config.num_bits)?);
        }
    }

    info!("building tree over {} fingerprints", vectors.len());

    let tree = TreeBuilder::new(config)?.build(vectors)?;

    info!(
        "done: {} fingerprints in {} leaves, depth {}",
        tree.count_all()?,
        tree.num_leaves(),
        tree.depth()
    );

    return Ok(());
}

fn build_tree_streaming(args: &Args) -> Result<()> {
    let input = required(&args.input, "input");
    let output = required(&args.output_dir, "output-dir");

    let mut config = tree_config(args);

    if config.storage_mode == LeafStorageMode::InMemory {
        // a streamed build that keeps every leaf resident defeats the point
        config.storage_mode = LeafStorageMode::Archive;
    }

    let temp_dir = PathBuf::from(output).join("tmp_partitions");

    let builder = StreamingBuilder::new(config, &temp_dir)?;
    let tree = builder.build(Path::new(input))?;

    info!(
        "done: {} fingerprints in {} leaves, depth {}",
        tree.count_all()?,
        tree.num_leaves(),
        tree.depth()
    );

    let _ = std::fs::remove_dir(&temp_dir);

    return Ok(());
}

fn build_lsh(args: &Args) -> Result<()> {
    let input = required(&args.input, "input");
    let output = required(&args.output_dir, "output-dir");

    let mut config = LshConfig::default();
    config.num_bits = args.num_bits;
    config.seed = args.seed;
    config.directory = Some(output.to_string());

    let functions = HashFunction::disjoint_partition(args.num_bits, args.num_functions)?;

    let index = LshIndex::build_streaming(Path::new(input), functions, config)?;

    info!(
        "done: {} hash functions written to {}",
        index.functions.len(),
        output
    );

    return Ok(());
}

fn pack_lsh(args: &Args) -> Result<()> {
    let output = required(&args.output_dir, "output-dir");

    let mut index = LshIndex::read_from_directory(Path::new(output))?;
    index.pack_to_archive()?;

    info!("packed bucket files under {} into an archive", output);

    return Ok(());
}
