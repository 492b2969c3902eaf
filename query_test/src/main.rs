use std::path::Path;
use std::time::Instant;

use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fp_index::data::Fingerprint;
use fp_index::lsh::LshIndex;
use fp_index::tree::SubsetTree;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    ///Directory holding a built subset tree
    #[arg(long)]
    tree_dir: Option<String>,

    ///Directory holding a built out-of-core LSH index
    #[arg(long)]
    lsh_dir: Option<String>,

    ///Number of random queries per check
    #[arg(short, long, default_value_t = 100)]
    queries: usize,

    #[arg(short, long, default_value_t = 7)]
    seed: u64,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    if let Some(tree_dir) = &args.tree_dir {
        exercise_tree(tree_dir, args.queries, args.seed);
    }

    if let Some(lsh_dir) = &args.lsh_dir {
        exercise_lsh(lsh_dir, args.queries, args.seed);
    }
}

fn exercise_tree(directory: &str, queries: usize, seed: u64) {
    let tree = SubsetTree::read_from_directory(Path::new(directory)).unwrap();

    let num_bits = tree.config.num_bits;
    let total = tree.count_all().unwrap();

    info!(
        "{}: {} fingerprints, {} leaves, depth {}",
        directory,
        total,
        tree.num_leaves(),
        tree.depth()
    );

    let mut rng = StdRng::seed_from_u64(seed);

    let mut hits = 0usize;
    let start = Instant::now();

    for _ in 0..queries {
        let query = Fingerprint::random(num_bits, 0.05, &mut rng);

        let supersets = tree.collect_supersets(&query).unwrap();

        // cross-check against the lazy iterator
        let iterated = tree
            .superset_iter(&query)
            .map(|r| r.unwrap())
            .count();
        assert_eq!(iterated, supersets.len());

        if !supersets.is_empty() {
            hits += 1;
            assert!(tree.test_subset(&query).unwrap());
        }
    }

    info!(
        "{} superset queries ({} non-empty) in {:.3}s",
        queries,
        hits,
        start.elapsed().as_secs_f64()
    );
}

fn exercise_lsh(directory: &str, queries: usize, seed: u64) {
    let index = LshIndex::read_from_directory(Path::new(directory)).unwrap();

    info!(
        "{}: {} hash functions over {} bits",
        directory,
        index.functions.len(),
        index.num_bits()
    );

    let mut rng = StdRng::seed_from_u64(seed);

    let start = Instant::now();
    let mut total_hits = 0usize;

    for _ in 0..queries {
        let query = Fingerprint::random(index.num_bits(), 0.1, &mut rng);
        let radius = rng.gen_range(0..(index.num_bits() as u32 / 8).max(1));

        let found = index.find_all_nearest_neighbors_mih(&query, radius).unwrap();
        total_hits += found.len();
    }

    info!(
        "{} MIH queries ({} hits) in {:.3}s",
        queries,
        total_hits,
        start.elapsed().as_secs_f64()
    );
}
