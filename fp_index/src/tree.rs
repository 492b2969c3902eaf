//! The subset-screening tree: construction, queries and serialization.
//!
//! Every node records the bit positions forced to zero and forced to one for
//! all fingerprints stored beneath it. Internal nodes additionally carry the
//! split bit that separates their children; leaves carry a payload of
//! fingerprints in one of the [`LeafStorage`] modes. The root is the unique
//! node whose masks are both empty.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::archive::SharedArchive;
use crate::config::{LeafStorageMode, TreeConfig};
use crate::data::Fingerprint;
use crate::encoding;
use crate::error::{Error, Result};
use crate::leaf::{LeafStorage, LeafWriter};

/// Balance score (`min(p, 1-p)` of the one-fraction) above which a split
/// candidate is accepted without scanning the remaining positions. Bounds
/// construction cost; a slightly unbalanced split is fine.
pub const GOOD_ENOUGH_BALANCE: f64 = 0.42;

#[derive(Debug)]
pub enum Node {
    Internal {
        split_bit: usize,
        forced_zero: Fingerprint,
        forced_one: Fingerprint,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        forced_zero: Fingerprint,
        forced_one: Fingerprint,
        storage: LeafStorage,
    },
}

impl Node {
    pub fn forced_zero(&self) -> &Fingerprint {
        match self {
            Node::Internal { forced_zero, .. } => forced_zero,
            Node::Leaf { forced_zero, .. } => forced_zero,
        }
    }

    pub fn forced_one(&self) -> &Fingerprint {
        match self {
            Node::Internal { forced_one, .. } => forced_one,
            Node::Leaf { forced_one, .. } => forced_one,
        }
    }

    pub fn is_leaf(&self) -> bool {
        return matches!(self, Node::Leaf { .. });
    }
}

/// Builds a [`SubsetTree`] from an in-memory dataset.
///
/// The split-bit shuffle runs on a builder-owned generator seeded from
/// `TreeConfig::seed`, so tree shapes are reproducible when a seed is given.
#[derive(Debug)]
pub struct TreeBuilder {
    config: TreeConfig,
    rng: StdRng,
    leaf_writer: LeafWriter,
}

impl TreeBuilder {
    pub fn new(config: TreeConfig) -> Result<Self> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let leaf_writer = LeafWriter::new(&config)?;

        return Ok(Self {
            config,
            rng,
            leaf_writer,
        });
    }

    pub fn build(mut self, vectors: Vec<Fingerprint>) -> Result<SubsetTree> {
        for v in vectors.iter() {
            if v.num_bits() != self.config.num_bits {
                return Err(Error::LengthMismatch {
                    expected: self.config.num_bits,
                    got: v.num_bits(),
                });
            }
        }

        log::debug!("building subset tree over {} fingerprints", vectors.len());

        let num_bits = self.config.num_bits;
        let root = self.build_node(
            vectors,
            Fingerprint::new(num_bits),
            Fingerprint::new(num_bits),
            "r".to_string(),
        )?;

        return self.finish(root);
    }

    pub(crate) fn config(&self) -> &TreeConfig {
        return &self.config;
    }

    pub(crate) fn rng(&mut self) -> &mut StdRng {
        return &mut self.rng;
    }

    pub(crate) fn materialize_leaf(
        &mut self,
        vectors: Vec<Fingerprint>,
        forced_zero: Fingerprint,
        forced_one: Fingerprint,
        label: &str,
    ) -> Result<Node> {
        let storage = self.leaf_writer.materialize(vectors, label)?;

        return Ok(Node::Leaf {
            forced_zero,
            forced_one,
            storage,
        });
    }

    pub(crate) fn finish(self, root: Node) -> Result<SubsetTree> {
        self.leaf_writer.finish()?;

        let tree = SubsetTree {
            root,
            config: self.config,
        };

        if tree.config.storage_mode != LeafStorageMode::InMemory {
            tree.config.to_file(&tree.config.config_file_path()?)?;
            tree.write_structure()?;
        }

        return Ok(tree);
    }

    pub(crate) fn build_node(
        &mut self,
        vectors: Vec<Fingerprint>,
        forced_zero: Fingerprint,
        forced_one: Fingerprint,
        label: String,
    ) -> Result<Node> {
        if vectors.len() <= self.config.leaf_capacity {
            let storage = self.leaf_writer.materialize(vectors, &label)?;

            return Ok(Node::Leaf {
                forced_zero,
                forced_one,
                storage,
            });
        }

        let split_bit = match self.choose_split_bit(&vectors, &forced_zero, &forced_one) {
            Some(bit) => bit,
            None => {
                // capacity is a target, not a ceiling: with every free bit
                // degenerate the dataset becomes an oversized leaf
                let storage = self.leaf_writer.materialize(vectors, &label)?;

                return Ok(Node::Leaf {
                    forced_zero,
                    forced_one,
                    storage,
                });
            }
        };

        let (ones, zeros): (Vec<Fingerprint>, Vec<Fingerprint>) =
            vectors.into_iter().partition(|v| v.get_bit(split_bit));

        let left = self.build_node(
            zeros,
            forced_zero.with_bit(split_bit),
            forced_one.clone(),
            encoding::child_label(&label, false),
        )?;

        let right = self.build_node(
            ones,
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

    /// Scan the not-yet-fixed bit positions in shuffled order, keeping the
    /// best balance score seen, and stop early once a candidate clears
    /// [`GOOD_ENOUGH_BALANCE`]. `None` when every candidate is degenerate.
    fn choose_split_bit(
        &mut self,
        vectors: &[Fingerprint],
        forced_zero: &Fingerprint,
        forced_one: &Fingerprint,
    ) -> Option<usize> {
        let mut candidates: Vec<usize> = (0..self.config.num_bits)
            .filter(|&bit| !forced_zero.get_bit(bit) && !forced_one.get_bit(bit))
            .collect();

        candidates.shuffle(&mut self.rng);

        let mut best_bit: Option<usize> = None;
        let mut best_score = 0.0f64;

        for bit in candidates {
            let ones = vectors.iter().filter(|v| v.get_bit(bit)).count();
            let p = ones as f64 / vectors.len() as f64;
            let score = p.min(1.0 - p);

            if score > best_score {
                best_score = score;
                best_bit = Some(bit);
            }

            if score > GOOD_ENOUGH_BALANCE {
                break;
            }
        }

        return best_bit;
    }
}

#[derive(Debug)]
pub struct SubsetTree {
    pub root: Node,
    pub config: TreeConfig,
}

impl SubsetTree {
    /// True iff some stored fingerprint is a bit-superset of `query`.
    pub fn test_subset(&self, query: &Fingerprint) -> Result<bool> {
        return Ok(self.find_matching_subtree(query)?.is_some());
    }

    /// The first subtree guaranteed to contain a superset of `query`: either
    /// an internal node whose forced-one mask already covers the query, or a
    /// leaf holding a concrete superset.
    pub fn find_matching_subtree(&self, query: &Fingerprint) -> Result<Option<&Node>> {
        return Self::find_in_node(&self.root, query);
    }

    fn find_in_node<'a>(node: &'a Node, query: &Fingerprint) -> Result<Option<&'a Node>> {
        match node {
            Node::Leaf { storage, .. } => {
                let vectors = storage.load()?;

                match vectors.iter().any(|v| query.is_subset_of(v)) {
                    true => Ok(Some(node)),
                    false => Ok(None),
                }
            }
            Node::Internal {
                split_bit,
                forced_one,
                left,
                right,
                ..
            } => {
                // the forced-one mask is contained in every concrete
                // fingerprint below, so covering the query here is a
                // guaranteed terminal match
                if query.is_subset_of(forced_one) {
                    return Ok(Some(node));
                }

                if query.get_bit(*split_bit) {
                    // only the forced-one child can hold supersets
                    return Self::find_in_node(right, query);
                }

                if let Some(found) = Self::find_in_node(right, query)? {
                    return Ok(Some(found));
                }

                return Self::find_in_node(left, query);
            }
        }
    }

    /// Every stored fingerprint that is a superset of `query`.
    pub fn collect_supersets(&self, query: &Fingerprint) -> Result<Vec<Fingerprint>> {
        let mut out: Vec<Fingerprint> = Vec::new();
        Self::collect_in_node(&self.root, query, &mut out)?;

        return Ok(out);
    }

    fn collect_in_node(node: &Node, query: &Fingerprint, out: &mut Vec<Fingerprint>) -> Result<()> {
        match node {
            Node::Leaf { storage, .. } => {
                for v in storage.load()? {
                    if query.is_subset_of(&v) {
                        out.push(v);
                    }
                }

                return Ok(());
            }
            Node::Internal {
                split_bit,
                left,
                right,
                ..
            } => {
                if !query.get_bit(*split_bit) {
                    Self::collect_in_node(left, query, out)?;
                }

                return Self::collect_in_node(right, query, out);
            }
        }
    }

    /// True iff every stored fingerprint is a superset of `query`.
    pub fn check_all_are_superset(&self, query: &Fingerprint) -> Result<bool> {
        return Self::all_in_node(&self.root, query);
    }

    fn all_in_node(node: &Node, query: &Fingerprint) -> Result<bool> {
        match node {
            Node::Leaf { storage, .. } => {
                let vectors = storage.load()?;

                return Ok(vectors.iter().all(|v| query.is_subset_of(v)));
            }
            Node::Internal {
                forced_one,
                left,
                right,
                ..
            } => {
                if query.is_subset_of(forced_one) {
                    return Ok(true);
                }

                if !Self::all_in_node(left, query)? {
                    return Ok(false);
                }

                return Self::all_in_node(right, query);
            }
        }
    }

    /// Lazy enumeration of the stored supersets of `query`. One leaf is
    /// decoded at a time; a fresh call restarts from the beginning.
    pub fn superset_iter<'a>(&'a self, query: &Fingerprint) -> SupersetIter<'a> {
        return SupersetIter {
            query: query.clone(),
            stack: vec![&self.root],
            current: Vec::new().into_iter(),
        };
    }

    pub fn count_all(&self) -> Result<usize> {
        return Self::count_in_node(&self.root);
    }

    fn count_in_node(node: &Node) -> Result<usize> {
        match node {
            Node::Leaf { storage, .. } => storage.len(),
            Node::Internal { left, right, .. } => {
                Ok(Self::count_in_node(left)? + Self::count_in_node(right)?)
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn depth_of(node: &Node) -> usize {
            match node {
                Node::Leaf { .. } => 0,
                Node::Internal { left, right, .. } => 1 + depth_of(left).max(depth_of(right)),
            }
        }

        return depth_of(&self.root);
    }

    pub fn num_leaves(&self) -> usize {
        fn leaves_of(node: &Node) -> usize {
            match node {
                Node::Leaf { .. } => 1,
                Node::Internal { left, right, .. } => leaves_of(left) + leaves_of(right),
            }
        }

        return leaves_of(&self.root);
    }

    /// Depth-first token stream with every leaf's payload inline. The result
    /// reconstructs an equivalent resident tree via [`SubsetTree::deserialize`].
    pub fn serialize(&self) -> Result<String> {
        let mut tokens: Vec<String> = Vec::new();
        Self::emit_node(&self.root, true, &mut tokens)?;

        return Ok(tokens.join(encoding::NODE_DELIMITER));
    }

    fn emit_node(node: &Node, inline: bool, tokens: &mut Vec<String>) -> Result<()> {
        match node {
            Node::Leaf {
                forced_zero,
                forced_one,
                storage,
            } => {
                let mut token = format!(
                    "{}{}{}{}{}",
                    encoding::LEAF_MARKER,
                    encoding::FIELD_DELIMITER,
                    encoding::vector_token(forced_zero),
                    encoding::FIELD_DELIMITER,
                    encoding::vector_token(forced_one),
                );

                if inline {
                    let vectors = storage.load()?;
                    token.push_str(encoding::FIELD_DELIMITER);
                    token.push_str(&encoding::vector_list(&vectors));
                }

                tokens.push(token);

                return Ok(());
            }
            Node::Internal {
                split_bit,
                forced_zero,
                forced_one,
                left,
                right,
            } => {
                tokens.push(format!(
                    "{}{}{}{}{}",
                    split_bit,
                    encoding::FIELD_DELIMITER,
                    encoding::vector_token(forced_zero),
                    encoding::FIELD_DELIMITER,
                    encoding::vector_token(forced_one),
                ));

                Self::emit_node(left, inline, tokens)?;

                return Self::emit_node(right, inline, tokens);
            }
        }
    }

    /// Parse a serialized tree. Malformed tokens, duplicate or unmatched
    /// mask pairs and leftover nodes are all fatal parse errors; no partial
    /// tree is ever returned.
    pub fn deserialize(s: &str) -> Result<SubsetTree> {
        let (root, num_bits) = parse_node_stream(s, None)?;

        let mut config = TreeConfig::default();
        config.num_bits = num_bits;
        config.storage_mode = LeafStorageMode::InMemory;

        return Ok(SubsetTree { root, config });
    }

    /// Persist the node structure next to the leaf payloads. Disk-backed
    /// leaves are written as bare leaf tokens; their payload location is
    /// recovered from the tree path on reload.
    fn write_structure(&self) -> Result<()> {
        let mut tokens: Vec<String> = Vec::new();
        let inline = self.config.storage_mode == LeafStorageMode::InMemory;
        Self::emit_node(&self.root, inline, &mut tokens)?;

        std::fs::write(
            self.config.tree_file_path()?,
            tokens.join(encoding::NODE_DELIMITER),
        )?;

        return Ok(());
    }

    /// Reload a tree previously written by a disk-backed build.
    pub fn read_from_directory(directory: &Path) -> Result<SubsetTree> {
        let mut config = TreeConfig::from_file(&directory.join("config.yaml"))?;
        config.directory = Some(directory.to_string_lossy().to_string());

        let archive = match config.storage_mode {
            LeafStorageMode::Archive => {
                Some(Arc::new(SharedArchive::new(config.archive_file_path()?)))
            }
            _ => None,
        };

        let s = std::fs::read_to_string(config.tree_file_path()?)?;

        let (root, num_bits) = parse_node_stream(&s, Some((&config, archive.as_ref())))?;

        if num_bits != config.num_bits {
            return Err(Error::Parse(format!(
                "tree masks carry {} bits but the configuration says {}",
                num_bits, config.num_bits
            )));
        }

        return Ok(SubsetTree { root, config });
    }
}

pub struct SupersetIter<'a> {
    query: Fingerprint,
    stack: Vec<&'a Node>,
    current: std::vec::IntoIter<Fingerprint>,
}

impl<'a> Iterator for SupersetIter<'a> {
    type Item = Result<Fingerprint>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(fp) = self.current.next() {
                return Some(Ok(fp));
            }

            let node = self.stack.pop()?;

            match node {
                Node::Internal {
                    split_bit,
                    left,
                    right,
                    ..
                } => {
                    self.stack.push(right);

                    if !self.query.get_bit(*split_bit) {
                        self.stack.push(left);
                    }
                }
                Node::Leaf { storage, .. } => match storage.load() {
                    Ok(vectors) => {
                        let query = self.query.clone();
                        let matching: Vec<Fingerprint> = vectors
                            .into_iter()
                            .filter(|v| query.is_subset_of(v))
                            .collect();

                        self.current = matching.into_iter();
                    }
                    Err(e) => return Some(Err(e)),
                },
            }
        }
    }
}

struct ParsedNode {
    split_bit: i64,
    forced_zero: Fingerprint,
    forced_one: Fingerprint,
    leaf_vectors: Option<Vec<Fingerprint>>,
}

type StorageContext<'a> = (&'a TreeConfig, Option<&'a Arc<SharedArchive>>);

/// Parse every node token, index the nodes by their mask pair, find the
/// unique empty-mask root and re-link children by mask containment.
fn parse_node_stream(s: &str, context: Option<StorageContext>) -> Result<(Node, usize)> {
    let mut nodes: Vec<Option<ParsedNode>> = Vec::new();

    for token in s.split(encoding::NODE_DELIMITER) {
        nodes.push(Some(parse_node_token(token, context.is_some())?));
    }

    let num_bits = match nodes.first().and_then(|n| n.as_ref()) {
        Some(node) => node.forced_zero.num_bits(),
        None => return Err(Error::Parse("serialized tree holds no nodes".to_string())),
    };

    let mut by_masks: HashMap<(Fingerprint, Fingerprint), usize> = HashMap::new();

    for (i, node) in nodes.iter().enumerate() {
        let node = match node {
            Some(n) => n,
            None => continue,
        };

        if node.forced_zero.num_bits() != num_bits || node.forced_one.num_bits() != num_bits {
            return Err(Error::Parse(
                "node masks disagree on the fingerprint length".to_string(),
            ));
        }

        if node.forced_zero.intersection_count(&node.forced_one) != 0 {
            return Err(Error::Parse(
                "a node forces the same bit to zero and one".to_string(),
            ));
        }

        let key = (node.forced_zero.clone(), node.forced_one.clone());

        if by_masks.insert(key, i).is_some() {
            return Err(Error::Parse(
                "two nodes share the same forced-zero/forced-one masks".to_string(),
            ));
        }
    }

    let root_key = (Fingerprint::new(num_bits), Fingerprint::new(num_bits));

    let root_index = match by_masks.get(&root_key) {
        Some(i) => *i,
        None => {
            return Err(Error::Parse(
                "no root node with empty masks was found".to_string(),
            ))
        }
    };

    let root = link_node(root_index, "r".to_string(), &mut nodes, &by_masks, &context)?;

    if nodes.iter().any(|n| n.is_some()) {
        return Err(Error::Parse(
            "serialized tree holds nodes unreachable from the root".to_string(),
        ));
    }

    return Ok((root, num_bits));
}

fn parse_node_token(token: &str, allow_external_leaves: bool) -> Result<ParsedNode> {
    let fields: Vec<&str> = token.split(encoding::FIELD_DELIMITER).collect();

    if fields.len() != 3 && fields.len() != 4 {
        return Err(Error::Parse(format!(
            "node token has {} fields: {:?}",
            fields.len(),
            token
        )));
    }

    let split_bit: i64 = fields[0]
        .parse()
        .map_err(|_| Error::Parse(format!("bad split bit field: {:?}", fields[0])))?;

    let forced_zero = encoding::parse_vector_token(fields[1])?;
    let forced_one = encoding::parse_vector_token(fields[2])?;

    if split_bit >= 0 {
        if fields.len() == 4 {
            return Err(Error::Parse(
                "internal node token carries a leaf vector list".to_string(),
            ));
        }

        if split_bit as usize >= forced_zero.num_bits() {
            return Err(Error::Parse(format!(
                "split bit {} is out of range for {} bits",
                split_bit,
                forced_zero.num_bits()
            )));
        }

        return Ok(ParsedNode {
            split_bit,
            forced_zero,
            forced_one,
            leaf_vectors: None,
        });
    }

    if split_bit != encoding::LEAF_MARKER {
        return Err(Error::Parse(format!("bad split bit value: {}", split_bit)));
    }

    let leaf_vectors = match fields.len() {
        4 => Some(encoding::parse_vector_list(fields[3])?),
        _ => {
            if !allow_external_leaves {
                return Err(Error::Parse(
                    "leaf token carries no vector list".to_string(),
                ));
            }

            None
        }
    };

    return Ok(ParsedNode {
        split_bit,
        forced_zero,
        forced_one,
        leaf_vectors,
    });
}

fn link_node(
    index: usize,
    label: String,
    nodes: &mut Vec<Option<ParsedNode>>,
    by_masks: &HashMap<(Fingerprint, Fingerprint), usize>,
    context: &Option<StorageContext>,
) -> Result<Node> {
    let parsed = match nodes[index].take() {
        Some(p) => p,
        None => return Err(Error::Parse("a node was claimed by two parents".to_string())),
    };

    if parsed.split_bit == encoding::LEAF_MARKER {
        let storage = match parsed.leaf_vectors {
            Some(vectors) => LeafStorage::InMemory(vectors),
            None => external_leaf_storage(&label, context)?,
        };

        return Ok(Node::Leaf {
            forced_zero: parsed.forced_zero,
            forced_one: parsed.forced_one,
            storage,
        });
    }

    let split_bit = parsed.split_bit as usize;

    if parsed.forced_zero.get_bit(split_bit) || parsed.forced_one.get_bit(split_bit) {
        return Err(Error::Parse(format!(
            "split bit {} is already forced by the node's masks",
            split_bit
        )));
    }

    let left_key = (
        parsed.forced_zero.with_bit(split_bit),
        parsed.forced_one.clone(),
    );
    let right_key = (
        parsed.forced_zero.clone(),
        parsed.forced_one.with_bit(split_bit),
    );

    let left_index = match by_masks.get(&left_key) {
        Some(i) => *i,
        None => {
            return Err(Error::Parse(format!(
                "no node matches the left child masks under split bit {}",
                split_bit
            )))
        }
    };

    let right_index = match by_masks.get(&right_key) {
        Some(i) => *i,
        None => {
            return Err(Error::Parse(format!(
                "no node matches the right child masks under split bit {}",
                split_bit
            )))
        }
    };

    let left = link_node(
        left_index,
        encoding::child_label(&label, false),
        nodes,
        by_masks,
        context,
    )?;

    let right = link_node(
        right_index,
        encoding::child_label(&label, true),
        nodes,
        by_masks,
        context,
    )?;

    return Ok(Node::Internal {
        split_bit,
        forced_zero: parsed.forced_zero,
        forced_one: parsed.forced_one,
        left: Box::new(left),
        right: Box::new(right),
    });
}

fn external_leaf_storage(label: &str, context: &Option<StorageContext>) -> Result<LeafStorage> {
    let (config, archive) = match context {
        Some(c) => *c,
        None => {
            return Err(Error::Parse(
                "external leaf token outside a storage context".to_string(),
            ))
        }
    };

    match config.storage_mode {
        LeafStorageMode::PerLeafFiles => {
            let directory = config.directory_path()?;

            return Ok(LeafStorage::File(encoding::leaf_file_path(
                &directory, label,
            )));
        }
        LeafStorageMode::Archive => {
            let archive = match archive {
                Some(a) => Arc::clone(a),
                None => {
                    return Err(Error::Parse(
                        "archive-backed tree reloaded without an archive handle".to_string(),
                    ))
                }
            };

            return Ok(LeafStorage::ArchiveEntry {
                archive,
                entry: encoding::leaf_entry_name(label),
            });
        }
        LeafStorageMode::InMemory => {
            return Err(Error::Parse(
                "resident storage mode cannot hold external leaves".to_string(),
            ));
        }
    }
}
