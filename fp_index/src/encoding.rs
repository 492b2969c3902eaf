//! Text formats shared by serialization, leaf files, bucket files and the
//! archive entry namespace.
//!
//! Every format is built from space-delimited tokens. The delimiters are
//! length-tiered so a split on the longest one can never land inside a
//! shorter one: nodes are joined by seven spaces, node fields by three,
//! vector-list items by two, and the bit length is separated from its base64
//! payload by one.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::data::Fingerprint;
use crate::error::{Error, Result};

/// Joins node tokens in a serialized tree.
pub const NODE_DELIMITER: &str = "       ";

/// Joins the fields of one node token.
pub const FIELD_DELIMITER: &str = "   ";

/// Joins the vector tokens of a leaf vector list.
pub const LIST_DELIMITER: &str = "  ";

/// Stands in for a leaf vector list with no vectors.
pub const EMPTY_LIST_SENTINEL: &str = "_<<EMPTY>>_<<EMPTY>>_";

/// Split-bit field value marking a leaf node token.
pub const LEAF_MARKER: i64 = -1;

pub const LEAF_SUFFIX: &str = ".leaf";
pub const BUCKET_SUFFIX: &str = ".hsb";

/// `"<length> <base64>"`. The bit length is explicit because trailing zero
/// bits are invisible in the byte payload.
pub fn vector_token(fp: &Fingerprint) -> String {
    return format!("{} {}", fp.num_bits(), STANDARD.encode(fp.to_bytes()));
}

pub fn parse_vector_token(token: &str) -> Result<Fingerprint> {
    let mut parts = token.splitn(2, ' ');

    let length_part = parts
        .next()
        .ok_or_else(|| Error::Parse(format!("empty vector token: {:?}", token)))?;

    let payload_part = parts
        .next()
        .ok_or_else(|| Error::Parse(format!("vector token has no payload: {:?}", token)))?;

    let num_bits: usize = length_part
        .parse()
        .map_err(|_| Error::Parse(format!("bad vector length: {:?}", length_part)))?;

    let bytes = STANDARD
        .decode(payload_part)
        .map_err(|e| Error::Parse(format!("bad base64 payload: {}", e)))?;

    return Fingerprint::from_bytes(&bytes, num_bits);
}

pub fn vector_list(fps: &[Fingerprint]) -> String {
    if fps.is_empty() {
        return EMPTY_LIST_SENTINEL.to_string();
    }

    let tokens: Vec<String> = fps.iter().map(vector_token).collect();

    return tokens.join(LIST_DELIMITER);
}

pub fn parse_vector_list(s: &str) -> Result<Vec<Fingerprint>> {
    if s == EMPTY_LIST_SENTINEL {
        return Ok(Vec::new());
    }

    let mut fps: Vec<Fingerprint> = Vec::new();

    for token in s.split(LIST_DELIMITER) {
        fps.push(parse_vector_token(token)?);
    }

    return Ok(fps);
}

/// One fingerprint as one line of an input, leaf-partition or bucket file:
/// the bare base64 of the raw bytes. The bit length comes from context.
pub fn encode_line(fp: &Fingerprint) -> String {
    return STANDARD.encode(fp.to_bytes());
}

pub fn parse_line(line: &str, num_bits: usize) -> Result<Fingerprint> {
    let bytes = STANDARD
        .decode(line.trim_end())
        .map_err(|e| Error::Parse(format!("bad base64 line: {}", e)))?;

    return Fingerprint::from_bytes(&bytes, num_bits);
}

/// Tree-path labels name subtrees: `r` for the root, then `_0` per
/// forced-zero descent and `_1` per forced-one descent.
pub fn child_label(label: &str, forced_one: bool) -> String {
    match forced_one {
        true => format!("{}_1", label),
        false => format!("{}_0", label),
    }
}

pub fn leaf_file_path(directory: &Path, label: &str) -> PathBuf {
    return directory.join(format!("{}{}", label, LEAF_SUFFIX));
}

/// Archive entry name for a tree leaf.
pub fn leaf_entry_name(label: &str) -> String {
    return format!("data/{}{}", label, LEAF_SUFFIX);
}

/// Directory name for one hash function's bucket files.
pub fn bucket_dir_name(function_index: usize) -> String {
    return format!("hf_{:07}", function_index);
}

/// Archive entry name for an LSH bucket.
pub fn bucket_entry_name(function_index: usize, bucket: u64) -> String {
    return format!(
        "/data/{}/{}{}",
        bucket_dir_name(function_index),
        bucket,
        BUCKET_SUFFIX
    );
}

/// Recover `(function_index, bucket)` from a bucket archive entry name.
pub fn parse_bucket_entry_name(name: &str) -> Result<(usize, u64)> {
    let bad = || Error::Parse(format!("bad bucket entry name: {:?}", name));

    let rest = name.strip_prefix("/data/hf_").ok_or_else(bad)?;

    let (function_part, bucket_part) = rest.split_once('/').ok_or_else(bad)?;

    let function_index: usize = function_part.parse().map_err(|_| bad())?;

    let bucket: u64 = bucket_part
        .strip_suffix(BUCKET_SUFFIX)
        .ok_or_else(bad)?
        .parse()
        .map_err(|_| bad())?;

    return Ok((function_index, bucket));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn vector_token_round_trip() {
        let mut rng = StdRng::seed_from_u64(3);

        for num_bits in [5, 64, 166, 1024] {
            let fp = Fingerprint::random(num_bits, 0.25, &mut rng);
            let token = vector_token(&fp);
            let back = parse_vector_token(&token).unwrap();

            assert_eq!(back, fp);
        }
    }

    #[test]
    fn vector_list_round_trip_and_sentinel() {
        let mut rng = StdRng::seed_from_u64(4);

        let fps: Vec<Fingerprint> = (0..7)
            .map(|_| Fingerprint::random(64, 0.3, &mut rng))
            .collect();

        let s = vector_list(&fps);
        assert_eq!(parse_vector_list(&s).unwrap(), fps);

        assert_eq!(vector_list(&[]), EMPTY_LIST_SENTINEL);
        assert!(parse_vector_list(EMPTY_LIST_SENTINEL).unwrap().is_empty());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(parse_vector_token("no-payload").is_err());
        assert!(parse_vector_token("abc AAAA").is_err());
        assert!(parse_vector_token("16 !!!notbase64!!!").is_err());
        assert!(parse_line("%%%", 16).is_err());
    }

    #[test]
    fn entry_names() {
        assert_eq!(leaf_entry_name("r_0_1"), "data/r_0_1.leaf");
        assert_eq!(bucket_dir_name(3), "hf_0000003");
        assert_eq!(bucket_entry_name(3, 42), "/data/hf_0000003/42.hsb");
        assert_eq!(child_label("r", false), "r_0");
        assert_eq!(child_label("r_0", true), "r_0_1");

        assert_eq!(
            parse_bucket_entry_name("/data/hf_0000003/42.hsb").unwrap(),
            (3, 42)
        );
        assert!(parse_bucket_entry_name("data/hf_0000003/42.hsb").is_err());
        assert!(parse_bucket_entry_name("/data/hf_0000003/42").is_err());
        assert!(parse_bucket_entry_name("/data/hf_x/42.hsb").is_err());
    }
}
