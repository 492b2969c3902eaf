//! Distance and similarity primitives for fingerprints.

use crate::data::Fingerprint;

/// Number of bit positions at which the two fingerprints differ.
pub fn hamming(a: &Fingerprint, b: &Fingerprint) -> u32 {
    return a.xor_count(b);
}

/// Tanimoto similarity: `|A and B| / |A or B|`.
///
/// Two empty fingerprints compare at 0.0 rather than 0/0, so the value is
/// always a total-orderable float.
pub fn tanimoto(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let union = a.union_count(b);

    if union == 0 {
        return 0.0;
    }

    return a.intersection_count(b) as f64 / union as f64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn hamming_identical_and_disjoint() {
        let a = Fingerprint::from_set_bits(&[1, 2, 3], 16);
        let b = Fingerprint::from_set_bits(&[4, 5, 6], 16);

        assert_eq!(hamming(&a, &a), 0);
        assert_eq!(hamming(&a, &b), 6);
    }

    #[test]
    fn tanimoto_partial_overlap() {
        let a = Fingerprint::from_set_bits(&[1, 2, 3, 4], 16);
        let b = Fingerprint::from_set_bits(&[3, 4, 5, 6], 16);

        // intersection {3,4}, union {1..6}
        assert_approx_eq!(tanimoto(&a, &b), 2.0 / 6.0);
    }

    #[test]
    fn tanimoto_subset() {
        let a = Fingerprint::from_set_bits(&[1, 2], 16);
        let b = Fingerprint::from_set_bits(&[1, 2, 3, 4], 16);

        assert_approx_eq!(tanimoto(&a, &b), 0.5);
        assert_approx_eq!(tanimoto(&a, &a), 1.0);
    }

    #[test]
    fn tanimoto_of_two_empty_fingerprints_is_zero() {
        let a = Fingerprint::new(16);
        let b = Fingerprint::new(16);

        assert_approx_eq!(tanimoto(&a, &b), 0.0);
    }
}
