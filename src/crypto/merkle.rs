//! Merkle root over the transactions a block commits

use super::{hash_pair, Hash};

/// Compute the Merkle root of a list of leaf hashes.
///
/// An empty list yields the zero hash; an odd level pairs its last node
/// with itself.
pub fn compute_merkle_root(leaves: &[Hash]) -> Hash {
    let mut level: Vec<Hash> = leaves.to_vec();
    if level.is_empty() {
        return Hash::zero();
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => hash_pair(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }

    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    #[test]
    fn test_empty_and_single() {
        assert_eq!(compute_merkle_root(&[]), Hash::zero());
        let leaf = hash_bytes(b"only");
        assert_eq!(compute_merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let a = hash_bytes(b"a");
        let b = hash_bytes(b"b");
        let c = hash_bytes(b"c");
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(compute_merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_order_sensitive() {
        let a = hash_bytes(b"a");
        let b = hash_bytes(b"b");
        assert_ne!(compute_merkle_root(&[a, b]), compute_merkle_root(&[b, a]));
    }
}
