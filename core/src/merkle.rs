//! Merkle commitment over transaction byte blobs
//!
//! Leaves are SHA-256 of each blob; a level of odd length duplicates its
//! last node; parents hash the concatenation of their children. The single
//! remaining node is the 32-byte root carried in the block header.

use sha2::{Digest, Sha256};

/// Compute the Merkle root of an ordered list of byte blobs.
///
/// Every block carries at least a coinbase transaction, so an empty input
/// is a programming error.
pub fn merkle_root(items: &[Vec<u8>]) -> Vec<u8> {
    assert!(!items.is_empty(), "merkle tree over empty transaction set");

    let mut level: Vec<Vec<u8>> = items
        .iter()
        .map(|item| Sha256::digest(item).to_vec())
        .collect();

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            let last = level.last().expect("level is non-empty").clone();
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(&pair[0]);
                hasher.update(&pair[1]);
                hasher.finalize().to_vec()
            })
            .collect();
    }

    level.pop().expect("root remains")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("tx-{i}").into_bytes()).collect()
    }

    #[test]
    fn single_leaf_root_is_its_hash() {
        let items = blobs(1);
        assert_eq!(
            merkle_root(&items),
            Sha256::digest(&items[0]).to_vec()
        );
    }

    #[test]
    fn root_is_32_bytes_for_any_arity() {
        for n in 1..=9 {
            assert_eq!(merkle_root(&blobs(n)).len(), 32);
        }
    }

    #[test]
    fn swapping_two_items_changes_the_root() {
        let items = blobs(4);
        let mut swapped = items.clone();
        swapped.swap(1, 2);
        assert_ne!(merkle_root(&items), merkle_root(&swapped));
    }

    #[test]
    fn mutating_one_byte_changes_the_root() {
        let items = blobs(5);
        let root = merkle_root(&items);
        for i in 0..items.len() {
            let mut mutated = items.clone();
            mutated[i][0] ^= 0x01;
            assert_ne!(root, merkle_root(&mutated), "blob {i}");
        }
    }

    #[test]
    fn odd_level_duplicates_last_node() {
        // With three leaves the last is paired with itself, which is the
        // same tree as four leaves where items 2 and 3 are identical.
        let three = blobs(3);
        let mut four = three.clone();
        four.push(three[2].clone());
        assert_eq!(merkle_root(&three), merkle_root(&four));
    }

    #[test]
    #[should_panic(expected = "empty transaction set")]
    fn empty_input_panics() {
        merkle_root(&[]);
    }
}
