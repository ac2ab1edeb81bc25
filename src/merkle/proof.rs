//! Inclusion and consistency proofs, built on demand from leaf hashes.
//!
//! Proofs are not pre-stored; callers fetch the relevant Merkle leaf hashes
//! from the sequenced-leaf store and derive the audit path here. Verifiers
//! reconstruct roots bottom-up and compare against the signed tree head.

use crate::crypto::LogHasher;
use crate::domain::Hash;

/// Root of `leaves` per RFC 6962 §2.1.
pub fn root_hash<H: LogHasher>(hasher: &H, leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => hasher.empty_root(),
        1 => leaves[0],
        n => {
            let split = largest_power_of_two_below(n as u64) as usize;
            let left = root_hash(hasher, &leaves[..split]);
            let right = root_hash(hasher, &leaves[split..]);
            hasher.hash_children(&left, &right)
        }
    }
}

/// Audit path for the leaf at `index` within `leaves` (RFC 6962 §2.1.1).
///
/// Returns `None` when `index` is out of range.
pub fn inclusion_proof<H: LogHasher>(
    hasher: &H,
    leaves: &[Hash],
    index: u64,
) -> Option<Vec<Hash>> {
    if index >= leaves.len() as u64 {
        return None;
    }
    let mut path = Vec::new();
    build_inclusion(hasher, leaves, index, &mut path);
    Some(path)
}

fn build_inclusion<H: LogHasher>(hasher: &H, leaves: &[Hash], index: u64, path: &mut Vec<Hash>) {
    let n = leaves.len() as u64;
    if n <= 1 {
        return;
    }
    let split = largest_power_of_two_below(n);
    if index < split {
        build_inclusion(hasher, &leaves[..split as usize], index, path);
        path.push(root_hash(hasher, &leaves[split as usize..]));
    } else {
        build_inclusion(hasher, &leaves[split as usize..], index - split, path);
        path.push(root_hash(hasher, &leaves[..split as usize]));
    }
}

/// Consistency proof between the first `size1` leaves and all of `leaves`
/// (RFC 6962 §2.1.2). Returns `None` when `size1` exceeds the leaf count.
pub fn consistency_proof<H: LogHasher>(
    hasher: &H,
    leaves: &[Hash],
    size1: u64,
) -> Option<Vec<Hash>> {
    let size2 = leaves.len() as u64;
    if size1 > size2 {
        return None;
    }
    if size1 == 0 || size1 == size2 {
        return Some(Vec::new());
    }
    let mut path = Vec::new();
    build_consistency(hasher, leaves, size1, true, &mut path);
    Some(path)
}

fn build_consistency<H: LogHasher>(
    hasher: &H,
    leaves: &[Hash],
    m: u64,
    complete: bool,
    path: &mut Vec<Hash>,
) {
    let n = leaves.len() as u64;
    if m == n {
        if !complete {
            path.push(root_hash(hasher, leaves));
        }
        return;
    }
    let k = largest_power_of_two_below(n);
    if m <= k {
        build_consistency(hasher, &leaves[..k as usize], m, complete, path);
        path.push(root_hash(hasher, &leaves[k as usize..]));
    } else {
        build_consistency(hasher, &leaves[k as usize..], m - k, false, path);
        path.push(root_hash(hasher, &leaves[..k as usize]));
    }
}

/// Recompute the root committed to by an inclusion proof.
///
/// Returns `None` when the proof does not fit a tree of `tree_size` leaves.
pub fn root_from_inclusion_proof<H: LogHasher>(
    hasher: &H,
    leaf_hash: &Hash,
    index: u64,
    tree_size: u64,
    proof: &[Hash],
) -> Option<Hash> {
    if index >= tree_size {
        return None;
    }
    let mut fnode = index;
    let mut snode = tree_size - 1;
    let mut hash = *leaf_hash;
    for p in proof {
        if snode == 0 {
            return None;
        }
        if fnode & 1 == 1 || fnode == snode {
            hash = hasher.hash_children(p, &hash);
            // Skip the levels where this node is the entire right edge.
            while fnode & 1 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            hash = hasher.hash_children(&hash, p);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    if snode == 0 {
        Some(hash)
    } else {
        None
    }
}

/// Verify an inclusion proof against a known root.
pub fn verify_inclusion<H: LogHasher>(
    hasher: &H,
    leaf_hash: &Hash,
    index: u64,
    tree_size: u64,
    proof: &[Hash],
    root: &Hash,
) -> bool {
    root_from_inclusion_proof(hasher, leaf_hash, index, tree_size, proof)
        .map(|computed| computed == *root)
        .unwrap_or(false)
}

/// Verify that the tree of `size2` leaves with root `root2` is an
/// append-only extension of the tree of `size1` leaves with root `root1`.
pub fn verify_consistency<H: LogHasher>(
    hasher: &H,
    size1: u64,
    size2: u64,
    root1: &Hash,
    root2: &Hash,
    proof: &[Hash],
) -> bool {
    if size1 > size2 {
        return false;
    }
    if size1 == size2 {
        return proof.is_empty() && root1 == root2;
    }
    if size1 == 0 {
        // Any tree is consistent with the empty tree.
        return proof.is_empty();
    }

    let mut node = size1 - 1;
    let mut last_node = size2 - 1;
    while node & 1 == 1 {
        node >>= 1;
        last_node >>= 1;
    }

    let mut idx = 0;
    let (mut old_hash, mut new_hash) = if node != 0 {
        let Some(seed) = proof.get(idx) else {
            return false;
        };
        idx += 1;
        (*seed, *seed)
    } else {
        (*root1, *root1)
    };

    while node != 0 {
        if node & 1 == 1 {
            let Some(p) = proof.get(idx) else {
                return false;
            };
            idx += 1;
            old_hash = hasher.hash_children(p, &old_hash);
            new_hash = hasher.hash_children(p, &new_hash);
        } else if node < last_node {
            let Some(p) = proof.get(idx) else {
                return false;
            };
            idx += 1;
            new_hash = hasher.hash_children(&new_hash, p);
        }
        node >>= 1;
        last_node >>= 1;
    }

    while last_node != 0 {
        let Some(p) = proof.get(idx) else {
            return false;
        };
        idx += 1;
        new_hash = hasher.hash_children(&new_hash, p);
        last_node >>= 1;
    }

    old_hash == *root1 && new_hash == *root2 && idx == proof.len()
}

fn largest_power_of_two_below(n: u64) -> u64 {
    debug_assert!(n > 1);
    let k = n.next_power_of_two();
    if k == n {
        n / 2
    } else {
        k / 2
    }
}
