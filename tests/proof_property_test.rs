//! Property-based tests using proptest.
//!
//! These verify the Merkle invariants that must hold for any leaf set:
//! compact-range roots match the recursive definition, and proofs verify
//! exactly when they should.

use proptest::prelude::*;

use merklelog::crypto::{LogHasher, Rfc6962Hasher};
use merklelog::domain::Hash;
use merklelog::merkle::{proof, CompactRange};

/// Generate a leaf set of 1..48 arbitrary values.
fn arb_leaves() -> impl Strategy<Value = Vec<Hash>> {
    prop::collection::vec(any::<[u8; 16]>(), 1..48)
        .prop_map(|values| values.iter().map(|v| Rfc6962Hasher.hash_leaf(v)).collect())
}

proptest! {
    #[test]
    fn compact_range_matches_recursive_root(leaves in arb_leaves()) {
        let mut range = CompactRange::new(Rfc6962Hasher);
        for leaf in &leaves {
            range.append(*leaf);
        }
        prop_assert_eq!(range.root(), proof::root_hash(&Rfc6962Hasher, &leaves));
        prop_assert_eq!(range.size(), leaves.len() as u64);
    }

    #[test]
    fn inclusion_proofs_verify_at_every_index(leaves in arb_leaves(), index in any::<prop::sample::Index>()) {
        let hasher = Rfc6962Hasher;
        let n = leaves.len() as u64;
        let i = index.index(leaves.len()) as u64;
        let root = proof::root_hash(&hasher, &leaves);

        let path = proof::inclusion_proof(&hasher, &leaves, i).unwrap();
        prop_assert!(proof::verify_inclusion(&hasher, &leaves[i as usize], i, n, &path, &root));
    }

    #[test]
    fn corrupted_inclusion_proofs_fail(leaves in arb_leaves(), index in any::<prop::sample::Index>()) {
        let hasher = Rfc6962Hasher;
        let n = leaves.len() as u64;
        let i = index.index(leaves.len()) as u64;
        let root = proof::root_hash(&hasher, &leaves);
        let path = proof::inclusion_proof(&hasher, &leaves, i).unwrap();

        // Flipping a bit anywhere in the path must break verification.
        if !path.is_empty() {
            let mut tampered = path.clone();
            tampered[0][0] ^= 0x01;
            prop_assert!(!proof::verify_inclusion(&hasher, &leaves[i as usize], i, n, &tampered, &root));
        }

        // A wrong leaf must break verification.
        let wrong = hasher.hash_leaf(b"interloper");
        if wrong != leaves[i as usize] {
            prop_assert!(!proof::verify_inclusion(&hasher, &wrong, i, n, &path, &root));
        }
    }

    #[test]
    fn consistency_proofs_verify_for_any_prefix(leaves in arb_leaves(), split in any::<prop::sample::Index>()) {
        let hasher = Rfc6962Hasher;
        let n2 = leaves.len() as u64;
        let n1 = split.index(leaves.len() + 1) as u64;

        let root1 = proof::root_hash(&hasher, &leaves[..n1 as usize]);
        let root2 = proof::root_hash(&hasher, &leaves);
        let path = proof::consistency_proof(&hasher, &leaves, n1).unwrap();

        prop_assert!(proof::verify_consistency(&hasher, n1, n2, &root1, &root2, &path));
    }

    #[test]
    fn consistency_proofs_reject_rewritten_prefixes(leaves in arb_leaves(), split in any::<prop::sample::Index>()) {
        let hasher = Rfc6962Hasher;
        let n2 = leaves.len() as u64;
        let n1 = split.index(leaves.len()) as u64;
        // Only meaningful for proper non-empty prefixes.
        prop_assume!(n1 > 0 && n1 < n2);

        let mut forked = leaves[..n1 as usize].to_vec();
        forked[0] = hasher.hash_leaf(b"rewritten history");
        prop_assume!(forked[0] != leaves[0]);

        let forked_root = proof::root_hash(&hasher, &forked);
        let root2 = proof::root_hash(&hasher, &leaves);
        let path = proof::consistency_proof(&hasher, &leaves, n1).unwrap();

        prop_assert!(!proof::verify_consistency(&hasher, n1, n2, &forked_root, &root2, &path));
    }

    #[test]
    fn merged_ranges_agree_with_sequential_appends(leaves in arb_leaves(), split in any::<prop::sample::Index>()) {
        let hasher = Rfc6962Hasher;
        let at = split.index(leaves.len() + 1);

        let mut left = CompactRange::new(hasher);
        for leaf in &leaves[..at] {
            left.append(*leaf);
        }
        let mut right = CompactRange::new(hasher);
        for leaf in &leaves[at..] {
            right.append(*leaf);
        }

        if left.merge(&right).is_ok() {
            prop_assert_eq!(left.size(), leaves.len() as u64);
            prop_assert_eq!(left.root(), proof::root_hash(&hasher, &leaves));
        }
    }
}
