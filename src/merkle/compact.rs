//! Compact representation of the right edge of a Merkle tree.

use thiserror::Error;

use crate::crypto::LogHasher;
use crate::domain::{Hash, NodeId, TreeNode};

/// Errors from reconstructing or merging compact ranges.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CompactRangeError {
    #[error("expected {want} fringe nodes for size {size}, got {got}")]
    WrongNodeCount { size: u64, want: usize, got: usize },

    #[error("fringe node {got} does not match expected id {want}")]
    WrongNodeId { want: NodeId, got: NodeId },

    #[error("cannot merge a range of size {other} onto a range of size {size}")]
    MisalignedMerge { size: u64, other: u64 },
}

/// The O(log N) right fringe of a Merkle tree of size N.
///
/// The fringe holds one hash per perfect subtree whose right edge aligns
/// with N: one entry per set bit of N, highest level first. Appending a
/// leaf carries through equal-height subtrees immediately, collapsing them
/// into parents.
#[derive(Debug, Clone)]
pub struct CompactRange<H: LogHasher> {
    hasher: H,
    size: u64,
    fringe: Vec<(u8, Hash)>,
}

impl<H: LogHasher> CompactRange<H> {
    /// An empty range.
    pub fn new(hasher: H) -> Self {
        Self {
            hasher,
            size: 0,
            fringe: Vec::new(),
        }
    }

    /// Rebuild a range for a tree of `size` leaves from its stored
    /// perfect-subtree roots, ordered highest level first.
    pub fn from_parts(hasher: H, size: u64, nodes: &[TreeNode]) -> Result<Self, CompactRangeError> {
        let want_ids = Self::node_ids_for_size(size);
        if nodes.len() != want_ids.len() {
            return Err(CompactRangeError::WrongNodeCount {
                size,
                want: want_ids.len(),
                got: nodes.len(),
            });
        }
        let mut fringe = Vec::with_capacity(nodes.len());
        for (node, want) in nodes.iter().zip(want_ids) {
            if node.id != want {
                return Err(CompactRangeError::WrongNodeId {
                    want,
                    got: node.id,
                });
            }
            fringe.push((node.id.level, node.hash));
        }
        Ok(Self {
            hasher,
            size,
            fringe,
        })
    }

    /// Ids of the fringe nodes for a tree of `size` leaves, highest level
    /// first.
    pub fn node_ids_for_size(size: u64) -> Vec<NodeId> {
        let mut ids = Vec::new();
        for level in (0..64u8).rev() {
            if (size >> level) & 1 == 1 {
                ids.push(NodeId::new(level, (size >> (level + 1)) << 1));
            }
        }
        ids
    }

    /// Number of leaves covered.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append one leaf hash.
    ///
    /// Returns every node this append creates, leaf node included, so the
    /// caller can write them into the subtree cache.
    pub fn append(&mut self, leaf_hash: Hash) -> Vec<TreeNode> {
        let mut nodes = vec![TreeNode {
            id: NodeId::new(0, self.size),
            hash: leaf_hash,
        }];

        let mut level = 0u8;
        let mut hash = leaf_hash;
        while (self.size >> level) & 1 == 1 {
            let (_, left) = self
                .fringe
                .pop()
                .expect("fringe has an entry for every set size bit");
            hash = self.hasher.hash_children(&left, &hash);
            level += 1;
            nodes.push(TreeNode {
                id: NodeId::new(level, self.size >> level),
                hash,
            });
        }
        self.fringe.push((level, hash));
        self.size += 1;
        nodes
    }

    /// Absorb a range that covers the leaves immediately to the right of
    /// this one. `other`'s left boundary must align with this range's size.
    pub fn merge(&mut self, other: &CompactRange<H>) -> Result<(), CompactRangeError> {
        for &(level, hash) in &other.fringe {
            if self.size % (1u64 << level) != 0 {
                return Err(CompactRangeError::MisalignedMerge {
                    size: self.size,
                    other: other.size,
                });
            }
            self.push_subtree(level, hash);
        }
        Ok(())
    }

    fn push_subtree(&mut self, subtree_level: u8, subtree_hash: Hash) {
        let mut level = subtree_level;
        let mut hash = subtree_hash;
        while (self.size >> level) & 1 == 1 {
            let (_, left) = self
                .fringe
                .pop()
                .expect("fringe has an entry for every set size bit");
            hash = self.hasher.hash_children(&left, &hash);
            level += 1;
        }
        self.fringe.push((level, hash));
        self.size += 1u64 << subtree_level;
    }

    /// Root hash of the covered tree; the empty root for size 0.
    pub fn root(&self) -> Hash {
        let mut iter = self.fringe.iter().rev();
        match iter.next() {
            None => self.hasher.empty_root(),
            Some((_, first)) => {
                let mut acc = *first;
                for (_, hash) in iter {
                    acc = self.hasher.hash_children(hash, &acc);
                }
                acc
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Rfc6962Hasher;

    fn leaf(i: u8) -> Hash {
        Rfc6962Hasher.hash_leaf(&[i])
    }

    /// Reference MTH from RFC 6962 §2.1 for cross-checking.
    fn mth(hasher: &Rfc6962Hasher, leaves: &[Hash]) -> Hash {
        match leaves.len() {
            0 => hasher.empty_root(),
            1 => leaves[0],
            n => {
                // Split at the largest power of two strictly less than n.
                let k = n.next_power_of_two();
                let split = if k == n { n / 2 } else { k / 2 };
                let left = mth(hasher, &leaves[..split]);
                let right = mth(hasher, &leaves[split..]);
                hasher.hash_children(&left, &right)
            }
        }
    }

    #[test]
    fn empty_range_roots_to_empty_hash() {
        let range = CompactRange::new(Rfc6962Hasher);
        assert_eq!(range.root(), Rfc6962Hasher.empty_root());
        assert_eq!(range.size(), 0);
    }

    #[test]
    fn single_leaf_root_is_the_leaf_hash() {
        let mut range = CompactRange::new(Rfc6962Hasher);
        let nodes = range.append(leaf(0));
        assert_eq!(range.root(), leaf(0));
        assert_eq!(nodes, vec![TreeNode { id: NodeId::new(0, 0), hash: leaf(0) }]);
    }

    #[test]
    fn two_leaves_collapse_into_a_parent() {
        let hasher = Rfc6962Hasher;
        let mut range = CompactRange::new(hasher);
        range.append(leaf(0));
        let nodes = range.append(leaf(1));

        let parent = hasher.hash_children(&leaf(0), &leaf(1));
        assert_eq!(range.root(), parent);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, NodeId::new(0, 1));
        assert_eq!(nodes[1], TreeNode { id: NodeId::new(1, 0), hash: parent });
    }

    #[test]
    fn roots_match_reference_mth_for_all_small_sizes() {
        let hasher = Rfc6962Hasher;
        let leaves: Vec<Hash> = (0..33).map(leaf).collect();
        let mut range = CompactRange::new(hasher);
        for (n, l) in leaves.iter().enumerate() {
            assert_eq!(range.root(), mth(&hasher, &leaves[..n]), "size {n}");
            range.append(*l);
        }
        assert_eq!(range.root(), mth(&hasher, &leaves));
    }

    #[test]
    fn node_ids_for_size_follow_set_bits() {
        assert!(CompactRange::<Rfc6962Hasher>::node_ids_for_size(0).is_empty());
        assert_eq!(
            CompactRange::<Rfc6962Hasher>::node_ids_for_size(1),
            vec![NodeId::new(0, 0)]
        );
        // 6 = 0b110: a level-2 subtree over leaves [0,4) and a level-1
        // subtree over leaves [4,6).
        assert_eq!(
            CompactRange::<Rfc6962Hasher>::node_ids_for_size(6),
            vec![NodeId::new(2, 0), NodeId::new(1, 2)]
        );
        // 7 = 0b111 adds the lone leaf at index 6.
        assert_eq!(
            CompactRange::<Rfc6962Hasher>::node_ids_for_size(7),
            vec![NodeId::new(2, 0), NodeId::new(1, 2), NodeId::new(0, 6)]
        );
    }

    #[test]
    fn from_parts_round_trips_through_appends() {
        let hasher = Rfc6962Hasher;
        for size in 1u64..20 {
            let mut range = CompactRange::new(hasher);
            let mut stored: std::collections::HashMap<NodeId, Hash> =
                std::collections::HashMap::new();
            for i in 0..size {
                for node in range.append(leaf(i as u8)) {
                    stored.insert(node.id, node.hash);
                }
            }

            let parts: Vec<TreeNode> = CompactRange::<Rfc6962Hasher>::node_ids_for_size(size)
                .into_iter()
                .map(|id| TreeNode {
                    id,
                    hash: stored[&id],
                })
                .collect();
            let rebuilt = CompactRange::from_parts(hasher, size, &parts).unwrap();
            assert_eq!(rebuilt.root(), range.root(), "size {size}");
        }
    }

    #[test]
    fn from_parts_rejects_wrong_shapes() {
        let hasher = Rfc6962Hasher;
        let err = CompactRange::from_parts(hasher, 2, &[]).unwrap_err();
        assert!(matches!(err, CompactRangeError::WrongNodeCount { .. }));

        let bad = [TreeNode {
            id: NodeId::new(0, 0),
            hash: leaf(0),
        }];
        let err = CompactRange::from_parts(hasher, 2, &bad).unwrap_err();
        assert!(matches!(err, CompactRangeError::WrongNodeId { .. }));
    }

    #[test]
    fn merge_matches_sequential_appends() {
        let hasher = Rfc6962Hasher;
        let leaves: Vec<Hash> = (0..12).map(leaf).collect();
        for split in 0..=leaves.len() {
            let mut left = CompactRange::new(hasher);
            for l in &leaves[..split] {
                left.append(*l);
            }
            let mut right = CompactRange::new(hasher);
            for l in &leaves[split..] {
                right.append(*l);
            }

            let mut sequential = CompactRange::new(hasher);
            for l in &leaves {
                sequential.append(*l);
            }

            // Merging is only defined when the right range starts on a
            // boundary the left range can absorb.
            if left.merge(&right).is_ok() {
                assert_eq!(left.size(), leaves.len() as u64);
                assert_eq!(left.root(), sequential.root(), "split {split}");
            }
        }
    }
}
