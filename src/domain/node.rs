//! Merkle node addressing.
//!
//! Nodes are addressed by `(level, index)`: level 0 is the leaves, and at
//! each level nodes are numbered left to right from 0. Parent/child ids are
//! derived arithmetically; nothing stores pointers.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::Hash;

/// Depth of one cached subtree band. A subtree at stride 8 spans 8 levels
/// and covers up to 256 leaf-level positions of its band.
pub const SUBTREE_STRIDE: u8 = 8;

/// Address of a node in the Merkle tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Height above the leaves; leaves are level 0.
    pub level: u8,
    /// Zero-based position within the level.
    pub index: u64,
}

impl NodeId {
    pub fn new(level: u8, index: u64) -> Self {
        Self { level, index }
    }

    /// The parent one level up.
    pub fn parent(&self) -> NodeId {
        NodeId::new(self.level + 1, self.index >> 1)
    }

    /// The other child of this node's parent.
    pub fn sibling(&self) -> NodeId {
        NodeId::new(self.level, self.index ^ 1)
    }

    /// The subtree containing this node, and the node's slot inside it.
    ///
    /// Band `b` spans levels `[b*D, (b+1)*D)`. The subtree is identified by
    /// the index its root would have at level `(b+1)*D`; slots inside are
    /// relative to the band.
    pub fn subtree_coords(&self, stride: u8) -> (SubtreeCoord, NodeSlot) {
        let band = self.level / stride;
        let slot_level = self.level - band * stride;
        let shift = u32::from(stride - slot_level);
        let prefix = self.index >> shift;
        let slot_index = self.index & ((1u64 << shift) - 1);
        (
            SubtreeCoord { band, prefix },
            NodeSlot {
                level: slot_level,
                index: slot_index,
            },
        )
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.level, self.index)
    }
}

/// Identity of one cached subtree: which band of levels, and which position
/// within that band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubtreeCoord {
    pub band: u8,
    pub prefix: u64,
}

impl SubtreeCoord {
    /// Stable byte encoding used as the storage key.
    pub fn to_key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.push(self.band);
        out.extend_from_slice(&self.prefix.to_be_bytes());
        out
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 9 {
            return None;
        }
        let prefix = u64::from_be_bytes(bytes[1..9].try_into().ok()?);
        Some(Self {
            band: bytes[0],
            prefix,
        })
    }
}

/// A node's position relative to its subtree band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeSlot {
    pub level: u8,
    pub index: u64,
}

/// A node id paired with its hash, as returned by `get_merkle_nodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeNode {
    pub id: NodeId,
    pub hash: Hash,
}
