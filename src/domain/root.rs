//! Signed tree heads.

use serde::{Deserialize, Serialize};

use super::{hash_hex, Hash};

/// Structured body of a signed tree head.
///
/// `revision` advances by one with every committed write transaction;
/// `tree_size` and `timestamp_nanos` are non-decreasing along the lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRoot {
    pub tree_size: u64,
    #[serde(with = "hash_hex")]
    pub root_hash: Hash,
    pub timestamp_nanos: i64,
    pub revision: i64,
}

impl LogRoot {
    /// Serialized form stored alongside the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("LogRoot serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A [`LogRoot`] plus the signature produced by the layer above storage.
///
/// The storage core stores and returns the signature as opaque bytes; it
/// never signs or verifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLogRoot {
    pub root: LogRoot,
    pub signature: Vec<u8>,
}

impl SignedLogRoot {
    pub fn new(root: LogRoot, signature: Vec<u8>) -> Self {
        Self { root, signature }
    }

    /// A head for an empty tree, carrying the given empty-root hash.
    pub fn initial(empty_root: Hash, timestamp_nanos: i64) -> Self {
        Self {
            root: LogRoot {
                tree_size: 0,
                root_hash: empty_root,
                timestamp_nanos,
                revision: 0,
            },
            signature: Vec::new(),
        }
    }

    pub fn tree_size(&self) -> u64 {
        self.root.tree_size
    }

    pub fn root_hash(&self) -> &Hash {
        &self.root.root_hash
    }
}
