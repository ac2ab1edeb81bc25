//! Log leaves and queue entries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::LogHasher;

use super::{hash_hex, Hash};

/// Sentinel index for a leaf that has not been sequenced yet.
pub const UNSEQUENCED: i64 = -1;

/// A client-submitted data item plus its identity and Merkle leaf hashes.
///
/// `leaf_identity_hash` is the client-chosen dedup key: two leaves with the
/// same identity hash are the same submission. `merkle_leaf_hash` is the
/// domain-separated hash of `leaf_value` and is what the tree commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLeaf {
    /// Position in the log; [`UNSEQUENCED`] until the sequencer assigns one.
    pub leaf_index: i64,

    /// Client-supplied logical identity, used for deduplication.
    #[serde(with = "hash_hex")]
    pub leaf_identity_hash: Hash,

    /// Domain-separated hash of `leaf_value`.
    #[serde(with = "hash_hex")]
    pub merkle_leaf_hash: Hash,

    /// Raw submitted data.
    pub leaf_value: Vec<u8>,

    /// Opaque side data stored with the leaf but not hashed into the tree.
    pub extra_data: Vec<u8>,

    /// Nanoseconds since epoch at which the leaf entered the queue.
    pub queue_timestamp_nanos: i64,

    /// Nanoseconds since epoch at which the leaf was sequenced; 0 until then.
    pub integrate_timestamp_nanos: i64,
}

impl LogLeaf {
    /// Build a leaf from raw data, deriving the Merkle leaf hash with the
    /// given hasher and the identity hash as a plain SHA-256 of the value.
    pub fn new<H: LogHasher>(hasher: &H, leaf_value: Vec<u8>, extra_data: Vec<u8>) -> Self {
        let merkle_leaf_hash = hasher.hash_leaf(&leaf_value);
        let leaf_identity_hash = Sha256::digest(&leaf_value).into();
        Self {
            leaf_index: UNSEQUENCED,
            leaf_identity_hash,
            merkle_leaf_hash,
            leaf_value,
            extra_data,
            queue_timestamp_nanos: 0,
            integrate_timestamp_nanos: 0,
        }
    }

    /// Override the identity hash (clients may dedup on something other than
    /// the raw value).
    pub fn with_identity_hash(mut self, identity_hash: Hash) -> Self {
        self.leaf_identity_hash = identity_hash;
        self
    }

    /// Assign a client-chosen index (preordered logs only).
    pub fn with_index(mut self, index: i64) -> Self {
        self.leaf_index = index;
        self
    }

    pub fn is_sequenced(&self) -> bool {
        self.leaf_index >= 0
    }
}

/// Outcome of queueing a single leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// The leaf was accepted into the queue (or sequenced store).
    Ok,
    /// A leaf with the same identity hash already exists; the carried leaf
    /// is the existing one.
    AlreadyExists,
}

/// Per-leaf result of [`queue_leaves`](crate::infra::LogStorage::queue_leaves)
/// and `add_sequenced_leaves`.
#[derive(Debug, Clone)]
pub struct QueuedLeaf {
    pub leaf: LogLeaf,
    pub status: QueueStatus,
}

impl QueuedLeaf {
    pub fn ok(leaf: LogLeaf) -> Self {
        Self {
            leaf,
            status: QueueStatus::Ok,
        }
    }

    pub fn already_exists(existing: LogLeaf) -> Self {
        Self {
            leaf: existing,
            status: QueueStatus::AlreadyExists,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.status == QueueStatus::AlreadyExists
    }
}
