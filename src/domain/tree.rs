//! Tree metadata as supplied by the admin layer.
//!
//! The storage core treats tree metadata as immutable input; creating and
//! updating trees is the admin subsystem's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit identifier of a logical log tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeId(pub i64);

impl TreeId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of log tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeType {
    /// Leaves are queued by clients and sequenced by the log itself.
    Log,
    /// Leaf indices are assigned by the client and may arrive with gaps.
    PreorderedLog,
}

impl TreeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeType::Log => "LOG",
            TreeType::PreorderedLog => "PREORDERED_LOG",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "LOG" => Some(TreeType::Log),
            "PREORDERED_LOG" => Some(TreeType::PreorderedLog),
            _ => None,
        }
    }
}

/// Lifecycle state of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeState {
    /// Accepting new leaves and integrating them.
    Active,
    /// No new leaves accepted; the queue drains until empty.
    Draining,
    /// Read-only.
    Frozen,
    /// Hidden pending permanent deletion.
    SoftDeleted,
}

impl TreeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeState::Active => "ACTIVE",
            TreeState::Draining => "DRAINING",
            TreeState::Frozen => "FROZEN",
            TreeState::SoftDeleted => "SOFT_DELETED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(TreeState::Active),
            "DRAINING" => Some(TreeState::Draining),
            "FROZEN" => Some(TreeState::Frozen),
            "SOFT_DELETED" => Some(TreeState::SoftDeleted),
            _ => None,
        }
    }
}

/// Hash strategy identifier carried in tree metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashStrategy {
    /// RFC 6962 leaf/node domain separation over SHA-256.
    Rfc6962Sha256,
}

impl HashStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashStrategy::Rfc6962Sha256 => "RFC6962_SHA256",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "RFC6962_SHA256" => Some(HashStrategy::Rfc6962Sha256),
            _ => None,
        }
    }

    /// Digest size in bytes.
    pub fn hash_size(&self) -> usize {
        match self {
            HashStrategy::Rfc6962Sha256 => 32,
        }
    }
}

/// Immutable tree metadata consumed from the admin subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeMeta {
    pub id: TreeId,
    pub tree_type: TreeType,
    pub state: TreeState,
    pub hash_strategy: HashStrategy,
    pub deleted: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl TreeMeta {
    /// A new active tree with the default hash strategy.
    pub fn new(id: TreeId, tree_type: TreeType) -> Self {
        let now = Utc::now();
        Self {
            id,
            tree_type,
            state: TreeState::Active,
            hash_strategy: HashStrategy::Rfc6962Sha256,
            deleted: false,
            create_time: now,
            update_time: now,
        }
    }

    /// Digest size for this tree's hash strategy.
    pub fn hash_size(&self) -> usize {
        self.hash_strategy.hash_size()
    }

    /// Whether the tree is in a state that requires sequencing.
    pub fn needs_sequencing(&self) -> bool {
        !self.deleted && matches!(self.state, TreeState::Active | TreeState::Draining)
    }
}
