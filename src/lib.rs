//! Storage core for a verifiable append-only Merkle log.
//!
//! A log tree ingests leaves from clients, assigns them contiguous sequence
//! numbers, incorporates them into an RFC-6962-style Merkle tree and serves
//! signed tree heads. This crate is the storage subsystem behind that
//! service: the transactional model spanning the unsequenced leaf queue, the
//! write-once sequenced-leaf store, the revisioned subtree cache over
//! internal Merkle nodes, and the signed-root lineage.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (leaves, trees, roots, node addressing)
//! - [`crypto`] - RFC-6962 domain-separated hashing
//! - [`merkle`] - Compact ranges and inclusion/consistency proofs
//! - [`infra`] - Storage backends (in-memory, PostgreSQL) and transaction traits
//! - [`sequencer`] - Batch integration workflow
//! - [`metrics`] - Counters incremented at transaction commit
//!
//! The RPC surface, master election, and tree administration live in other
//! crates; this one only consumes their narrow interfaces
//! ([`infra::AdminReader`], [`infra::MasterSignal`]).

pub mod config;
pub mod crypto;
pub mod domain;
pub mod infra;
pub mod merkle;
pub mod metrics;
pub mod migrations;
pub mod sequencer;

// Re-export commonly used types
pub use domain::{
    Hash, LogLeaf, LogRoot, NodeId, QueueStatus, QueuedLeaf, SignedLogRoot, TreeId, TreeMeta,
    TreeState, TreeType,
};

pub use infra::{
    read_write_transaction, AdminReader, LogStorage, LogTx, ReadOnlyLogTx, Result, StorageError,
    StorageProvider,
};
