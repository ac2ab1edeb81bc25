//! Error types for the log storage core.
//!
//! Every error maps onto one of the standard wire status codes so the RPC
//! layer can translate without inspecting variants. Classification also
//! drives the retry wrapper: conflict-shaped failures are retryable,
//! integrity failures never are.

use thiserror::Error;

use crate::domain::TreeId;
use crate::merkle::CompactRangeError;

/// Errors that can occur in the storage core.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database error from the backing store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The tree exists but has no signed root yet.
    #[error("tree {0} needs initialising")]
    TreeNeedsInit(TreeId),

    /// Unknown tree ID.
    #[error("tree {0} not found")]
    TreeNotFound(TreeId),

    /// A leaf with this identity hash already exists.
    #[error("leaf already exists in tree {tree_id}: {identity_hash}")]
    LeafAlreadyExists {
        tree_id: TreeId,
        identity_hash: String,
    },

    /// A signed root with this timestamp already exists.
    #[error("signed root for tree {tree_id} at timestamp {timestamp_nanos} already exists")]
    RootAlreadyExists {
        tree_id: TreeId,
        timestamp_nanos: i64,
    },

    /// Caller-supplied data failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A hash had the wrong length for the tree's strategy.
    #[error("leaf hash has incorrect size: got {got}, want {want}")]
    HashSizeMismatch { got: usize, want: usize },

    /// The operation is not supported for this tree type.
    #[error("{0} is not implemented for this tree type")]
    Unimplemented(&'static str),

    /// Lock contention or serialization failure; safe to retry.
    #[error("transaction conflict on tree {tree_id}: {message}")]
    Conflict { tree_id: TreeId, message: String },

    /// Stored state contradicts an invariant. Signals corruption; never
    /// retryable.
    #[error("integrity violation in tree {tree_id}: {message}")]
    Integrity { tree_id: TreeId, message: String },

    /// The operation was cancelled before reaching commit.
    #[error("operation cancelled")]
    Canceled,

    /// The caller-supplied deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Wire status codes understood by the RPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    InvalidArgument,
    Unimplemented,
    Aborted,
    Canceled,
    DeadlineExceeded,
    Unavailable,
    Internal,
}

impl StorageError {
    /// The wire status code this error maps to.
    pub fn code(&self) -> StatusCode {
        match self {
            StorageError::TreeNeedsInit(_) | StorageError::TreeNotFound(_) => StatusCode::NotFound,
            StorageError::LeafAlreadyExists { .. } | StorageError::RootAlreadyExists { .. } => {
                StatusCode::AlreadyExists
            }
            StorageError::InvalidArgument(_) | StorageError::HashSizeMismatch { .. } => {
                StatusCode::InvalidArgument
            }
            StorageError::Unimplemented(_) => StatusCode::Unimplemented,
            StorageError::Conflict { .. } => StatusCode::Aborted,
            StorageError::Canceled => StatusCode::Canceled,
            StorageError::DeadlineExceeded => StatusCode::DeadlineExceeded,
            StorageError::Database(e) if is_retryable_db_error(e) => StatusCode::Unavailable,
            StorageError::Database(_)
            | StorageError::Integrity { .. }
            | StorageError::Internal(_) => StatusCode::Internal,
        }
    }

    /// Whether retrying the whole transaction can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Conflict { .. } => true,
            StorageError::Database(e) => is_retryable_db_error(e),
            _ => false,
        }
    }
}

/// Check if a database error is worth retrying.
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        // Connection errors are usually transient
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false, // Pool is intentionally closed
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // PostgreSQL serialization failure
            code == "40001"
                // PostgreSQL deadlock detected
                || code == "40P01"
                // Connection exceptions
                || code.starts_with("08")
                // Operator intervention (admin disconnected, crash recovery)
                || code.starts_with("57")
        }
        _ => false,
    }
}

impl From<CompactRangeError> for StorageError {
    fn from(err: CompactRangeError) -> Self {
        StorageError::Internal(err.to_string())
    }
}
