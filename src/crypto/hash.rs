//! RFC 6962 hashing with domain separation.
//!
//! Leaf hashes and interior-node hashes are computed under distinct domain
//! prefixes so that a leaf value can never collide with an interior node.
//! The empty tree hashes to `SHA256("")`.

use sha2::{Digest, Sha256};

use crate::domain::Hash;

/// Output size of every supported hash strategy, in bytes.
pub const HASH_SIZE: usize = 32;

/// Domain prefix for leaf hashing.
pub const PREFIX_LEAF: u8 = 0x00;

/// Domain prefix for interior-node hashing.
pub const PREFIX_INTERNAL: u8 = 0x01;

/// Hashing strategy for a log tree.
///
/// Implementations must be domain-separated: `hash_leaf` and
/// `hash_children` may never produce the same digest for related inputs.
pub trait LogHasher: Send + Sync {
    /// Hash of the empty tree.
    fn empty_root(&self) -> Hash;

    /// Hash of a single leaf value.
    fn hash_leaf(&self, leaf_value: &[u8]) -> Hash;

    /// Hash of an interior node from its two children.
    fn hash_children(&self, left: &Hash, right: &Hash) -> Hash;

    /// Digest length in bytes.
    fn size(&self) -> usize {
        HASH_SIZE
    }
}

/// The RFC 6962 SHA-256 hasher used by certificate-transparency-style logs.
///
/// `leaf_hash = SHA256(0x00 || leaf_value)`,
/// `node_hash = SHA256(0x01 || left || right)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc6962Hasher;

impl LogHasher for Rfc6962Hasher {
    fn empty_root(&self) -> Hash {
        Sha256::digest([]).into()
    }

    fn hash_leaf(&self, leaf_value: &[u8]) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update([PREFIX_LEAF]);
        hasher.update(leaf_value);
        hasher.finalize().into()
    }

    fn hash_children(&self, left: &Hash, right: &Hash) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update([PREFIX_INTERNAL]);
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().into()
    }
}
