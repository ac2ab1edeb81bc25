//! Cryptographic hashing for log trees.
//!
//! The storage core consumes hashing as a pure function; everything else
//! (root signatures, key management) belongs to the layers above.

mod hash;

pub use hash::{LogHasher, Rfc6962Hasher, HASH_SIZE, PREFIX_INTERNAL, PREFIX_LEAF};
