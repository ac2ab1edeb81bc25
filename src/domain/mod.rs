//! Domain models for the log storage core.
//!
//! Leaves, tree metadata, signed roots, and Merkle node addressing.

mod leaf;
mod node;
mod root;
mod tree;

pub use leaf::*;
pub use node::*;
pub use root::*;
pub use tree::*;

/// 32-byte SHA-256 digest.
pub type Hash = [u8; 32];

/// Serde module for serializing a [`Hash`] as a hex string.
pub mod hash_hex {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes for Hash"))
    }
}
