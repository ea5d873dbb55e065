//! Content addresses: the storage key derived from an object's bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowercase hex SHA-1 of an object's bytes.
///
/// Identical content always yields the same address, which makes the
/// address the deduplication key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Build an address from a finished SHA-1 digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
