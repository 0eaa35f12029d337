//! Content hashing for provenance
//!
//! All hashes are lowercase hex SHA-256. Structured values are hashed over
//! their canonical JSON form (object keys sorted), so field order in the
//! source file never changes a configuration hash.

use crate::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Hash raw bytes
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    format!("{:x}", Sha256::digest(bytes.as_ref()))
}

/// Hash a file's full contents
pub fn hash_file(path: &Path) -> Result<String> {
    let contents = fs::read(path)?;
    Ok(sha256_hex(contents))
}

/// Canonical JSON rendering with sorted object keys
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    // serde_json::Map is BTreeMap-backed, so going through Value sorts keys
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

/// Hash the canonical JSON form of a value
pub fn hash_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?))
}

/// Hash an ordered sequence of string parts with unambiguous separators
///
/// Each part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn hash_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
