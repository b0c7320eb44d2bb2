//! Stable 64-bit hashes for config content and sampled values

use crate::event::Value;
use serde::Serialize;
use sha2::{Digest, Sha256};

fn truncate(digest: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Hash of the canonical JSON form of a config entry
pub fn content_hash<T: Serialize>(item: &T) -> u64 {
    let bytes = serde_json::to_vec(item).unwrap_or_default();
    truncate(&Sha256::digest(&bytes))
}

/// Folds another hash into `seed`
pub fn combine(seed: u64, other: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(other.to_le_bytes());
    truncate(&hasher.finalize())
}

/// Hash of a field value, used to pick sampling shards
pub fn value_hash(value: &Value) -> u64 {
    let mut bytes = Vec::new();
    value.canonical_bytes(&mut bytes);
    truncate(&Sha256::digest(&bytes))
}
