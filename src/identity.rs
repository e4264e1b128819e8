//! Deterministic identity generation
//!
//! Names hash to stable GUIDs so independently bootstrapped nodes agree on
//! the identity of well-known concepts and relationship types without a
//! naming service.

use std::sync::OnceLock;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::model::Guid;

/// Number of hash bytes kept in a GUID (32 hex characters).
pub const GUID_BYTES: usize = 16;

fn cache() -> &'static DashMap<String, Guid> {
    static CACHE: OnceLock<DashMap<String, Guid>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Map a name to its GUID: the first 16 bytes of SHA-256(name), hex encoded.
///
/// Results are memoized for the lifetime of the process. The cache is a
/// shortcut only; the hash alone decides the value.
pub fn generate_guid(name: &str) -> Guid {
    if let Some(guid) = cache().get(name) {
        return guid.clone();
    }
    let guid = hash_name(name);
    cache().insert(name.to_string(), guid.clone());
    guid
}

fn hash_name(name: &str) -> Guid {
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..GUID_BYTES])
}

/// Deterministic edge ID for a `(source, type, target)` triple.
pub fn relationship_id(source: &str, kind: &str, target: &str) -> Guid {
    generate_guid(&format!("{}-{}-{}", source, kind, target))
}

/// Fresh random GUID for concepts that have no well-known name.
pub fn random_guid() -> Guid {
    uuid::Uuid::new_v4().to_string()
}

/// Number of memoized names.
pub fn cached_names() -> usize {
    cache().len()
}
