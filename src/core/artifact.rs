//! Immutable model-output records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An immutable output produced by one model backend call.
///
/// `hash` is the short identity hash (first 16 hex chars of
/// sha256(content || adapter || model)); `content_sha256` is the full
/// content digest used for evidence binding. Artifacts are never mutated
/// after construction; metadata additions produce a new value sharing the
/// same identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub content: String,
    pub adapter: String,
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub hash: String,
    pub content_sha256: String,
}

impl Artifact {
    pub fn new(content: &str, adapter: &str, model: &str, prompt: &str) -> Self {
        let hash = identity_hash(content, adapter, model);
        let content_sha256 = hex::encode(Sha256::digest(content.as_bytes()));
        Self {
            content: content.to_string(),
            adapter: adapter.to_string(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            hash,
            content_sha256,
        }
    }

    /// Return a new artifact with one more metadata entry, sharing the
    /// same identity hash and timestamps.
    pub fn with_metadata(&self, key: &str, value: &str) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.to_string(), value.to_string());
        next
    }
}

fn identity_hash(content: &str, adapter: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(adapter.as_bytes());
    hasher.update(model.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_short() {
        let a = Artifact::new("body", "mock", "m1", "p");
        let b = Artifact::new("body", "mock", "m1", "different prompt");
        assert_eq!(a.hash.len(), 16);
        // Prompt does not participate in the identity hash.
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn hash_depends_on_adapter_and_model() {
        let a = Artifact::new("body", "mock", "m1", "p");
        let b = Artifact::new("body", "mock", "m2", "p");
        let c = Artifact::new("body", "other", "m1", "p");
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn with_metadata_preserves_identity() {
        let a = Artifact::new("body", "mock", "m1", "p");
        let b = a.with_metadata("extension", ".rs");
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.content_sha256, b.content_sha256);
        assert_eq!(b.metadata.get("extension").map(String::as_str), Some(".rs"));
        assert!(a.metadata.is_empty());
    }

    #[test]
    fn content_sha256_matches_content_only() {
        let a = Artifact::new("body", "mock", "m1", "p");
        let expected = hex::encode(sha2::Sha256::digest(b"body"));
        assert_eq!(a.content_sha256, expected);
    }
}
