//! Cache key generation.

use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 hex digest of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

/// SHA-256 hex digest of a file's contents.
pub async fn fingerprint_file(path: impl AsRef<Path>) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(fingerprint(&bytes))
}

/// Opaque cache key. `hash` is the full key string (`prefix:hexdigest`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
    pub provider: Option<String>,
    pub fingerprint: Option<String>,
    /// Request text for similarity lookup; only the L3 tier reads it.
    pub semantic_text: Option<String>,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            provider: None,
            fingerprint: None,
            semantic_text: None,
        }
    }
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
    pub fn with_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.fingerprint = Some(fp.into());
        self
    }
    pub fn with_semantic_text(mut self, text: impl Into<String>) -> Self {
        self.semantic_text = Some(text.into());
        self
    }
    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Builds keys as `prefix:sha256(canonical json of {fingerprint, params})`.
///
/// Object keys are sorted before hashing, so parameter order never changes
/// the key.
#[derive(Debug, Clone)]
pub struct CacheKeyGenerator {
    prefix: String,
    salt: Option<String>,
}

impl CacheKeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            salt: None,
        }
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn generate(&self, fingerprint: &str, params: &Value) -> CacheKey {
        let mut parts = serde_json::Map::new();
        parts.insert("fingerprint".into(), Value::String(fingerprint.to_string()));
        parts.insert("params".into(), params.clone());
        if let Some(ref s) = self.salt {
            parts.insert("salt".into(), Value::String(s.clone()));
        }
        let canonical = canonical_json(&Value::Object(parts));
        let digest = hex(&Sha256::digest(canonical.as_bytes()));
        CacheKey::new(format!("{}:{}", self.prefix, digest)).with_fingerprint(fingerprint)
    }

    /// Key for text content: fingerprints the text and keeps it for L3 lookup.
    pub fn generate_for_text(&self, text: &str, params: &Value) -> CacheKey {
        self.generate(&fingerprint(text.as_bytes()), params)
            .with_semantic_text(text)
    }
}

/// Serialize with object keys sorted at every depth.
fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}
