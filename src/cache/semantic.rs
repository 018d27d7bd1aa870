//! Similarity (L3) tier: nearest-neighbour lookup over request embeddings.

use crate::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Lookup by meaning rather than exact key.
#[async_trait]
pub trait SemanticCache: Send + Sync {
    /// Value of the most similar unexpired entry scoring at least `threshold`.
    async fn find_similar(&self, query: &str, threshold: f32) -> Result<Option<Vec<u8>>>;
    async fn insert(&self, key: &str, query: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
}

/// Text to fixed-size vector.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Feature-hashed bag of lowercase words. Local and deterministic; texts
/// sharing most of their words score close to 1.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dimensions;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        Ok(v)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::validation(format!(
            "Vector dimensions must match: {} != {}",
            a.len(),
            b.len()
        )));
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (mag_a * mag_b))
}

struct SemanticEntry {
    vector: Vec<f32>,
    data: Vec<u8>,
    expires_at: Instant,
}

/// In-memory [`SemanticCache`] scanning every entry by cosine similarity.
pub struct EmbeddingCache {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<HashMap<String, SemanticEntry>>,
}

impl EmbeddingCache {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(Arc::new(HashingEmbedder::default()))
    }
}

#[async_trait]
impl SemanticCache for EmbeddingCache {
    async fn find_similar(&self, query: &str, threshold: f32) -> Result<Option<Vec<u8>>> {
        let probe = self.embedder.embed(query)?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| now < e.expires_at);

        let mut best: Option<(f32, &SemanticEntry)> = None;
        for entry in entries.values() {
            let score = cosine_similarity(&probe, &entry.vector)?;
            if score >= threshold && best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, entry));
            }
        }
        Ok(best.map(|(score, entry)| {
            debug!(score, threshold, "L3 similarity hit");
            entry.data.clone()
        }))
    }

    async fn insert(&self, key: &str, query: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let vector = self.embedder.embed(query)?;
        let entry = SemanticEntry {
            vector,
            data: value.to_vec(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| now < e.expires_at)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_err());
    }

    #[test]
    fn test_hashing_embedder_ignores_case_and_punctuation() {
        let e = HashingEmbedder::default();
        let a = e.embed("Explain the borrow checker.").unwrap();
        let b = e.embed("explain THE borrow checker").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_similar() {
        let cache = EmbeddingCache::default();
        let ttl = Duration::from_secs(60);
        cache
            .insert("k1", "how do I read a file in rust", b"use std::fs", ttl)
            .await
            .unwrap();
        cache
            .insert("k2", "best pizza toppings", b"basil", ttl)
            .await
            .unwrap();

        let hit = cache
            .find_similar("How do I read a file in Rust?", 0.9)
            .await
            .unwrap();
        assert_eq!(hit, Some(b"use std::fs".to_vec()));
        assert!(cache
            .find_similar("weather tomorrow", 0.9)
            .await
            .unwrap()
            .is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache
            .find_similar("how do I read a file in rust", 0.5)
            .await
            .unwrap()
            .is_none());
        assert_eq!(cache.len().await.unwrap(), 0);
    }
}
