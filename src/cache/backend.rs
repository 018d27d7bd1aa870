//! Cache backend trait and the in-memory (L1) tier.

use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Byte-level key/value tier addressed by the full key string.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
    /// Corrupt entries this tier has detected and removed.
    fn repairs(&self) -> u64 {
        0
    }
}

struct CacheEntry {
    data: Vec<u8>,
    ttl: Duration,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(data: Vec<u8>, ttl: Duration, now: Instant) -> Self {
        Self {
            data,
            ttl,
            expires_at: now + ttl,
        }
    }
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Capacity-bounded in-memory tier with sliding expiration.
///
/// A hit pushes the entry's expiry out by its TTL again. Expired entries are
/// pruned before every read and write; beyond capacity the oldest-inserted
/// entry is evicted. Neither reads nor overwrites move an entry in that
/// order, so the `LruCache` is only ever touched through `peek*`.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(max_entries)),
        }
    }

    /// Like [`MemoryCache::new`], rejecting a zero capacity.
    pub fn with_capacity(max_entries: usize) -> Result<Self> {
        let cap = NonZeroUsize::new(max_entries).ok_or_else(|| {
            Error::configuration_with_context(
                "L1 capacity must be positive",
                ErrorContext::new()
                    .with_field_path("cache.l1_max_items")
                    .with_details("got 0")
                    .with_source("memory_cache"),
            )
        })?;
        Ok(Self::new(cap))
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prune_expired(entries: &mut LruCache<String, CacheEntry>, now: Instant) {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        if !expired.is_empty() {
            debug!(count = expired.len(), "pruning expired L1 entries");
        }
        for k in expired {
            entries.pop(&k);
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut entries = self.lock();
        Self::prune_expired(&mut entries, now);
        Ok(entries.peek_mut(key).map(|entry| {
            entry.expires_at = now + entry.ttl;
            entry.data.clone()
        }))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.lock();
        Self::prune_expired(&mut entries, now);
        let entry = CacheEntry::new(value.to_vec(), ttl, now);
        if let Some(existing) = entries.peek_mut(key) {
            *existing = entry;
            return Ok(());
        }
        if let Some((evicted, _)) = entries.push(key.to_string(), entry) {
            debug!(key = evicted.as_str(), "evicted oldest L1 entry over capacity");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().pop(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .lock()
            .peek(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false))
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let now = Instant::now();
        Ok(self
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .count())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Tier that stores nothing; stands in for a disabled level.
pub struct NullCache;
impl NullCache {
    pub fn new() -> Self {
        Self
    }
}
impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    async fn set(&self, _: &str, _: &[u8], _: Duration) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _: &str) -> Result<bool> {
        Ok(false)
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
