//! Multi-level cache manager.

use super::backend::{CacheBackend, MemoryCache, NullCache};
use super::disk::DiskCache;
use super::key::CacheKey;
use super::semantic::{EmbeddingCache, SemanticCache};
use crate::{Error, ErrorContext, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which tier(s) an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
    All,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::L1 => "l1",
            CacheLevel::L2 => "l2",
            CacheLevel::L3 => "l3",
            CacheLevel::All => "all",
        }
    }

    fn includes(self, tier: CacheLevel) -> bool {
        self == CacheLevel::All || self == tier
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l1" => Ok(CacheLevel::L1),
            "l2" => Ok(CacheLevel::L2),
            "l3" => Ok(CacheLevel::L3),
            "all" => Ok(CacheLevel::All),
            other => Err(Error::validation_with_context(
                format!("invalid cache level '{}'", other),
                ErrorContext::new()
                    .with_field_path("level")
                    .with_details("expected one of: l1, l2, l3, all")
                    .with_source("cache_level"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub l1_max_items: usize,
    pub l1_ttl: Duration,
    /// L2 root directory; `None` disables the durable tier.
    pub l2_dir: Option<PathBuf>,
    pub l2_ttl: Duration,
    pub l3_enabled: bool,
    pub l3_ttl: Duration,
    pub l3_similarity_threshold: f32,
    /// Serialized values larger than this are not cached.
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_max_items: 100,
            l1_ttl: Duration::from_secs(900),
            l2_dir: None,
            l2_ttl: Duration::from_secs(86_400),
            l3_enabled: false,
            l3_ttl: Duration::from_secs(604_800),
            l3_similarity_threshold: 0.92,
            max_entry_size: 10 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_l1(mut self, max_items: usize, ttl: Duration) -> Self {
        self.l1_max_items = max_items;
        self.l1_ttl = ttl;
        self
    }
    pub fn with_l2_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.l2_dir = Some(dir.into());
        self
    }
    pub fn with_l2_ttl(mut self, ttl: Duration) -> Self {
        self.l2_ttl = ttl;
        self
    }
    pub fn with_l3(mut self, ttl: Duration, threshold: f32) -> Self {
        self.l3_enabled = true;
        self.l3_ttl = ttl;
        self.l3_similarity_threshold = threshold;
        self
    }

    fn default_ttl(&self, level: CacheLevel) -> Duration {
        match level {
            CacheLevel::L1 | CacheLevel::All => self.l1_ttl,
            CacheLevel::L2 => self.l2_ttl,
            CacheLevel::L3 => self.l3_ttl,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    /// Corrupt durable entries detected and removed.
    pub repairs: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.l3_hits
    }
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Tiered cache: volatile L1, durable L2, optional similarity L3.
///
/// One instance is shared (behind an `Arc`) by every request in the process.
/// `get` at [`CacheLevel::All`] consults L1, then L2 (promoting a hit into
/// L1), then L3. A failing tier is logged and skipped when reading through
/// all levels, so a broken disk degrades to misses instead of failing calls.
pub struct MultiLevelCache {
    config: CacheConfig,
    l1: Box<dyn CacheBackend>,
    l2: Box<dyn CacheBackend>,
    l3: Option<Arc<dyn SemanticCache>>,
    stats: AtomicStats,
}

impl MultiLevelCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        if !(0.0..=1.0).contains(&config.l3_similarity_threshold) {
            return Err(Error::configuration_with_context(
                "similarity threshold must lie in [0, 1]",
                ErrorContext::new()
                    .with_field_path("cache.l3_similarity_threshold")
                    .with_details(format!("got {}", config.l3_similarity_threshold))
                    .with_source("multi_level_cache"),
            ));
        }
        let l1: Box<dyn CacheBackend> = Box::new(MemoryCache::with_capacity(config.l1_max_items)?);
        let l2: Box<dyn CacheBackend> = match config.l2_dir {
            Some(ref dir) => Box::new(DiskCache::new(dir.clone())),
            None => Box::new(NullCache::new()),
        };
        let l3: Option<Arc<dyn SemanticCache>> = if config.l3_enabled {
            Some(Arc::new(EmbeddingCache::default()))
        } else {
            None
        };
        info!(
            l1_max_items = config.l1_max_items,
            l2 = l2.name(),
            l3 = l3.is_some(),
            "multi-level cache initialized"
        );
        Ok(Self {
            config,
            l1,
            l2,
            l3,
            stats: AtomicStats::default(),
        })
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self {
            config: CacheConfig::default().with_enabled(false),
            l1: Box::new(NullCache::new()),
            l2: Box::new(NullCache::new()),
            l3: None,
            stats: AtomicStats::default(),
        }
    }

    /// Replace the durable tier (e.g. with an embedded KV store).
    pub fn with_l2_backend(mut self, backend: Box<dyn CacheBackend>) -> Self {
        self.l2 = backend;
        self
    }

    pub fn with_semantic(mut self, l3: Arc<dyn SemanticCache>) -> Self {
        self.l3 = Some(l3);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn stats(&self) -> CacheStats {
        let s = &self.stats;
        CacheStats {
            l1_hits: s.l1_hits.load(Ordering::Relaxed),
            l2_hits: s.l2_hits.load(Ordering::Relaxed),
            l3_hits: s.l3_hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            sets: s.sets.load(Ordering::Relaxed),
            deletes: s.deletes.load(Ordering::Relaxed),
            errors: s.errors.load(Ordering::Relaxed),
            repairs: self.l2.repairs(),
        }
    }

    /// Per-tier failure: propagate when the caller addressed that tier
    /// directly, otherwise log and continue as a miss.
    fn tolerate<T: Default>(&self, level: CacheLevel, tier: CacheLevel, result: Result<T>) -> Result<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                AtomicStats::bump(&self.stats.errors);
                if level == CacheLevel::All {
                    warn!(tier = tier.as_str(), error = %e, "cache tier failed, skipping");
                    Ok(T::default())
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn get_bytes(&self, key: &CacheKey, level: CacheLevel) -> Result<Option<Vec<u8>>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let k = key.as_str();

        if level.includes(CacheLevel::L1) {
            if let Some(v) = self.tolerate(level, CacheLevel::L1, self.l1.get(k).await)? {
                AtomicStats::bump(&self.stats.l1_hits);
                debug!(key = k, "L1 hit");
                return Ok(Some(v));
            }
        }

        if level.includes(CacheLevel::L2) {
            if let Some(v) = self.tolerate(level, CacheLevel::L2, self.l2.get(k).await)? {
                AtomicStats::bump(&self.stats.l2_hits);
                debug!(key = k, "L2 hit, promoting to L1");
                if let Err(e) = self.l1.set(k, &v, self.config.l1_ttl).await {
                    AtomicStats::bump(&self.stats.errors);
                    warn!(key = k, error = %e, "failed to promote L2 hit");
                }
                return Ok(Some(v));
            }
        }

        if level.includes(CacheLevel::L3) {
            if let (Some(l3), Some(text)) = (&self.l3, key.semantic_text.as_deref()) {
                let found = l3
                    .find_similar(text, self.config.l3_similarity_threshold)
                    .await;
                if let Some(v) = self.tolerate(level, CacheLevel::L3, found)? {
                    AtomicStats::bump(&self.stats.l3_hits);
                    debug!(key = k, "L3 hit");
                    return Ok(Some(v));
                }
            }
        }

        AtomicStats::bump(&self.stats.misses);
        Ok(None)
    }

    /// Typed read. A value that no longer deserializes counts as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey, level: CacheLevel) -> Result<Option<T>> {
        match self.get_bytes(key, level).await? {
            Some(data) => match serde_json::from_slice(&data) {
                Ok(val) => Ok(Some(val)),
                Err(e) => {
                    AtomicStats::bump(&self.stats.errors);
                    warn!(key = key.as_str(), error = %e, "cached value has unexpected shape");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Write to the addressed tier(s). `ttl = None` uses each tier's
    /// configured TTL.
    pub async fn set_bytes(
        &self,
        key: &CacheKey,
        value: &[u8],
        ttl: Option<Duration>,
        level: CacheLevel,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if value.len() > self.config.max_entry_size {
            debug!(key = key.as_str(), bytes = value.len(), "value too large to cache");
            return Ok(());
        }
        let k = key.as_str();
        let ttl_for = |tier: CacheLevel| ttl.unwrap_or_else(|| self.config.default_ttl(tier));

        if level.includes(CacheLevel::L1) {
            let r = self.l1.set(k, value, ttl_for(CacheLevel::L1)).await;
            self.tolerate(level, CacheLevel::L1, r)?;
        }
        if level.includes(CacheLevel::L2) {
            let r = self.l2.set(k, value, ttl_for(CacheLevel::L2)).await;
            self.tolerate(level, CacheLevel::L2, r)?;
        }
        if level.includes(CacheLevel::L3) {
            match (&self.l3, key.semantic_text.as_deref()) {
                (Some(l3), Some(text)) => {
                    let r = l3.insert(k, text, value, ttl_for(CacheLevel::L3)).await;
                    self.tolerate(level, CacheLevel::L3, r)?;
                }
                (Some(_), None) => debug!(key = k, "no semantic text, skipping L3"),
                (None, _) => {}
            }
        }
        AtomicStats::bump(&self.stats.sets);
        Ok(())
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
        level: CacheLevel,
    ) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.set_bytes(key, &data, ttl, level).await
    }

    /// Remove `key` from the addressed tier(s); true if any tier held it.
    pub async fn delete(&self, key: &CacheKey, level: CacheLevel) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let k = key.as_str();
        let mut removed = false;
        if level.includes(CacheLevel::L1) {
            removed |= self.tolerate(level, CacheLevel::L1, self.l1.delete(k).await)?;
        }
        if level.includes(CacheLevel::L2) {
            removed |= self.tolerate(level, CacheLevel::L2, self.l2.delete(k).await)?;
        }
        if level.includes(CacheLevel::L3) {
            if let Some(l3) = &self.l3 {
                removed |= self.tolerate(level, CacheLevel::L3, l3.remove(k).await)?;
            }
        }
        if removed {
            AtomicStats::bump(&self.stats.deletes);
        }
        Ok(removed)
    }

    /// Empty the addressed tier(s). Safe alongside in-flight reads and
    /// writes; a write racing a clear may survive it.
    pub async fn clear(&self, level: CacheLevel) -> Result<()> {
        if level.includes(CacheLevel::L1) {
            self.l1.clear().await?;
        }
        if level.includes(CacheLevel::L2) {
            self.l2.clear().await?;
        }
        if level.includes(CacheLevel::L3) {
            if let Some(l3) = &self.l3 {
                l3.clear().await?;
            }
        }
        info!(level = level.as_str(), "cache cleared");
        Ok(())
    }

    /// Live entry count per tier: `(l1, l2, l3)`.
    pub async fn len(&self) -> Result<(usize, usize, usize)> {
        let l3 = match &self.l3 {
            Some(l3) => l3.len().await?,
            None => 0,
        };
        Ok((self.l1.len().await?, self.l2.len().await?, l3))
    }
}

impl fmt::Debug for MultiLevelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLevelCache")
            .field("l1", &self.l1.name())
            .field("l2", &self.l2.name())
            .field("l3", &self.l3.is_some())
            .field("enabled", &self.config.enabled)
            .finish()
    }
}
