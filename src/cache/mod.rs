//! 多级缓存模块：内存 L1、磁盘 L2 与语义 L3 三层缓存，减少重复的模型调用。
//!
//! # Multi-Level Response Cache
//!
//! Responses are cached in tiers with independent TTLs so repeated requests
//! (and requests whose provider is currently failing) can be served without
//! a remote call.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MultiLevelCache`] | Tier orchestration, promotion and statistics |
//! | [`CacheConfig`] | Capacities, TTLs and tier enablement |
//! | [`CacheLevel`] | `l1`, `l2`, `l3` or `all` |
//! | [`CacheBackend`] | Trait for byte-level key/value tiers |
//! | [`MemoryCache`] | L1: bounded, insertion-order eviction, sliding expiration |
//! | [`DiskCache`] | L2: content-addressed files with atomic replace |
//! | [`SemanticCache`] | L3: similarity lookup seam, with [`EmbeddingCache`] |
//! | [`CacheKeyGenerator`] | Stable keys from a fingerprint and request parameters |
//!
//! ## Example
//!
//! ```rust
//! use llm_relay::cache::{CacheConfig, CacheKeyGenerator, CacheLevel, MultiLevelCache};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let cache = MultiLevelCache::new(CacheConfig::new()).unwrap();
//! let key = CacheKeyGenerator::new("chat").generate_for_text("hi", &json!({"model": "gpt-4"}));
//!
//! cache.set(&key, &"hello!", None, CacheLevel::All).await.unwrap();
//! let hit: Option<String> = cache.get(&key, CacheLevel::All).await.unwrap();
//! assert_eq!(hit.as_deref(), Some("hello!"));
//! # });
//! ```
//!
//! ## Key Generation
//!
//! Keys are `prefix:sha256(...)` over a content fingerprint and a canonical
//! JSON form of the request parameters, so identical requests share a key
//! and parameter order never matters.

mod backend;
mod disk;
mod key;
mod manager;
mod semantic;

pub use backend::{CacheBackend, MemoryCache, NullCache};
pub use disk::DiskCache;
pub use key::{fingerprint, fingerprint_file, CacheKey, CacheKeyGenerator};
pub use manager::{CacheConfig, CacheLevel, CacheStats, MultiLevelCache};
pub use semantic::{cosine_similarity, Embedder, EmbeddingCache, HashingEmbedder, SemanticCache};
