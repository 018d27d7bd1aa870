//! # llm-relay
//!
//! 面向命令行 LLM 助手的弹性请求管线：Token 预算、分块、限流、重试与多级缓存。
//!
//! Resilient request pipeline for command-line LLM assistants.
//!
//! ## Overview
//!
//! Every request to a remote language model passes through the same stages:
//! it is sized, shaped to fit the model's context window, admitted by a
//! shared rate limiter, executed with retries and fallbacks, and cached so
//! repeated work is served locally. The remote call itself is supplied by
//! the caller as an async closure; this crate owns everything around it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llm_relay::{CallOptions, Pipeline, PipelineConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> llm_relay::Result<()> {
//!     let pipeline = Pipeline::from_config(PipelineConfig::load(None)?)?;
//!
//!     let key = pipeline
//!         .key_generator()
//!         .generate_for_text("Explain this diff", &json!({"model": "gpt-4"}));
//!     let outcome = pipeline
//!         .run(CallOptions::new("chat").with_cache_key(key), |provider| async move {
//!             // call `provider` here
//!             Ok(format!("answer from {}", provider))
//!         })
//!         .await?;
//!
//!     println!("{} ({:?})", outcome.value, outcome.served_by);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`tokens`] | Token estimation and context budgeting |
//! | [`optimize`] | Chunking and conversation truncation |
//! | [`resilience`] | Rate limiting, retry policy, error classification, executor |
//! | [`cache`] | L1 memory, L2 disk and L3 semantic response cache |
//! | [`events`] | API call lifecycle events and sinks |
//! | [`config`] | Layered configuration (defaults, YAML, environment) |
//! | [`pipeline`] | Facade wiring the components together |
//! | [`error_code`] | Canonical remote error classes |

pub mod cache;
pub mod config;
pub mod error_code;
pub mod events;
pub mod optimize;
pub mod pipeline;
pub mod resilience;
pub mod tokens;
pub mod types;

mod error;

pub use error::{Error, ErrorContext};
pub use error_code::ErrorClass;

// Re-export main types for convenience
pub use cache::{CacheConfig, CacheKey, CacheLevel, MultiLevelCache};
pub use config::PipelineConfig;
pub use events::{ApiEvent, ApiEventKind, EventSink};
pub use optimize::{Chunk, Chunker, PromptOptimizer};
pub use pipeline::{ChunkedOutcome, Pipeline, PipelineBuilder};
pub use resilience::{
    CallOptions, ErrorClassifier, Outcome, RateLimiter, RateLimiterConfig, RetryPolicy,
    RetryingExecutor, ServedBy,
};
pub use tokens::{TokenBudget, TokenCounter, TokenEstimator};
pub use types::{Message, MessageRole};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
