//! 弹性模块：提供滑动窗口限流、错误分类、指数退避重试与回退执行。
//!
//! # Resilience Module
//!
//! Everything between "the caller has a prepared request" and "the caller
//! has a result or a terminal error".
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Sliding-window admission control shared by all requests |
//! | [`RetryPolicy`] | Retry budget and exponential backoff schedule |
//! | [`ErrorClassifier`] | Explicit retryable / non-retryable class sets |
//! | [`RetryingExecutor`] | Admission, retries, cache fallback, provider fallback |
//!
//! ## Rate Limiter
//!
//! At most `max_requests` admissions fall within any trailing window:
//!
//! ```rust
//! use llm_relay::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = RateLimiterConfig::new()
//!     .with_max_requests(2)
//!     .with_window(Duration::from_secs(60));
//! let limiter = RateLimiter::new(config).unwrap();
//!
//! assert!(limiter.try_admit().await);
//! assert!(limiter.try_admit().await);
//! assert!(!limiter.try_admit().await);
//! # });
//! ```
//!
//! ## Retrying Executor
//!
//! ```rust
//! use llm_relay::resilience::{CallOptions, RateLimiter, RateLimiterConfig, RetryingExecutor, ServedBy};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()).unwrap());
//! let executor = RetryingExecutor::new(limiter).with_fallback_provider("backup");
//!
//! let outcome = executor
//!     .execute(CallOptions::new("chat"), |provider| async move {
//!         Ok(format!("answered by {}", provider))
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(outcome.served_by, ServedBy::Primary);
//! # });
//! ```

mod classify;
mod executor;
mod policy;
pub mod rate_limiter;

pub use classify::{ErrorClassifier, Verdict};
pub use executor::{CallOptions, Outcome, RetryingExecutor, ServedBy};
pub use policy::RetryPolicy;
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
