//! 重试执行器：限流准入、调用、错误分类、指数退避，以及缓存与备用提供方回退。
//!
//! Retrying executor for one logical remote call.
//!
//! ```text
//! Idle -> Admitting -> Calling -> Succeeded
//!                         |
//!                         +-> RetryScheduled -> Admitting
//!                         +-> Exhausted -> CacheFallback -> ProviderFallback -> Failed
//! ```
//!
//! Attempts within one call are strictly sequential. Many calls may run
//! concurrently on separate tasks sharing one [`RateLimiter`] and one
//! [`MultiLevelCache`].

use super::classify::{ErrorClassifier, Verdict};
use super::policy::RetryPolicy;
use super::rate_limiter::RateLimiter;
use crate::cache::{CacheKey, CacheLevel, MultiLevelCache};
use crate::error_code::ErrorClass;
use crate::events::{noop_sink, ApiEvent, ApiEventKind, EventSink};
use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-call options.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub endpoint: String,
    pub cache_key: Option<CacheKey>,
    pub allow_cache_fallback: bool,
    pub allow_provider_fallback: bool,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            cache_key: None,
            allow_cache_fallback: true,
            allow_provider_fallback: true,
            cancel: None,
        }
    }

    pub fn with_cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    pub fn allow_cache_fallback(mut self, allow: bool) -> Self {
        self.allow_cache_fallback = allow;
        self
    }

    pub fn allow_provider_fallback(mut self, allow: bool) -> Self {
        self.allow_provider_fallback = allow;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Where a successful result came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServedBy {
    Primary,
    /// Found in the cache before any remote call was made.
    CacheHit,
    /// A previously cached value stood in after retries were exhausted.
    Cache,
    Fallback(String),
}

#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub served_by: ServedBy,
    /// Remote calls made, fallback included.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T> Outcome<T> {
    /// True when the value came from a remote call made for this request.
    pub fn is_fresh(&self) -> bool {
        matches!(self.served_by, ServedBy::Primary | ServedBy::Fallback(_))
    }
}

/// Runs remote operations through admission control, retries and fallbacks.
pub struct RetryingExecutor {
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<MultiLevelCache>>,
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    primary: String,
    fallback: Option<String>,
    events: Arc<dyn EventSink>,
}

impl RetryingExecutor {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            cache: None,
            policy: RetryPolicy::default(),
            classifier: ErrorClassifier::default(),
            primary: "primary".to_string(),
            fallback: None,
            events: noop_sink(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<MultiLevelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_primary_provider(mut self, name: impl Into<String>) -> Self {
        self.primary = name.into();
        self
    }

    pub fn with_fallback_provider(mut self, name: impl Into<String>) -> Self {
        self.fallback = Some(name.into());
        self
    }

    /// Inject an event sink. Default is a no-op sink.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn primary_provider(&self) -> &str {
        &self.primary
    }

    pub fn fallback_provider(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    async fn emit(&self, provider: &str, options: &CallOptions, kind: ApiEventKind) {
        self.events
            .emit(ApiEvent::new(provider, options.endpoint.as_str(), kind))
            .await;
    }

    /// Execute `op` against the primary provider with retries, then fall
    /// back to the cache and to the fallback provider.
    ///
    /// `op` receives the provider name and is invoked once per attempt. It is
    /// expected to enforce its own deadline and to report failures as
    /// [`Error::Remote`] or [`Error::Timeout`].
    ///
    /// Fatal errors are returned unchanged. Exhaustion yields
    /// [`Error::RetriesExhausted`] when no fallback was tried, or
    /// [`Error::FallbacksExhausted`] when one was.
    pub async fn execute<T, F, Fut>(&self, options: CallOptions, op: F) -> Result<Outcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let started = Instant::now();
        let cancel = options.cancel.clone().unwrap_or_default();
        let primary = self.primary.as_str();
        let mut unclassified_seen = 0u32;
        let mut attempt = 0u32;

        let last_error = loop {
            let err = match self.attempt(primary, attempt, &options, &op, &cancel).await {
                Ok(value) => {
                    return Ok(Outcome {
                        value,
                        served_by: ServedBy::Primary,
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                    });
                }
                Err(err) => err,
            };

            let class = err.class();
            let verdict = self.classifier.classify(&err, unclassified_seen);
            if self.classifier.is_unclassified(class) {
                unclassified_seen += 1;
            }

            if verdict == Verdict::Fatal {
                if !matches!(err, Error::Cancelled) {
                    error!(
                        provider = primary,
                        endpoint = options.endpoint.as_str(),
                        attempt = attempt + 1,
                        error_class = class.name(),
                        error_code = class.code(),
                        error = %err,
                        "non-retryable error"
                    );
                    self.emit(primary, &options, failed(&err)).await;
                }
                return Err(err);
            }

            let hint = err.retry_after();
            if let (ErrorClass::RateLimited, Some(hint)) = (class, hint) {
                self.limiter.block_for(hint).await;
            }

            if attempt >= self.policy.max_retries {
                break err;
            }

            let delay = self.policy.backoff_delay(attempt, hint);
            warn!(
                provider = primary,
                endpoint = options.endpoint.as_str(),
                attempt = attempt + 1,
                max_attempts = self.policy.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error_class = class.name(),
                error_code = class.code(),
                error = %err,
                "attempt failed, retrying"
            );
            self.emit(
                primary,
                &options,
                ApiEventKind::RetryScheduled {
                    attempt: attempt + 1,
                    delay,
                    class,
                },
            )
            .await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        };

        let attempts = attempt + 1;
        error!(
            provider = primary,
            endpoint = options.endpoint.as_str(),
            attempts,
            error = %last_error,
            "retries exhausted"
        );

        let mut fallback_tried = false;

        if options.allow_cache_fallback {
            if let (Some(cache), Some(key)) = (&self.cache, &options.cache_key) {
                fallback_tried = true;
                match cache.get::<T>(key, CacheLevel::All).await {
                    Ok(Some(value)) => {
                        info!(key = key.as_str(), "serving cached value after exhausted retries");
                        self.emit(
                            primary,
                            &options,
                            ApiEventKind::CacheFallbackUsed {
                                key: key.as_str().to_string(),
                            },
                        )
                        .await;
                        return Ok(Outcome {
                            value,
                            served_by: ServedBy::Cache,
                            attempts,
                            elapsed: started.elapsed(),
                        });
                    }
                    Ok(None) => debug!(key = key.as_str(), "cache fallback missed"),
                    Err(e) => warn!(key = key.as_str(), error = %e, "cache fallback failed"),
                }
            }
        }

        let mut fallback_error = None;
        if options.allow_provider_fallback {
            if let Some(fallback) = self.fallback.as_deref() {
                fallback_tried = true;
                info!(
                    provider = primary,
                    fallback_provider = fallback,
                    "triggering provider fallback"
                );
                self.emit(
                    primary,
                    &options,
                    ApiEventKind::ProviderFallbackTriggered {
                        reason: last_error.to_string(),
                        fallback_provider: fallback.to_string(),
                    },
                )
                .await;
                match self.attempt(fallback, 0, &options, &op, &cancel).await {
                    Ok(value) => {
                        return Ok(Outcome {
                            value,
                            served_by: ServedBy::Fallback(fallback.to_string()),
                            attempts: attempts + 1,
                            elapsed: started.elapsed(),
                        });
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        error!(fallback_provider = fallback, error = %e, "fallback provider failed");
                        self.emit(fallback, &options, failed(&e)).await;
                        fallback_error = Some(Box::new(e));
                    }
                }
            }
        }

        self.emit(primary, &options, failed(&last_error)).await;
        let source = Box::new(last_error);
        if fallback_tried {
            Err(Error::FallbacksExhausted {
                attempts,
                source,
                fallback_error,
            })
        } else {
            Err(Error::RetriesExhausted { attempts, source })
        }
    }

    /// One admission plus one invocation.
    async fn attempt<T, F, Fut>(
        &self,
        provider: &str,
        attempt: u32,
        options: &CallOptions,
        op: &F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let wait = self.limiter.estimated_wait().await;
        if !wait.is_zero() {
            info!(
                provider,
                endpoint = options.endpoint.as_str(),
                wait_ms = wait.as_millis() as u64,
                "request deferred by rate limiter"
            );
            self.emit(provider, options, ApiEventKind::Deferred { wait }).await;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.limiter.wait_for_admission() => {}
        }

        self.emit(
            provider,
            options,
            ApiEventKind::Initiated {
                attempt: attempt + 1,
            },
        )
        .await;
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = op(provider.to_string()) => r,
        };
        let latency = start.elapsed();

        if result.is_ok() {
            debug!(
                provider,
                endpoint = options.endpoint.as_str(),
                latency_ms = latency.as_millis() as u64,
                "call succeeded"
            );
            self.emit(provider, options, ApiEventKind::Succeeded { latency })
                .await;
        }
        result
    }
}

fn failed(err: &Error) -> ApiEventKind {
    ApiEventKind::Failed {
        class: err.class(),
        message: err.to_string(),
    }
}

impl std::fmt::Debug for RetryingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingExecutor")
            .field("policy", &self.policy)
            .field("primary", &self.primary)
            .field("fallback", &self.fallback)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::RateLimiterConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(max_retries: u32) -> RetryingExecutor {
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_max_requests(100)).unwrap();
        RetryingExecutor::new(Arc::new(limiter))
            .with_policy(RetryPolicy::new().with_max_retries(max_retries))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<Outcome<String>> = executor(5)
            .execute(CallOptions::new("chat"), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::from_http_status(401, "bad key")) }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Authentication);
        assert!(!err.is_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_error_retried_once_then_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<Outcome<String>> = executor(5)
            .execute(CallOptions::new("chat"), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::remote(ErrorClass::Unknown, "???")) }
            })
            .await;
        assert_eq!(result.unwrap_err().class(), ErrorClass::Unknown);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_sets_delay() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let outcome = executor(3)
            .execute(CallOptions::new("chat"), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::from_http_status(429, "slow down")
                            .with_retry_after(Duration::from_millis(7500)))
                    } else {
                        Ok("done".to_string())
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(7500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });
        let result: Result<Outcome<String>> = executor(5)
            .execute(CallOptions::new("chat").with_cancel(token), |_| async {
                Err(Error::from_http_status(503, "busy"))
            })
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
