//! Retrying executor: backoff timing, exhaustion, cache and provider fallback.

use llm_relay::cache::{CacheConfig, CacheKey, CacheLevel, MultiLevelCache};
use llm_relay::events::{ApiEventKind, InMemoryEventSink};
use llm_relay::resilience::{
    CallOptions, RateLimiter, RateLimiterConfig, RetryPolicy, RetryingExecutor, ServedBy,
};
use llm_relay::{Error, ErrorClass};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn roomy_limiter() -> Arc<RateLimiter> {
    Arc::new(
        RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_requests(1000)
                .with_window(Duration::from_secs(60)),
        )
        .unwrap(),
    )
}

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_retries(max_retries)
        .with_initial_backoff(Duration::from_secs(1))
        .with_backoff_factor(2.0)
        .with_max_backoff(Duration::from_secs(60))
}

fn server_error() -> Error {
    Error::from_http_status(502, "bad gateway")
}

#[tokio::test(start_paused = true)]
async fn test_two_failures_then_success_waits_three_seconds() {
    let events = Arc::new(InMemoryEventSink::new(64));
    let executor = RetryingExecutor::new(roomy_limiter())
        .with_policy(policy(5))
        .with_event_sink(events.clone());

    let calls = AtomicU32::new(0);
    let outcome = executor
        .execute(CallOptions::new("chat"), |_| async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(server_error())
            } else {
                Ok(format!("attempt {}", n))
            }
        })
        .await
        .unwrap();

    assert_eq!(outcome.value, "attempt 3");
    assert_eq!(outcome.served_by, ServedBy::Primary);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.elapsed, Duration::from_secs(3));
    assert_eq!(
        events.names(),
        vec![
            "initiated",
            "retry_scheduled",
            "initiated",
            "retry_scheduled",
            "initiated",
            "succeeded"
        ]
    );

    let delays: Vec<Duration> = events
        .events()
        .into_iter()
        .filter_map(|e| match e.kind {
            ApiEventKind::RetryScheduled { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_serves_cached_value() {
    let cache = Arc::new(MultiLevelCache::new(CacheConfig::new()).unwrap());
    let key = CacheKey::new("chat:previous");
    cache
        .set(&key, &"cached answer".to_string(), None, CacheLevel::All)
        .await
        .unwrap();

    let events = Arc::new(InMemoryEventSink::new(64));
    let executor = RetryingExecutor::new(roomy_limiter())
        .with_cache(cache)
        .with_policy(policy(2))
        .with_event_sink(events.clone());

    let calls = AtomicU32::new(0);
    let outcome = executor
        .execute(
            CallOptions::new("chat").with_cache_key(key.clone()),
            |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(server_error())
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.value, "cached answer");
    assert_eq!(outcome.served_by, ServedBy::Cache);
    assert!(!outcome.is_fresh());
    assert_eq!(outcome.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(events.events().iter().any(|e| e.kind
        == ApiEventKind::CacheFallbackUsed {
            key: key.as_str().to_string()
        }));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_without_fallback_fails_after_max_attempts() {
    let events = Arc::new(InMemoryEventSink::new(64));
    let executor = RetryingExecutor::new(roomy_limiter())
        .with_policy(policy(3))
        .with_event_sink(events.clone());

    let calls = AtomicU32::new(0);
    let err = executor
        .execute(CallOptions::new("chat"), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(Error::Timeout(Duration::from_secs(30)))
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    match err {
        Error::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 4);
            assert!(matches!(*source, Error::Timeout(_)));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(events.names().last(), Some(&"failed"));
}

#[tokio::test(start_paused = true)]
async fn test_cache_miss_falls_through_to_provider() {
    let cache = Arc::new(MultiLevelCache::new(CacheConfig::new()).unwrap());
    let events = Arc::new(InMemoryEventSink::new(64));
    let executor = RetryingExecutor::new(roomy_limiter())
        .with_cache(cache)
        .with_policy(policy(1))
        .with_primary_provider("openai")
        .with_fallback_provider("backup")
        .with_event_sink(events.clone());

    let seen = Mutex::new(Vec::new());
    let outcome = executor
        .execute(
            CallOptions::new("chat").with_cache_key(CacheKey::new("chat:missing")),
            |provider| {
                seen.lock().unwrap().push(provider.clone());
                async move {
                    if provider == "backup" {
                        Ok("from backup".to_string())
                    } else {
                        Err(server_error())
                    }
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.value, "from backup");
    assert_eq!(outcome.served_by, ServedBy::Fallback("backup".to_string()));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["openai".to_string(), "openai".to_string(), "backup".to_string()]
    );
    assert!(events
        .names()
        .contains(&"provider_fallback_triggered"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_fallback_reports_both_errors() {
    let executor = RetryingExecutor::new(roomy_limiter())
        .with_policy(policy(1))
        .with_fallback_provider("backup");

    let err = executor
        .execute(CallOptions::new("chat"), |provider| async move {
            if provider == "backup" {
                Err::<String, _>(Error::remote(ErrorClass::Overloaded, "backup busy"))
            } else {
                Err(server_error())
            }
        })
        .await
        .unwrap_err();

    match err {
        Error::FallbacksExhausted {
            attempts,
            source,
            fallback_error,
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(source.class(), ErrorClass::ServerError);
            assert_eq!(
                fallback_error.map(|e| e.class()),
                Some(ErrorClass::Overloaded)
            );
        }
        other => panic!("expected FallbacksExhausted, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_provider_fallback_can_be_disabled_per_call() {
    let executor = RetryingExecutor::new(roomy_limiter())
        .with_policy(policy(0))
        .with_fallback_provider("backup");

    let calls = AtomicU32::new(0);
    let err = executor
        .execute(
            CallOptions::new("chat").allow_provider_fallback(false),
            |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(server_error())
            },
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, Error::RetriesExhausted { attempts: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_authentication_error_skips_retries_and_fallbacks() {
    let cache = Arc::new(MultiLevelCache::new(CacheConfig::new()).unwrap());
    let key = CacheKey::new("chat:auth");
    cache.set(&key, &1u32, None, CacheLevel::All).await.unwrap();

    let executor = RetryingExecutor::new(roomy_limiter())
        .with_cache(cache)
        .with_policy(policy(5))
        .with_fallback_provider("backup");

    let calls = AtomicU32::new(0);
    let err = executor
        .execute(CallOptions::new("chat").with_cache_key(key), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(Error::from_http_status(401, "bad key"))
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.class(), ErrorClass::Authentication);
    assert!(!err.is_exhausted());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_hint_blocks_shared_limiter() {
    let limiter = roomy_limiter();
    let executor = RetryingExecutor::new(limiter.clone()).with_policy(policy(0));

    let err = executor
        .execute(CallOptions::new("chat"), |_| async {
            Err::<String, _>(
                Error::from_http_status(429, "slow down").with_retry_after(Duration::from_secs(20)),
            )
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 1, .. }));

    // Other requests sharing the limiter now wait out the provider's pause.
    assert_eq!(limiter.estimated_wait().await, Duration::from_secs(20));
    assert!(!limiter.try_admit().await);
}
