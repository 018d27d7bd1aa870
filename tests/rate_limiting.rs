//! Sliding-window admission under concurrent callers.

use llm_relay::events::{ApiEventKind, InMemoryEventSink};
use llm_relay::resilience::{CallOptions, RateLimiter, RateLimiterConfig, RetryingExecutor};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn limiter(max_requests: usize, window_secs: u64) -> Arc<RateLimiter> {
    Arc::new(
        RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_requests(max_requests)
                .with_window(Duration::from_secs(window_secs)),
        )
        .unwrap(),
    )
}

#[test]
fn test_invalid_config_rejected() {
    assert!(RateLimiter::new(RateLimiterConfig::new().with_max_requests(0)).is_err());
    assert!(RateLimiter::new(RateLimiterConfig::new().with_window(Duration::ZERO)).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_waiters_never_exceed_window() {
    let limiter = limiter(3, 10);
    let origin = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.wait_for_admission().await;
            Instant::now()
        }));
    }

    let mut admitted = Vec::new();
    for h in handles {
        admitted.push(h.await.unwrap().duration_since(origin));
    }
    admitted.sort();

    // Any trailing 10 s interval holds at most 3 admissions.
    for (i, start) in admitted.iter().enumerate() {
        let in_window = admitted[i..]
            .iter()
            .take_while(|t| **t < *start + Duration::from_secs(10))
            .count();
        assert!(in_window <= 3, "{} admissions within 10s of {:?}", in_window, start);
    }

    // Batches of three at 0 s, 10 s, 20 s, then the last one at 30 s.
    assert_eq!(admitted.last().copied(), Some(Duration::from_secs(30)));
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_reflects_window() {
    let limiter = limiter(2, 60);
    assert!(limiter.try_admit().await);
    tokio::time::advance(Duration::from_secs(15)).await;
    assert!(limiter.try_admit().await);

    let snap = limiter.snapshot().await;
    assert_eq!(snap.in_window, 2);
    assert_eq!(snap.estimated_wait, Duration::from_secs(45));

    tokio::time::advance(Duration::from_secs(45)).await;
    let snap = limiter.snapshot().await;
    assert_eq!(snap.in_window, 1);
    assert_eq!(snap.estimated_wait, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_executor_reports_deferred_admission() {
    let limiter = limiter(1, 30);
    let events = Arc::new(InMemoryEventSink::new(64));
    let executor = RetryingExecutor::new(limiter.clone()).with_event_sink(events.clone());

    let start = Instant::now();
    for _ in 0..2 {
        executor
            .execute(CallOptions::new("chat"), |_| async { Ok(42u32) })
            .await
            .unwrap();
    }

    assert_eq!(start.elapsed(), Duration::from_secs(30));
    let deferred: Vec<Duration> = events
        .events()
        .into_iter()
        .filter_map(|e| match e.kind {
            ApiEventKind::Deferred { wait } => Some(wait),
            _ => None,
        })
        .collect();
    assert_eq!(deferred, vec![Duration::from_secs(30)]);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_limiter_delays_admission() {
    let limiter = limiter(5, 60);
    limiter.block_for(Duration::from_secs(12)).await;
    // A shorter block never shortens an existing one.
    limiter.block_for(Duration::from_secs(3)).await;

    let start = Instant::now();
    limiter.wait_for_admission().await;
    assert_eq!(start.elapsed(), Duration::from_secs(12));
}
