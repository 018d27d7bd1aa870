use crate::{Error, ErrorContext, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterSnapshot {
    pub max_requests: usize,
    pub window: Duration,
    /// Admissions recorded within the trailing window.
    pub in_window: usize,
    /// Time until the next admission would succeed; zero when one is available now.
    pub estimated_wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Maximum admissions per window.
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimiterConfig {
    /// Create a new config with default values (5 requests per minute)
    pub fn new() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(60),
        }
    }

    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::configuration_with_context(
                "max_requests must be positive",
                ErrorContext::new()
                    .with_field_path("rate_limit.max_requests")
                    .with_details("got 0")
                    .with_source("rate_limiter"),
            ));
        }
        if self.window.is_zero() {
            return Err(Error::configuration_with_context(
                "time window must be positive",
                ErrorContext::new()
                    .with_field_path("rate_limit.time_window_secs")
                    .with_details("got 0")
                    .with_source("rate_limiter"),
            ));
        }
        Ok(())
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct State {
    /// Admission timestamps, oldest first.
    admissions: VecDeque<Instant>,
    /// Provider-signalled pause (e.g. a `Retry-After` on a 429).
    blocked_until: Option<Instant>,
}

/// Sliding-window rate limiter shared by every request in the process.
///
/// - At most `max_requests` admissions fall within any trailing `window`
/// - Check-and-record happens under one lock; waiting happens outside it
/// - An admission is consumed when granted and never refunded
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Result<Self> {
        cfg.validate()?;
        let state = Mutex::new(State {
            admissions: VecDeque::with_capacity(cfg.max_requests),
            blocked_until: None,
        });
        Ok(Self { cfg, state })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn prune_locked(cfg: &RateLimiterConfig, st: &mut State, now: Instant) {
        while let Some(&oldest) = st.admissions.front() {
            if now.saturating_duration_since(oldest) >= cfg.window {
                st.admissions.pop_front();
            } else {
                break;
            }
        }
        if matches!(st.blocked_until, Some(until) if until <= now) {
            st.blocked_until = None;
        }
    }

    fn wait_locked(cfg: &RateLimiterConfig, st: &State, now: Instant) -> Duration {
        let blocked = st
            .blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        let window = if st.admissions.len() < cfg.max_requests {
            Duration::ZERO
        } else {
            st.admissions
                .front()
                .map(|&oldest| (oldest + cfg.window).saturating_duration_since(now))
                .unwrap_or_default()
        };
        blocked.max(window)
    }

    /// Admit one request now if the window has room.
    pub async fn try_admit(&self) -> bool {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        Self::prune_locked(&self.cfg, &mut st, now);
        if Self::wait_locked(&self.cfg, &st, now).is_zero() {
            st.admissions.push_back(now);
            true
        } else {
            false
        }
    }

    /// Wait (without spinning) until an admission is granted.
    pub async fn wait_for_admission(&self) {
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                Self::prune_locked(&self.cfg, &mut st, now);
                let wait = Self::wait_locked(&self.cfg, &st, now);
                if wait.is_zero() {
                    st.admissions.push_back(now);
                    return;
                }
                wait
            };

            debug!(
                wait_ms = wait.as_millis() as u64,
                max_requests = self.cfg.max_requests,
                "rate limit reached, waiting for admission"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// How long until the next admission would succeed, without recording one.
    pub async fn estimated_wait(&self) -> Duration {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        Self::prune_locked(&self.cfg, &mut st, now);
        Self::wait_locked(&self.cfg, &st, now)
    }

    /// Refuse admissions until `duration` from now has elapsed.
    ///
    /// An existing longer block is kept.
    pub async fn block_for(&self, duration: Duration) {
        let mut st = self.state.lock().await;
        let until = Instant::now() + duration;
        if st.blocked_until.map(|cur| until > cur).unwrap_or(true) {
            info!(
                block_ms = duration.as_millis() as u64,
                "rate limiter blocked by provider signal"
            );
            st.blocked_until = Some(until);
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        Self::prune_locked(&self.cfg, &mut st, now);
        RateLimiterSnapshot {
            max_requests: self.cfg.max_requests,
            window: self.cfg.window,
            in_window: st.admissions.len(),
            estimated_wait: Self::wait_locked(&self.cfg, &st, now),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("cfg", &self.cfg).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, secs: u64) -> RateLimiter {
        RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_requests(max)
                .with_window(Duration::from_secs(secs)),
        )
        .unwrap()
    }

    #[test]
    fn test_rate_limiter_config_defaults() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.max_requests, 5);
        assert_eq!(config.window, Duration::from_secs(60));
    }

    #[test]
    fn test_rate_limiter_config_invalid() {
        assert!(RateLimiter::new(RateLimiterConfig::new().with_max_requests(0)).is_err());
        assert!(RateLimiter::new(RateLimiterConfig::new().with_window(Duration::ZERO)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_try_admit() {
        let limiter = limiter(3, 10);
        assert!(limiter.try_admit().await);
        assert!(limiter.try_admit().await);
        assert!(limiter.try_admit().await);

        // Fourth is refused until the oldest admission leaves the window
        assert!(!limiter.try_admit().await);
        assert_eq!(limiter.estimated_wait().await, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.try_admit().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_wait_for_admission() {
        let limiter = limiter(2, 5);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.wait_for_admission().await;
        }
        // two admitted immediately, two more after the window rolls over
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_snapshot() {
        let limiter = limiter(2, 60);
        limiter.try_admit().await;
        let snapshot = limiter.snapshot().await;
        assert_eq!(snapshot.in_window, 1);
        assert_eq!(snapshot.max_requests, 2);
        assert!(snapshot.estimated_wait.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_block_for() {
        let limiter = limiter(10, 60);
        limiter.block_for(Duration::from_secs(3)).await;
        assert!(!limiter.try_admit().await);
        assert_eq!(limiter.estimated_wait().await, Duration::from_secs(3));

        // a shorter block does not shorten the existing one
        limiter.block_for(Duration::from_secs(1)).await;
        assert_eq!(limiter.estimated_wait().await, Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(limiter.try_admit().await);
    }
}
