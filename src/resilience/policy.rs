use crate::{Error, ErrorContext, Result};
use std::time::Duration;

/// Retry budget and exponential backoff schedule.
///
/// Attempt `n` (0-based) that fails with a retryable error waits
/// `initial_backoff * backoff_factor^n`, capped at `max_backoff`, before
/// attempt `n + 1`. No wait follows the final attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a new policy with default values (5 retries, 1s doubling, 60s cap)
    pub fn new() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = d;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(Error::configuration_with_context(
                "backoff factor must be a finite number >= 1",
                ErrorContext::new()
                    .with_field_path("retry.backoff_factor")
                    .with_details(format!("got {}", self.backoff_factor))
                    .with_source("retry_policy"),
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(Error::configuration_with_context(
                "max backoff must not be smaller than the initial backoff",
                ErrorContext::new()
                    .with_field_path("retry.max_backoff_secs")
                    .with_details(format!(
                        "initial {:?}, max {:?}",
                        self.initial_backoff, self.max_backoff
                    ))
                    .with_source("retry_policy"),
            ));
        }
        Ok(())
    }

    /// Total attempts a request may make against the primary provider.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retrying after failed attempt `attempt` (0-based).
    ///
    /// A provider `retry_after` hint replaces the computed delay; both are
    /// capped by `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let chosen = retry_after.unwrap_or_else(|| {
            let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
            let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exp);
            if secs.is_finite() && secs < self.max_backoff.as_secs_f64() {
                Duration::from_secs_f64(secs)
            } else {
                self.max_backoff
            }
        });
        chosen.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_schedule() {
        let policy = RetryPolicy::new();
        let delays: Vec<_> = (0..4).map(|n| policy.backoff_delay(n, None)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new().with_max_backoff(Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(10, None), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(u32::MAX, None), Duration::from_secs(5));
        assert_eq!(
            policy.backoff_delay(0, Some(Duration::from_secs(30))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_retry_after_overrides() {
        let policy = RetryPolicy::new();
        assert_eq!(
            policy.backoff_delay(3, Some(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::new().validate().is_ok());
        assert!(RetryPolicy::new().with_backoff_factor(0.5).validate().is_err());
        assert!(RetryPolicy::new()
            .with_backoff_factor(f64::NAN)
            .validate()
            .is_err());
        assert!(RetryPolicy::new()
            .with_max_backoff(Duration::from_millis(10))
            .validate()
            .is_err());
    }
}
