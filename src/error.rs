use crate::error_code::ErrorClass;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "retry.backoff_factor")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_loader", "cache_level")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the request pipeline.
///
/// Remote operations supplied by callers report failures as [`Error::Remote`]
/// (or [`Error::Timeout`]); the executor classifies them and either retries,
/// falls back, or surfaces one of the terminal variants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Remote error ({class}){}: {message}", format_status(.status))]
    Remote {
        class: ErrorClass,
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Prompt does not fit the token budget: {required} tokens required, {budget} available")]
    BudgetExceeded { required: usize, budget: usize },

    #[error("Max retries exceeded after {attempts} attempt(s), no fallback available. Last error: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("All retries and fallbacks failed after {attempts} attempt(s). Last error: {source}{}", format_fallback(.fallback_error))]
    FallbacksExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
        fallback_error: Option<Box<Error>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" HTTP {}", s)).unwrap_or_default()
}

fn format_fallback(err: &Option<Box<Error>>) -> String {
    match err {
        Some(e) => format!("; fallback provider error: {}", e),
        None => String::new(),
    }
}

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::validation_with_context(msg, ErrorContext::new())
    }

    /// Remote failure of the given class, as reported by a provider call.
    pub fn remote(class: ErrorClass, msg: impl Into<String>) -> Self {
        Error::Remote {
            class,
            status: None,
            message: msg.into(),
            retry_after: None,
        }
    }

    /// Remote failure derived from an HTTP status code.
    pub fn from_http_status(status: u16, msg: impl Into<String>) -> Self {
        Error::Remote {
            class: ErrorClass::from_http_status(status),
            status: Some(status),
            message: msg.into(),
            retry_after: None,
        }
    }

    /// Attach a provider `Retry-After` hint. No-op for non-remote errors.
    pub fn with_retry_after(mut self, after: Duration) -> Self {
        if let Error::Remote {
            ref mut retry_after,
            ..
        } = self
        {
            *retry_after = Some(after);
        }
        self
    }

    /// Canonical class used by retry classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Remote { class, .. } => *class,
            Error::Timeout(_) => ErrorClass::Timeout,
            Error::Cancelled => ErrorClass::Cancelled,
            Error::Configuration { .. } | Error::Validation { .. } => ErrorClass::InvalidRequest,
            Error::BudgetExceeded { .. } => ErrorClass::RequestTooLarge,
            _ => ErrorClass::Unknown,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Remote { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True for the terminal errors the executor raises once every path is exhausted.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Error::RetriesExhausted { .. } | Error::FallbacksExhausted { .. }
        )
    }

    /// Attempt count carried by a terminal exhaustion error.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::RetriesExhausted { attempts, .. } | Error::FallbacksExhausted { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Validation { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_rendered() {
        let err = Error::configuration_with_context(
            "max_requests must be positive",
            ErrorContext::new()
                .with_field_path("rate_limit.max_requests")
                .with_source("config"),
        );
        let msg = err.to_string();
        assert!(msg.contains("field: rate_limit.max_requests"));
        assert!(msg.contains("source: config"));
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(Error::from_http_status(429, "slow down").class(), ErrorClass::RateLimited);
        assert_eq!(Error::from_http_status(401, "bad key").class(), ErrorClass::Authentication);
        assert_eq!(Error::Timeout(Duration::from_secs(3)).class(), ErrorClass::Timeout);
    }

    #[test]
    fn test_exhaustion_carries_cause() {
        let err = Error::RetriesExhausted {
            attempts: 6,
            source: Box::new(Error::remote(ErrorClass::ServerError, "boom")),
        };
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), Some(6));
        assert!(err.to_string().contains("boom"));
    }
}
