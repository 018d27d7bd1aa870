//! Retryable / fatal classification of remote failures.

use crate::error_code::ErrorClass;
use crate::{Error, ErrorContext, Result};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Consumes an attempt and may be retried.
    Retryable,
    /// Propagates immediately: no retry, no fallback.
    Fatal,
}

/// Explicit two-set classifier.
///
/// Classes in neither set are unclassified: the first such failure within a
/// logical request is retried, any later one is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassifier {
    retryable: HashSet<ErrorClass>,
    non_retryable: HashSet<ErrorClass>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            retryable: ErrorClass::ALL
                .into_iter()
                .filter(ErrorClass::default_retryable)
                .collect(),
            non_retryable: ErrorClass::ALL
                .into_iter()
                .filter(ErrorClass::default_non_retryable)
                .collect(),
        }
    }

    /// Build from configured class names (e.g. `"rate_limited"`).
    ///
    /// Empty lists keep the defaults for that set. Unknown names and classes
    /// listed in both sets are configuration errors.
    pub fn from_names(retryable: &[String], non_retryable: &[String]) -> Result<Self> {
        let mut classifier = Self::new();
        if !retryable.is_empty() {
            classifier.retryable = parse_classes(retryable, "retry.retryable")?;
        }
        if !non_retryable.is_empty() {
            classifier.non_retryable = parse_classes(non_retryable, "retry.non_retryable")?;
        }
        if let Some(both) = classifier.retryable.intersection(&classifier.non_retryable).next() {
            return Err(Error::configuration_with_context(
                format!("error class '{}' is both retryable and non-retryable", both.name()),
                ErrorContext::new()
                    .with_field_path("retry")
                    .with_source("error_classifier"),
            ));
        }
        Ok(classifier)
    }

    pub fn with_retryable(mut self, class: ErrorClass) -> Self {
        self.non_retryable.remove(&class);
        self.retryable.insert(class);
        self
    }

    pub fn with_non_retryable(mut self, class: ErrorClass) -> Self {
        self.retryable.remove(&class);
        self.non_retryable.insert(class);
        self
    }

    /// True when `class` is in neither configured set.
    pub fn is_unclassified(&self, class: ErrorClass) -> bool {
        !self.retryable.contains(&class) && !self.non_retryable.contains(&class)
    }

    /// Classify `err`, given how many unclassified failures this request
    /// has already seen.
    pub fn classify(&self, err: &Error, unclassified_seen: u32) -> Verdict {
        if matches!(err, Error::Cancelled) {
            return Verdict::Fatal;
        }
        let class = err.class();
        if self.non_retryable.contains(&class) {
            Verdict::Fatal
        } else if self.retryable.contains(&class) || unclassified_seen == 0 {
            Verdict::Retryable
        } else {
            Verdict::Fatal
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_classes(names: &[String], field: &str) -> Result<HashSet<ErrorClass>> {
    names
        .iter()
        .map(|name| {
            ErrorClass::from_name(name.trim()).ok_or_else(|| {
                Error::configuration_with_context(
                    format!("unknown error class '{}'", name),
                    ErrorContext::new()
                        .with_field_path(field)
                        .with_details(format!(
                            "expected one of: {}",
                            ErrorClass::ALL.map(|c| c.name()).join(", ")
                        ))
                        .with_source("error_classifier"),
                )
            })
        })
        .collect()
}
