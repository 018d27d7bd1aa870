//! API 调用事件：执行器在每个状态转换时发出的结构化事件及其接收端。
//!
//! Events emitted by the retrying executor as a logical call moves through
//! admission, calling, retry and fallback.
//!
//! The CLI surface renders these as status lines ("deferred 12s", "retrying
//! in 2s"); tests record them with [`InMemoryEventSink`].

use crate::error_code::ErrorClass;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiEventKind {
    /// Admission is not immediately available; the call will wait.
    Deferred { wait: Duration },
    Initiated { attempt: u32 },
    Succeeded { latency: Duration },
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        class: ErrorClass,
    },
    Failed { class: ErrorClass, message: String },
    CacheFallbackUsed { key: String },
    ProviderFallbackTriggered {
        reason: String,
        fallback_provider: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEvent {
    pub provider: String,
    pub endpoint: String,
    pub kind: ApiEventKind,
    pub timestamp: f64,
}

impl ApiEvent {
    pub fn new(provider: impl Into<String>, endpoint: impl Into<String>, kind: ApiEventKind) -> Self {
        Self {
            provider: provider.into(),
            endpoint: endpoint.into(),
            kind,
            timestamp: timestamp(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            ApiEventKind::Deferred { .. } => "deferred",
            ApiEventKind::Initiated { .. } => "initiated",
            ApiEventKind::Succeeded { .. } => "succeeded",
            ApiEventKind::RetryScheduled { .. } => "retry_scheduled",
            ApiEventKind::Failed { .. } => "failed",
            ApiEventKind::CacheFallbackUsed { .. } => "cache_fallback_used",
            ApiEventKind::ProviderFallbackTriggered { .. } => "provider_fallback_triggered",
        }
    }

    /// One-line human rendering, e.g. `retrying in 2s (E3001 server_error, server)`.
    pub fn status_line(&self) -> String {
        let status = match &self.kind {
            ApiEventKind::Deferred { wait } => format!("deferred {}s", wait.as_secs()),
            ApiEventKind::Initiated { attempt } => format!("attempt {}", attempt + 1),
            ApiEventKind::Succeeded { latency } => format!("done in {}ms", latency.as_millis()),
            ApiEventKind::RetryScheduled { delay, class, .. } => format!(
                "retrying in {}s ({} {}, {})",
                delay.as_secs(),
                class.code(),
                class.name(),
                class.category()
            ),
            ApiEventKind::Failed { class, message } => format!(
                "failed ({} {}, {}): {}",
                class.code(),
                class.name(),
                class.category(),
                message
            ),
            ApiEventKind::CacheFallbackUsed { .. } => "served from cache".to_string(),
            ApiEventKind::ProviderFallbackTriggered {
                fallback_provider, ..
            } => format!("falling back to {}", fallback_provider),
        };
        format!("[{}/{}] {}", self.provider, self.endpoint, status)
    }
}

/// Event sink trait.
///
/// Emission is fire-and-forget: a sink must not fail the call it observes.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ApiEvent);
}

/// No-op sink (the default).
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _: ApiEvent) {}
}

/// Returns a no-op event sink.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopEventSink)
}

/// In-memory sink for testing. Keeps at most `max_events`, dropping the oldest.
pub struct InMemoryEventSink {
    events: Mutex<Vec<ApiEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            max_events: max,
        }
    }

    pub fn events(&self) -> Vec<ApiEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Event names in emission order, e.g. `["initiated", "succeeded"]`.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(ApiEvent::name).collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn emit(&self, event: ApiEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
    }
}

/// Logs every event through `tracing`.
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: ApiEvent) {
        let provider = event.provider.as_str();
        let endpoint = event.endpoint.as_str();
        match &event.kind {
            ApiEventKind::Deferred { wait } => info!(
                provider,
                endpoint,
                wait_ms = wait.as_millis() as u64,
                "request deferred by rate limiter"
            ),
            ApiEventKind::Initiated { attempt } => {
                info!(provider, endpoint, attempt, "request initiated")
            }
            ApiEventKind::Succeeded { latency } => info!(
                provider,
                endpoint,
                latency_ms = latency.as_millis() as u64,
                "request succeeded"
            ),
            ApiEventKind::RetryScheduled {
                attempt,
                delay,
                class,
            } => warn!(
                provider,
                endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error_class = class.name(),
                error_code = class.code(),
                error_category = class.category(),
                "retry scheduled"
            ),
            ApiEventKind::Failed { class, message } => warn!(
                provider,
                endpoint,
                error_class = class.name(),
                error_code = class.code(),
                error_category = class.category(),
                error = message.as_str(),
                "request failed"
            ),
            ApiEventKind::CacheFallbackUsed { key } => {
                info!(provider, endpoint, key = key.as_str(), "served from cache fallback")
            }
            ApiEventKind::ProviderFallbackTriggered {
                reason,
                fallback_provider,
            } => warn!(
                provider,
                endpoint,
                fallback_provider = fallback_provider.as_str(),
                reason = reason.as_str(),
                "provider fallback triggered"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_sink_caps_events() {
        let sink = InMemoryEventSink::new(2);
        for attempt in 0..3 {
            sink.emit(ApiEvent::new("p", "chat", ApiEventKind::Initiated { attempt }))
                .await;
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ApiEventKind::Initiated { attempt: 1 });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ApiEvent::new(
            "p",
            "chat",
            ApiEventKind::CacheFallbackUsed { key: "k".into() },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["type"], "cache_fallback_used");
        assert_eq!(event.name(), "cache_fallback_used");
    }

    #[test]
    fn test_status_line_carries_code_and_category() {
        let retry = ApiEvent::new(
            "openai",
            "chat",
            ApiEventKind::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(2),
                class: ErrorClass::ServerError,
            },
        );
        assert_eq!(
            retry.status_line(),
            "[openai/chat] retrying in 2s (E3001 server_error, server)"
        );

        let failed = ApiEvent::new(
            "openai",
            "chat",
            ApiEventKind::Failed {
                class: ErrorClass::Authentication,
                message: "bad key".into(),
            },
        );
        assert_eq!(
            failed.status_line(),
            "[openai/chat] failed (E1002 authentication, client): bad key"
        );
    }
}
