//! Configuration files feeding a working pipeline.

use llm_relay::config::PipelineConfig;
use llm_relay::resilience::CallOptions;
use llm_relay::{Error, Pipeline, ServedBy};
use std::io::Write;
use std::time::Duration;

fn write_config(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(
        r#"
rate_limit:
  max_requests: 12
  time_window_secs: 30
retry:
  max_retries: 2
  initial_backoff_secs: 0.5
  non_retryable: [authentication, invalid_request, not_found]
cache:
  l1_max_items: 8
  l2_enabled: false
chunking:
  target_chunk_tokens: 512
  chunk_overlap_tokens: 32
providers:
  primary: openai
  fallback: anthropic
tokenizer: approximate
"#,
    );

    let config = PipelineConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.rate_limit.max_requests, 12);
    assert_eq!(
        config.rate_limiter_config().unwrap().window,
        Duration::from_secs(30)
    );
    let policy = config.retry_policy().unwrap();
    assert_eq!(policy.max_retries, 2);
    assert_eq!(policy.initial_backoff, Duration::from_millis(500));
    assert_eq!(config.cache_config().l1_max_items, 8);
    assert!(config.cache_config().l2_dir.is_none());
    assert_eq!(config.providers.fallback.as_deref(), Some("anthropic"));
}

#[test]
fn test_missing_explicit_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = PipelineConfig::load(Some(&dir.path().join("absent.yaml"))).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn test_malformed_yaml_is_error() {
    let file = write_config("rate_limit: [not, a, map]\n");
    assert!(matches!(
        PipelineConfig::load(Some(file.path())),
        Err(Error::Yaml(_))
    ));
}

#[test]
fn test_invalid_values_fail_fast() {
    let file = write_config("rate_limit:\n  max_requests: 0\n");
    let err = PipelineConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("rate_limit.max_requests"));
}

#[tokio::test(start_paused = true)]
async fn test_configured_fallback_provider_is_used() {
    let file = write_config(
        "retry:\n  max_retries: 1\ncache:\n  l2_enabled: false\nproviders:\n  primary: main\n  fallback: spare\ntokenizer: approximate\n",
    );
    let pipeline = Pipeline::from_config(PipelineConfig::load(Some(file.path())).unwrap()).unwrap();

    let outcome = pipeline
        .run(CallOptions::new("chat"), |provider| async move {
            match provider.as_str() {
                "spare" => Ok(provider),
                _ => Err(Error::from_http_status(500, "boom")),
            }
        })
        .await
        .unwrap();

    assert_eq!(outcome.value, "spare");
    assert_eq!(outcome.served_by, ServedBy::Fallback("spare".to_string()));
}
