//! 管线配置：内置默认值 → YAML 文件 → `LLM_RELAY_*` 环境变量，构造时校验。
//!
//! Pipeline configuration.
//!
//! Sources, lowest to highest precedence:
//!
//! 1. built-in defaults
//! 2. a YAML file (`--config`, or `<config dir>/llm-relay/config.yaml` when present)
//! 3. `LLM_RELAY_*` environment variables
//!
//! Every section deserializes with defaults, so a file only needs the keys it
//! changes:
//!
//! ```yaml
//! rate_limit:
//!   max_requests: 20
//! retry:
//!   max_retries: 3
//!   non_retryable: [authentication, invalid_request]
//! providers:
//!   fallback: backup
//! ```

use crate::cache::CacheConfig;
use crate::resilience::{ErrorClassifier, RateLimiterConfig, RetryPolicy};
use crate::tokens::TokenBudget;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const ENV_PREFIX: &str = "LLM_RELAY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_requests: usize,
    pub time_window_secs: f64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: 5,
            time_window_secs: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_backoff_secs: f64,
    pub backoff_factor: f64,
    pub max_backoff_secs: f64,
    /// Error class names; empty keeps the built-in set.
    pub retryable: Vec<String>,
    pub non_retryable: Vec<String>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_secs: 1.0,
            backoff_factor: 2.0,
            max_backoff_secs: 60.0,
            retryable: Vec::new(),
            non_retryable: Vec::new(),
        }
    }
}

fn default_l2_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("llm-relay").join("l2"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub l1_max_items: usize,
    pub l1_ttl_secs: u64,
    pub l2_enabled: bool,
    pub l2_ttl_secs: u64,
    pub l2_dir: Option<PathBuf>,
    pub l3_enabled: bool,
    pub l3_ttl_secs: u64,
    pub l3_similarity_threshold: f32,
    pub key_prefix: Option<String>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_max_items: 100,
            l1_ttl_secs: 900,
            l2_enabled: true,
            l2_ttl_secs: 86_400,
            l2_dir: default_l2_dir(),
            l3_enabled: false,
            l3_ttl_secs: 604_800,
            l3_similarity_threshold: 0.92,
            key_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSection {
    pub target_chunk_tokens: usize,
    pub chunk_overlap_tokens: usize,
    /// Chunk requests in flight at once.
    pub max_concurrency: usize,
}

impl Default for ChunkingSection {
    fn default() -> Self {
        Self {
            target_chunk_tokens: 4000,
            chunk_overlap_tokens: 100,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub model_context_window: usize,
    pub response_reserve_tokens: usize,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            model_context_window: 8192,
            response_reserve_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersSection {
    pub primary: String,
    pub fallback: Option<String>,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            primary: "primary".to_string(),
            fallback: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub rate_limit: RateLimitSection,
    pub retry: RetrySection,
    pub cache: CacheSection,
    pub chunking: ChunkingSection,
    pub budget: BudgetSection,
    pub providers: ProvidersSection,
    /// `cl100k_base` or `approximate`.
    pub tokenizer: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitSection::default(),
            retry: RetrySection::default(),
            cache: CacheSection::default(),
            chunking: ChunkingSection::default(),
            budget: BudgetSection::default(),
            providers: ProvidersSection::default(),
            tokenizer: "cl100k_base".to_string(),
        }
    }
}

fn config_error(field: &str, msg: impl Into<String>, details: impl Into<String>) -> Error {
    Error::configuration_with_context(
        msg,
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("pipeline_config"),
    )
}

fn parse_env<T: FromStr>(var: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        Error::configuration_with_context(
            format!("unparseable value for {}", var),
            ErrorContext::new()
                .with_field_path(var)
                .with_details(format!("got '{}'", raw))
                .with_source("environment"),
        )
    })
}

fn parse_env_bool(var: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration_with_context(
            format!("unparseable value for {}", var),
            ErrorContext::new()
                .with_field_path(var)
                .with_details(format!("expected a boolean, got '{}'", raw))
                .with_source("environment"),
        )),
    }
}

fn secs(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| config_error(field, "invalid duration", format!("{}: {}", value, e)))
}

impl PipelineConfig {
    /// `<config dir>/llm-relay/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("llm-relay").join("config.yaml"))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            config_error(
                "config",
                format!("cannot read config file {}", path.display()),
                e.to_string(),
            )
        })?;
        Self::from_yaml_str(&content)
    }

    /// Load from every source and validate.
    ///
    /// An explicit `path` must exist; the default path is used only if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                info!(path = %p.display(), "loading configuration");
                Self::from_yaml_file(p)?
            }
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(p) => {
                    info!(path = %p.display(), "loading configuration");
                    Self::from_yaml_file(&p)?
                }
                None => {
                    debug!("no configuration file, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LLM_RELAY_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply `LLM_RELAY_*` overrides from `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let var = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&var).map(|raw| (var, raw))
        };

        if let Some((var, raw)) = get("MAX_REQUESTS") {
            self.rate_limit.max_requests = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("TIME_WINDOW_SECS") {
            self.rate_limit.time_window_secs = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("MAX_RETRIES") {
            self.retry.max_retries = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("INITIAL_BACKOFF_SECS") {
            self.retry.initial_backoff_secs = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("BACKOFF_FACTOR") {
            self.retry.backoff_factor = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("MAX_BACKOFF_SECS") {
            self.retry.max_backoff_secs = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("CACHE_ENABLED") {
            self.cache.enabled = parse_env_bool(&var, &raw)?;
        }
        if let Some((var, raw)) = get("L1_MAX_ITEMS") {
            self.cache.l1_max_items = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("L1_TTL_SECS") {
            self.cache.l1_ttl_secs = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("L2_ENABLED") {
            self.cache.l2_enabled = parse_env_bool(&var, &raw)?;
        }
        if let Some((var, raw)) = get("L2_TTL_SECS") {
            self.cache.l2_ttl_secs = parse_env(&var, &raw)?;
        }
        if let Some((_, raw)) = get("L2_DIR") {
            self.cache.l2_dir = Some(PathBuf::from(raw));
        }
        if let Some((var, raw)) = get("L3_ENABLED") {
            self.cache.l3_enabled = parse_env_bool(&var, &raw)?;
        }
        if let Some((_, raw)) = get("CACHE_KEY_PREFIX") {
            self.cache.key_prefix = Some(raw);
        }
        if let Some((var, raw)) = get("TARGET_CHUNK_TOKENS") {
            self.chunking.target_chunk_tokens = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("CHUNK_OVERLAP_TOKENS") {
            self.chunking.chunk_overlap_tokens = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("MAX_CONCURRENCY") {
            self.chunking.max_concurrency = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("MODEL_CONTEXT_WINDOW") {
            self.budget.model_context_window = parse_env(&var, &raw)?;
        }
        if let Some((var, raw)) = get("RESPONSE_RESERVE_TOKENS") {
            self.budget.response_reserve_tokens = parse_env(&var, &raw)?;
        }
        if let Some((_, raw)) = get("PRIMARY_PROVIDER") {
            self.providers.primary = raw;
        }
        if let Some((_, raw)) = get("FALLBACK_PROVIDER") {
            self.providers.fallback = Some(raw).filter(|s| !s.trim().is_empty());
        }
        if let Some((_, raw)) = get("TOKENIZER") {
            self.tokenizer = raw;
        }
        Ok(())
    }

    /// Fail fast on values no component could honour.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiter_config()?.validate()?;
        self.retry_policy()?.validate()?;
        self.classifier()?;

        if self.retry.initial_backoff_secs < 0.0 {
            return Err(config_error(
                "retry.initial_backoff_secs",
                "initial backoff must not be negative",
                format!("got {}", self.retry.initial_backoff_secs),
            ));
        }
        let c = &self.cache;
        if c.l1_max_items == 0 {
            return Err(config_error("cache.l1_max_items", "L1 capacity must be positive", "got 0"));
        }
        for (field, ttl) in [
            ("cache.l1_ttl_secs", c.l1_ttl_secs),
            ("cache.l2_ttl_secs", c.l2_ttl_secs),
            ("cache.l3_ttl_secs", c.l3_ttl_secs),
        ] {
            if ttl == 0 {
                return Err(config_error(field, "cache TTL must be positive", "got 0"));
            }
        }
        if !(0.0..=1.0).contains(&c.l3_similarity_threshold) {
            return Err(config_error(
                "cache.l3_similarity_threshold",
                "similarity threshold must lie in [0, 1]",
                format!("got {}", c.l3_similarity_threshold),
            ));
        }

        let ch = &self.chunking;
        if ch.target_chunk_tokens == 0 {
            return Err(config_error(
                "chunking.target_chunk_tokens",
                "chunk size must be positive",
                "got 0",
            ));
        }
        if ch.chunk_overlap_tokens >= ch.target_chunk_tokens {
            return Err(config_error(
                "chunking.chunk_overlap_tokens",
                "chunk overlap must be smaller than the chunk size",
                format!(
                    "overlap {}, size {}",
                    ch.chunk_overlap_tokens, ch.target_chunk_tokens
                ),
            ));
        }
        if ch.max_concurrency == 0 {
            return Err(config_error(
                "chunking.max_concurrency",
                "concurrency must be positive",
                "got 0",
            ));
        }

        if self.budget.response_reserve_tokens >= self.budget.model_context_window {
            return Err(config_error(
                "budget.response_reserve_tokens",
                "response reserve must leave room for the prompt",
                format!(
                    "reserve {}, context window {}",
                    self.budget.response_reserve_tokens, self.budget.model_context_window
                ),
            ));
        }
        if self.providers.primary.trim().is_empty() {
            return Err(config_error("providers.primary", "primary provider name is empty", ""));
        }
        Ok(())
    }

    pub fn rate_limiter_config(&self) -> Result<RateLimiterConfig> {
        if !(self.rate_limit.time_window_secs > 0.0) {
            return Err(config_error(
                "rate_limit.time_window_secs",
                "time window must be positive",
                format!("got {}", self.rate_limit.time_window_secs),
            ));
        }
        Ok(RateLimiterConfig::new()
            .with_max_requests(self.rate_limit.max_requests)
            .with_window(secs(
                "rate_limit.time_window_secs",
                self.rate_limit.time_window_secs,
            )?))
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let r = &self.retry;
        Ok(RetryPolicy::new()
            .with_max_retries(r.max_retries)
            .with_initial_backoff(secs("retry.initial_backoff_secs", r.initial_backoff_secs)?)
            .with_backoff_factor(r.backoff_factor)
            .with_max_backoff(secs("retry.max_backoff_secs", r.max_backoff_secs)?))
    }

    pub fn classifier(&self) -> Result<ErrorClassifier> {
        ErrorClassifier::from_names(&self.retry.retryable, &self.retry.non_retryable)
    }

    pub fn cache_config(&self) -> CacheConfig {
        let c = &self.cache;
        let mut config = CacheConfig::new()
            .with_enabled(c.enabled)
            .with_l1(c.l1_max_items, Duration::from_secs(c.l1_ttl_secs))
            .with_l2_ttl(Duration::from_secs(c.l2_ttl_secs));
        if c.l2_enabled {
            if let Some(ref dir) = c.l2_dir {
                config = config.with_l2_dir(dir);
            }
        }
        if c.l3_enabled {
            config = config.with_l3(Duration::from_secs(c.l3_ttl_secs), c.l3_similarity_threshold);
        }
        config
    }

    pub fn token_budget(&self) -> TokenBudget {
        TokenBudget::new(
            self.budget.model_context_window,
            self.budget.response_reserve_tokens,
        )
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.cache.l1_ttl_secs, 900);
        assert_eq!(config.token_budget().available(), 8192 - 1024);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = PipelineConfig::from_yaml_str(
            "rate_limit:\n  max_requests: 20\nproviders:\n  fallback: backup\n",
        )
        .unwrap();
        assert_eq!(config.rate_limit.max_requests, 20);
        assert_eq!(config.rate_limit.time_window_secs, 60.0);
        assert_eq!(config.providers.fallback.as_deref(), Some("backup"));
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_env_overrides_yaml() {
        let mut config = PipelineConfig::from_yaml_str("retry:\n  max_retries: 2\n").unwrap();
        config
            .apply_env_from(env(&[
                ("LLM_RELAY_MAX_RETRIES", "7"),
                ("LLM_RELAY_L3_ENABLED", "true"),
                ("LLM_RELAY_L2_DIR", "/tmp/relay-l2"),
            ]))
            .unwrap();
        assert_eq!(config.retry.max_retries, 7);
        assert!(config.cache.l3_enabled);
        assert_eq!(config.cache.l2_dir, Some(PathBuf::from("/tmp/relay-l2")));
    }

    #[test]
    fn test_unparseable_env_is_error() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env_from(env(&[("LLM_RELAY_MAX_REQUESTS", "many")]))
            .unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("LLM_RELAY_MAX_REQUESTS")
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut c = PipelineConfig::default();
        c.rate_limit.max_requests = 0;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.rate_limit.time_window_secs = -1.0;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.retry.backoff_factor = 0.5;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.retry.initial_backoff_secs = -1.0;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.cache.l2_ttl_secs = 0;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.budget.response_reserve_tokens = 9000;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.retry.retryable = vec!["sometimes".into()];
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.chunking.chunk_overlap_tokens = 4000;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_cache_config_respects_l2_toggle() {
        let mut c = PipelineConfig::default();
        c.cache.l2_dir = Some(PathBuf::from("/tmp/x"));
        assert!(c.cache_config().l2_dir.is_some());
        c.cache.l2_enabled = false;
        assert!(c.cache_config().l2_dir.is_none());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = PipelineConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(PipelineConfig::from_yaml_str(&yaml).unwrap(), config);
    }
}
