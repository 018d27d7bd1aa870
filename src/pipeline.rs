//! 请求管线门面：将 Token 估算、分块、对话截断、限流、重试与多级缓存组合为一个入口。
//!
//! # Request Pipeline
//!
//! [`Pipeline`] wires the components together the way a command-line
//! assistant uses them:
//!
//! 1. size the request with the [`TokenEstimator`]
//! 2. shape it: [`Pipeline::prepare_messages`] for conversations,
//!    [`Pipeline::run_chunked`] for long content
//! 3. look the request up in the [`MultiLevelCache`]
//! 4. send it through the [`RetryingExecutor`]
//! 5. write fresh results back to the cache
//!
//! ```rust
//! use llm_relay::config::PipelineConfig;
//! use llm_relay::pipeline::Pipeline;
//! use llm_relay::resilience::CallOptions;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let mut config = PipelineConfig::default();
//! config.tokenizer = "approximate".to_string();
//! config.cache.l2_enabled = false;
//!
//! let pipeline = Pipeline::from_config(config).unwrap();
//! let key = pipeline.key_generator().generate_for_text("hi", &json!({"model": "m"}));
//!
//! let first = pipeline
//!     .run(CallOptions::new("chat").with_cache_key(key.clone()), |_| async {
//!         Ok("hello".to_string())
//!     })
//!     .await
//!     .unwrap();
//! assert!(first.is_fresh());
//!
//! let second = pipeline
//!     .run(CallOptions::new("chat").with_cache_key(key), |_| async {
//!         Ok("never called".to_string())
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(second.value, "hello");
//! assert_eq!(second.attempts, 0);
//! # });
//! ```

use crate::cache::{fingerprint, CacheKey, CacheKeyGenerator, CacheLevel, MultiLevelCache};
use crate::config::PipelineConfig;
use crate::events::{noop_sink, EventSink};
use crate::optimize::{Chunk, Chunker, Chunks, PromptOptimizer};
use crate::resilience::{CallOptions, Outcome, RateLimiter, RetryingExecutor, ServedBy};
use crate::tokens::{TokenBudget, TokenCounter, TokenEstimator};
use crate::types::Message;
use crate::{Error, Result};
use futures::stream::{self, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_KEY_PREFIX: &str = "llm-relay";

/// Result for one chunk of a chunked request.
#[derive(Debug)]
pub struct ChunkResult<T> {
    pub index: usize,
    pub total: usize,
    pub result: Result<Outcome<T>>,
}

/// Per-chunk results, in chunk order regardless of completion order.
#[derive(Debug)]
pub struct ChunkedOutcome<T> {
    pub results: Vec<ChunkResult<T>>,
}

impl<T> ChunkedOutcome<T> {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// True when every chunk produced a value.
    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|r| r.result.is_ok())
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|r| r.result.is_err())
            .map(|r| r.index)
            .collect()
    }

    /// Successful values in chunk order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.results
            .iter()
            .filter_map(|r| r.result.as_ref().ok().map(|o| &o.value))
    }

    /// All values in order, or the first chunk error.
    pub fn into_values(self) -> Result<Vec<T>> {
        self.results
            .into_iter()
            .map(|r| r.result.map(|o| o.value))
            .collect()
    }
}

/// Builder for [`Pipeline`].
///
/// Anything not injected is derived from the [`PipelineConfig`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    estimator: Option<Arc<TokenEstimator>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    cache: Option<Arc<MultiLevelCache>>,
    events: Arc<dyn EventSink>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            estimator: None,
            rate_limiter: None,
            cache: None,
            events: noop_sink(),
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific estimator instead of resolving `config.tokenizer`.
    pub fn estimator(mut self, estimator: Arc<TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Share a limiter with other pipelines calling the same service.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn cache(mut self, cache: Arc<MultiLevelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Inject an event sink. Default is a no-op sink.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config.validate()?;

        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(TokenEstimator::from_name(&config.tokenizer)));
        let limiter = match self.rate_limiter {
            Some(l) => l,
            None => Arc::new(RateLimiter::new(config.rate_limiter_config()?)?),
        };
        let cache = match self.cache {
            Some(c) => c,
            None => Arc::new(MultiLevelCache::new(config.cache_config())?),
        };

        let mut executor = RetryingExecutor::new(limiter.clone())
            .with_cache(cache.clone())
            .with_policy(config.retry_policy()?)
            .with_classifier(config.classifier()?)
            .with_primary_provider(config.providers.primary.clone())
            .with_event_sink(self.events);
        if let Some(ref fallback) = config.providers.fallback {
            executor = executor.with_fallback_provider(fallback.clone());
        }

        let keys = CacheKeyGenerator::new(
            config
                .cache
                .key_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        );

        info!(
            tokenizer = estimator.tokenizer_name(),
            max_requests = config.rate_limit.max_requests,
            max_retries = config.retry.max_retries,
            cache_enabled = cache.is_enabled(),
            fallback = config.providers.fallback.as_deref().unwrap_or("none"),
            "pipeline initialized"
        );

        Ok(Pipeline {
            chunker: Chunker::new(estimator.clone()),
            optimizer: PromptOptimizer::new(estimator.clone()),
            budget: config.token_budget(),
            estimator,
            limiter,
            cache,
            executor,
            keys,
            config,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Single entry point over the request pipeline components.
pub struct Pipeline {
    config: PipelineConfig,
    estimator: Arc<TokenEstimator>,
    chunker: Chunker,
    optimizer: PromptOptimizer,
    budget: TokenBudget,
    limiter: Arc<RateLimiter>,
    cache: Arc<MultiLevelCache>,
    executor: RetryingExecutor,
    keys: CacheKeyGenerator,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        PipelineBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn estimator(&self) -> &Arc<TokenEstimator> {
        &self.estimator
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn optimizer(&self) -> &PromptOptimizer {
        &self.optimizer
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<MultiLevelCache> {
        &self.cache
    }

    pub fn executor(&self) -> &RetryingExecutor {
        &self.executor
    }

    pub fn key_generator(&self) -> &CacheKeyGenerator {
        &self.keys
    }

    pub fn estimate(&self, text: &str) -> usize {
        self.estimator.count(text)
    }

    /// Chunk `content` with the configured target and overlap.
    pub fn chunk(&self, content: &str) -> Chunks {
        self.chunker.chunk(
            content,
            self.config.chunking.target_chunk_tokens,
            self.config.chunking.chunk_overlap_tokens,
        )
    }

    /// Truncate `messages` to the prompt budget.
    ///
    /// Fails with [`Error::BudgetExceeded`] when nothing fits, typically a
    /// system message that alone exceeds the budget.
    pub fn prepare_messages(&self, messages: &[Message]) -> Result<Vec<Message>> {
        let available = self.budget.available();
        let prepared = self.optimizer.optimize(messages, available);
        if prepared.is_empty() && !messages.is_empty() {
            let pinned = match messages.first() {
                Some(m) if m.is_system() => &messages[..1],
                _ => messages,
            };
            return Err(Error::BudgetExceeded {
                required: self.estimator.count_messages(pinned),
                budget: available,
            });
        }
        if prepared.len() < messages.len() {
            debug!(
                kept = prepared.len(),
                dropped = messages.len() - prepared.len(),
                budget = available,
                "conversation truncated to budget"
            );
        }
        Ok(prepared)
    }

    /// Run `op` through the executor without a cache lookup or write-back.
    pub async fn execute<T, F, Fut>(&self, options: CallOptions, op: F) -> Result<Outcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.executor.execute(options, op).await
    }

    /// Serve from the cache when `options.cache_key` hits, otherwise run `op`
    /// through the executor and store a fresh result under that key.
    ///
    /// Cache failures on either side are logged and never fail the call.
    pub async fn run<T, F, Fut>(&self, options: CallOptions, op: F) -> Result<Outcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let started = Instant::now();
        let key = options.cache_key.clone();

        if let Some(ref key) = key {
            match self.cache.get::<T>(key, CacheLevel::All).await {
                Ok(Some(value)) => {
                    debug!(key = key.as_str(), endpoint = options.endpoint.as_str(), "served from cache");
                    return Ok(Outcome {
                        value,
                        served_by: ServedBy::CacheHit,
                        attempts: 0,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(key = key.as_str(), error = %e, "cache lookup failed"),
            }
        }

        let outcome = self.executor.execute(options, op).await?;

        if outcome.is_fresh() {
            if let Some(ref key) = key {
                if let Err(e) = self.cache.set(key, &outcome.value, None, CacheLevel::All).await {
                    warn!(key = key.as_str(), error = %e, "cache write-back failed");
                }
            }
        }
        Ok(outcome)
    }

    /// Key for one chunk: content fingerprint, request parameters and position.
    pub fn chunk_key(&self, content_fingerprint: &str, params: &Value, chunk: &Chunk) -> CacheKey {
        self.keys
            .generate(
                content_fingerprint,
                &json!({
                    "params": params,
                    "chunk": chunk.index,
                    "total": chunk.total,
                }),
            )
            .with_semantic_text(chunk.text.clone())
    }

    /// Chunk `content` and run `op` once per chunk, at most
    /// `chunking.max_concurrency` chunks in flight.
    ///
    /// Each chunk is cached and retried independently; one failing chunk does
    /// not cancel the others.
    pub async fn run_chunked<T, F, Fut>(
        &self,
        endpoint: &str,
        content: &str,
        params: &Value,
        op: F,
    ) -> ChunkedOutcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(Chunk, String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let content_fp = fingerprint(content.as_bytes());
        let chunks = self.chunk(content);
        let total = chunks.total();
        let concurrency = self.config.chunking.max_concurrency.max(1);

        info!(
            endpoint,
            chunks = total,
            concurrency,
            tokens = self.estimate(content),
            "running chunked request"
        );

        let op = &op;
        let content_fp = content_fp.as_str();
        let results: Vec<ChunkResult<T>> = stream::iter(chunks)
            .map(|chunk| async move {
                let index = chunk.index;
                let total = chunk.total;
                let options = CallOptions::new(endpoint)
                    .with_cache_key(self.chunk_key(content_fp, params, &chunk));
                let result = self
                    .run(options, |provider| op(chunk.clone(), provider))
                    .await;
                if let Err(ref e) = result {
                    warn!(endpoint, chunk = index, total, error = %e, "chunk failed");
                }
                ChunkResult {
                    index,
                    total,
                    result,
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        ChunkedOutcome { results }
    }
}
