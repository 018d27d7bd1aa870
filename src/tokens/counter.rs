//! Token counter implementations.

use crate::types::Message;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Characters per token used when no tokenizer is available.
pub const APPROX_CHARS_PER_TOKEN: usize = 4;

/// Per-message structural overhead (role and boundary markers).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Every reply is primed with an assistant header.
pub const REPLY_PRIMING_TOKENS: usize = 3;

/// Model-specific subword tokenizer.
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Strict decode: a run that ends inside a multi-byte character is an
    /// error, never replacement characters. The chunker uses this to find
    /// character boundaries.
    fn decode(&self, tokens: &[u32]) -> Result<String>;
}

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Tokens one message contributes, structural overhead included.
    fn count_message(&self, message: &Message) -> usize {
        MESSAGE_OVERHEAD_TOKENS + self.count(message.role.as_str()) + self.count(&message.content)
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| self.count_message(m))
            .sum::<usize>()
            + REPLY_PRIMING_TOKENS
    }
}

/// `cl100k_base` byte-pair encoding (GPT-3.5/4 family).
#[cfg(feature = "tiktoken")]
pub struct BpeTokenizer {
    name: String,
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl BpeTokenizer {
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| {
            crate::Error::configuration_with_context(
                format!("failed to load tokenizer: {}", e),
                crate::ErrorContext::new()
                    .with_field_path("tokenizer")
                    .with_source("token_estimator"),
            )
        })?;
        Ok(Self {
            name: "cl100k_base".to_string(),
            bpe,
        })
    }
}

#[cfg(feature = "tiktoken")]
impl Tokenizer for BpeTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self
            .bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|t| t as u32)
            .collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.bpe
            .decode(tokens.iter().map(|&t| t as _).collect())
            .map_err(|e| crate::Error::validation(format!("token decode failed: {}", e)))
    }
}

/// Token estimator that never fails.
///
/// Uses the configured tokenizer when present; a missing tokenizer or an
/// encoding failure degrades to `chars / 4`.
#[derive(Clone)]
pub struct TokenEstimator {
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl TokenEstimator {
    /// Estimator backed by `cl100k_base` when it can be loaded.
    pub fn new() -> Self {
        #[cfg(feature = "tiktoken")]
        {
            match BpeTokenizer::cl100k() {
                Ok(t) => {
                    tracing::info!(tokenizer = t.name(), "token estimator initialized");
                    return Self::with_tokenizer(Arc::new(t));
                }
                Err(e) => {
                    tracing::error!(error = %e, "tokenizer unavailable, falling back to approximation");
                }
            }
        }
        #[cfg(not(feature = "tiktoken"))]
        warn!("built without a tokenizer, token estimation uses character approximation");
        Self::approximate()
    }

    /// Character approximation only.
    pub fn approximate() -> Self {
        Self { tokenizer: None }
    }

    pub fn with_tokenizer(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer: Some(tokenizer),
        }
    }

    /// Resolve a tokenizer by configured name (`"cl100k_base"` or `"approximate"`).
    pub fn from_name(name: &str) -> Self {
        match name {
            "approximate" | "chars" => Self::approximate(),
            "cl100k_base" => Self::new(),
            other => {
                warn!(tokenizer = other, "unknown tokenizer, using character approximation");
                Self::approximate()
            }
        }
    }

    pub fn tokenizer(&self) -> Option<&Arc<dyn Tokenizer>> {
        self.tokenizer.as_ref()
    }

    pub fn tokenizer_name(&self) -> &str {
        self.tokenizer
            .as_deref()
            .map(|t| t.name())
            .unwrap_or("approximate")
    }

    pub fn estimate(&self, text: &str) -> usize {
        self.count(text)
    }

    pub fn estimate_for_messages(&self, messages: &[Message]) -> usize {
        self.count_messages(messages)
    }

    /// Tokenize with the configured tokenizer.
    ///
    /// `None` when no tokenizer is configured or encoding failed; callers fall
    /// back to character-based handling.
    pub fn encode(&self, text: &str) -> Option<Vec<u32>> {
        let tokenizer = self.tokenizer.as_ref()?;
        match tokenizer.encode(text) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                warn!(
                    tokenizer = tokenizer.name(),
                    error = %e,
                    "encoding failed, falling back to approximation"
                );
                None
            }
        }
    }

    pub(crate) fn approximate_count(text: &str) -> usize {
        text.chars().count() / APPROX_CHARS_PER_TOKEN
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("tokenizer", &self.tokenizer_name())
            .finish()
    }
}

impl TokenCounter for TokenEstimator {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encode(text) {
            Some(tokens) => tokens.len(),
            None => {
                let n = Self::approximate_count(text);
                debug!(chars = text.len(), tokens = n, "approximate token estimate");
                n
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    struct BrokenTokenizer;

    impl Tokenizer for BrokenTokenizer {
        fn name(&self) -> &str {
            "broken"
        }
        fn encode(&self, _text: &str) -> Result<Vec<u32>> {
            Err(Error::validation("tokenizer exploded"))
        }
        fn decode(&self, _tokens: &[u32]) -> Result<String> {
            Err(Error::validation("tokenizer exploded"))
        }
    }

    #[test]
    fn test_approximation_is_quarter_length() {
        let est = TokenEstimator::approximate();
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("abc"), 0);
        assert_eq!(est.estimate("abcdefghij"), 2);
        assert_eq!(est.tokenizer_name(), "approximate");
    }

    #[test]
    fn test_failing_tokenizer_degrades() {
        let est = TokenEstimator::with_tokenizer(Arc::new(BrokenTokenizer));
        assert_eq!(est.estimate("abcdefgh"), 2);
        assert!(est.encode("abcdefgh").is_none());
    }

    #[test]
    fn test_message_overhead_is_counted() {
        let est = TokenEstimator::approximate();
        let messages = vec![
            Message::system("x".repeat(40)),
            Message::user("y".repeat(20)),
        ];
        // system: 4 + 1 ("system") + 10; user: 4 + 1 ("user") + 5; priming: 3
        assert_eq!(est.estimate_for_messages(&messages), 28);
        let content_only: usize = messages.iter().map(|m| est.estimate(&m.content)).sum();
        assert!(est.estimate_for_messages(&messages) > content_only);
    }

    #[test]
    fn test_empty_message_list_counts_priming() {
        let est = TokenEstimator::approximate();
        assert_eq!(est.estimate_for_messages(&[]), REPLY_PRIMING_TOKENS);
    }

    #[cfg(feature = "tiktoken")]
    #[test]
    fn test_bpe_round_trip() {
        let bpe = BpeTokenizer::cl100k().unwrap();
        let tokens = bpe.encode("hello world").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(bpe.decode(&tokens).unwrap(), "hello world");
    }
}
