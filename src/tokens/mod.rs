//! Token 计数与预算模块：提供基于分词器的 Token 估算和上下文预算。
//!
//! # Token Estimation and Budgeting Module
//!
//! Token counts drive every sizing decision in the pipeline: whether content
//! must be chunked, how far a conversation has to be truncated, and whether a
//! request fits the model's context window at all.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TokenCounter`] | Trait for token counting implementations |
//! | [`TokenEstimator`] | Tokenizer-backed estimator that degrades to a character approximation |
//! | [`Tokenizer`] | Encode/decode seam for model-specific subword tokenizers |
//! | [`TokenBudget`] | Context window minus the reserve kept for the reply |
//!
//! ## Example
//!
//! ```rust
//! use llm_relay::tokens::{TokenBudget, TokenCounter, TokenEstimator};
//! use llm_relay::types::Message;
//!
//! let estimator = TokenEstimator::approximate();
//! assert_eq!(estimator.count("abcdefgh"), 2);
//!
//! let budget = TokenBudget::new(8192, 1024);
//! let messages = vec![Message::user("Hello, how are you?")];
//! assert!(budget.fits(estimator.count_messages(&messages)));
//! ```
//!
//! ## Estimation Accuracy
//!
//! | Method | Accuracy | Use Case |
//! |--------|----------|----------|
//! | BPE (`cl100k_base`) | Exact for GPT-family models | Budgeting, chunking |
//! | Character-based | ~85% | Tokenizer unavailable or failed |

mod budget;
mod counter;

pub use budget::TokenBudget;
pub use counter::{
    TokenCounter, TokenEstimator, Tokenizer, APPROX_CHARS_PER_TOKEN, MESSAGE_OVERHEAD_TOKENS,
    REPLY_PRIMING_TOKENS,
};

#[cfg(feature = "tiktoken")]
pub use counter::BpeTokenizer;
