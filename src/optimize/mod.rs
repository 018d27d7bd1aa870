//! 请求整形模块：将超长内容切分为重叠分块，并按 Token 预算截断对话历史。
//!
//! # Request Shaping Module
//!
//! Two ways of making an oversized request fit a model's context window:
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Chunker`] | Splits long content into overlapping token windows |
//! | [`PromptOptimizer`] | Drops the oldest history until the conversation fits |
//!
//! ```rust
//! use llm_relay::optimize::{Chunker, PromptOptimizer};
//! use llm_relay::tokens::TokenEstimator;
//! use llm_relay::types::Message;
//! use std::sync::Arc;
//!
//! let estimator = Arc::new(TokenEstimator::approximate());
//!
//! let chunks: Vec<_> = Chunker::new(estimator.clone())
//!     .chunk(&"x".repeat(400), 40, 5)
//!     .collect();
//! assert!(chunks.len() > 1);
//!
//! let optimizer = PromptOptimizer::new(estimator);
//! let messages = vec![Message::system("be brief"), Message::user("hi")];
//! assert_eq!(optimizer.optimize(&messages, 1000), messages);
//! ```

mod chunker;
mod optimizer;

pub use chunker::{Chunk, Chunker, Chunks};
pub use optimizer::PromptOptimizer;
