//! 类型系统模块：定义请求管线使用的核心消息类型。
//!
//! # Types Module
//!
//! Core conversational types shared by the token estimator, the prompt
//! optimizer and orchestrating callers.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Message`] | Chat message with role and text content |
//! | [`MessageRole`] | Message role (system, user, assistant) |
//!
//! ```rust
//! use llm_relay::types::{Message, MessageRole};
//!
//! let history = vec![
//!     Message::system("You are a helpful assistant"),
//!     Message::user("Summarize main.rs"),
//! ];
//! assert_eq!(history[0].role, MessageRole::System);
//! ```

pub mod message;

pub use message::{Message, MessageRole};
