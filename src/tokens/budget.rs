//! Context window budgeting.

use serde::{Deserialize, Serialize};

/// Maximum number of prompt tokens a request may use.
///
/// Computed as `context_window - response_reserve`; the reserve is kept free
/// for the model's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub context_window: usize,
    pub response_reserve: usize,
}

impl TokenBudget {
    pub fn new(context_window: usize, response_reserve: usize) -> Self {
        Self {
            context_window,
            response_reserve,
        }
    }

    /// Tokens available for the prompt.
    pub fn available(&self) -> usize {
        self.context_window.saturating_sub(self.response_reserve)
    }

    pub fn fits(&self, tokens: usize) -> bool {
        tokens <= self.available()
    }

    /// How many tokens over budget `tokens` is (0 when it fits).
    pub fn overflow(&self, tokens: usize) -> usize {
        tokens.saturating_sub(self.available())
    }
}
