//! Oldest-first history truncation.

use crate::tokens::{TokenCounter, REPLY_PRIMING_TOKENS};
use crate::types::Message;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shrinks a message history until it fits a token budget.
///
/// A leading system message is pinned and always survives. An empty result
/// means the budget cannot be met even with every other message dropped.
#[derive(Clone)]
pub struct PromptOptimizer {
    counter: Arc<dyn TokenCounter>,
}

impl PromptOptimizer {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn optimize(&self, messages: &[Message], max_tokens: usize) -> Vec<Message> {
        let initial = self.counter.count_messages(messages);
        if initial <= max_tokens {
            return messages.to_vec();
        }

        let (system, history) = match messages.split_first() {
            Some((first, rest)) if first.is_system() => (Some(first), rest),
            _ => (None, messages),
        };

        // Per-message costs are additive, so re-estimation after each removal
        // reduces to subtracting the removed message's cost.
        let mut total = REPLY_PRIMING_TOKENS
            + system.map(|m| self.counter.count_message(m)).unwrap_or(0);
        let mut survivors: VecDeque<(usize, &Message)> = history
            .iter()
            .map(|m| {
                let cost = self.counter.count_message(m);
                total += cost;
                (cost, m)
            })
            .collect();

        let mut dropped = 0usize;
        while total > max_tokens {
            match survivors.pop_front() {
                Some((cost, _)) => {
                    total -= cost;
                    dropped += 1;
                    debug!(dropped, remaining_tokens = total, "dropped oldest message");
                }
                None => {
                    warn!(
                        required = total,
                        budget = max_tokens,
                        "system prompt alone exceeds the token budget"
                    );
                    return Vec::new();
                }
            }
        }

        info!(
            from_tokens = initial,
            to_tokens = total,
            dropped,
            budget = max_tokens,
            "truncated message history"
        );
        system
            .into_iter()
            .chain(survivors.into_iter().map(|(_, m)| m))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for PromptOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptOptimizer").finish_non_exhaustive()
    }
}
