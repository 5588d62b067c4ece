//! Chat request types and request normalization.

use serde::{Deserialize, Serialize};

use super::tokens;
use crate::error::LlmError;

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// A chat-completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
        }
    }

    /// Normalize the request: trim the model id and drop blank turns.
    pub fn init(mut self) -> Self {
        self.model = self.model.trim().to_string();
        self.messages.retain(|m| !m.content.trim().is_empty());
        self
    }

    /// Token estimate for the whole request.
    pub fn token_count(&self) -> usize {
        tokens::count_messages(&self.messages, &self.model)
    }

    /// Drop the oldest non-system turn, never the last one.
    ///
    /// Returns `false` when nothing can be dropped.
    fn drop_oldest_turn(&mut self) -> bool {
        let last = self.messages.len().saturating_sub(1);
        match self
            .messages
            .iter()
            .position(|m| !m.is_system())
            .filter(|&idx| idx < last)
        {
            Some(idx) => {
                self.messages.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Trim turns until the request fits in `limit` tokens, correcting at most
    /// `max_attempts` times.
    pub fn fit_context(mut self, limit: usize, max_attempts: usize) -> Result<Self, LlmError> {
        if self.messages.is_empty() {
            return Err(LlmError::FixupExhausted {
                attempts: 0,
                reason: "request has no messages".to_string(),
            });
        }

        let mut used = self.token_count();
        let mut attempts = 0;
        while used > limit {
            if attempts >= max_attempts {
                return Err(LlmError::FixupExhausted {
                    attempts,
                    reason: LlmError::ContextLengthExceeded { used, limit }.to_string(),
                });
            }
            if !self.drop_oldest_turn() {
                return Err(LlmError::ContextLengthExceeded { used, limit });
            }
            attempts += 1;
            used = self.token_count();
            tracing::debug!(attempts, used, limit, "Trimmed oldest turn from chat request");
        }

        Ok(self)
    }
}
