//! Chat backend integration.
//!
//! The worker only needs two things from a backend: a request fix-up pass and
//! a streaming completion delivered over an mpsc channel of [`StreamChunk`]s.
//! `OpenAiBackend` implements that against any OpenAI-compatible endpoint.

pub mod costs;
pub mod openai;
pub mod request;
pub mod tokens;

pub use costs::CostTable;
pub use openai::OpenAiBackend;
pub use request::{ChatMessage, ChatRequest};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ConfigError, LlmError};

/// One increment of model output.
///
/// A chunk with a non-empty `error_code` is terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub error_code: String,
    pub error: String,
}

impl StreamChunk {
    /// A successful text fragment.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// A terminal error chunk.
    pub fn failed(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error_code: code.into(),
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error_code.is_empty()
    }
}

/// A streaming chat-completion backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Provider name, used in logs and errors.
    fn name(&self) -> &str;

    /// Context window for `model`, in tokens.
    fn context_window(&self, model: &str) -> usize {
        tokens::context_window(model)
    }

    /// Rewrite `request` until it satisfies the backend's constraints.
    ///
    /// The default trims the oldest turns until the conversation fits the
    /// model's context window.
    async fn fixup(
        &self,
        request: ChatRequest,
        max_attempts: usize,
    ) -> Result<ChatRequest, LlmError> {
        let limit = self.context_window(&request.model);
        request.fit_context(limit, max_attempts)
    }

    /// Open a streaming completion. The channel closes at end of stream.
    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, LlmError>;
}

/// Configuration for creating a chat backend.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: secrecy::SecretString,
}

impl LlmConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    /// Read `OPENAI_API_KEY` and `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| Self::DEFAULT_BASE_URL.to_string());

        Ok(Self {
            base_url,
            api_key: secrecy::SecretString::from(api_key),
        })
    }
}

/// Create a chat backend from configuration.
pub fn create_backend(config: &LlmConfig) -> Arc<dyn ChatBackend> {
    tracing::info!("Using OpenAI-compatible backend at {}", config.base_url);
    Arc::new(OpenAiBackend::new(&config.base_url, config.api_key.clone()))
}
