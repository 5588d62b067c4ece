//! Error types for the group chat worker.

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors returned by the external stores (messages, tasks, quota).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),
}

/// Chat backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Request still invalid after {attempts} fix attempts: {reason}")]
    FixupExhausted { attempts: usize, reason: String },
}

/// Terminal errors of a single job invocation.
///
/// The `Display` output of these errors is what ends up in the failed
/// message record and in the task result, so keep it user readable.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("fix chat request failed: {0}")]
    Fixup(#[source] LlmError),

    #[error("chat failed: {0}")]
    Open(#[source] LlmError),

    #[error("chat failed: {code} {detail}")]
    Stream {
        code: String,
        detail: String,
        /// Reply text accumulated before the error chunk, error block included.
        partial: String,
    },

    #[error("update chat message failed: {0}")]
    MessageUpdate(#[source] StoreError),

    #[error("panic: {0}")]
    Panicked(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("no handler registered for task type {0}")]
    UnknownTaskType(String),
}

impl JobError {
    /// Text to show as the failed message's content.
    ///
    /// Stream failures keep whatever reply was already produced; every other
    /// failure shows the error itself.
    pub fn message_content(&self) -> String {
        match self {
            Self::Stream { partial, .. } if !partial.is_empty() => partial.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
