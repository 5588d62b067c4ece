//! Store traits — the narrow async interfaces the worker writes through.
//!
//! Each trait maps to one external system: the chat message table, the task
//! status table, the quota ledger and the free-request counters. Backends
//! are responsible for their own atomicity per user.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::worker::state::{MessageStatus, TaskStatus};

/// Usage category for group chat charges.
pub const USAGE_GROUP_CHAT: &str = "group_chat";

/// Fields written to a chat message when a task finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageUpdate {
    pub content: String,
    pub token_count: i64,
    pub quota_cost: i64,
    pub status: MessageStatus,
    /// Wall-clock time of the whole completion, in microseconds.
    pub total_cost_us: i64,
    /// Time until the first content arrived, in microseconds.
    pub first_content_cost_us: Option<i64>,
    pub error: Option<String>,
}

impl MessageUpdate {
    /// A failed update showing `content` and recording `error`.
    pub fn failed(content: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            token_count: 0,
            quota_cost: 0,
            status: MessageStatus::Failed,
            total_cost_us: 0,
            first_content_cost_us: None,
            error: Some(error.into()),
        }
    }
}

/// Result payload stored alongside a task status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl TaskResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn errors(errors: Vec<String>) -> Self {
        Self { errors }
    }
}

/// Tag attached to a quota commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub category: String,
    pub model: String,
}

impl QuotaUsage {
    pub fn group_chat(model: impl Into<String>) -> Self {
        Self {
            category: USAGE_GROUP_CHAT.to_string(),
            model: model.into(),
        }
    }
}

/// Durable chat message records.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Overwrite the reply fields of a message.
    async fn update_message(
        &self,
        group_id: i64,
        user_id: i64,
        message_id: i64,
        update: &MessageUpdate,
    ) -> Result<(), StoreError>;
}

/// Durable task status records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Record the terminal status of a task.
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: &TaskResult,
    ) -> Result<(), StoreError>;
}

/// Per-user quota balance.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Permanently deduct `amount` from the user's balance.
    async fn commit(&self, user_id: i64, amount: i64, usage: &QuotaUsage)
    -> Result<(), StoreError>;

    /// Return `amount` of frozen quota to the user's available balance.
    async fn release_frozen(&self, user_id: i64, amount: i64) -> Result<(), StoreError>;
}

/// Per-user, per-model free request allowance.
#[async_trait]
pub trait FreeTier: Send + Sync {
    /// Free requests the user still has for `model`.
    async fn remaining_free_requests(&self, user_id: i64, model: &str)
    -> Result<i64, StoreError>;

    /// Count one request against the user's free allowance for `model`.
    async fn record_free_request(&self, user_id: i64, model: &str) -> Result<(), StoreError>;
}
