//! Task payloads and the queue envelope they travel in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, JobError};
use crate::llm::ChatMessage;

/// Queue type name of group chat tasks.
pub const TYPE_GROUP_CHAT: &str = "group_chat";

/// A task as delivered by the queue: type name plus JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTask {
    /// Queue-assigned id. May be empty until the scheduler assigns one.
    pub id: String,
    pub type_name: String,
    pub payload: Vec<u8>,
}

impl QueueTask {
    pub fn new(type_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: String::new(),
            type_name: type_name.into(),
            payload,
        }
    }
}

/// Common accessors for queued payloads.
pub trait QueuePayload {
    /// Human readable task kind.
    fn title(&self) -> &str;
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    /// Owner of the task.
    fn user_id(&self) -> i64;
}

/// Handles one delivered task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, cancel: CancellationToken, task: QueueTask) -> Result<(), Error>;
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// Payload of a group chat reply task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChatPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub group_id: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub member_id: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub question_id: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Quota reserved for this task at enqueue time.
    #[serde(rename = "freezed_coins", default, skip_serializing_if = "is_zero")]
    pub frozen_coins: i64,
}

impl GroupChatPayload {
    /// Whether the task is too old to be worth answering at `now`.
    ///
    /// A payload without a creation time is always stale.
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let Some(created_at) = self.created_at else {
            return true;
        };
        match chrono::Duration::from_std(window) {
            Ok(window) => created_at + window < now,
            Err(_) => false,
        }
    }

    /// Wrap the payload in a queue envelope.
    pub fn to_task(&self) -> Result<QueueTask, Error> {
        let payload = serde_json::to_vec(self)
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
        Ok(QueueTask {
            id: self.id.clone(),
            type_name: TYPE_GROUP_CHAT.to_string(),
            payload,
        })
    }

    /// Decode the payload of a delivered task. The envelope id wins over an
    /// empty payload id.
    pub fn from_task(task: &QueueTask) -> Result<Self, JobError> {
        let mut payload: Self = serde_json::from_slice(&task.payload)
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
        if payload.id.is_empty() {
            payload.id = task.id.clone();
        }
        Ok(payload)
    }
}

impl QueuePayload for GroupChatPayload {
    fn title(&self) -> &str {
        "Group chat"
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn user_id(&self) -> i64 {
        self.user_id
    }
}
