//! In-memory store — messages, tasks, quota and free allowances behind
//! `tokio::sync::RwLock`s. Every trait call takes the write lock for its
//! whole read-modify-write, which is what keeps per-user updates atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::{
    FreeTier, MessageStore, MessageUpdate, QuotaLedger, QuotaUsage, TaskResult, TaskStore,
};
use crate::error::StoreError;
use crate::worker::state::{MessageStatus, TaskStatus};

/// A chat message slot waiting for (or holding) a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub status: MessageStatus,
    pub last_update: Option<MessageUpdate>,
}

/// A task status row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub result: TaskResult,
}

/// A user's quota balance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserQuota {
    /// Total coins owned, committed usage already deducted.
    pub balance: i64,
    /// Coins reserved by in-flight tasks.
    pub frozen: i64,
    /// Coins committed so far.
    pub used: i64,
    /// Commits in order.
    pub history: Vec<(i64, QuotaUsage)>,
}

impl UserQuota {
    /// Coins not reserved by any task.
    pub fn available(&self) -> i64 {
        self.balance - self.frozen
    }
}

type MessageKey = (i64, i64, i64);

/// Store implementation holding everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<MessageKey, StoredMessage>>,
    tasks: RwLock<HashMap<String, TaskRecord>>,
    quotas: RwLock<HashMap<i64, UserQuota>>,
    free_allowance: RwLock<HashMap<String, i64>>,
    free_used: RwLock<HashMap<(i64, String), i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending message slot that a task will fill in.
    pub async fn insert_pending_message(&self, group_id: i64, user_id: i64, message_id: i64) {
        self.messages.write().await.insert(
            (group_id, user_id, message_id),
            StoredMessage {
                status: MessageStatus::Pending,
                last_update: None,
            },
        );
    }

    pub async fn message(
        &self,
        group_id: i64,
        user_id: i64,
        message_id: i64,
    ) -> Option<StoredMessage> {
        self.messages
            .read()
            .await
            .get(&(group_id, user_id, message_id))
            .cloned()
    }

    pub async fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn quota(&self, user_id: i64) -> UserQuota {
        self.quotas
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Add coins to a user's balance.
    pub async fn credit(&self, user_id: i64, amount: i64) {
        self.quotas.write().await.entry(user_id).or_default().balance += amount;
    }

    /// Reserve `amount` coins for a task about to be enqueued.
    pub async fn freeze(&self, user_id: i64, amount: i64) -> Result<(), StoreError> {
        let mut quotas = self.quotas.write().await;
        let quota = quotas.entry(user_id).or_default();
        if quota.available() < amount {
            return Err(StoreError::Constraint(format!(
                "user {user_id} has {} coins available, {amount} requested",
                quota.available()
            )));
        }
        quota.frozen += amount;
        Ok(())
    }

    /// Grant every user `count` free requests per period on `model`.
    pub async fn set_free_allowance(&self, model: impl Into<String>, count: i64) {
        self.free_allowance.write().await.insert(model.into(), count);
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn update_message(
        &self,
        group_id: i64,
        user_id: i64,
        message_id: i64,
        update: &MessageUpdate,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&(group_id, user_id, message_id))
            .ok_or_else(|| StoreError::NotFound {
                entity: "chat_group_message".to_string(),
                id: message_id.to_string(),
            })?;

        if !message.status.can_transition_to(update.status) {
            return Err(StoreError::Constraint(format!(
                "message {message_id} is already {}",
                message.status
            )));
        }

        message.status = update.status;
        message.last_update = Some(update.clone());
        debug!(message_id, status = %update.status, "Message updated");
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: &TaskResult,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get(task_id)
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Pending);

        if current.is_terminal() {
            return Err(StoreError::Constraint(format!(
                "task {task_id} is already {current}"
            )));
        }
        if !current.can_transition_to(status) {
            return Err(StoreError::Constraint(format!(
                "task {task_id} cannot move from {current} to {status}"
            )));
        }

        tasks.insert(
            task_id.to_string(),
            TaskRecord {
                status,
                result: result.clone(),
            },
        );
        debug!(task_id, %status, "Task status updated");
        Ok(())
    }
}

#[async_trait]
impl QuotaLedger for MemoryStore {
    async fn commit(
        &self,
        user_id: i64,
        amount: i64,
        usage: &QuotaUsage,
    ) -> Result<(), StoreError> {
        if amount < 0 {
            return Err(StoreError::Constraint(format!(
                "negative quota commit {amount}"
            )));
        }
        let mut quotas = self.quotas.write().await;
        let quota = quotas.entry(user_id).or_default();
        quota.balance -= amount;
        quota.used += amount;
        quota.history.push((amount, usage.clone()));
        debug!(
            user_id,
            amount,
            category = %usage.category,
            model = %usage.model,
            "Quota committed"
        );
        Ok(())
    }

    async fn release_frozen(&self, user_id: i64, amount: i64) -> Result<(), StoreError> {
        let mut quotas = self.quotas.write().await;
        let quota = quotas.get_mut(&user_id).ok_or_else(|| StoreError::NotFound {
            entity: "quota".to_string(),
            id: user_id.to_string(),
        })?;
        if quota.frozen < amount {
            return Err(StoreError::Constraint(format!(
                "user {user_id} has {} coins frozen, cannot release {amount}",
                quota.frozen
            )));
        }
        quota.frozen -= amount;
        debug!(user_id, amount, "Frozen quota released");
        Ok(())
    }
}

#[async_trait]
impl FreeTier for MemoryStore {
    async fn remaining_free_requests(
        &self,
        user_id: i64,
        model: &str,
    ) -> Result<i64, StoreError> {
        let allowance = self
            .free_allowance
            .read()
            .await
            .get(model)
            .copied()
            .unwrap_or(0);
        let used = self
            .free_used
            .read()
            .await
            .get(&(user_id, model.to_string()))
            .copied()
            .unwrap_or(0);
        Ok((allowance - used).max(0))
    }

    async fn record_free_request(&self, user_id: i64, model: &str) -> Result<(), StoreError> {
        let allowance = self
            .free_allowance
            .read()
            .await
            .get(model)
            .copied()
            .unwrap_or(0);
        let mut used = self.free_used.write().await;
        let count = used.entry((user_id, model.to_string())).or_insert(0);
        // Only free requests count against the allowance.
        if *count < allowance {
            *count += 1;
        }
        Ok(())
    }
}
