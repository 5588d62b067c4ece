//! Group chat task execution.
//!
//! One [`GroupChatExecutor::execute`] call answers one queued group chat
//! message: it streams the model reply, bills it and records the terminal
//! message and task state. Whatever happens after the freshness check, the
//! task's frozen quota is released exactly once and a failure always leaves a
//! visible FAILED message behind.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Error, JobError};
use crate::llm::{ChatBackend, ChatMessage, ChatRequest, CostTable, tokens};
use crate::store::{
    FreeTier, MessageStore, MessageUpdate, QuotaLedger, QuotaUsage, TaskResult, TaskStore,
};
use crate::worker::state::{MessageStatus, TaskStatus};
use crate::worker::stream::collect_reply;
use crate::worker::task::{GroupChatPayload, QueuePayload, QueueTask, TaskHandler};

/// Collaborators the executor calls into.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub backend: Arc<dyn ChatBackend>,
    pub messages: Arc<dyn MessageStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub free_tier: Arc<dyn FreeTier>,
    pub costs: Arc<CostTable>,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub reply: String,
    pub total_cost: Duration,
    pub first_content_cost: Option<Duration>,
    pub token_count: i64,
    pub quota_cost: i64,
}

impl ExecutionOutcome {
    fn to_message_update(&self) -> MessageUpdate {
        MessageUpdate {
            content: self.reply.clone(),
            token_count: self.token_count,
            quota_cost: self.quota_cost,
            status: MessageStatus::Succeeded,
            total_cost_us: micros(self.total_cost),
            first_content_cost_us: self.first_content_cost.map(micros),
            error: None,
        }
    }
}

fn micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

/// Best-effort text of a caught panic.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `fut`, turning a panic into a logged error so the caller can go on
/// with its remaining bookkeeping.
async fn guarded<F: Future>(what: &str, fut: F) -> Result<F::Output, String> {
    AssertUnwindSafe(fut).catch_unwind().await.map_err(|panic| {
        let message = panic_message(panic.as_ref());
        error!(panic = %message, "Panic during {what}");
        message
    })
}

/// Executes group chat tasks.
pub struct GroupChatExecutor {
    deps: ExecutorDeps,
    config: WorkerConfig,
}

impl GroupChatExecutor {
    pub fn new(deps: ExecutorDeps, config: WorkerConfig) -> Self {
        Self { deps, config }
    }

    /// Run one task to a terminal state.
    ///
    /// The returned error is informational: every failure has already been
    /// written to the message and task stores when this returns.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        payload: GroupChatPayload,
    ) -> Result<(), Error> {
        if payload.is_stale(Utc::now(), self.config.freshness_window) {
            debug!(
                task_id = %payload.id,
                created_at = ?payload.created_at,
                "Skipping stale group chat task"
            );
            return Ok(());
        }

        let span = tracing::info_span!(
            "group_chat",
            task_id = %payload.id,
            user_id = payload.user_id,
            message_id = payload.message_id,
            model = %payload.model_id,
        );

        async {
            let result = guarded("group chat task", self.run(cancel, &payload))
                .await
                .unwrap_or_else(|message| Err(JobError::Panicked(message)));

            let finished = match result {
                Ok((model, outcome)) => {
                    // The reply is recorded; nothing past this point may fail the task.
                    let _ = guarded("quota settlement", self.settle(&payload, &model, &outcome))
                        .await;
                    guarded("task success update", self.mark_succeeded(&payload))
                        .await
                        .unwrap_or_else(|message| Err(JobError::Panicked(message).into()))
                }
                Err(e) => {
                    self.record_failure(&payload, &e).await;
                    Err(e.into())
                }
            };

            self.release_frozen(&payload).await;
            finished
        }
        .instrument(span)
        .await
    }

    /// Stream, bill and record the reply. Any error returned here is terminal.
    ///
    /// Returns the model the request was sent to and the recorded outcome.
    async fn run(
        &self,
        cancel: &CancellationToken,
        payload: &GroupChatPayload,
    ) -> Result<(String, ExecutionOutcome), JobError> {
        let request =
            ChatRequest::new(payload.model_id.clone(), payload.context_messages.clone()).init();

        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Cancelled),
            fixed = self.deps.backend.fixup(request, self.config.fixup_attempts) => {
                fixed.map_err(JobError::Fixup)?
            }
        };

        let started = Instant::now();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Cancelled),
            opened = self.deps.backend.chat_stream(request.clone()) => {
                opened.map_err(JobError::Open)?
            }
        };

        let reply = collect_reply(&mut stream, self.config.stream_deadline, cancel).await;
        let first_content_cost = reply.first_content_at.map(|at| at - started);
        debug!(chunks = reply.chunks, end = ?reply.end, "Reply stream drained");
        let reply = reply.into_result()?;
        let total_cost = started.elapsed();

        let outcome = self
            .bill(payload, &request, reply, total_cost, first_content_cost)
            .await;

        self.deps
            .messages
            .update_message(
                payload.group_id,
                payload.user_id,
                payload.message_id,
                &outcome.to_message_update(),
            )
            .await
            .map_err(JobError::MessageUpdate)?;

        info!(
            tokens = outcome.token_count,
            quota = outcome.quota_cost,
            total_us = micros(outcome.total_cost),
            "Group chat reply recorded"
        );

        Ok((request.model, outcome))
    }

    /// Post-success bookkeeping: free request counter and quota commit.
    /// Failures are logged only.
    async fn settle(&self, payload: &GroupChatPayload, model: &str, outcome: &ExecutionOutcome) {
        if let Err(e) = self
            .deps
            .free_tier
            .record_free_request(payload.user_id, model)
            .await
        {
            warn!(error = %e, "Failed to update free chat count");
        }

        if outcome.quota_cost > 0 {
            let usage = QuotaUsage::group_chat(model);
            if let Err(e) = self
                .deps
                .ledger
                .commit(payload.user_id, outcome.quota_cost, &usage)
                .await
            {
                error!(error = %e, quota = outcome.quota_cost, "Failed to commit used quota");
            }
        }
    }

    /// Count tokens over the whole conversation and price them, unless the
    /// user still has free requests for this model.
    async fn bill(
        &self,
        payload: &GroupChatPayload,
        request: &ChatRequest,
        reply: String,
        total_cost: Duration,
        first_content_cost: Option<Duration>,
    ) -> ExecutionOutcome {
        let mut conversation = request.messages.clone();
        conversation.push(ChatMessage::assistant(reply.clone()));
        let token_count = tokens::count_messages(&conversation, &request.model);
        let token_count = i64::try_from(token_count).unwrap_or(i64::MAX);

        let free_left = match self
            .deps
            .free_tier
            .remaining_free_requests(payload.user_id, &request.model)
            .await
        {
            Ok(left) => left,
            Err(e) => {
                warn!(error = %e, "Failed to read free chat allowance, billing the request");
                0
            }
        };

        let quota_cost = if free_left > 0 {
            0
        } else {
            let billed_model = self.deps.costs.resolve_billing_model(&request.model);
            self.deps.costs.cost_for_tokens(&billed_model, token_count)
        };

        ExecutionOutcome {
            reply,
            total_cost,
            first_content_cost,
            token_count,
            quota_cost,
        }
    }

    async fn mark_succeeded(&self, payload: &GroupChatPayload) -> Result<(), Error> {
        self.deps
            .tasks
            .update_task_status(payload.id(), TaskStatus::Succeeded, &TaskResult::empty())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to mark task succeeded");
                Error::from(e)
            })
    }

    /// Write the FAILED message and task records. Store errors are logged only.
    async fn record_failure(&self, payload: &GroupChatPayload, err: &JobError) {
        let error_text = err.to_string();
        warn!(error = %error_text, "Group chat task failed");

        let update = MessageUpdate::failed(err.message_content(), error_text.clone());
        let message_write = self.deps.messages.update_message(
            payload.group_id,
            payload.user_id,
            payload.message_id,
            &update,
        );
        if let Ok(Err(e)) = guarded("failed message update", message_write).await {
            error!(error = %e, "Failed to mark chat message failed");
        }

        let result = TaskResult::errors(vec![error_text]);
        let task_write = self
            .deps
            .tasks
            .update_task_status(payload.id(), TaskStatus::Failed, &result);
        if let Ok(Err(e)) = guarded("failed task update", task_write).await {
            error!(error = %e, "Failed to mark task failed");
        }
    }

    async fn release_frozen(&self, payload: &GroupChatPayload) {
        if payload.frozen_coins <= 0 {
            return;
        }
        let release = self
            .deps
            .ledger
            .release_frozen(payload.user_id, payload.frozen_coins);
        match guarded("frozen quota release", release).await {
            Ok(Ok(())) => debug!(coins = payload.frozen_coins, "Released frozen quota"),
            Ok(Err(e)) => error!(
                error = %e,
                coins = payload.frozen_coins,
                "Failed to release frozen quota for group chat task"
            ),
            // Already logged; the coins stay frozen for reconciliation.
            Err(_) => {}
        }
    }
}

#[async_trait]
impl TaskHandler for GroupChatExecutor {
    async fn handle(&self, cancel: CancellationToken, task: QueueTask) -> Result<(), Error> {
        let payload = GroupChatPayload::from_task(&task)?;
        self.execute(&cancel, payload).await
    }
}
