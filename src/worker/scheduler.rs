//! Task scheduler — routes delivered tasks to handlers with bounded
//! concurrency.
//!
//! The scheduler provides:
//! - `register()` — bind a handler to a queue type name
//! - `submit()` — spawn one handler invocation per delivered task
//! - `drain()` / `shutdown()` — wait for (or cancel, then wait for) running tasks

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::worker::task::{QueueTask, TaskHandler};

/// Dispatches queue tasks to registered handlers.
pub struct Scheduler {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    /// Running invocations; each yields its task id when done.
    running: Mutex<JoinSet<String>>,
}

impl Scheduler {
    /// Create a scheduler running at most `config.max_parallel_jobs` tasks at once.
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            permits: Arc::new(Semaphore::new(config.max_parallel_jobs.max(1))),
            cancel: CancellationToken::new(),
            running: Mutex::new(JoinSet::new()),
        }
    }

    /// Register the handler for a task type, replacing any previous one.
    pub fn register(&mut self, type_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(type_name.into(), handler);
    }

    /// Token cancelled by [`Scheduler::shutdown`]; handed to every invocation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a handler invocation for `task`. Returns the task id, assigning a
    /// fresh one when the task has none.
    pub async fn submit(&self, mut task: QueueTask) -> Result<String, JobError> {
        let handler = self
            .handlers
            .get(&task.type_name)
            .cloned()
            .ok_or_else(|| JobError::UnknownTaskType(task.type_name.clone()))?;

        if task.id.is_empty() {
            task.id = Uuid::new_v4().to_string();
        }
        let task_id = task.id.clone();
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();

        let mut running = self.running.lock().await;
        while let Some(joined) = running.try_join_next() {
            log_join(joined);
        }

        let id = task_id.clone();
        running.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return id;
            };
            tracing::debug!(task_id = %id, task_type = %task.type_name, "Task started");
            if let Err(e) = handler.handle(cancel, task).await {
                tracing::warn!(task_id = %id, error = %e, "Task finished with error");
            }
            id
        });

        Ok(task_id)
    }

    /// Number of submitted tasks that have not been reaped yet.
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Wait for every task submitted so far to finish.
    ///
    /// The set is taken out of the lock first so `submit` keeps working while
    /// draining; tasks submitted meanwhile are left for the next drain.
    pub async fn drain(&self) {
        let mut running = std::mem::take(&mut *self.running.lock().await);
        while let Some(joined) = running.join_next().await {
            log_join(joined);
        }
    }

    /// Cancel running tasks and wait for them to record their outcome.
    pub async fn shutdown(&self) {
        tracing::info!("Scheduler shutting down");
        self.cancel.cancel();
        self.drain().await;
    }
}

fn log_join(joined: Result<String, JoinError>) {
    match joined {
        Ok(task_id) => tracing::debug!(task_id = %task_id, "Task reaped"),
        Err(e) if e.is_panic() => tracing::error!("Task handler panicked: {e}"),
        Err(e) => tracing::warn!("Task handler aborted: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::Error;

    /// Records peak concurrency and every task id it saw.
    #[derive(Default)]
    struct CountingHandler {
        active: AtomicUsize,
        peak: AtomicUsize,
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _cancel: CancellationToken, task: QueueTask) -> Result<(), Error> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(task.id);
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl TaskHandler for PanickingHandler {
        async fn handle(&self, _cancel: CancellationToken, _task: QueueTask) -> Result<(), Error> {
            panic!("handler blew up");
        }
    }

    struct WaitForCancel;

    #[async_trait]
    impl TaskHandler for WaitForCancel {
        async fn handle(&self, cancel: CancellationToken, _task: QueueTask) -> Result<(), Error> {
            cancel.cancelled().await;
            Err(JobError::Cancelled.into())
        }
    }

    fn config(max_parallel_jobs: usize) -> WorkerConfig {
        WorkerConfig {
            max_parallel_jobs,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let scheduler = Scheduler::new(&config(2));
        let err = scheduler
            .submit(QueueTask::new("nope", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::UnknownTaskType(ref t) if t == "nope"));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_and_ids_assigned() {
        let handler = Arc::new(CountingHandler::default());
        let mut scheduler = Scheduler::new(&config(2));
        scheduler.register("count", handler.clone());

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(scheduler.submit(QueueTask::new("count", Vec::new())).await.unwrap());
        }
        let mut named = QueueTask::new("count", Vec::new());
        named.id = "fixed-id".to_string();
        ids.push(scheduler.submit(named).await.unwrap());

        scheduler.drain().await;

        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert!(ids.iter().all(|id| !id.is_empty()));
        assert_eq!(ids.last().unwrap(), "fixed-id");
        assert_eq!(handler.seen.lock().unwrap().len(), 7);
        assert_eq!(scheduler.running_count().await, 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_poison_scheduler() {
        let counting = Arc::new(CountingHandler::default());
        let mut scheduler = Scheduler::new(&config(1));
        scheduler.register("panic", Arc::new(PanickingHandler));
        scheduler.register("count", counting.clone());

        scheduler.submit(QueueTask::new("panic", Vec::new())).await.unwrap();
        scheduler.submit(QueueTask::new("count", Vec::new())).await.unwrap();
        scheduler.drain().await;

        assert_eq!(counting.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submit_is_not_blocked_by_drain() {
        let counting = Arc::new(CountingHandler::default());
        let scheduler = Arc::new({
            let mut scheduler = Scheduler::new(&config(4));
            scheduler.register("wait", Arc::new(WaitForCancel));
            scheduler.register("count", counting.clone());
            scheduler
        });
        scheduler.submit(QueueTask::new("wait", Vec::new())).await.unwrap();

        let draining = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.drain().await }
        });
        tokio::task::yield_now().await;

        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.submit(QueueTask::new("count", Vec::new())),
        )
        .await
        .expect("submit should not wait for drain")
        .unwrap();

        scheduler.cancellation_token().cancel();
        draining.await.unwrap();
        scheduler.drain().await;
        assert_eq!(counting.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_handlers() {
        let mut scheduler = Scheduler::new(&config(4));
        scheduler.register("wait", Arc::new(WaitForCancel));
        scheduler.submit(QueueTask::new("wait", Vec::new())).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .expect("shutdown should not hang");
        assert!(scheduler.cancellation_token().is_cancelled());
    }
}
