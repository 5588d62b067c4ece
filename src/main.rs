use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};

use group_chat_worker::config::WorkerConfig;
use group_chat_worker::llm::{CostTable, LlmConfig, create_backend};
use group_chat_worker::store::MemoryStore;
use group_chat_worker::worker::{
    ExecutorDeps, GroupChatExecutor, GroupChatPayload, Scheduler, TYPE_GROUP_CHAT,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the appender guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_tracing();

    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    let llm_config = LlmConfig::from_env().context("loading backend configuration")?;

    eprintln!("💬 Group chat worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Backend: {}", llm_config.base_url);
    eprintln!("   Max parallel tasks: {}", config.max_parallel_jobs);
    eprintln!("   Stream deadline: {:?}", config.stream_deadline);
    eprintln!("   Reading one JSON payload per line from stdin. Ctrl-C to stop.\n");

    let store = Arc::new(MemoryStore::new());
    let deps = ExecutorDeps {
        backend: create_backend(&llm_config),
        messages: store.clone(),
        tasks: store.clone(),
        ledger: store.clone(),
        free_tier: store.clone(),
        costs: Arc::new(CostTable::with_aliases(config.fee_aliases.clone())),
    };

    let mut scheduler = Scheduler::new(&config);
    scheduler.register(
        TYPE_GROUP_CHAT,
        Arc::new(GroupChatExecutor::new(deps, config.clone())),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, cancelling running tasks");
                scheduler.shutdown().await;
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match enqueue(&scheduler, &store, &line).await {
                    Ok(task_id) => tracing::info!(task_id = %task_id, "Task submitted"),
                    Err(e) => tracing::warn!(error = %e, "Rejected payload"),
                }
            }
        }
    }

    scheduler.drain().await;
    Ok(())
}

/// Play the producer's part for a payload read from stdin: stamp it, create
/// the pending message, freeze its quota, then hand it to the scheduler.
async fn enqueue(
    scheduler: &Scheduler,
    store: &MemoryStore,
    line: &str,
) -> anyhow::Result<String> {
    let mut payload: GroupChatPayload =
        serde_json::from_str(line).context("decoding group chat payload")?;
    if payload.created_at.is_none() {
        payload.created_at = Some(Utc::now());
    }

    store
        .insert_pending_message(payload.group_id, payload.user_id, payload.message_id)
        .await;
    if payload.frozen_coins > 0 {
        store.credit(payload.user_id, payload.frozen_coins).await;
        store.freeze(payload.user_id, payload.frozen_coins).await?;
    }

    let task = payload.to_task()?;
    Ok(scheduler.submit(task).await?)
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match std::env::var("GROUP_CHAT_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "group-chat-worker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
