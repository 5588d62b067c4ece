//! Worker system — group chat task execution with scheduling.
//!
//! Core components:
//! - `task` — payloads, the queue envelope and the `TaskHandler` trait
//! - `state` — task and message state machines (Pending → Succeeded/Failed)
//! - `stream` — reply stream aggregation under a phase deadline
//! - `executor` — the group chat job executor
//! - `scheduler` — handler routing with bounded concurrency

pub mod executor;
pub mod scheduler;
pub mod state;
pub mod stream;
pub mod task;

pub use executor::{ExecutionOutcome, ExecutorDeps, GroupChatExecutor};
pub use scheduler::Scheduler;
pub use state::{MessageStatus, TaskStatus};
pub use task::{GroupChatPayload, QueuePayload, QueueTask, TYPE_GROUP_CHAT, TaskHandler};
