//! Persistence layer — the message, task and quota stores the worker writes to.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{
    FreeTier, MessageStore, MessageUpdate, QuotaLedger, QuotaUsage, TaskResult, TaskStore,
};
