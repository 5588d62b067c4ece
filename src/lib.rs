//! Group chat worker — answers queued group chat messages from a streaming
//! chat backend and settles the user's quota.

pub mod config;
pub mod error;
pub mod llm;
pub mod store;
pub mod worker;
