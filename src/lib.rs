//! Streaming chat pipeline for the parenting assistant app.
//!
//! UI code sends through [`ChatController`], renders from [`MessageStore`]
//! subscriptions, and leaves retries to the [`OfflineActionQueue`].
pub mod chat;
pub mod config;
pub mod pipeline;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use chat::{ChatController, ChatError, ChatResult, MessageStore, StreamTokenProcessor};
pub use pipeline::ChatPipeline;
pub use sync::{NetworkMonitor, OfflineActionQueue};
