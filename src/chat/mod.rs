//! Streaming chat pipeline.
//!
//! - `processor` - parses the newline-delimited JSON stream into a growing reply
//! - `store` - observable per-conversation message lists
//! - `controller` - drives one send from user message to finished reply
pub mod controller;
pub mod processor;
pub mod store;

use crate::sync::queue::QueueError;
use crate::transport::TransportError;

pub use controller::{ActionOutcome, ChatController, SendOutcome};
pub use processor::{
    ProcessorError, StreamEvent, StreamMetadata, StreamPhase, StreamSnapshot,
    StreamTokenProcessor,
};
pub use store::{ChangeKind, ListenerId, MessageStore, Scope, StoreChange};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("a reply is still streaming for this conversation")]
    StreamInProgress,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ChatError {
    /// Rejected before anything was sent or stored.
    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::EmptyMessage | ChatError::StreamInProgress)
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
