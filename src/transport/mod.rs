//! Contract for the chat backend.
//!
//! The pipeline only talks to the network through [`ChatTransport`]. The
//! bundled [`HttpTransport`] speaks the newline-delimited JSON protocol over
//! reqwest; tests substitute their own stubs.
pub mod http;

use crate::types::{Conversation, ConversationDraft, HistoryRecord};
use async_trait::async_trait;

pub use http::HttpTransport;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("device is offline")]
    Offline,

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Decode(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// What the backend reports once a streamed reply has finished.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportReply {
    pub content: String,
    pub chat_id: Option<i64>,
}

pub type ChunkSink<'a> = dyn FnMut(&str) + Send + 'a;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Sends `content` and hands every raw chunk of the streamed reply to
    /// `on_chunk`, in arrival order. `conversation_id` is `None` for a
    /// conversation the server has not created yet.
    async fn send_message(
        &self,
        content: &str,
        conversation_id: Option<i64>,
        on_chunk: &mut ChunkSink<'_>,
    ) -> TransportResult<TransportReply>;

    async fn load_messages(&self, conversation_id: i64) -> TransportResult<Vec<HistoryRecord>>;

    async fn create_conversation(&self, draft: &ConversationDraft) -> TransportResult<Conversation>;

    async fn update_conversation(
        &self,
        conversation_id: i64,
        draft: &ConversationDraft,
    ) -> TransportResult<()>;

    async fn delete_conversation(&self, conversation_id: i64) -> TransportResult<()>;
}
