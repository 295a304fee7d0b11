use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

static LOCAL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Milliseconds since the unix epoch, the unit every timestamp in this crate uses.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Client-generated id for a message the server has not confirmed yet.
pub fn temp_message_id(prefix: &str) -> String {
    let seq = LOCAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{seq}", now_millis())
}

/// Which conversation a message list belongs to.
///
/// A conversation that the server has not created yet lives under `Draft`
/// until a reply carries its id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationKey {
    #[default]
    Draft,
    Id(i64),
}

impl ConversationKey {
    pub fn id(&self) -> Option<i64> {
        match self {
            ConversationKey::Draft => None,
            ConversationKey::Id(id) => Some(*id),
        }
    }
}

impl From<Option<i64>> for ConversationKey {
    fn from(id: Option<i64>) -> Self {
        id.map_or(ConversationKey::Draft, ConversationKey::Id)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Draft => write!(f, "draft"),
            ConversationKey::Id(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Streaming,
    Complete,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feedback {
    Helpful,
    NotHelpful,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub is_user: bool,
    pub timestamp: i64,
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub server_message_id: Option<String>,
    #[serde(default)]
    pub feedback: Option<Feedback>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    pub fn user(content: impl Into<String>, conversation_id: Option<i64>) -> Self {
        Self {
            id: temp_message_id("user"),
            content: content.into(),
            is_user: true,
            timestamp: now_millis(),
            conversation_id,
            server_message_id: None,
            feedback: None,
            status: MessageStatus::Pending,
        }
    }

    /// Empty assistant message that streamed content is written into.
    pub fn placeholder(conversation_id: Option<i64>) -> Self {
        Self {
            id: temp_message_id("assistant"),
            content: String::new(),
            is_user: false,
            timestamp: now_millis(),
            conversation_id,
            server_message_id: None,
            feedback: None,
            status: MessageStatus::Pending,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == MessageStatus::Complete
    }
}

/// Partial update applied through `MessageStore::update_by_id`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessagePatch {
    pub id: Option<String>,
    pub content: Option<String>,
    pub conversation_id: Option<i64>,
    pub server_message_id: Option<String>,
    pub feedback: Option<Feedback>,
    pub status: Option<MessageStatus>,
}

impl MessagePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            status: Some(MessageStatus::Streaming),
            ..Self::default()
        }
    }

    pub fn touches_content(&self) -> bool {
        self.content.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub title: String,
}

/// Fields sent when creating or renaming a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDraft {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<i64>,
}

/// One question/answer pair as returned by the history endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: i64,
    pub conversation_id: i64,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub request_time: Option<i64>,
    #[serde(default)]
    pub response_time: Option<i64>,
    pub created_at: i64,
}

impl HistoryRecord {
    /// Expands the record into its user and assistant turns.
    pub fn into_messages(self) -> Vec<Message> {
        let mut out = Vec::with_capacity(2);
        if let Some(question) = self.question {
            out.push(Message {
                id: format!("server-{}-q", self.id),
                content: question,
                is_user: true,
                timestamp: self.request_time.unwrap_or(self.created_at),
                conversation_id: Some(self.conversation_id),
                server_message_id: Some(self.id.to_string()),
                feedback: None,
                status: MessageStatus::Complete,
            });
        }
        if let Some(answer) = self.answer {
            out.push(Message {
                id: format!("server-{}", self.id),
                content: answer,
                is_user: false,
                timestamp: self.response_time.unwrap_or(self.created_at),
                conversation_id: Some(self.conversation_id),
                server_message_id: Some(self.id.to_string()),
                feedback: None,
                status: MessageStatus::Complete,
            });
        }
        out
    }
}
