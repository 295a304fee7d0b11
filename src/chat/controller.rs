use super::processor::{ProcessorError, StreamEvent, StreamPhase, StreamSnapshot, StreamTokenProcessor};
use super::store::{MessageStore, messages_from_history};
use super::{ChatError, ChatResult};
use crate::config::SyncConfig;
use crate::sync::network::NetworkMonitor;
use crate::sync::queue::{OfflineActionQueue, PendingAction, QueueError, SendMessagePayload};
use crate::transport::{ChatTransport, TransportError, TransportResult};
use crate::types::{Conversation, ConversationDraft, ConversationKey, Message, MessagePatch, MessageStatus};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Result of a reply that streamed to completion.
#[derive(Clone, Debug, PartialEq)]
pub struct SendOutcome {
    /// Conversation the reply ended up in; a draft is promoted once the server names it.
    pub conversation: ConversationKey,
    pub message_id: String,
    pub content: String,
    pub model: Option<String>,
    pub sources: Vec<String>,
}

/// A mutating call either reached the server or was parked in the offline queue.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionOutcome<T> {
    Done(T),
    Queued { action_id: String },
}

/// Where a streamed reply is written.
pub(crate) struct ReplyTarget<'a> {
    pub key: ConversationKey,
    pub placeholder_id: &'a str,
    pub user_message_id: Option<&'a str>,
}

/// Streams the reply to `content` into the message `target.placeholder_id`.
///
/// `processor` must already be started. Every content update lands in the store
/// as it arrives; on success the placeholder is finalized and frozen. Failures
/// are returned untouched so the caller decides how to surface them.
pub(crate) async fn stream_into_message(
    transport: &dyn ChatTransport,
    store: &MessageStore,
    processor: &Mutex<StreamTokenProcessor>,
    target: ReplyTarget<'_>,
    content: &str,
) -> ChatResult<SendOutcome> {
    let key = target.key;
    let placeholder_id = target.placeholder_id;
    let mut misuse: Option<ProcessorError> = None;

    let reply = {
        let mut on_chunk = |raw: &str| {
            let events = {
                let mut processor = processor.lock().expect("stream state poisoned");
                if processor.phase() == StreamPhase::Complete {
                    debug!(len = raw.len(), "dropping chunk received after terminal record");
                    return;
                }
                processor.process_chunk(raw)
            };
            match events {
                Ok(events) => {
                    for event in events {
                        apply_event(store, key, placeholder_id, event);
                    }
                }
                Err(err) => {
                    error!(error = %err, "stream processor misuse");
                    misuse.get_or_insert(err);
                }
            }
        };
        transport.send_message(content, key.id(), &mut on_chunk).await
    };

    let reply = reply?;
    if let Some(err) = misuse {
        return Err(err.into());
    }

    let snapshot = {
        let mut processor = processor.lock().expect("stream state poisoned");
        for event in processor.complete()? {
            apply_event(store, key, placeholder_id, event);
        }
        processor.get_state()
    };

    let final_content = if snapshot.full_content.is_empty() {
        reply.content
    } else {
        snapshot.full_content
    };

    let mut key = key;
    if key == ConversationKey::Draft
        && let Some(chat_id) = snapshot.chat_id.or(reply.chat_id)
    {
        info!(chat_id, "draft conversation assigned by server");
        store.promote(ConversationKey::Draft, ConversationKey::Id(chat_id));
        key = ConversationKey::Id(chat_id);
    }

    // A chatId standing in for the message id repeats across replies; ids stay unique.
    let message_id = snapshot
        .message_id
        .as_ref()
        .map(|id| format!("server-{id}"))
        .filter(|id| id == placeholder_id || store.find(key, id).is_none())
        .unwrap_or_else(|| placeholder_id.to_string());
    store.update_by_id(
        key,
        placeholder_id,
        MessagePatch {
            id: Some(message_id.clone()),
            content: Some(final_content.clone()),
            conversation_id: key.id(),
            server_message_id: snapshot.message_id.clone(),
            feedback: None,
            status: Some(MessageStatus::Complete),
        },
    );
    if let Some(user_id) = target.user_message_id {
        store.update_by_id(
            key,
            user_id,
            MessagePatch {
                conversation_id: key.id(),
                status: Some(MessageStatus::Complete),
                ..MessagePatch::default()
            },
        );
    }

    Ok(SendOutcome {
        conversation: key,
        message_id,
        content: final_content,
        model: snapshot.model,
        sources: snapshot.sources,
    })
}

fn apply_event(store: &MessageStore, key: ConversationKey, placeholder_id: &str, event: StreamEvent) {
    match event {
        StreamEvent::Content { content, .. } => {
            store.update_by_id(key, placeholder_id, MessagePatch::content(content));
        }
        StreamEvent::Sources(sources) => {
            debug!(count = sources.len(), "reply sources received");
        }
        // Finalized once the transport call returns.
        StreamEvent::Complete { .. } => {}
    }
}

/// Settles a send whose future was dropped before the transport returned.
///
/// Without it the shared stream state would stay `Streaming` and every later
/// send would be rejected.
struct SendGuard<'a> {
    controller: &'a ChatController,
    key: ConversationKey,
    placeholder_id: &'a str,
    armed: bool,
}

impl SendGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(conversation = %self.key, "send dropped before the reply finished");
        match self.controller.stream.lock() {
            Ok(mut stream) => stream.fail(),
            Err(poisoned) => poisoned.into_inner().fail(),
        }
        let store = &self.controller.store;
        let key = store.locate(self.placeholder_id).unwrap_or(self.key);
        store.update_by_id(
            key,
            self.placeholder_id,
            MessagePatch {
                status: Some(MessageStatus::Error),
                ..MessagePatch::default()
            },
        );
    }
}

/// Drives sends for the active conversation.
///
/// Holds the only live stream state: a second `send_message` while a reply is
/// still streaming is rejected instead of interleaving with it.
pub struct ChatController {
    transport: Arc<dyn ChatTransport>,
    store: Arc<MessageStore>,
    queue: Arc<OfflineActionQueue>,
    network: Arc<NetworkMonitor>,
    fallback_message: String,
    active: Mutex<ConversationKey>,
    stream: Mutex<StreamTokenProcessor>,
}

impl ChatController {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<MessageStore>,
        queue: Arc<OfflineActionQueue>,
        network: Arc<NetworkMonitor>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            transport,
            store,
            queue,
            network,
            fallback_message: config.fallback_message.clone(),
            active: Mutex::new(ConversationKey::Draft),
            stream: Mutex::new(StreamTokenProcessor::new()),
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<OfflineActionQueue> {
        &self.queue
    }

    pub fn active_conversation(&self) -> ConversationKey {
        *self.active.lock().expect("active conversation poisoned")
    }

    pub fn select_conversation(&self, key: ConversationKey) {
        *self.active.lock().expect("active conversation poisoned") = key;
    }

    pub fn phase(&self) -> StreamPhase {
        self.stream.lock().expect("stream state poisoned").phase()
    }

    pub fn stream_snapshot(&self) -> StreamSnapshot {
        self.stream.lock().expect("stream state poisoned").get_state()
    }

    /// Sends `content` to the active conversation and streams the reply into the store.
    ///
    /// Blank input is rejected before anything is stored or sent. A failed or
    /// impossible transport call leaves the fallback text in the reply slot and
    /// parks the send in the offline queue.
    pub async fn send_message(&self, content: &str) -> ChatResult<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        {
            let mut stream = self.stream.lock().expect("stream state poisoned");
            if stream.is_streaming() {
                return Err(ChatError::StreamInProgress);
            }
            stream.start();
        }

        let key = self.active_conversation();
        let user = Message::user(content, key.id());
        let user_id = user.id.clone();
        self.store.append(key, user);
        let placeholder = Message::placeholder(key.id());
        let placeholder_id = placeholder.id.clone();
        self.store.append(key, placeholder);
        let guard = SendGuard {
            controller: self,
            key,
            placeholder_id: &placeholder_id,
            armed: true,
        };

        let result = if self.network.is_online() {
            stream_into_message(
                self.transport.as_ref(),
                &self.store,
                &self.stream,
                ReplyTarget {
                    key,
                    placeholder_id: &placeholder_id,
                    user_message_id: Some(&user_id),
                },
                content,
            )
            .await
        } else {
            Err(ChatError::Transport(TransportError::Offline))
        };

        guard.disarm();
        match result {
            Ok(outcome) => {
                if outcome.conversation != key {
                    let mut active = self.active.lock().expect("active conversation poisoned");
                    if *active == key {
                        *active = outcome.conversation;
                    }
                }
                Ok(outcome)
            }
            Err(err) => {
                self.show_fallback(key, &placeholder_id);
                if let ChatError::Transport(transport_err) = &err {
                    error!(error = %transport_err, conversation = %key, "send failed, queueing for retry");
                    let payload = SendMessagePayload {
                        conversation_id: key.id(),
                        content: content.to_string(),
                        placeholder_id: placeholder_id.clone(),
                        user_message_id: Some(user_id),
                    };
                    if let Err(queue_err) = self.park(PendingAction::send_message(&payload)).await {
                        error!(error = %queue_err, "could not queue failed send");
                    }
                }
                Err(err)
            }
        }
    }

    fn show_fallback(&self, key: ConversationKey, placeholder_id: &str) {
        self.stream.lock().expect("stream state poisoned").fail();
        self.store.update_by_id(
            key,
            placeholder_id,
            MessagePatch {
                content: Some(self.fallback_message.clone()),
                status: Some(MessageStatus::Error),
                ..MessagePatch::default()
            },
        );
    }

    async fn park(
        &self,
        action: Result<PendingAction, QueueError>,
    ) -> ChatResult<String> {
        let action = action?;
        let action_id = action.id.clone();
        self.queue.enqueue(action).await?;
        Ok(action_id)
    }

    /// Loads history for `key` from the server and installs it in the store.
    pub async fn load_history(&self, key: ConversationKey) -> ChatResult<usize> {
        let Some(conversation_id) = key.id() else {
            return Ok(self.store.get(key).len());
        };
        let records = self.transport.load_messages(conversation_id).await?;
        let messages = messages_from_history(records);
        let count = messages.len();
        self.store.replace_all(key, messages);
        Ok(count)
    }

    async fn run_or_queue<T, F>(
        &self,
        attempt: F,
        action: Result<PendingAction, QueueError>,
    ) -> ChatResult<ActionOutcome<T>>
    where
        F: Future<Output = TransportResult<T>>,
    {
        if self.network.is_online() {
            match attempt.await {
                Ok(value) => return Ok(ActionOutcome::Done(value)),
                Err(err) => warn!(error = %err, "conversation update failed, queueing for retry"),
            }
        }
        let action_id = self.park(action).await?;
        Ok(ActionOutcome::Queued { action_id })
    }

    pub async fn create_conversation(
        &self,
        draft: ConversationDraft,
    ) -> ChatResult<ActionOutcome<Conversation>> {
        self.run_or_queue(
            self.transport.create_conversation(&draft),
            PendingAction::create_conversation(&draft),
        )
        .await
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: i64,
        draft: ConversationDraft,
    ) -> ChatResult<ActionOutcome<()>> {
        self.run_or_queue(
            self.transport.update_conversation(conversation_id, &draft),
            PendingAction::update_conversation(conversation_id, &draft),
        )
        .await
    }

    /// Deletes a conversation; its local messages are dropped right away.
    pub async fn delete_conversation(&self, conversation_id: i64) -> ChatResult<ActionOutcome<()>> {
        let outcome = self
            .run_or_queue(
                self.transport.delete_conversation(conversation_id),
                PendingAction::delete_conversation(conversation_id),
            )
            .await?;
        let key = ConversationKey::Id(conversation_id);
        self.store.clear(key);
        let mut active = self.active.lock().expect("active conversation poisoned");
        if *active == key {
            *active = ConversationKey::Draft;
        }
        Ok(outcome)
    }
}
