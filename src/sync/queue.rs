use super::network::{ConnectivityChange, NetworkMonitor, SubscriptionId};
use crate::chat::ChatError;
use crate::chat::controller::{ReplyTarget, stream_into_message};
use crate::chat::processor::StreamTokenProcessor;
use crate::chat::store::MessageStore;
use crate::config::SyncConfig;
use crate::storage::{KeyValueStore, StorageError};
use crate::transport::ChatTransport;
use crate::types::{
    ConversationDraft, ConversationKey, Message, MessagePatch, MessageStatus, now_millis,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to encode offline action: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    CreateConversation,
    UpdateConversation,
    DeleteConversation,
    SendMessage,
}

/// A mutating call waiting for connectivity, as persisted on the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: String,
    pub kind: ActionKind,
    pub data: Value,
    pub timestamp: i64,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: Option<i64>,
    pub content: String,
    /// Assistant message that shows the fallback text until the replay succeeds.
    pub placeholder_id: String,
    #[serde(default)]
    pub user_message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConversationPayload {
    pub conversation_id: i64,
    #[serde(flatten)]
    pub draft: ConversationDraft,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConversationPayload {
    pub conversation_id: i64,
}

impl PendingAction {
    pub fn new(kind: ActionKind, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            data,
            timestamp: now_millis(),
            retry_count: 0,
        }
    }

    pub fn create_conversation(draft: &ConversationDraft) -> QueueResult<Self> {
        Ok(Self::new(
            ActionKind::CreateConversation,
            serde_json::to_value(draft)?,
        ))
    }

    pub fn update_conversation(conversation_id: i64, draft: &ConversationDraft) -> QueueResult<Self> {
        let payload = UpdateConversationPayload {
            conversation_id,
            draft: draft.clone(),
        };
        Ok(Self::new(
            ActionKind::UpdateConversation,
            serde_json::to_value(payload)?,
        ))
    }

    pub fn delete_conversation(conversation_id: i64) -> QueueResult<Self> {
        Ok(Self::new(
            ActionKind::DeleteConversation,
            serde_json::to_value(DeleteConversationPayload { conversation_id })?,
        ))
    }

    pub fn send_message(payload: &SendMessagePayload) -> QueueResult<Self> {
        Ok(Self::new(ActionKind::SendMessage, serde_json::to_value(payload)?))
    }
}

#[derive(Debug, thiserror::Error)]
enum ReplayError {
    #[error("malformed {kind:?} payload: {source}")]
    Payload {
        kind: ActionKind,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl From<crate::transport::TransportError> for ReplayError {
    fn from(err: crate::transport::TransportError) -> Self {
        ReplayError::Chat(err.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    Empty,
    AlreadyFlushing,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub skipped: Option<SkipReason>,
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed but kept for another pass.
    pub failed: usize,
    /// Failed for the last allowed time and removed.
    pub dropped: usize,
    pub remaining: usize,
}

impl FlushReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub dropped_total: u64,
    pub is_flushing: bool,
    pub last_sync_time: Option<i64>,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Persists mutating calls that could not reach the server and replays them in order.
pub struct OfflineActionQueue {
    storage: Arc<dyn KeyValueStore>,
    transport: Arc<dyn ChatTransport>,
    store: Arc<MessageStore>,
    network: Arc<NetworkMonitor>,
    config: SyncConfig,
    /// Serializes read-modify-write cycles on the persisted array.
    lock: tokio::sync::Mutex<()>,
    flushing: AtomicBool,
    dropped_total: AtomicU64,
}

impl OfflineActionQueue {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        transport: Arc<dyn ChatTransport>,
        store: Arc<MessageStore>,
        network: Arc<NetworkMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            storage,
            transport,
            store,
            network,
            config,
            lock: tokio::sync::Mutex::new(()),
            flushing: AtomicBool::new(false),
            dropped_total: AtomicU64::new(0),
        }
    }

    async fn read_actions(&self) -> QueueResult<Vec<PendingAction>> {
        let Some(raw) = self.storage.get(&self.config.queue_key).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(actions) => Ok(actions),
            Err(err) => {
                warn!(error = %err, "persisted offline queue is unreadable, starting over");
                Ok(Vec::new())
            }
        }
    }

    async fn write_actions(&self, actions: &[PendingAction]) -> QueueResult<()> {
        let raw = serde_json::to_string(actions)?;
        self.storage.set(&self.config.queue_key, &raw).await?;
        Ok(())
    }

    pub async fn enqueue(&self, action: PendingAction) -> QueueResult<()> {
        let _lock = self.lock.lock().await;
        let mut actions = self.read_actions().await?;
        info!(id = %action.id, kind = ?action.kind, "queued offline action");
        actions.push(action);
        self.write_actions(&actions).await
    }

    pub async fn pending_actions(&self) -> QueueResult<Vec<PendingAction>> {
        let _lock = self.lock.lock().await;
        self.read_actions().await
    }

    pub async fn clear(&self) -> QueueResult<()> {
        let _lock = self.lock.lock().await;
        self.write_actions(&[]).await
    }

    pub async fn load_last_sync_time(&self) -> QueueResult<Option<i64>> {
        let raw = self.storage.get(&self.config.last_sync_key).await?;
        Ok(raw.and_then(|value| value.trim().parse().ok()))
    }

    pub async fn status(&self) -> QueueResult<QueueStatus> {
        Ok(QueueStatus {
            pending: self.pending_actions().await?.len(),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            is_flushing: self.flushing.load(Ordering::Acquire),
            last_sync_time: self.load_last_sync_time().await?,
        })
    }

    /// Replays queued actions one at a time, oldest first.
    ///
    /// Does nothing while offline, when the queue is empty, or when another
    /// flush is already running.
    pub async fn flush(&self) -> QueueResult<FlushReport> {
        if !self.network.is_online() {
            debug!("offline, flush skipped");
            return Ok(FlushReport::skipped(SkipReason::Offline));
        }
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            debug!("flush already running");
            return Ok(FlushReport::skipped(SkipReason::AlreadyFlushing));
        };

        let snapshot = {
            let _lock = self.lock.lock().await;
            self.read_actions().await?
        };
        if snapshot.is_empty() {
            return Ok(FlushReport::skipped(SkipReason::Empty));
        }

        let mut report = FlushReport::default();
        for (index, mut action) in snapshot.into_iter().enumerate() {
            if index > 0 && !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            if !self.network.is_online() {
                info!("connectivity lost, pausing flush");
                break;
            }

            report.attempted += 1;
            let outcome = self.replay(&mut action).await;

            let _lock = self.lock.lock().await;
            let mut actions = self.read_actions().await?;
            let Some(pos) = actions.iter().position(|queued| queued.id == action.id) else {
                debug!(id = %action.id, "action left the queue during replay");
                continue;
            };
            match outcome {
                Ok(()) => {
                    debug!(id = %action.id, kind = ?action.kind, "offline action replayed");
                    actions.remove(pos);
                    report.succeeded += 1;
                }
                Err(err) => {
                    let entry = &mut actions[pos];
                    entry.data = action.data.clone();
                    entry.retry_count += 1;
                    if entry.retry_count >= self.config.max_retries {
                        error!(
                            id = %entry.id,
                            kind = ?entry.kind,
                            retries = entry.retry_count,
                            error = %err,
                            "dropping offline action after exhausting retries"
                        );
                        actions.remove(pos);
                        self.dropped_total.fetch_add(1, Ordering::Relaxed);
                        report.dropped += 1;
                    } else {
                        warn!(
                            id = %entry.id,
                            kind = ?entry.kind,
                            retries = entry.retry_count,
                            error = %err,
                            "offline action failed, keeping it for the next flush"
                        );
                        report.failed += 1;
                    }
                }
            }
            self.write_actions(&actions).await?;
        }

        let _lock = self.lock.lock().await;
        report.remaining = self.read_actions().await?.len();
        if report.remaining == 0 {
            self.storage
                .set(&self.config.last_sync_key, &now_millis().to_string())
                .await?;
        }
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            dropped = report.dropped,
            remaining = report.remaining,
            "offline queue flushed"
        );
        Ok(report)
    }

    /// Runs one action. A replayed send may rewrite `action.data` so the next
    /// attempt renders into the same messages.
    async fn replay(&self, action: &mut PendingAction) -> Result<(), ReplayError> {
        fn decode<T: serde::de::DeserializeOwned>(action: &PendingAction) -> Result<T, ReplayError> {
            serde_json::from_value(action.data.clone()).map_err(|source| ReplayError::Payload {
                kind: action.kind,
                source,
            })
        }

        match action.kind {
            ActionKind::CreateConversation => {
                let draft: ConversationDraft = decode(action)?;
                let conversation = self.transport.create_conversation(&draft).await?;
                debug!(id = conversation.id, "conversation created from offline queue");
            }
            ActionKind::UpdateConversation => {
                let payload: UpdateConversationPayload = decode(action)?;
                self.transport
                    .update_conversation(payload.conversation_id, &payload.draft)
                    .await?;
            }
            ActionKind::DeleteConversation => {
                let payload: DeleteConversationPayload = decode(action)?;
                self.transport
                    .delete_conversation(payload.conversation_id)
                    .await?;
                self.store
                    .clear(ConversationKey::Id(payload.conversation_id));
            }
            ActionKind::SendMessage => {
                let mut payload: SendMessagePayload = decode(action)?;
                let result = self.replay_send(&mut payload).await;
                action.data = serde_json::to_value(&payload).map_err(|source| {
                    ReplayError::Payload {
                        kind: action.kind,
                        source,
                    }
                })?;
                result?;
            }
        }
        Ok(())
    }

    /// Streams the reply into the assistant message left behind by the failed send.
    ///
    /// The messages are looked up wherever they live now, so a draft that was
    /// promoted in the meantime is replayed against its server conversation.
    /// When the local copy is gone the send is shown again before replaying it.
    async fn replay_send(&self, payload: &mut SendMessagePayload) -> Result<(), ReplayError> {
        let key = match self.store.locate(&payload.placeholder_id) {
            Some(key) => key,
            None => {
                let key = ConversationKey::from(payload.conversation_id);
                debug!(conversation = %key, "reply slot gone, showing queued send again");
                let user = Message::user(payload.content.clone(), key.id());
                let placeholder = Message::placeholder(key.id());
                payload.user_message_id = Some(user.id.clone());
                payload.placeholder_id = placeholder.id.clone();
                self.store.append(key, user);
                self.store.append(key, placeholder);
                key
            }
        };
        payload.conversation_id = key.id();

        let processor = Mutex::new(StreamTokenProcessor::new());
        processor.lock().expect("stream state poisoned").start();

        let result = stream_into_message(
            self.transport.as_ref(),
            &self.store,
            &processor,
            ReplyTarget {
                key,
                placeholder_id: &payload.placeholder_id,
                user_message_id: payload.user_message_id.as_deref(),
            },
            &payload.content,
        )
        .await;

        match result {
            Ok(outcome) => {
                payload.conversation_id = outcome.conversation.id();
                payload.placeholder_id = outcome.message_id;
                Ok(())
            }
            Err(err) => {
                processor.lock().expect("stream state poisoned").fail();
                // Partial output from the failed attempt is replaced by the fallback again.
                self.store.update_by_id(
                    key,
                    &payload.placeholder_id,
                    MessagePatch {
                        content: Some(self.config.fallback_message.clone()),
                        status: Some(MessageStatus::Error),
                        ..MessagePatch::default()
                    },
                );
                Err(err.into())
            }
        }
    }

    /// Flushes whenever the network monitor reports the device came back online.
    ///
    /// The listener only holds a weak reference, so dropping the queue detaches it.
    /// The flush is spawned on the runtime of the caller of `set_online`, or else
    /// on the runtime that was current when this was called, so platform threads
    /// outside tokio can report connectivity. With neither available the
    /// transition is logged and the queue waits for the next flush.
    pub fn watch_connectivity(self: &Arc<Self>) -> SubscriptionId {
        let queue = Arc::downgrade(self);
        let attached = tokio::runtime::Handle::try_current().ok();
        self.network.subscribe(move |change| {
            if change != ConnectivityChange::BecameOnline {
                return;
            }
            let Some(queue) = queue.upgrade() else {
                return;
            };
            let handle = tokio::runtime::Handle::try_current()
                .ok()
                .or_else(|| attached.clone());
            match handle {
                Some(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = queue.flush().await {
                            error!(error = %err, "offline queue flush failed");
                        }
                    });
                }
                None => warn!("no async runtime available, reconnect flush skipped"),
            }
        })
    }
}
