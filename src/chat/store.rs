use crate::types::{
    ConversationKey, Feedback, HistoryRecord, Message, MessagePatch, MessageStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Which conversations a listener wants to hear about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    All,
    Conversation(ConversationKey),
}

impl Scope {
    fn matches(&self, key: ConversationKey) -> bool {
        match self {
            Scope::All => true,
            Scope::Conversation(wanted) => *wanted == key,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChangeKind {
    Appended { id: String },
    Updated { id: String },
    Replaced,
    Cleared,
    Promoted { from: ConversationKey },
}

/// Delivered to listeners after every mutation, with the conversation's messages as they now are.
#[derive(Clone, Debug)]
pub struct StoreChange {
    pub key: ConversationKey,
    pub kind: ChangeKind,
    pub messages: Vec<Message>,
}

pub type Listener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Default)]
struct ConversationMessageState {
    messages: Vec<Message>,
    /// temporary id -> content the server has not confirmed yet
    pending: HashMap<String, String>,
}

impl ConversationMessageState {
    fn insert_ordered(&mut self, message: Message) {
        let pos = self
            .messages
            .partition_point(|existing| existing.timestamp <= message.timestamp);
        self.messages.insert(pos, message);
    }
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<ConversationKey, ConversationMessageState>,
    listeners: Vec<(ListenerId, Scope, Listener)>,
    next_listener: u64,
}

/// Keyed, observable cache of message lists.
///
/// Every mutation notifies matching listeners before it returns. Listeners run
/// outside the internal lock, so they may read the store again.
#[derive(Default)]
pub struct MessageStore {
    inner: Mutex<Inner>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        scope: Scope,
        listener: impl Fn(&StoreChange) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut inner = self.inner.lock().expect("message store poisoned");
        inner.next_listener += 1;
        let id = ListenerId(inner.next_listener);
        inner.listeners.push((id, scope, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().expect("message store poisoned");
        let before = inner.listeners.len();
        inner.listeners.retain(|(existing, _, _)| *existing != id);
        inner.listeners.len() != before
    }

    pub fn get(&self, key: ConversationKey) -> Vec<Message> {
        let inner = self.inner.lock().expect("message store poisoned");
        inner
            .conversations
            .get(&key)
            .map(|state| state.messages.clone())
            .unwrap_or_default()
    }

    pub fn find(&self, key: ConversationKey, id: &str) -> Option<Message> {
        let inner = self.inner.lock().expect("message store poisoned");
        inner
            .conversations
            .get(&key)?
            .messages
            .iter()
            .find(|message| message.id == id)
            .cloned()
    }

    /// Conversation currently holding the message `id`, wherever promotion moved it.
    pub fn locate(&self, id: &str) -> Option<ConversationKey> {
        let inner = self.inner.lock().expect("message store poisoned");
        inner
            .conversations
            .iter()
            .find(|(_, state)| state.messages.iter().any(|message| message.id == id))
            .map(|(key, _)| *key)
    }

    /// Unconfirmed user content, keyed by temporary message id.
    pub fn pending_for(&self, key: ConversationKey) -> HashMap<String, String> {
        let inner = self.inner.lock().expect("message store poisoned");
        inner
            .conversations
            .get(&key)
            .map(|state| state.pending.clone())
            .unwrap_or_default()
    }

    pub fn append(&self, key: ConversationKey, message: Message) {
        let id = message.id.clone();
        self.mutate(key, ChangeKind::Appended { id }, |inner| {
            let state = inner.conversations.entry(key).or_default();
            if message.is_user && message.status == MessageStatus::Pending {
                state.pending.insert(message.id.clone(), message.content.clone());
            }
            state.insert_ordered(message);
            true
        });
    }

    /// Applies `patch` to the message with `id`. Unknown ids are ignored.
    ///
    /// Content of a completed message is frozen; such patches are dropped.
    pub fn update_by_id(&self, key: ConversationKey, id: &str, patch: MessagePatch) -> bool {
        let new_id = patch.id.clone().unwrap_or_else(|| id.to_string());
        self.mutate(key, ChangeKind::Updated { id: new_id }, |inner| {
            let Some(state) = inner.conversations.get_mut(&key) else {
                debug!(conversation = %key, id, "update for unknown conversation ignored");
                return false;
            };
            let Some(message) = state.messages.iter_mut().find(|m| m.id == id) else {
                debug!(conversation = %key, id, "update for unknown message ignored");
                return false;
            };
            if message.is_complete() && patch.touches_content() {
                warn!(conversation = %key, id, "refusing to change content of a completed message");
                return false;
            }

            if let Some(content) = patch.content {
                message.content = content;
            }
            if let Some(conversation_id) = patch.conversation_id {
                message.conversation_id = Some(conversation_id);
            }
            if let Some(server_id) = patch.server_message_id {
                message.server_message_id = Some(server_id);
            }
            if let Some(feedback) = patch.feedback {
                message.feedback = Some(feedback);
            }
            if let Some(status) = patch.status {
                message.status = status;
            }
            if let Some(renamed) = patch.id {
                if let Some(content) = state.pending.remove(id) {
                    state.pending.insert(renamed.clone(), content);
                }
                message.id = renamed;
            }
            if message.status == MessageStatus::Complete {
                state.pending.remove(&message.id);
            }
            true
        })
    }

    /// Records feedback on a completed assistant message.
    pub fn set_feedback(&self, key: ConversationKey, id: &str, feedback: Feedback) -> bool {
        let eligible = self
            .find(key, id)
            .is_some_and(|message| !message.is_user && message.is_complete());
        if !eligible {
            debug!(conversation = %key, id, "feedback ignored for message that is not a completed reply");
            return false;
        }
        self.update_by_id(
            key,
            id,
            MessagePatch {
                feedback: Some(feedback),
                ..MessagePatch::default()
            },
        )
    }

    pub fn replace_all(&self, key: ConversationKey, mut messages: Vec<Message>) {
        messages.sort_by_key(|message| message.timestamp);
        self.mutate(key, ChangeKind::Replaced, |inner| {
            inner.conversations.insert(
                key,
                ConversationMessageState {
                    messages,
                    pending: HashMap::new(),
                },
            );
            true
        });
    }

    pub fn clear(&self, key: ConversationKey) {
        self.mutate(key, ChangeKind::Cleared, |inner| {
            inner.conversations.remove(&key).is_some()
        });
    }

    /// Moves everything stored under `from` into `to` and stamps the new conversation id.
    pub fn promote(&self, from: ConversationKey, to: ConversationKey) {
        if from == to {
            return;
        }
        self.mutate(to, ChangeKind::Promoted { from }, |inner| {
            let Some(moved) = inner.conversations.remove(&from) else {
                return false;
            };
            let target = inner.conversations.entry(to).or_default();
            for mut message in moved.messages {
                message.conversation_id = to.id();
                target.insert_ordered(message);
            }
            target.pending.extend(moved.pending);
            true
        });
    }

    fn mutate(
        &self,
        key: ConversationKey,
        kind: ChangeKind,
        apply: impl FnOnce(&mut Inner) -> bool,
    ) -> bool {
        let (change, listeners) = {
            let mut inner = self.inner.lock().expect("message store poisoned");
            if !apply(&mut inner) {
                return false;
            }
            let messages = inner
                .conversations
                .get(&key)
                .map(|state| state.messages.clone())
                .unwrap_or_default();
            let listeners: Vec<Listener> = inner
                .listeners
                .iter()
                .filter(|(_, scope, _)| scope.matches(key))
                .map(|(_, _, listener)| Arc::clone(listener))
                .collect();
            (
                StoreChange {
                    key,
                    kind,
                    messages,
                },
                listeners,
            )
        };

        for listener in listeners {
            listener(&change);
        }
        true
    }
}

/// Turns history records into a message list ordered by effective timestamp.
pub fn messages_from_history(records: Vec<HistoryRecord>) -> Vec<Message> {
    let mut messages: Vec<Message> = records
        .into_iter()
        .flat_map(HistoryRecord::into_messages)
        .collect();
    messages.sort_by_key(|message| message.timestamp);
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message_at(id: &str, timestamp: i64) -> Message {
        Message {
            id: id.to_string(),
            content: String::new(),
            is_user: false,
            timestamp,
            conversation_id: Some(1),
            server_message_id: None,
            feedback: None,
            status: MessageStatus::Streaming,
        }
    }

    #[test]
    fn append_keeps_timestamp_order() {
        let store = MessageStore::new();
        let key = ConversationKey::Id(1);
        store.append(key, message_at("b", 20));
        store.append(key, message_at("a", 10));
        store.append(key, message_at("c", 20));
        let ids: Vec<_> = store.get(key).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn update_unknown_id_is_noop() {
        let store = MessageStore::new();
        let key = ConversationKey::Id(1);
        assert!(!store.update_by_id(key, "missing", MessagePatch::content("x")));
        store.append(key, message_at("a", 1));
        assert!(!store.update_by_id(key, "missing", MessagePatch::content("x")));
        assert_eq!(store.get(key)[0].content, "");
    }

    #[test]
    fn completed_content_is_frozen() {
        let store = MessageStore::new();
        let key = ConversationKey::Id(1);
        store.append(key, message_at("a", 1));
        store.update_by_id(
            key,
            "a",
            MessagePatch {
                content: Some("done".into()),
                status: Some(MessageStatus::Complete),
                ..MessagePatch::default()
            },
        );
        assert!(!store.update_by_id(key, "a", MessagePatch::content("again")));
        assert_eq!(store.get(key)[0].content, "done");
        assert!(store.set_feedback(key, "a", Feedback::Helpful));
        assert_eq!(store.get(key)[0].feedback, Some(Feedback::Helpful));
    }

    #[test]
    fn feedback_requires_completed_reply() {
        let store = MessageStore::new();
        let key = ConversationKey::Id(1);
        store.append(key, message_at("a", 1));
        assert!(!store.set_feedback(key, "a", Feedback::NotHelpful));
    }

    #[test]
    fn listeners_are_notified_by_scope() {
        let store = MessageStore::new();
        let all = Arc::new(AtomicUsize::new(0));
        let only_two = Arc::new(AtomicUsize::new(0));
        {
            let all = Arc::clone(&all);
            store.subscribe(Scope::All, move |_| {
                all.fetch_add(1, Ordering::SeqCst);
            });
        }
        let id = {
            let only_two = Arc::clone(&only_two);
            store.subscribe(Scope::Conversation(ConversationKey::Id(2)), move |change| {
                assert_eq!(change.key, ConversationKey::Id(2));
                only_two.fetch_add(1, Ordering::SeqCst);
            })
        };

        store.append(ConversationKey::Id(1), message_at("a", 1));
        store.append(ConversationKey::Id(2), message_at("b", 1));
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(only_two.load(Ordering::SeqCst), 1);

        assert!(store.unsubscribe(id));
        store.clear(ConversationKey::Id(2));
        assert_eq!(only_two.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn listener_can_read_store() {
        let store = Arc::new(MessageStore::new());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let reader = Arc::clone(&store);
            let seen = Arc::clone(&seen);
            store.subscribe(Scope::All, move |change| {
                seen.store(reader.get(change.key).len(), Ordering::SeqCst);
            });
        }
        store.append(ConversationKey::Draft, message_at("a", 1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_tracks_unconfirmed_user_messages() {
        let store = MessageStore::new();
        let key = ConversationKey::Draft;
        let user = Message::user("hello", None);
        let id = user.id.clone();
        store.append(key, user);
        assert_eq!(store.pending_for(key).get(&id).map(String::as_str), Some("hello"));

        store.update_by_id(
            key,
            &id,
            MessagePatch {
                status: Some(MessageStatus::Complete),
                ..MessagePatch::default()
            },
        );
        assert!(store.pending_for(key).is_empty());
    }

    #[test]
    fn promote_moves_draft_messages() {
        let store = MessageStore::new();
        store.append(ConversationKey::Draft, Message::user("hi", None));
        store.promote(ConversationKey::Draft, ConversationKey::Id(42));
        assert!(store.get(ConversationKey::Draft).is_empty());
        let moved = store.get(ConversationKey::Id(42));
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].conversation_id, Some(42));
        assert_eq!(store.pending_for(ConversationKey::Id(42)).len(), 1);
    }

    #[test]
    fn locate_follows_promotion() {
        let store = MessageStore::new();
        let placeholder = Message::placeholder(None);
        let id = placeholder.id.clone();
        store.append(ConversationKey::Draft, placeholder);
        assert_eq!(store.locate(&id), Some(ConversationKey::Draft));

        store.promote(ConversationKey::Draft, ConversationKey::Id(42));
        assert_eq!(store.locate(&id), Some(ConversationKey::Id(42)));

        store.clear(ConversationKey::Id(42));
        assert_eq!(store.locate(&id), None);
    }

    #[test]
    fn history_is_sorted_by_effective_time() {
        let records = vec![
            HistoryRecord {
                id: 2,
                conversation_id: 1,
                question: Some("second".into()),
                answer: Some("second answer".into()),
                request_time: Some(300),
                response_time: Some(400),
                created_at: 10,
            },
            HistoryRecord {
                id: 1,
                conversation_id: 1,
                question: Some("first".into()),
                answer: Some("first answer".into()),
                request_time: None,
                response_time: None,
                created_at: 100,
            },
        ];
        let contents: Vec<_> = messages_from_history(records)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(
            contents,
            vec!["first", "first answer", "second", "second answer"]
        );
    }
}
