//! Integration tests for on-device blob storage
//!
//! Each test works in its own scratch directory under the system temp dir.

use nurture_chat::config::SyncConfig;
use nurture_chat::storage::{FileStore, KeyValueStore};
use std::path::PathBuf;

fn scratch_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("nurture-{name}-{}", uuid::Uuid::new_v4()))
}

mod file_store_tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let root = scratch_dir("set-get");
        let store = FileStore::new(&root);
        let value = r#"[{"id":"a","kind":"SEND_MESSAGE","data":{},"timestamp":1,"retryCount":0}]"#;

        store.set("offline_pending_actions", value).await.expect("Failed to set");
        let retrieved = store.get("offline_pending_actions").await.expect("Failed to get");
        assert_eq!(retrieved.as_deref(), Some(value));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let root = scratch_dir("missing");
        let store = FileStore::new(&root);
        assert_eq!(store.get("nonexistent_key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove() {
        let root = scratch_dir("remove");
        let store = FileStore::new(&root);

        store.set("to_delete", "value").await.unwrap();
        assert!(store.get("to_delete").await.unwrap().is_some());

        store.remove("to_delete").await.unwrap();
        assert!(store.get("to_delete").await.unwrap().is_none());

        // Removing again is not an error
        store.remove("to_delete").await.unwrap();

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let root = scratch_dir("overwrite");
        let store = FileStore::new(&root);

        store.set("last_sync_time", "1000").await.unwrap();
        store.set("last_sync_time", "2000").await.unwrap();
        assert_eq!(store.get("last_sync_time").await.unwrap().as_deref(), Some("2000"));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_special_characters_in_key() {
        let root = scratch_dir("special");
        let store = FileStore::new(&root);

        store.set("user:prefs/../x", "v").await.unwrap();
        assert_eq!(store.get("user:prefs/../x").await.unwrap().as_deref(), Some("v"));
        // Nothing escapes the root directory
        assert!(std::fs::read_dir(&root).unwrap().count() == 1);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_unicode_round_trip() {
        let root = scratch_dir("unicode");
        let store = FileStore::new(&root);

        store.set("reply", "宝宝发烧了怎么办").await.unwrap();
        assert_eq!(store.get("reply").await.unwrap().as_deref(), Some("宝宝发烧了怎么办"));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_stores_are_isolated() {
        let first_root = scratch_dir("isolated-a");
        let second_root = scratch_dir("isolated-b");
        let first = FileStore::new(&first_root);
        let second = FileStore::new(&second_root);

        first.set("shared_key", "from first").await.unwrap();
        second.set("shared_key", "from second").await.unwrap();

        assert_eq!(first.get("shared_key").await.unwrap().as_deref(), Some("from first"));
        assert_eq!(second.get("shared_key").await.unwrap().as_deref(), Some("from second"));

        let _ = std::fs::remove_dir_all(first_root);
        let _ = std::fs::remove_dir_all(second_root);
    }
}

mod queue_on_disk_tests {
    use super::*;
    use nurture_chat::chat::MessageStore;
    use nurture_chat::sync::{NetworkMonitor, OfflineActionQueue, PendingAction};
    use nurture_chat::transport::{
        ChatTransport, ChunkSink, TransportError, TransportReply, TransportResult,
    };
    use nurture_chat::types::{Conversation, ConversationDraft, HistoryRecord};
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait::async_trait]
    impl ChatTransport for Unreachable {
        async fn send_message(
            &self,
            _content: &str,
            _conversation_id: Option<i64>,
            _on_chunk: &mut ChunkSink<'_>,
        ) -> TransportResult<TransportReply> {
            Err(TransportError::Offline)
        }

        async fn load_messages(&self, _conversation_id: i64) -> TransportResult<Vec<HistoryRecord>> {
            Err(TransportError::Offline)
        }

        async fn create_conversation(
            &self,
            _draft: &ConversationDraft,
        ) -> TransportResult<Conversation> {
            Err(TransportError::Offline)
        }

        async fn update_conversation(
            &self,
            _conversation_id: i64,
            _draft: &ConversationDraft,
        ) -> TransportResult<()> {
            Err(TransportError::Offline)
        }

        async fn delete_conversation(&self, _conversation_id: i64) -> TransportResult<()> {
            Err(TransportError::Offline)
        }
    }

    fn queue_at(root: &PathBuf) -> OfflineActionQueue {
        OfflineActionQueue::new(
            Arc::new(FileStore::new(root)),
            Arc::new(Unreachable),
            Arc::new(MessageStore::new()),
            Arc::new(NetworkMonitor::new(false)),
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let root = scratch_dir("queue");

        let action = PendingAction::delete_conversation(12).unwrap();
        queue_at(&root).enqueue(action.clone()).await.unwrap();

        let restored = queue_at(&root).pending_actions().await.unwrap();
        assert_eq!(restored, vec![action]);

        let _ = std::fs::remove_dir_all(root);
    }
}
