#![allow(dead_code)]

use async_trait::async_trait;
use nurture_chat::config::SyncConfig;
use nurture_chat::storage::{KeyValueStore, MemoryStore};
use nurture_chat::sync::NetworkMonitor;
use nurture_chat::transport::{
    ChatTransport, ChunkSink, TransportError, TransportReply, TransportResult,
};
use nurture_chat::types::{Conversation, ConversationDraft, HistoryRecord};
use nurture_chat::ChatPipeline;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Transport double that records every call and streams canned chunks.
#[derive(Default)]
pub struct StubTransport {
    chunks: Mutex<Vec<String>>,
    history: Mutex<Vec<HistoryRecord>>,
    calls: Mutex<Vec<String>>,
    send_targets: Mutex<Vec<Option<i64>>>,
    failing: AtomicBool,
    /// When set, `send_message` waits here after the first chunk.
    gate: Mutex<Option<Arc<Notify>>>,
}

impl StubTransport {
    pub fn streaming(chunks: &[&str]) -> Arc<Self> {
        let transport = Self::default();
        *transport.chunks.lock().unwrap() = chunks.iter().map(|c| c.to_string()).collect();
        Arc::new(transport)
    }

    pub fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_chunks(&self, chunks: &[&str]) {
        *self.chunks.lock().unwrap() = chunks.iter().map(|c| c.to_string()).collect();
    }

    pub fn set_history(&self, history: Vec<HistoryRecord>) {
        *self.history.lock().unwrap() = history;
    }

    pub fn gate(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&notify));
        notify
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Conversation id passed with each send, in call order.
    pub fn send_targets(&self) -> Vec<Option<i64>> {
        self.send_targets.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> TransportResult<()> {
        self.calls.lock().unwrap().push(call);
        if self.failing.load(Ordering::SeqCst) {
            Err(TransportError::Network("connection reset".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatTransport for StubTransport {
    async fn send_message(
        &self,
        content: &str,
        conversation_id: Option<i64>,
        on_chunk: &mut ChunkSink<'_>,
    ) -> TransportResult<TransportReply> {
        self.send_targets.lock().unwrap().push(conversation_id);
        self.record(format!("send:{content}"))?;
        let chunks = self.chunks.lock().unwrap().clone();
        let gate = self.gate.lock().unwrap().clone();
        for (index, chunk) in chunks.iter().enumerate() {
            on_chunk(chunk.as_str());
            if index == 0
                && let Some(gate) = &gate
            {
                gate.notified().await;
            }
        }
        Ok(TransportReply::default())
    }

    async fn load_messages(&self, conversation_id: i64) -> TransportResult<Vec<HistoryRecord>> {
        self.record(format!("load:{conversation_id}"))?;
        Ok(self.history.lock().unwrap().clone())
    }

    async fn create_conversation(&self, draft: &ConversationDraft) -> TransportResult<Conversation> {
        self.record(format!("create:{}", draft.title))?;
        Ok(Conversation {
            id: 100,
            title: draft.title.clone(),
        })
    }

    async fn update_conversation(
        &self,
        conversation_id: i64,
        _draft: &ConversationDraft,
    ) -> TransportResult<()> {
        self.record(format!("update:{conversation_id}"))
    }

    async fn delete_conversation(&self, conversation_id: i64) -> TransportResult<()> {
        self.record(format!("delete:{conversation_id}"))
    }
}

pub struct Harness {
    pub transport: Arc<StubTransport>,
    pub storage: Arc<MemoryStore>,
    pub pipeline: ChatPipeline,
}

pub fn harness(transport: Arc<StubTransport>, online: bool) -> Harness {
    let storage = Arc::new(MemoryStore::new());
    let pipeline = ChatPipeline::new(
        transport.clone(),
        storage.clone() as Arc<dyn KeyValueStore>,
        Arc::new(NetworkMonitor::new(online)),
        SyncConfig::default(),
    );
    Harness {
        transport,
        storage,
        pipeline,
    }
}

pub fn draft(title: &str) -> ConversationDraft {
    ConversationDraft {
        title: title.to_string(),
        child_id: None,
    }
}
