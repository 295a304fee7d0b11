use super::{ChatTransport, ChunkSink, TransportError, TransportReply, TransportResult};
use crate::chat::processor::StreamTokenProcessor;
use crate::config::TransportConfig;
use crate::types::{Conversation, ConversationDraft, HistoryRecord};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use tracing::{debug, error};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<i64>,
    stream: bool,
}

/// Re-assembles UTF-8 text from byte packets that may split a multi-byte character.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        // Incomplete character at the end; wait for the next packet.
                        None => {
                            self.pending.drain(..valid);
                            return text;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// HTTP client for the chat backend.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(TransportError::from)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> TransportResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send_message(
        &self,
        content: &str,
        conversation_id: Option<i64>,
        on_chunk: &mut ChunkSink<'_>,
    ) -> TransportResult<TransportReply> {
        let request = self
            .client
            .post(self.url("chat/stream"))
            .header("accept", "application/x-ndjson")
            .json(&SendRequest {
                content,
                chat_id: conversation_id,
                stream: true,
            });
        let response = Self::check(self.authorize(request).send().await?).await?;

        // Tracks the reply locally so the caller gets the final text and chat id
        // without having to interpret the chunks itself.
        let mut tracker = StreamTokenProcessor::new();
        tracker.start();
        let mut carry = Utf8Carry::default();
        let mut stream = response.bytes_stream();
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => {
                    let chunk = carry.push(&bytes);
                    if chunk.is_empty() {
                        continue;
                    }
                    debug!(len = chunk.len(), "chat stream chunk");
                    on_chunk(&chunk);
                    if tracker.is_streaming() {
                        tracker.process_chunk(&chunk).ok();
                    }
                }
                Err(err) => {
                    error!(error = %err, "chat stream interrupted");
                    return Err(TransportError::from(err));
                }
            }
        }

        let rest = carry.finish();
        if !rest.is_empty() {
            on_chunk(&rest);
            if tracker.is_streaming() {
                tracker.process_chunk(&rest).ok();
            }
        }
        if tracker.is_streaming() {
            tracker.complete().ok();
        }
        let state = tracker.get_state();
        Ok(TransportReply {
            content: state.full_content,
            chat_id: state.chat_id,
        })
    }

    async fn load_messages(&self, conversation_id: i64) -> TransportResult<Vec<HistoryRecord>> {
        let request = self
            .client
            .get(self.url(&format!("chat/{conversation_id}/records")));
        let response = Self::check(self.authorize(request).send().await?).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn create_conversation(&self, draft: &ConversationDraft) -> TransportResult<Conversation> {
        let request = self.client.post(self.url("chat")).json(draft);
        let response = Self::check(self.authorize(request).send().await?).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn update_conversation(
        &self,
        conversation_id: i64,
        draft: &ConversationDraft,
    ) -> TransportResult<()> {
        let request = self
            .client
            .put(self.url(&format!("chat/{conversation_id}")))
            .json(draft);
        Self::check(self.authorize(request).send().await?).await?;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: i64) -> TransportResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("chat/{conversation_id}")));
        Self::check(self.authorize(request).send().await?).await?;
        Ok(())
    }
}
