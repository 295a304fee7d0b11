use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("stream processor received a chunk before start()")]
    NotStarted,

    #[error("stream processor received a chunk after it finished ({0:?})")]
    AlreadyFinished(StreamPhase),
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming,
    Complete,
    Error,
}

/// Metadata carried by the terminal record of a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub message_id: Option<String>,
    pub chat_id: Option<i64>,
    pub model: Option<String>,
}

/// One newline-delimited record of the chat stream, classified by the fields it carries.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamRecord {
    ContentDelta(String),
    Sources(Vec<String>),
    Terminal(StreamMetadata),
    Unknown,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    token: Option<String>,
    sources: Option<Vec<String>>,
    chat_id: Option<Value>,
    message_id: Option<Value>,
    model: Option<String>,
    done: Option<bool>,
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses one line of the stream. Blank lines yield `Ok(None)`.
pub fn parse_stream_line(line_with_ws: &str) -> Result<Option<StreamRecord>, serde_json::Error> {
    let line = line_with_ws.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let raw: RawRecord = serde_json::from_str(line)?;

    if let Some(token) = raw.token {
        return Ok(Some(StreamRecord::ContentDelta(token)));
    }
    if let Some(sources) = raw.sources {
        return Ok(Some(StreamRecord::Sources(sources)));
    }

    let chat_id = raw
        .chat_id
        .as_ref()
        .and_then(value_to_id)
        .and_then(|id| id.parse::<i64>().ok());
    let message_id = raw
        .message_id
        .as_ref()
        .and_then(value_to_id)
        .or_else(|| chat_id.map(|id| id.to_string()));

    if chat_id.is_some() || message_id.is_some() || raw.model.is_some() || raw.done == Some(true)
    {
        return Ok(Some(StreamRecord::Terminal(StreamMetadata {
            message_id,
            chat_id,
            model: raw.model,
        })));
    }

    Ok(Some(StreamRecord::Unknown))
}

/// What the caller should react to after feeding a chunk.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// `content` is the whole buffer after appending `delta`.
    Content { delta: String, content: String },
    Sources(Vec<String>),
    Complete {
        content: String,
        metadata: StreamMetadata,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamSnapshot {
    pub full_content: String,
    pub message_id: Option<String>,
    pub chat_id: Option<i64>,
    pub model: Option<String>,
    pub sources: Vec<String>,
    pub is_complete: bool,
}

/// Incremental parser for the newline-delimited JSON chat stream.
///
/// Records may be split across chunks; whatever follows the last newline of a
/// chunk is carried over and completed by the next one.
#[derive(Debug, Default)]
pub struct StreamTokenProcessor {
    phase: StreamPhase,
    buffer: String,
    raw_tail: String,
    metadata: StreamMetadata,
    sources: Vec<String>,
}

impl StreamTokenProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        *self = Self {
            phase: StreamPhase::Streaming,
            ..Self::default()
        };
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == StreamPhase::Streaming
    }

    fn ensure_streaming(&self) -> ProcessorResult<()> {
        match self.phase {
            StreamPhase::Streaming => Ok(()),
            StreamPhase::Idle => Err(ProcessorError::NotStarted),
            done => Err(ProcessorError::AlreadyFinished(done)),
        }
    }

    pub fn process_chunk(&mut self, raw: &str) -> ProcessorResult<Vec<StreamEvent>> {
        self.ensure_streaming()?;
        self.raw_tail.push_str(raw);

        let mut events = Vec::new();
        while let Some(pos) = self.raw_tail.find('\n') {
            let line: String = self.raw_tail.drain(..=pos).collect();
            self.apply_line(&line, &mut events);
            if self.phase == StreamPhase::Complete {
                if !self.raw_tail.trim().is_empty() {
                    debug!(
                        discarded = self.raw_tail.len(),
                        "ignoring stream data after terminal record"
                    );
                }
                self.raw_tail.clear();
                break;
            }
        }
        Ok(events)
    }

    /// Ends the stream once the transport has delivered everything.
    ///
    /// A final record without a trailing newline is parsed here. Returns the
    /// completion event unless a terminal record already completed the stream.
    pub fn complete(&mut self) -> ProcessorResult<Vec<StreamEvent>> {
        if self.phase == StreamPhase::Complete {
            return Ok(Vec::new());
        }
        self.ensure_streaming()?;

        let mut events = Vec::new();
        let tail = std::mem::take(&mut self.raw_tail);
        self.apply_line(&tail, &mut events);
        if self.phase != StreamPhase::Complete {
            self.phase = StreamPhase::Complete;
            events.push(StreamEvent::Complete {
                content: self.buffer.clone(),
                metadata: self.metadata.clone(),
            });
        }
        Ok(events)
    }

    pub fn fail(&mut self) {
        if self.phase == StreamPhase::Streaming {
            self.phase = StreamPhase::Error;
        }
    }

    pub fn get_state(&self) -> StreamSnapshot {
        StreamSnapshot {
            full_content: self.buffer.clone(),
            message_id: self.metadata.message_id.clone(),
            chat_id: self.metadata.chat_id,
            model: self.metadata.model.clone(),
            sources: self.sources.clone(),
            is_complete: self.phase == StreamPhase::Complete,
        }
    }

    fn apply_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let record = match parse_stream_line(line) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, line = line.trim(), "skipping malformed stream record");
                return;
            }
        };

        match record {
            StreamRecord::ContentDelta(delta) => {
                if delta.is_empty() {
                    return;
                }
                self.buffer.push_str(&delta);
                events.push(StreamEvent::Content {
                    delta,
                    content: self.buffer.clone(),
                });
            }
            StreamRecord::Sources(sources) => {
                self.sources.extend(sources.iter().cloned());
                events.push(StreamEvent::Sources(sources));
            }
            StreamRecord::Terminal(metadata) => {
                self.metadata = metadata;
                self.phase = StreamPhase::Complete;
                events.push(StreamEvent::Complete {
                    content: self.buffer.clone(),
                    metadata: self.metadata.clone(),
                });
            }
            StreamRecord::Unknown => {
                warn!(line = line.trim(), "skipping unrecognised stream record");
            }
        }
    }
}
