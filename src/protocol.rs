use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{QuotientError, Quote, Result};

/// Payload of a `chunk` event. `{"type":"text",...}` or `{"type":"quote",...}`
/// on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChunkPayload {
    Text {
        content: String,
    },
    Quote {
        text: String,
        reference: String,
        url: String,
    },
}

impl ChunkPayload {
    pub fn from_quote(quote: Quote) -> Self {
        ChunkPayload::Quote {
            text: quote.text,
            reference: quote.reference,
            url: quote.url,
        }
    }
}

/// The wire grammar shared by the generator and the client consumer.
///
/// Exactly one `session` per stream, zero or one `meta`, any number of
/// `chunk`, at most one `suggestions`, and one terminal `done` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Session {
        response_id: String,
    },
    Meta {
        quotes: Vec<Quote>,
    },
    Chunk(ChunkPayload),
    Suggestions {
        items: Vec<String>,
    },
    Done,
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl StreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::Session { .. } => "session",
            StreamEvent::Meta { .. } => "meta",
            StreamEvent::Chunk(_) => "chunk",
            StreamEvent::Suggestions { .. } => "suggestions",
            StreamEvent::Done => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self, StreamEvent::Chunk(_))
    }

    pub fn data(&self) -> Value {
        match self {
            StreamEvent::Session { response_id } => {
                serde_json::json!({ "responseId": response_id })
            }
            StreamEvent::Meta { quotes } => serde_json::json!({ "quotes": quotes }),
            StreamEvent::Chunk(payload) => {
                serde_json::to_value(payload).unwrap_or(Value::Null)
            }
            StreamEvent::Suggestions { items } => serde_json::json!({ "items": items }),
            StreamEvent::Done => serde_json::json!({}),
            StreamEvent::Error {
                code,
                message,
                retryable,
            } => serde_json::json!({
                "code": code,
                "message": message,
                "retryable": retryable,
            }),
        }
    }

    /// `event: <type>\ndata: <json>\n\n`
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_name(), self.data())
    }

    pub fn to_sse(&self) -> axum::response::sse::Event {
        axum::response::sse::Event::default()
            .event(self.event_name())
            .data(self.data().to_string())
    }

    pub fn from_parts(event: &str, data: &Value) -> Result<StreamEvent> {
        let parsed = match event {
            "session" => StreamEvent::Session {
                response_id: data
                    .get("responseId")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        QuotientError::Protocol("session event missing responseId".into())
                    })?
                    .to_string(),
            },
            "meta" => StreamEvent::Meta {
                quotes: serde_json::from_value(
                    data.get("quotes").cloned().unwrap_or(Value::Array(vec![])),
                )
                .map_err(QuotientError::Serialization)?,
            },
            "chunk" => StreamEvent::Chunk(
                serde_json::from_value(data.clone()).map_err(QuotientError::Serialization)?,
            ),
            "suggestions" => StreamEvent::Suggestions {
                items: serde_json::from_value(
                    data.get("items").cloned().unwrap_or(Value::Array(vec![])),
                )
                .map_err(QuotientError::Serialization)?,
            },
            "done" => StreamEvent::Done,
            "error" => StreamEvent::Error {
                code: data
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UNKNOWN")
                    .to_string(),
                message: data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                retryable: data
                    .get("retryable")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            },
            other => {
                return Err(
                    QuotientError::Protocol(format!("unknown event type: {}", other)).into(),
                )
            }
        };
        Ok(parsed)
    }
}

/// One undecoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: String,
    pub data: String,
}

impl RawFrame {
    pub fn decode(&self) -> Result<StreamEvent> {
        let data: Value =
            serde_json::from_str(&self.data).map_err(QuotientError::Serialization)?;
        StreamEvent::from_parts(&self.event, &data)
    }
}

/// Incremental `\n\n`-delimited frame decoder. A network read may end
/// mid-event or carry several events; the unconsumed tail stays buffered and
/// is prefixed onto the next read.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<RawFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_block(block: &str) -> Option<RawFrame> {
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for raw_line in block.lines() {
        let line = raw_line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Lines starting with ':' are keep-alive comments; anything else is
        // ignored per the SSE grammar.
    }

    if data_lines.is_empty() && event.is_none() {
        return None;
    }

    Some(RawFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}
