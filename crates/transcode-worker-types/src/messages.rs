//! Messages exchanged with the transcode worker.

use serde::{Deserialize, Serialize};

/// A message received by the worker.
///
/// The only meaningful payload is a binary buffer. Everything else is kept
/// verbatim so the worker can report it, but it is never answered.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundMessage {
    /// The whole unit of work. Ownership moves into the worker.
    Buffer(Box<[u8]>),
    /// Anything that is not a well-formed buffer message.
    Unexpected(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BufferEnvelope {
    #[serde(with = "crate::buffer")]
    buffer: Box<[u8]>,
}

impl InboundMessage {
    /// Decode one line of the inbound stream: `{"buffer":"<base64>"}`.
    pub fn decode_line(line: &str) -> Self {
        match serde_json::from_str::<BufferEnvelope>(line.trim()) {
            Ok(envelope) => InboundMessage::Buffer(envelope.buffer),
            Err(_) => InboundMessage::Unexpected(line.to_string()),
        }
    }

    /// Encode a buffer as an inbound line (without the trailing newline).
    pub fn encode_buffer(bytes: &[u8]) -> String {
        format!(r#"{{"buffer":"{}"}}"#, crate::buffer::encode(bytes))
    }
}

/// Progress of a single request. `current <= total` is expected, not enforced.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub current: u64,
    pub total: u64,
}

/// Output of the processing module.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct TranscodeOutput {
    pub filename: String,
    #[serde(with = "crate::buffer")]
    pub data: Box<[u8]>,
}

/// Response sent from worker to caller via stdout.
///
/// Serialized with the variant name as the single key:
/// `{"progress":{..}}`, `{"result":{..}}`, `{"error":".."}`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Progress(ProgressEvent),
    /// Terminal. The output buffer is moved to the receiver.
    Result(TranscodeOutput),
    /// Terminal.
    Error(String),
}

impl Response {
    pub fn progress(current: u64, total: u64) -> Self {
        Response::Progress(ProgressEvent { current, total })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(message.into())
    }

    /// Whether this response ends its request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Response::Progress(_))
    }
}
