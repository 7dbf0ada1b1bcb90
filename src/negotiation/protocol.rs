//! Wire frames for the streaming viewer protocol.
//!
//! Hub [`Frame`]s are internal; what a WebSocket client sees is a
//! [`ServerFrame`]:
//!
//! ```text
//! {"type":"response_start","streaming":true,"participant_id":"t1","role":"tenant"}
//! {"type":"response_chunk","chunk":"<text>"}
//! {"type":"response_complete","response":"<full text>","streaming":false}
//! {"type":"agreement_reached","details":{...}}
//! {"type":"dialogue_ended","reason":"agreement|rejected|max_turns|agent_failure|cancelled"}
//! {"type":"error","error":"<message>"}
//! ```
//!
//! Clients send either an injection `{"message": "...", "participant_id": "..."}`
//! or a "ready" signal (an empty frame, `{}`, `"ready"` or `{"type":"ready"}`).

use crate::negotiation::error::{NegotiationError, NegotiationResult};
use crate::negotiation::model::{AgreementDetails, Role, TerminationReason};
use crate::negotiation::transport::Frame;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ResponseStart {
        streaming: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    ResponseChunk {
        chunk: String,
    },
    ResponseComplete {
        response: String,
        streaming: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    AgreementReached {
        details: AgreementDetails,
    },
    DialogueEnded {
        reason: TerminationReason,
    },
    Error {
        error: String,
    },
}

impl ServerFrame {
    pub fn error(err: &NegotiationError) -> Self {
        ServerFrame::Error {
            error: err.to_string(),
        }
    }

    /// Whether the connection closes after this frame.
    pub fn is_final(&self) -> bool {
        matches!(self, ServerFrame::DialogueEnded { .. })
    }

    pub fn to_json(&self) -> NegotiationResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Frame> for ServerFrame {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::TurnStarted {
                participant_id,
                role,
                streaming,
                ..
            } => ServerFrame::ResponseStart {
                streaming,
                participant_id: Some(participant_id),
                role: Some(role),
            },
            Frame::Chunk { text } => ServerFrame::ResponseChunk { chunk: text },
            // The full text is always sent once the message is appended, so
            // viewers that missed chunks still converge.
            Frame::TurnCompleted { message } => ServerFrame::ResponseComplete {
                response: message.content,
                streaming: false,
                participant_id: Some(message.participant_id),
                role: Some(message.role),
            },
            Frame::AgreementReached { details } => ServerFrame::AgreementReached { details },
            Frame::SessionCompleted { reason } => ServerFrame::DialogueEnded { reason },
            Frame::Error { detail } => ServerFrame::Error { error: detail },
        }
    }
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Human-in-the-loop message on behalf of `participant_id`.
    Inject {
        participant_id: String,
        message: String,
    },
    /// Start the turn loop.
    Ready,
}

impl ClientFrame {
    pub fn parse(text: &str) -> NegotiationResult<Self> {
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("ready") {
            return Ok(ClientFrame::Ready);
        }
        let value: Value = serde_json::from_str(text)
            .map_err(|e| NegotiationError::InvalidRequest(format!("malformed frame: {}", e)))?;
        match value {
            Value::String(s) if s.eq_ignore_ascii_case("ready") => Ok(ClientFrame::Ready),
            Value::Object(map) => {
                let message = map.get("message").and_then(Value::as_str);
                let participant_id = map.get("participant_id").and_then(Value::as_str);
                match (message, participant_id) {
                    (Some(message), Some(participant_id)) => Ok(ClientFrame::Inject {
                        participant_id: participant_id.to_string(),
                        message: message.to_string(),
                    }),
                    (None, None) => match map.get("type").and_then(Value::as_str) {
                        None | Some("ready") => Ok(ClientFrame::Ready),
                        Some(other) => Err(NegotiationError::InvalidRequest(format!(
                            "unknown frame type {}",
                            other
                        ))),
                    },
                    _ => Err(NegotiationError::InvalidRequest(
                        "injection needs both message and participant_id".into(),
                    )),
                }
            }
            _ => Err(NegotiationError::InvalidRequest(
                "frame must be a JSON object".into(),
            )),
        }
    }
}
