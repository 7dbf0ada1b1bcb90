//! Error taxonomy for the negotiation core.
//!
//! Every fallible operation exposed by [`NegotiationService`](crate::NegotiationService),
//! [`TurnController`](crate::TurnController), [`SessionRegistry`](crate::SessionRegistry)
//! and [`TransportHub`](crate::TransportHub) returns a [`NegotiationError`].
//! External collaborators (agent responders, checkpoint backends) speak
//! `Box<dyn Error + Send + Sync>` at their boundary and are folded into this
//! enum by the component that calls them.
//!
//! # Example
//!
//! ```
//! use rentnego::NegotiationError;
//!
//! let err = NegotiationError::NotFound("session abc".into());
//! assert_eq!(err.to_string(), "Not found: session abc");
//! assert_eq!(err.status_code(), 404);
//! ```

use crate::negotiation::model::Role;
use std::error::Error;
use std::fmt;

/// Errors surfaced by the negotiation core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The request itself is malformed (e.g. a missing `property_id`).
    InvalidRequest(String),

    /// Participant list is unusable: missing landlord or tenant, two
    /// landlords, or duplicate participant ids.
    InvalidParticipants(String),

    /// A session, participant, or channel does not exist.
    NotFound(String),

    /// The session is `completed` or `cancelled` and rejects mutation.
    SessionClosed(String),

    /// A participant with the same id is already bound to the session.
    DuplicateParticipant(String),

    /// Illegal turn-controller transition (e.g. `advance` on a paused session).
    InvalidState(String),

    /// No active participant is bound to the requested role.
    MissingParticipant(Role),

    /// The agent responder kept failing after the retry bound was exhausted.
    AgentFailure(String),

    /// A subscriber fell behind its bounded buffer and was disconnected.
    Overflow(String),

    /// Checkpoint persistence or (de)serialization failed.
    Storage(String),
}

/// Convenience alias used across the crate.
pub type NegotiationResult<T> = Result<T, NegotiationError>;

impl NegotiationError {
    /// HTTP status the boundary layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            NegotiationError::InvalidRequest(_) => 400,
            NegotiationError::InvalidParticipants(_) => 400,
            NegotiationError::NotFound(_) => 404,
            NegotiationError::SessionClosed(_) => 409,
            NegotiationError::DuplicateParticipant(_) => 409,
            NegotiationError::InvalidState(_) => 409,
            NegotiationError::MissingParticipant(_) => 422,
            NegotiationError::AgentFailure(_) => 502,
            NegotiationError::Overflow(_) => 503,
            NegotiationError::Storage(_) => 500,
        }
    }

    /// Short machine-readable tag, used in `error` frames and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationError::InvalidRequest(_) => "invalid_request",
            NegotiationError::InvalidParticipants(_) => "invalid_participants",
            NegotiationError::NotFound(_) => "not_found",
            NegotiationError::SessionClosed(_) => "session_closed",
            NegotiationError::DuplicateParticipant(_) => "duplicate_participant",
            NegotiationError::InvalidState(_) => "invalid_state",
            NegotiationError::MissingParticipant(_) => "missing_participant",
            NegotiationError::AgentFailure(_) => "agent_failure",
            NegotiationError::Overflow(_) => "overflow",
            NegotiationError::Storage(_) => "storage",
        }
    }
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            NegotiationError::InvalidParticipants(msg) => {
                write!(f, "Invalid participants: {}", msg)
            }
            NegotiationError::NotFound(what) => write!(f, "Not found: {}", what),
            NegotiationError::SessionClosed(id) => write!(f, "Session closed: {}", id),
            NegotiationError::DuplicateParticipant(id) => {
                write!(f, "Duplicate participant: {}", id)
            }
            NegotiationError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            NegotiationError::MissingParticipant(role) => {
                write!(f, "No active participant bound to role {}", role)
            }
            NegotiationError::AgentFailure(msg) => write!(f, "Agent failure: {}", msg),
            NegotiationError::Overflow(id) => write!(f, "Subscriber overflow: {}", id),
            NegotiationError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl Error for NegotiationError {}

impl From<std::io::Error> for NegotiationError {
    fn from(err: std::io::Error) -> Self {
        NegotiationError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        NegotiationError::Storage(format!("serialization failed: {}", err))
    }
}
