//! Negotiation event system.
//!
//! A callback-based observability layer. Implement [`EventHandler`] to receive
//! real-time notifications about session lifecycle, turns, responder retries,
//! checkpoint writes, and subscriber overflow. These events are for operators
//! and metrics; viewers of a session consume [`Frame`](crate::Frame)s from the
//! [`TransportHub`](crate::TransportHub) instead.
//!
//! The handler is shared as `Arc<dyn EventHandler>`. When registered on a
//! [`NegotiationService`](crate::NegotiationService) it is propagated to every
//! [`TurnController`](crate::TurnController) the service creates.
//!
//! # Example
//!
//! ```rust,no_run
//! use rentnego::event::{EventHandler, NegotiationEvent};
//! use async_trait::async_trait;
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl EventHandler for PrintHandler {
//!     async fn on_negotiation_event(&self, event: &NegotiationEvent) {
//!         match event {
//!             NegotiationEvent::TurnCompleted { session_id, turn, role, .. } => {
//!                 println!("[{}] turn {} by {}", session_id, turn, role);
//!             }
//!             NegotiationEvent::SessionEnded { session_id, reason, .. } => {
//!                 println!("[{}] ended: {}", session_id, reason);
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

use crate::negotiation::model::{Role, SessionStatus, TerminationReason};
use async_trait::async_trait;

/// Events emitted by the service and the turn controllers.
///
/// Every variant carries `session_id` so handlers can correlate without
/// external state.
///
/// # Event Flow (one session)
///
/// ```text
/// SessionCreated
///   └─ TurnStarted { turn: 1 }
///       └─ (ResponderRetry { attempt: 2 } ...)
///   └─ TurnCompleted { turn: 1 }
///   └─ CheckpointWritten { sequence_id }
///   └─ ... more turns ...
/// SessionEnded { reason }
/// ```
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    // ── Session lifecycle ────────────────────────────────────────────────

    /// A session was created and its transport channel opened.
    SessionCreated {
        session_id: String,
        property_id: String,
        participant_count: usize,
    },

    /// A participant joined an existing session.
    ParticipantJoined {
        session_id: String,
        participant_id: String,
        role: Role,
    },

    /// A session was rebuilt from the checkpoint store.
    SessionRestored {
        session_id: String,
        turn_count: u32,
        status: SessionStatus,
    },

    /// The session was paused; no turn runs until it is resumed.
    SessionPaused { session_id: String },

    /// A paused session is active again.
    SessionResumed { session_id: String },

    /// The session reached a terminal state.
    SessionEnded {
        session_id: String,
        status: SessionStatus,
        reason: TerminationReason,
        turn_count: u32,
    },

    // ── Turns ────────────────────────────────────────────────────────────

    /// A participant's turn began.
    TurnStarted {
        session_id: String,
        participant_id: String,
        role: Role,
        /// 1-based number of the turn being taken.
        turn: u32,
    },

    /// A turn produced a message and it was appended to the history.
    TurnCompleted {
        session_id: String,
        participant_id: String,
        role: Role,
        turn: u32,
        /// Character length of the appended message.
        response_length: usize,
        /// `true` when a human injected the message.
        injected: bool,
    },

    /// A responder attempt failed and the turn will be retried.
    ResponderRetry {
        session_id: String,
        role: Role,
        /// 1-based number of the attempt about to run.
        attempt: u32,
        error: String,
    },

    // ── Persistence & transport ──────────────────────────────────────────

    /// A checkpoint write became durable.
    CheckpointWritten { session_id: String, sequence_id: u64 },

    /// A subscriber fell behind and was disconnected.
    SubscriberOverflowed {
        session_id: String,
        subscriber_id: String,
    },
}

impl NegotiationEvent {
    pub fn session_id(&self) -> &str {
        match self {
            NegotiationEvent::SessionCreated { session_id, .. }
            | NegotiationEvent::ParticipantJoined { session_id, .. }
            | NegotiationEvent::SessionRestored { session_id, .. }
            | NegotiationEvent::SessionPaused { session_id }
            | NegotiationEvent::SessionResumed { session_id }
            | NegotiationEvent::SessionEnded { session_id, .. }
            | NegotiationEvent::TurnStarted { session_id, .. }
            | NegotiationEvent::TurnCompleted { session_id, .. }
            | NegotiationEvent::ResponderRetry { session_id, .. }
            | NegotiationEvent::CheckpointWritten { session_id, .. }
            | NegotiationEvent::SubscriberOverflowed { session_id, .. } => session_id,
        }
    }
}

/// Receives [`NegotiationEvent`]s. The default implementation ignores them.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_negotiation_event(&self, _event: &NegotiationEvent) {}
}
