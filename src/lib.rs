//! # rentnego
//!
//! rentnego is the orchestration core for rental negotiations carried out by
//! autonomous tenant and landlord agents. It owns everything around the
//! language model and nothing inside it:
//!
//! * **Session lifecycle**: a [`SessionRegistry`] of negotiations with their
//!   participants, history, and status
//! * **Turn control**: a per-session [`TurnController`] that alternates
//!   speakers, calls the [`AgentResponder`] with retries and timeouts, and
//!   stops on agreement, rejection, or the turn budget
//! * **Information asymmetry**: a [`MessageRouter`] that builds each side's
//!   view of the negotiation without the other side's private figures
//! * **Live viewing**: a [`TransportHub`] that fans frames out to any number of
//!   viewers in publish order without letting a slow viewer stall a session
//! * **Crash recovery**: checkpoint writes and snapshots in a
//!   [`CheckpointStore`], with an in-memory and a hash-chained JSONL backend
//!
//! The language model itself is an external capability behind the
//! [`AgentResponder`] trait. [`ScriptedResponder`] replays canned replies and
//! drives the demos and tests.
//!
//! ## Quick start
//!
//! ```rust
//! use rentnego::{
//!     CreateSessionRequest, MemoryCheckpointStore, NegotiationConfig, NegotiationService,
//!     Role, ScriptedResponder, TerminationReason,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     rentnego::init_logger();
//!
//!     let responder = ScriptedResponder::new([
//!         "I'd like £1200",
//!         "I can do £1400",
//!         "Deal, £1300 works, agreement reached",
//!     ]);
//!     let service = NegotiationService::new(
//!         Arc::new(responder),
//!         Arc::new(MemoryCheckpointStore::new()),
//!         NegotiationConfig::default().with_first_speaker(Role::Tenant),
//!     );
//!
//!     let session = service
//!         .create_session(CreateSessionRequest::new("P1", ["T1"], "L1"))
//!         .await?;
//!     let viewer = service.subscribe(&session.session_id)?;
//!
//!     service.start(&session.session_id)?;
//!     let state = service.wait(&session.session_id).await?;
//!     assert_eq!(state.termination_reason, Some(TerminationReason::Agreement));
//!
//!     let (frames, _) = viewer.collect().await;
//!     println!("viewer saw {} frames", frames.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Observing a negotiation
//!
//! Two channels exist. Viewers of one session subscribe to its [`Frame`]s
//! through the [`TransportHub`] (or the WebSocket endpoint of the optional
//! `server` feature, which speaks [`protocol::ServerFrame`]). Operators
//! register an [`EventHandler`] on the service to receive
//! [`NegotiationEvent`]s from every session:
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use rentnego::event::{EventHandler, NegotiationEvent};
//! use rentnego::{MemoryCheckpointStore, NegotiationConfig, NegotiationService, ScriptedResponder};
//! use std::sync::Arc;
//!
//! struct Audit;
//!
//! #[async_trait]
//! impl EventHandler for Audit {
//!     async fn on_negotiation_event(&self, event: &NegotiationEvent) {
//!         log::info!("[{}] {:?}", event.session_id(), event);
//!     }
//! }
//!
//! let service = NegotiationService::new(
//!     Arc::new(ScriptedResponder::repeating("Let me think about it.")),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     NegotiationConfig::from_env(),
//! )
//! .with_event_handler(Arc::new(Audit));
//! ```
//!
//! ## Recovery
//!
//! Every turn is checkpointed before the controller moves on. A fresh process
//! pointed at the same [`JsonlCheckpointStore`] directory rebuilds sessions with
//! [`NegotiationService::restore`] (or `restore_all`) and continues where the
//! old one stopped, without repeating or losing a message.

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Embedding applications can opt in to `RUST_LOG` driven diagnostics without
/// choosing a logging backend up front.
///
/// ```rust
/// rentnego::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

pub mod negotiation;

// Re-exporting key items for easier external access.
pub use negotiation::checkpoint;
pub use negotiation::checkpoint::{
    recover, Checkpoint, CheckpointStore, CheckpointWrite, Checkpointer, JsonlCheckpointStore,
    MemoryCheckpointStore, RecoveredState, WriteKind,
};
pub use negotiation::config::NegotiationConfig;
pub use negotiation::controller::{SessionHandle, TurnController};
pub use negotiation::error::{NegotiationError, NegotiationResult};
pub use negotiation::event;
pub use negotiation::event::{EventHandler, NegotiationEvent};
pub use negotiation::model::{
    AgreementDetails, Message, Participant, Role, Session, SessionStatus, TerminationReason,
    TurnState,
};
pub use negotiation::protocol;
pub use negotiation::registry::SessionRegistry;
pub use negotiation::responder::{
    AgentResponder, ChunkSink, ResponderError, ScriptStep, ScriptedResponder,
};
pub use negotiation::router;
pub use negotiation::router::{AgentContext, ContextMessage, MessageRouter, Speaker};
#[cfg(feature = "server")]
pub use negotiation::server;
pub use negotiation::service::{
    CreateSessionRequest, InMemoryDirectory, NegotiationService, ParticipantDirectory,
};
pub use negotiation::termination;
pub use negotiation::termination::{LexiconPredicate, TerminationPredicate};
pub use negotiation::transport::{Audience, Frame, PublishReport, Subscription, TransportHub};
