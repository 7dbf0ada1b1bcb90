// src/negotiation/mod.rs

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod responder;
pub mod router;
#[cfg(feature = "server")]
pub mod server;
pub mod service;
pub mod termination;
pub mod transport;

// Flatten the most used types so callers can write `negotiation::Session`
// instead of `negotiation::model::Session`.
pub use controller::TurnController;
pub use error::{NegotiationError, NegotiationResult};
pub use model::{Message, Participant, Role, Session, SessionStatus, TerminationReason, TurnState};
pub use service::NegotiationService;
