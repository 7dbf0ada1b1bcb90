//! Per-role context building and outbound routing.
//!
//! The [`MessageRouter`] decides what each side of the table gets to see and
//! where outbound frames go.
//!
//! # Information asymmetry
//!
//! The session `context` is a JSON object. Keys under `"landlord_private"`
//! reach only the landlord's view and keys under `"tenant_private"` only the
//! tenant's. Any key named in [`PRIVATE_FIELDS`] is stripped from the shared
//! payload wherever it appears, at any depth, so a reservation price
//! accidentally left in the shared part never leaks to the counterparty.
//!
//! ```
//! use rentnego::router::visible_context;
//! use rentnego::Role;
//! use serde_json::json;
//!
//! let context = json!({
//!     "rent": 1350,
//!     "landlord_private": { "min_rent": 1250 },
//!     "tenant_private": { "max_budget": 1320 }
//! });
//! let context = context.as_object().unwrap();
//!
//! let tenant_view = visible_context(context, Role::Tenant);
//! assert_eq!(tenant_view["rent"], 1350);
//! assert_eq!(tenant_view["private"]["max_budget"], 1320);
//! assert!(tenant_view.get("landlord_private").is_none());
//! ```

use crate::negotiation::error::{NegotiationError, NegotiationResult};
use crate::negotiation::model::{Message, Participant, Role, Session};
use crate::negotiation::transport::{Audience, Frame, PublishReport, TransportHub};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Field names never shown to the counterparty.
pub const PRIVATE_FIELDS: &[&str] = &["reservation_price", "max_budget", "min_rent", "walk_away_price"];

const LANDLORD_PRIVATE: &str = "landlord_private";
const TENANT_PRIVATE: &str = "tenant_private";

/// How a history entry relates to the role the context is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Own,
    Counterparty,
    /// A human typed this on behalf of a participant.
    Human,
}

/// One history entry as seen from a role's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub speaker: Speaker,
    pub role: Role,
    pub participant_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything an [`AgentResponder`](crate::AgentResponder) gets for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub session_id: String,
    pub property_id: String,
    pub role: Role,
    /// Participant who speaks this turn.
    pub participant: Participant,
    /// Display names of the other side.
    pub counterparties: Vec<String>,
    /// 1-based number of the turn being produced.
    pub turn: u32,
    pub max_turns: u32,
    /// Shared property payload plus this role's private fields under `"private"`.
    pub property: Map<String, Value>,
    pub history: Vec<ContextMessage>,
}

impl AgentContext {
    /// Plain-text transcript for prompt-based responders.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for msg in &self.history {
            let who = match msg.speaker {
                Speaker::Own => "You".to_string(),
                Speaker::Counterparty => format!("{} ({})", msg.participant_name, msg.role),
                Speaker::Human => format!("{} ({}, human)", msg.participant_name, msg.role),
            };
            out.push_str(&format!("{}: {}\n", who, msg.content));
        }
        out
    }

    /// The counterparty's most recent message, if any.
    pub fn last_counterparty_message(&self) -> Option<&ContextMessage> {
        self.history
            .iter()
            .rev()
            .find(|m| m.speaker != Speaker::Own && m.role != self.role)
    }
}

/// Context payload visible to `role`.
pub fn visible_context(context: &Map<String, Value>, role: Role) -> Map<String, Value> {
    let (own_key, other_key) = match role {
        Role::Landlord => (LANDLORD_PRIVATE, TENANT_PRIVATE),
        Role::Tenant => (TENANT_PRIVATE, LANDLORD_PRIVATE),
    };

    let mut view = Map::new();
    for (key, value) in context {
        if key == own_key || key == other_key || PRIVATE_FIELDS.contains(&key.as_str()) {
            continue;
        }
        view.insert(key.clone(), strip_private(value));
    }
    if let Some(own) = context.get(own_key) {
        view.insert("private".to_string(), own.clone());
    }
    view
}

fn strip_private(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| {
                    !PRIVATE_FIELDS.contains(&k.as_str())
                        && k.as_str() != LANDLORD_PRIVATE
                        && k.as_str() != TENANT_PRIVATE
                })
                .map(|(k, v)| (k.clone(), strip_private(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_private).collect()),
        other => other.clone(),
    }
}

/// History rendered from `role`'s point of view.
pub fn render_history(session: &Session, role: Role) -> Vec<ContextMessage> {
    session
        .history
        .iter()
        .map(|msg| render_message(session, msg, role))
        .collect()
}

fn render_message(session: &Session, msg: &Message, role: Role) -> ContextMessage {
    let speaker = if msg.injected {
        Speaker::Human
    } else if msg.role == role {
        Speaker::Own
    } else {
        Speaker::Counterparty
    };
    let participant_name = session
        .participant(&msg.participant_id)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| msg.participant_id.clone());
    ContextMessage {
        speaker,
        role: msg.role,
        participant_name,
        content: msg.content.clone(),
        timestamp: msg.timestamp,
    }
}

/// Builds role-scoped contexts and routes frames to subscribers.
#[derive(Clone)]
pub struct MessageRouter {
    hub: Arc<TransportHub>,
    max_turns: u32,
    history_limit: Option<usize>,
}

impl MessageRouter {
    pub fn new(hub: Arc<TransportHub>, max_turns: u32) -> Self {
        Self {
            hub,
            max_turns,
            history_limit: None,
        }
    }

    /// Only pass the last `messages` history entries to responders.
    pub fn with_history_limit(mut self, messages: usize) -> Self {
        self.history_limit = Some(messages);
        self
    }

    pub fn hub(&self) -> &Arc<TransportHub> {
        &self.hub
    }

    /// Context for `role`'s next turn.
    ///
    /// Fails with [`NegotiationError::MissingParticipant`] when no active
    /// participant holds `role`.
    pub fn build_context(&self, session: &Session, role: Role) -> NegotiationResult<AgentContext> {
        let participant = session
            .speaker_for(role)
            .cloned()
            .ok_or(NegotiationError::MissingParticipant(role))?;
        self.build_context_for(session, participant)
    }

    /// Context for a specific participant (used for human injection).
    pub fn build_context_for(
        &self,
        session: &Session,
        participant: Participant,
    ) -> NegotiationResult<AgentContext> {
        if !participant.is_active {
            return Err(NegotiationError::MissingParticipant(participant.role));
        }
        let role = participant.role;
        let counterparties = session
            .participants
            .iter()
            .filter(|p| p.role == role.counterparty() && p.is_active)
            .map(|p| p.name.clone())
            .collect();

        let mut history = render_history(session, role);
        if let Some(limit) = self.history_limit {
            let start = history.len().saturating_sub(limit);
            history.drain(..start);
        }

        Ok(AgentContext {
            session_id: session.session_id.clone(),
            property_id: session.property_id.clone(),
            role,
            participant,
            counterparties,
            turn: session.turn_state.turn_count + 1,
            max_turns: self.max_turns,
            property: visible_context(&session.context, role),
            history,
        })
    }

    /// Deliver a frame to every subscriber of the session.
    pub fn route(&self, session_id: &str, frame: Frame) -> NegotiationResult<PublishReport> {
        self.route_to(session_id, Audience::All, frame)
    }

    /// Deliver a frame to a subset of the session's subscribers.
    pub fn route_to(
        &self,
        session_id: &str,
        audience: Audience,
        frame: Frame,
    ) -> NegotiationResult<PublishReport> {
        self.hub.publish_to(session_id, audience, frame)
    }
}
