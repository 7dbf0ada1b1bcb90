//! Core data model: sessions, participants, messages, and turn state.
//!
//! A [`Session`] owns its participants, its append-only message history, and
//! the [`TurnState`] that the [`TurnController`](crate::TurnController) advances.
//! Status changes follow the table in [`SessionStatus::can_transition_to`]:
//!
//! ```text
//! pending ──► active ──► completed
//!    │          ▲ │
//!    │          │ ▼
//!    │        paused
//!    │          │
//!    └──────────┴──────► cancelled
//! ```
//!
//! `pending` is the turn controller's *idle* state: no turn has run yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::negotiation::checkpoint::CheckpointWrite;

/// The two sides of a rental negotiation.
///
/// Context building is a pure mapping over this tag (see
/// [`MessageRouter`](crate::MessageRouter)); there is no per-role subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tenant,
    Landlord,
}

impl Role {
    /// The opposite side of the table.
    pub fn counterparty(self) -> Role {
        match self {
            Role::Tenant => Role::Landlord,
            Role::Landlord => Role::Tenant,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Tenant => "tenant",
            Role::Landlord => "landlord",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, no turn taken yet (the controller's idle state).
    Pending,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// `completed` and `cancelled` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// Whether this status is listed by `list_active_for_participant`.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Transition table. Monotonic apart from the `active ⇄ paused` cycle.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Cancelled)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Paused, Active)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a negotiation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Agreement,
    Rejected,
    MaxTurns,
    AgentFailure,
    Cancelled,
}

impl TerminationReason {
    /// Wire spelling used in `dialogue_ended` frames.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Agreement => "agreement",
            TerminationReason::Rejected => "rejected",
            TerminationReason::MaxTurns => "max_turns",
            TerminationReason::AgentFailure => "agent_failure",
            TerminationReason::Cancelled => "cancelled",
        }
    }

    /// Terminal status the session lands in for this reason.
    pub fn terminal_status(&self) -> SessionStatus {
        match self {
            TerminationReason::Agreement
            | TerminationReason::Rejected
            | TerminationReason::MaxTurns => SessionStatus::Completed,
            TerminationReason::AgentFailure | TerminationReason::Cancelled => {
                SessionStatus::Cancelled
            }
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A party bound to a session. Immutable once added, apart from `is_active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    pub role: Role,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Participant {
    pub fn new(participant_id: impl Into<String>, role: Role, name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            role,
            name: name.into(),
            is_active: true,
        }
    }

    pub fn tenant(participant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(participant_id, Role::Tenant, name)
    }

    pub fn landlord(participant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(participant_id, Role::Landlord, name)
    }
}

/// One appended contribution. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub session_id: String,
    pub participant_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// `true` when a human injected the text instead of the agent responder.
    #[serde(default)]
    pub injected: bool,
}

impl Message {
    pub fn new(
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            injected: false,
        }
    }

    pub fn injected(mut self) -> Self {
        self.injected = true;
        self
    }
}

/// Terms captured when the agreement predicate fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementDetails {
    /// Last monetary amount mentioned in the agreeing message, if any.
    pub price: Option<f64>,
    /// Currency code inferred from the symbol next to `price` (`GBP`, `USD`, `EUR`).
    pub currency: Option<String>,
    /// Turn on which agreement was reached (1-based).
    pub turn: u32,
    /// Who uttered the agreeing message.
    pub participant_id: String,
    pub role: Role,
}

/// Transient turn-taking state; this is what checkpoints capture.
///
/// Everything here is reconstructible from the message history plus the
/// small amount of policy state kept alongside it (`tenant_turns`, the
/// checkpoint sequence counters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    /// Participant expected to speak next; `None` once the session is terminal
    /// or when no active participant holds `next_role`.
    pub active_participant_id: Option<String>,
    /// Role that speaks on the next turn.
    pub next_role: Role,
    pub turn_count: u32,
    /// Tenant turns taken so far; selects the next tenant when several share
    /// a session.
    #[serde(default)]
    pub tenant_turns: u32,
    pub termination_reason: Option<TerminationReason>,
    #[serde(default)]
    pub agreement: Option<AgreementDetails>,
    /// Sequence id of the last checkpoint write staged for this session.
    #[serde(default)]
    pub last_sequence_id: u64,
    /// Sequence id of the last snapshot stored for this session.
    #[serde(default)]
    pub last_snapshot_sequence_id: Option<u64>,
}

impl TurnState {
    pub fn new(first_speaker: Role) -> Self {
        Self {
            active_participant_id: None,
            next_role: first_speaker,
            turn_count: 0,
            tenant_turns: 0,
            termination_reason: None,
            agreement: None,
            last_sequence_id: 0,
            last_snapshot_sequence_id: None,
        }
    }
}

/// One negotiation instance.
///
/// Sessions are never physically removed: terminal sessions stay in the
/// registry (and the checkpoint store) for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub property_id: String,
    pub participants: Vec<Participant>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Property details, market snapshot, and private reservation fields.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Message history held in memory. After recovery this is the trailing
    /// window captured by the snapshot plus replayed writes.
    #[serde(default)]
    pub history: Vec<Message>,
    pub turn_state: TurnState,
    /// Checkpoint writes staged but not yet durable, in sequence order.
    #[serde(skip)]
    pub(crate) pending_writes: VecDeque<CheckpointWrite>,
    /// Set when a snapshot write failed and must be retried on the next flush.
    #[serde(skip)]
    pub(crate) snapshot_dirty: bool,
}

impl Session {
    /// Build a pending session. Validation lives in
    /// [`SessionRegistry::create`](crate::SessionRegistry::create).
    pub fn new(
        session_id: impl Into<String>,
        property_id: impl Into<String>,
        participants: Vec<Participant>,
        context: serde_json::Map<String, serde_json::Value>,
        first_speaker: Role,
    ) -> Self {
        let now = Utc::now();
        let mut session = Self {
            session_id: session_id.into(),
            property_id: property_id.into(),
            participants,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            context,
            history: Vec::new(),
            turn_state: TurnState::new(first_speaker),
            pending_writes: VecDeque::new(),
            snapshot_dirty: false,
        };
        session.turn_state.active_participant_id = session
            .speaker_for(first_speaker)
            .map(|p| p.participant_id.clone());
        session
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    pub fn has_participant(&self, participant_id: &str) -> bool {
        self.participant(participant_id).is_some()
    }

    pub fn landlord(&self) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.role == Role::Landlord && p.is_active)
    }

    pub fn active_tenants(&self) -> Vec<&Participant> {
        self.participants
            .iter()
            .filter(|p| p.role == Role::Tenant && p.is_active)
            .collect()
    }

    /// Participant who speaks for `role` on the next turn of that role.
    ///
    /// The landlord seat has one occupant. Tenant seats rotate in join order
    /// across tenant turns.
    pub fn speaker_for(&self, role: Role) -> Option<&Participant> {
        match role {
            Role::Landlord => self.landlord(),
            Role::Tenant => {
                let tenants = self.active_tenants();
                if tenants.is_empty() {
                    None
                } else {
                    let idx = self.turn_state.tenant_turns as usize % tenants.len();
                    Some(tenants[idx])
                }
            }
        }
    }

    /// Recompute `active_participant_id` from the current turn state.
    pub(crate) fn refresh_active_participant(&mut self) {
        self.turn_state.active_participant_id = if self.status.is_terminal() {
            None
        } else {
            self.speaker_for(self.turn_state.next_role)
                .map(|p| p.participant_id.clone())
        };
    }

    /// Append a message and advance the alternation bookkeeping.
    pub(crate) fn record_message(&mut self, message: Message) {
        if message.role == Role::Tenant {
            self.turn_state.tenant_turns += 1;
        }
        self.turn_state.turn_count += 1;
        self.turn_state.next_role = message.role.counterparty();
        self.updated_at = message.timestamp;
        self.history.push(message);
        self.refresh_active_participant();
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.history.last()
    }

    /// Number of checkpoint writes staged but not yet durable.
    pub fn pending_checkpoint_writes(&self) -> usize {
        self.pending_writes.len()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
