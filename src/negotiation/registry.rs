//! Owned registry of live sessions.
//!
//! [`SessionRegistry`] is an explicit instance owned by the
//! [`NegotiationService`](crate::NegotiationService); there is no global
//! session table. Each entry sits behind its own async mutex, held only for
//! short reads and commits and never across a responder call, so different
//! sessions never contend. The map lock is only held long enough to clone an
//! entry handle.
//!
//! Mutations are checkpointed before they become visible: the change is
//! applied to a copy, the copy's writes are flushed, and only then does the
//! copy replace the entry. A failed flush leaves the entry exactly as it was.

use crate::negotiation::checkpoint::{Checkpointer, WriteKind};
use crate::negotiation::controller::SessionHandle;
use crate::negotiation::error::{NegotiationError, NegotiationResult};
use crate::negotiation::model::{Participant, Role, Session};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    checkpointer: Checkpointer,
    first_speaker: Role,
}

impl SessionRegistry {
    pub fn new(checkpointer: Checkpointer, first_speaker: Role) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            checkpointer,
            first_speaker,
        }
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Create a pending session and persist its creation record.
    ///
    /// Fails with [`NegotiationError::InvalidParticipants`] unless there is
    /// exactly one landlord, at least one tenant, and no repeated id.
    pub async fn create(
        &self,
        property_id: &str,
        participants: Vec<Participant>,
        context: Map<String, Value>,
    ) -> NegotiationResult<Session> {
        if property_id.trim().is_empty() {
            return Err(NegotiationError::InvalidRequest(
                "property_id is required".into(),
            ));
        }
        validate_participants(&participants)?;

        let session_id = Uuid::new_v4().to_string();
        let mut session = Session::new(
            session_id.clone(),
            property_id,
            participants,
            context,
            self.first_speaker,
        );
        self.checkpointer.record_created(&mut session);
        self.checkpointer.flush(&mut session).await?;

        let snapshot = session.clone();
        self.sessions
            .write()
            .map_err(|_| poisoned())?
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));
        log::info!(
            "Created session {} for property {} with {} participants",
            session_id,
            snapshot.property_id,
            snapshot.participants.len()
        );
        Ok(snapshot)
    }

    /// Lockable entry for `session_id`.
    pub fn handle(&self, session_id: &str) -> NegotiationResult<SessionHandle> {
        self.sessions
            .read()
            .map_err(|_| poisoned())?
            .get(session_id)
            .cloned()
            .ok_or_else(|| NegotiationError::NotFound(format!("session {}", session_id)))
    }

    /// Copy of a session.
    pub async fn get(&self, session_id: &str) -> NegotiationResult<Session> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .map(|s| s.contains_key(session_id))
            .unwrap_or(false)
    }

    /// Bind another participant to an open session.
    pub async fn add_participant(
        &self,
        session_id: &str,
        participant: Participant,
    ) -> NegotiationResult<Session> {
        if participant.participant_id.trim().is_empty() {
            return Err(NegotiationError::InvalidParticipants(
                "participant_id is required".into(),
            ));
        }
        let handle = self.handle(session_id)?;
        let mut session = handle.lock().await;
        self.checkpointer.flush(&mut session).await?;

        if session.status.is_terminal() {
            return Err(NegotiationError::SessionClosed(session_id.to_string()));
        }
        if session.has_participant(&participant.participant_id) {
            return Err(NegotiationError::DuplicateParticipant(
                participant.participant_id,
            ));
        }
        if participant.role == Role::Landlord && session.landlord().is_some() {
            return Err(NegotiationError::InvalidParticipants(format!(
                "session {} already has a landlord",
                session_id
            )));
        }

        let mut updated = session.clone();
        self.checkpointer.record(
            &mut updated,
            WriteKind::ParticipantAdded {
                participant: participant.clone(),
            },
        );
        self.checkpointer.flush(&mut updated).await?;
        *session = updated;

        log::info!(
            "Participant {} joined session {} as {}",
            participant.participant_id,
            session_id,
            participant.role
        );
        Ok(session.clone())
    }

    /// Non-terminal sessions the participant belongs to, oldest first.
    pub async fn list_active_for_participant(&self, participant_id: &str) -> Vec<Session> {
        let handles: Vec<SessionHandle> = match self.sessions.read() {
            Ok(sessions) => sessions.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };

        let mut found = Vec::new();
        for handle in handles {
            let session = handle.lock().await;
            if session.status.is_open() && session.has_participant(participant_id) {
                found.push(session.clone());
            }
        }
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        found
    }

    /// Register a session rebuilt from checkpoints. Returns the existing entry
    /// if the id is already present.
    pub fn insert_restored(&self, session: Session) -> NegotiationResult<SessionHandle> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        let handle = sessions
            .entry(session.session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(session)))
            .clone();
        Ok(handle)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_participants(participants: &[Participant]) -> NegotiationResult<()> {
    let mut seen = HashSet::new();
    for p in participants {
        if p.participant_id.trim().is_empty() {
            return Err(NegotiationError::InvalidParticipants(
                "participant_id is required".into(),
            ));
        }
        if !seen.insert(p.participant_id.as_str()) {
            return Err(NegotiationError::InvalidParticipants(format!(
                "duplicate participant id {}",
                p.participant_id
            )));
        }
    }

    let landlords = participants.iter().filter(|p| p.role == Role::Landlord).count();
    let tenants = participants.iter().filter(|p| p.role == Role::Tenant).count();
    match (landlords, tenants) {
        (1, t) if t >= 1 => Ok(()),
        (0, _) => Err(NegotiationError::InvalidParticipants(
            "a landlord is required".into(),
        )),
        (l, _) if l > 1 => Err(NegotiationError::InvalidParticipants(
            "only one landlord per session".into(),
        )),
        _ => Err(NegotiationError::InvalidParticipants(
            "at least one tenant is required".into(),
        )),
    }
}

fn poisoned() -> NegotiationError {
    NegotiationError::Storage("session map poisoned".into())
}
