//! The negotiation service facade.
//!
//! [`NegotiationService`] owns the [`SessionRegistry`], the [`TransportHub`],
//! the checkpoint store, and one [`TurnController`] per session. It is the
//! only surface the HTTP/WS boundary talks to.
//!
//! ```rust
//! use rentnego::{
//!     CreateSessionRequest, MemoryCheckpointStore, NegotiationConfig, NegotiationService,
//!     Role, ScriptedResponder, SessionStatus, TerminationReason,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let responder = ScriptedResponder::new([
//!     "I'd like £1200",
//!     "I can do £1400",
//!     "Deal, £1300 works, agreement reached",
//! ]);
//! let service = NegotiationService::new(
//!     Arc::new(responder),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     NegotiationConfig::default().with_first_speaker(Role::Tenant),
//! );
//!
//! let session = service
//!     .create_session(CreateSessionRequest::new("P1", ["T1"], "L1"))
//!     .await?;
//! let state = service.controller(&session.session_id)?.run_to_completion().await?;
//!
//! assert_eq!(state.turn_count, 3);
//! assert_eq!(state.termination_reason, Some(TerminationReason::Agreement));
//! assert_eq!(service.get(&session.session_id).await?.status, SessionStatus::Completed);
//! # Ok(())
//! # }
//! ```

use crate::negotiation::checkpoint::{recover, CheckpointStore, Checkpointer};
use crate::negotiation::config::NegotiationConfig;
use crate::negotiation::controller::TurnController;
use crate::negotiation::error::{NegotiationError, NegotiationResult};
use crate::negotiation::event::{EventHandler, NegotiationEvent};
use crate::negotiation::model::{Participant, Role, Session, TurnState};
use crate::negotiation::registry::SessionRegistry;
use crate::negotiation::responder::AgentResponder;
use crate::negotiation::router::MessageRouter;
use crate::negotiation::termination::{LexiconPredicate, TerminationPredicate};
use crate::negotiation::transport::{Frame, Subscription, TransportHub};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Body of `POST /negotiation/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub property_id: String,
    #[serde(default)]
    pub tenant_ids: Vec<String>,
    #[serde(default)]
    pub landlord_id: String,
    /// Property details and private reservation fields.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl CreateSessionRequest {
    pub fn new<I, S>(property_id: impl Into<String>, tenant_ids: I, landlord_id: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            property_id: property_id.into(),
            tenant_ids: tenant_ids.into_iter().map(Into::into).collect(),
            landlord_id: landlord_id.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// Resolves participant ids to display names. `None` means the id is unknown
/// for that role.
pub trait ParticipantDirectory: Send + Sync {
    fn lookup(&self, participant_id: &str, role: Role) -> Option<String>;
}

/// Fixed in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    entries: HashMap<String, (Role, String)>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, participant_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.entries
            .insert(participant_id.into(), (Role::Tenant, name.into()));
        self
    }

    pub fn with_landlord(mut self, participant_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.entries
            .insert(participant_id.into(), (Role::Landlord, name.into()));
        self
    }
}

impl ParticipantDirectory for InMemoryDirectory {
    fn lookup(&self, participant_id: &str, role: Role) -> Option<String> {
        self.entries
            .get(participant_id)
            .filter(|(r, _)| *r == role)
            .map(|(_, name)| name.clone())
    }
}

/// Entry point for creating, driving, observing, and restoring negotiations.
pub struct NegotiationService {
    config: NegotiationConfig,
    registry: Arc<SessionRegistry>,
    hub: Arc<TransportHub>,
    checkpointer: Checkpointer,
    responder: Arc<dyn AgentResponder>,
    predicate: Arc<dyn TerminationPredicate>,
    directory: Option<Arc<dyn ParticipantDirectory>>,
    event_handler: Option<Arc<dyn EventHandler>>,
    controllers: RwLock<HashMap<String, Arc<TurnController>>>,
    loops: Mutex<HashMap<String, JoinHandle<NegotiationResult<TurnState>>>>,
}

impl NegotiationService {
    pub fn new(
        responder: Arc<dyn AgentResponder>,
        store: Arc<dyn CheckpointStore>,
        config: NegotiationConfig,
    ) -> Self {
        let checkpointer = Checkpointer::new(store, &config);
        Self {
            registry: Arc::new(SessionRegistry::new(
                checkpointer.clone(),
                config.first_speaker,
            )),
            hub: Arc::new(TransportHub::new(config.subscriber_buffer)),
            checkpointer,
            responder,
            predicate: Arc::new(LexiconPredicate::default()),
            directory: None,
            event_handler: None,
            controllers: RwLock::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn TerminationPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// Validate referenced participant ids against `directory`.
    pub fn with_directory(mut self, directory: Arc<dyn ParticipantDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Receive lifecycle events from the service and every controller it creates.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<TransportHub> {
        &self.hub
    }

    /// Create a pending session and open its transport channel.
    pub async fn create_session(&self, request: CreateSessionRequest) -> NegotiationResult<Session> {
        if request.property_id.trim().is_empty() {
            return Err(NegotiationError::InvalidRequest(
                "property_id is required".into(),
            ));
        }
        if request.landlord_id.trim().is_empty() || request.tenant_ids.is_empty() {
            return Err(NegotiationError::InvalidParticipants(
                "a landlord_id and at least one tenant id are required".into(),
            ));
        }

        let mut participants = vec![self.resolve(&request.landlord_id, Role::Landlord)?];
        for tenant_id in &request.tenant_ids {
            participants.push(self.resolve(tenant_id, Role::Tenant)?);
        }

        let session = self
            .registry
            .create(&request.property_id, participants, request.context)
            .await?;
        self.hub.open_channel(&session.session_id);
        self.install_controller(&session.session_id)?;

        self.emit(NegotiationEvent::SessionCreated {
            session_id: session.session_id.clone(),
            property_id: session.property_id.clone(),
            participant_count: session.participants.len(),
        })
        .await;
        Ok(session)
    }

    /// Bind a participant to an existing session.
    pub async fn join(&self, session_id: &str, mut participant: Participant) -> NegotiationResult<Session> {
        let known = self.resolve(&participant.participant_id, participant.role)?;
        if participant.name.trim().is_empty() {
            participant.name = known.name;
        }
        let participant_id = participant.participant_id.clone();
        let role = participant.role;
        let session = self.registry.add_participant(session_id, participant).await?;
        self.emit(NegotiationEvent::ParticipantJoined {
            session_id: session_id.to_string(),
            participant_id,
            role,
        })
        .await;
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> NegotiationResult<Session> {
        self.registry.get(session_id).await
    }

    /// Open sessions (pending, active, paused) the participant belongs to.
    pub async fn list_for_participant(&self, participant_id: &str) -> Vec<Session> {
        self.registry.list_active_for_participant(participant_id).await
    }

    pub fn controller(&self, session_id: &str) -> NegotiationResult<Arc<TurnController>> {
        self.controllers
            .read()
            .map_err(|_| NegotiationError::Storage("controller map poisoned".into()))?
            .get(session_id)
            .cloned()
            .ok_or_else(|| NegotiationError::NotFound(format!("session {}", session_id)))
    }

    /// Attach a live viewer to the session's frames.
    pub fn subscribe(&self, session_id: &str) -> NegotiationResult<Subscription> {
        self.hub.subscribe(session_id)
    }

    /// Attach a viewer that only receives frames meant for `role`.
    pub fn subscribe_as(&self, session_id: &str, role: Role) -> NegotiationResult<Subscription> {
        self.hub.subscribe_as(session_id, Some(role))
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.hub.unsubscribe(subscription);
    }

    pub async fn advance(&self, session_id: &str) -> NegotiationResult<TurnState> {
        self.controller(session_id)?.advance().await
    }

    pub async fn inject(
        &self,
        session_id: &str,
        participant_id: &str,
        text: impl Into<String>,
    ) -> NegotiationResult<TurnState> {
        self.controller(session_id)?.inject(participant_id, text).await
    }

    /// Spawn the turn loop for a session. A loop that is already running is
    /// left alone.
    pub fn start(&self, session_id: &str) -> NegotiationResult<()> {
        let controller = self.controller(session_id)?;
        let mut loops = self
            .loops
            .lock()
            .map_err(|_| NegotiationError::Storage("task map poisoned".into()))?;
        if let Some(running) = loops.get(session_id) {
            if !running.is_finished() {
                log::debug!("Turn loop for session {} already running", session_id);
                return Ok(());
            }
        }
        let id = session_id.to_string();
        let task = tokio::spawn(async move {
            let outcome = controller.run_to_completion().await;
            if let Err(e) = &outcome {
                log::warn!("Turn loop for session {} stopped: {}", id, e);
            }
            outcome
        });
        loops.insert(session_id.to_string(), task);
        Ok(())
    }

    /// Wait for the loop started by [`start`](NegotiationService::start).
    pub async fn wait(&self, session_id: &str) -> NegotiationResult<TurnState> {
        let task = self
            .loops
            .lock()
            .map_err(|_| NegotiationError::Storage("task map poisoned".into()))?
            .remove(session_id);
        match task {
            Some(task) => task.await.map_err(|e| {
                NegotiationError::InvalidState(format!("turn loop for {} aborted: {}", session_id, e))
            })?,
            None => Ok(self.controller(session_id)?.state().await),
        }
    }

    pub async fn pause(&self, session_id: &str) -> NegotiationResult<TurnState> {
        self.controller(session_id)?.pause().await
    }

    /// Resume a paused session, restarting its loop when `auto_advance` is set.
    pub async fn resume(&self, session_id: &str) -> NegotiationResult<TurnState> {
        let state = self.controller(session_id)?.resume().await?;
        if self.config.auto_advance {
            self.start(session_id)?;
        }
        Ok(state)
    }

    pub async fn cancel(&self, session_id: &str) -> NegotiationResult<TurnState> {
        self.controller(session_id)?.cancel().await
    }

    /// Rebuild a session and its controller from the checkpoint store.
    ///
    /// Already loaded sessions are returned as they are.
    pub async fn restore(&self, session_id: &str) -> NegotiationResult<Session> {
        if self.registry.contains(session_id) {
            return self.registry.get(session_id).await;
        }
        let recovered = recover(self.checkpointer.store().as_ref(), session_id)
            .await?
            .ok_or_else(|| NegotiationError::NotFound(format!("session {}", session_id)))?;
        let session = recovered.session;
        log::info!(
            "Restored session {} at turn {} ({}, {} writes replayed)",
            session_id,
            session.turn_state.turn_count,
            session.status,
            recovered.replayed_writes
        );

        self.registry.insert_restored(session.clone())?;
        self.hub.open_channel(session_id);
        self.install_controller(session_id)?;
        if let Some(reason) = session.turn_state.termination_reason {
            if session.status.is_terminal() && !self.hub.is_closed(session_id) {
                // Late viewers of an ended session still get its final frame.
                self.hub.publish(session_id, Frame::SessionCompleted { reason })?;
            }
        }

        self.emit(NegotiationEvent::SessionRestored {
            session_id: session_id.to_string(),
            turn_count: session.turn_state.turn_count,
            status: session.status,
        })
        .await;
        Ok(session)
    }

    /// Restore every thread the store knows about. Threads that fail to
    /// restore are logged and skipped.
    pub async fn restore_all(&self) -> NegotiationResult<Vec<Session>> {
        let ids = self
            .checkpointer
            .store()
            .thread_ids()
            .await
            .map_err(|e| NegotiationError::Storage(e.to_string()))?;
        let results = join_all(ids.iter().map(|id| self.restore(id))).await;

        let mut restored = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(session) => restored.push(session),
                Err(e) => log::error!("Could not restore session {}: {}", id, e),
            }
        }
        Ok(restored)
    }

    fn resolve(&self, participant_id: &str, role: Role) -> NegotiationResult<Participant> {
        let name = match &self.directory {
            Some(directory) => directory.lookup(participant_id, role).ok_or_else(|| {
                NegotiationError::NotFound(format!("{} {}", role, participant_id))
            })?,
            None => participant_id.to_string(),
        };
        Ok(Participant::new(participant_id, role, name))
    }

    fn install_controller(&self, session_id: &str) -> NegotiationResult<Arc<TurnController>> {
        let mut controllers = self
            .controllers
            .write()
            .map_err(|_| NegotiationError::Storage("controller map poisoned".into()))?;
        if let Some(existing) = controllers.get(session_id) {
            return Ok(existing.clone());
        }

        let router = MessageRouter::new(self.hub.clone(), self.config.max_turns);
        let mut controller = TurnController::new(
            session_id,
            self.registry.handle(session_id)?,
            router,
            self.responder.clone(),
            self.checkpointer.clone(),
            self.config.clone(),
        )
        .with_predicate(self.predicate.clone());
        if let Some(handler) = &self.event_handler {
            controller = controller.with_event_handler(handler.clone());
        }

        let controller = Arc::new(controller);
        controllers.insert(session_id.to_string(), controller.clone());
        Ok(controller)
    }

    async fn emit(&self, event: NegotiationEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_negotiation_event(&event).await;
        }
    }
}
