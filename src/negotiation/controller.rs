//! The per-session turn controller.
//!
//! A [`TurnController`] serializes a session's turns, injections, pauses, and
//! resumes behind a turn lock, so message append order, publish order, and
//! checkpoint write order agree. The session lock itself is held only to read
//! a turn's context and to commit its result; the responder call runs without
//! it, so reads of the session and of other sessions never wait on a model.
//! Events for the [`EventHandler`] are emitted after the session lock is
//! released.
//!
//! # State machine
//!
//! ```text
//!            advance / inject
//!  pending ───────────────────► active ──(agreement | rejected | max_turns)──► completed
//!     │                          │  ▲
//!     │                   pause  ▼  │ resume
//!     │                        paused
//!     │                          │
//!     └──── cancel ──────────────┴──── cancel / retries exhausted ──────────► cancelled
//! ```
//!
//! # One turn
//!
//! 1. Flush checkpoint writes left staged by an earlier failure.
//! 2. Pick the next speaker by strict alternation.
//! 3. Build its [`AgentContext`] through the [`MessageRouter`].
//! 4. Call the [`AgentResponder`], forwarding chunks as they arrive when it
//!    streams, with a per-attempt timeout and bounded retries with backoff.
//! 5. Publish the message, append it, then evaluate the
//!    [`TerminationPredicate`] and the turn budget.
//! 6. Checkpoint the turn before returning.

use crate::negotiation::checkpoint::{Checkpointer, WriteKind};
use crate::negotiation::config::NegotiationConfig;
use crate::negotiation::error::{NegotiationError, NegotiationResult};
use crate::negotiation::event::{EventHandler, NegotiationEvent};
use crate::negotiation::model::{
    AgreementDetails, Message, Session, SessionStatus, TerminationReason, TurnState,
};
use crate::negotiation::responder::{AgentResponder, ChunkSink, ResponderError};
use crate::negotiation::router::{AgentContext, MessageRouter};
use crate::negotiation::termination::{agreement_details, LexiconPredicate, TerminationPredicate};
use crate::negotiation::transport::Frame;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// Shared, lockable session entry.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Events raised under the session lock, emitted once it is released.
type Pending = Vec<NegotiationEvent>;

enum Invocation {
    Reply(String),
    Failed(String),
    Cancelled,
}

/// Drives one session's turns.
///
/// Cheap to share behind an `Arc`; concurrent calls on the same controller
/// are serialized by the turn lock.
pub struct TurnController {
    session_id: String,
    session: SessionHandle,
    turn: Mutex<()>,
    router: MessageRouter,
    responder: Arc<dyn AgentResponder>,
    predicate: Arc<dyn TerminationPredicate>,
    checkpointer: Checkpointer,
    config: NegotiationConfig,
    cancel_tx: watch::Sender<bool>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl TurnController {
    pub fn new(
        session_id: impl Into<String>,
        session: SessionHandle,
        router: MessageRouter,
        responder: Arc<dyn AgentResponder>,
        checkpointer: Checkpointer,
        config: NegotiationConfig,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            session_id: session_id.into(),
            session,
            turn: Mutex::new(()),
            router,
            responder,
            predicate: Arc::new(LexiconPredicate::default()),
            checkpointer,
            config,
            cancel_tx,
            event_handler: None,
        }
    }

    /// Replace the default lexicon predicate.
    pub fn with_predicate(mut self, predicate: Arc<dyn TerminationPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Copy of the current turn state.
    pub async fn state(&self) -> TurnState {
        self.session.lock().await.turn_state.clone()
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.lock().await.status
    }

    /// Copy of the whole session.
    pub async fn session(&self) -> Session {
        self.session.lock().await.clone()
    }

    /// Run one turn.
    ///
    /// Fails with [`NegotiationError::InvalidState`] unless the session is
    /// pending or active, with [`NegotiationError::MissingParticipant`] when
    /// the next role has no active participant, and with
    /// [`NegotiationError::AgentFailure`] once the responder has failed
    /// `max_attempts` times (the session is then cancelled).
    pub async fn advance(&self) -> NegotiationResult<TurnState> {
        let _turn = self.turn.lock().await;

        let mut pending = Pending::new();
        let prepared = self.prepare_turn(&mut pending).await;
        self.emit_all(pending).await;
        let ctx = prepared?;

        let invocation = self.invoke(&ctx).await;

        let mut pending = Pending::new();
        let finished = self.finish_turn(&ctx, invocation, &mut pending).await;
        self.emit_all(pending).await;
        finished
    }

    /// Append a human-authored message on behalf of `participant_id`.
    ///
    /// The participant must be active and hold the role whose turn it is; the
    /// message then counts as that role's turn.
    pub async fn inject(
        &self,
        participant_id: &str,
        text: impl Into<String>,
    ) -> NegotiationResult<TurnState> {
        let _turn = self.turn.lock().await;
        let mut pending = Pending::new();
        let result = self.inject_locked(participant_id, text.into(), &mut pending).await;
        self.emit_all(pending).await;
        result
    }

    /// `active → paused`. The turn in progress, if any, finishes first.
    pub async fn pause(&self) -> NegotiationResult<TurnState> {
        let _turn = self.turn.lock().await;
        let mut pending = Pending::new();
        let result = self.pause_locked(&mut pending).await;
        self.emit_all(pending).await;
        result
    }

    /// `paused → active`.
    pub async fn resume(&self) -> NegotiationResult<TurnState> {
        let _turn = self.turn.lock().await;
        let mut pending = Pending::new();
        let result = self.resume_locked(&mut pending).await;
        self.emit_all(pending).await;
        result
    }

    /// Cancel the session from any non-terminal state.
    ///
    /// Does not wait for a turn in flight: its responder call is abandoned
    /// and its reply, if one arrives, is never appended. Cancelling an
    /// already cancelled session is a no-op.
    pub async fn cancel(&self) -> NegotiationResult<TurnState> {
        self.cancel_tx.send_replace(true);
        let mut pending = Pending::new();
        let result = self.cancel_locked(&mut pending).await;
        self.emit_all(pending).await;
        result
    }

    /// Keep advancing until the session ends or is paused.
    pub async fn run_to_completion(&self) -> NegotiationResult<TurnState> {
        loop {
            match self.advance().await {
                Ok(state) if state.termination_reason.is_some() => return Ok(state),
                Ok(_) => {}
                Err(NegotiationError::InvalidState(_)) | Err(NegotiationError::SessionClosed(_)) => {
                    let session = self.session.lock().await;
                    if session.status == SessionStatus::Paused || session.status.is_terminal() {
                        return Ok(session.turn_state.clone());
                    }
                    return Err(NegotiationError::InvalidState(format!(
                        "session {} stopped in state {}",
                        self.session_id, session.status
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Check the session is open and read the next speaker's context.
    async fn prepare_turn(&self, pending: &mut Pending) -> NegotiationResult<AgentContext> {
        let mut session = self.session.lock().await;
        self.flush(&mut session, pending).await?;
        self.require_open_for_turn(&session)?;

        let role = session.turn_state.next_role;
        let ctx = self.router.build_context(&session, role)?;
        self.activate(&mut session);

        log::debug!(
            "Session {} turn {}: {} ({}) to speak",
            self.session_id,
            ctx.turn,
            ctx.participant.participant_id,
            role
        );
        pending.push(NegotiationEvent::TurnStarted {
            session_id: self.session_id.clone(),
            participant_id: ctx.participant.participant_id.clone(),
            role,
            turn: ctx.turn,
        });
        Ok(ctx)
    }

    async fn finish_turn(
        &self,
        ctx: &AgentContext,
        invocation: Invocation,
        pending: &mut Pending,
    ) -> NegotiationResult<TurnState> {
        let mut session = self.session.lock().await;
        // Cancelled while the responder ran.
        if session.status.is_terminal() || self.cancel_requested() {
            if let Invocation::Cancelled = invocation {
                log::info!(
                    "Session {} turn {} abandoned: cancellation requested",
                    self.session_id,
                    ctx.turn
                );
            }
            return Err(NegotiationError::SessionClosed(self.session_id.clone()));
        }
        match invocation {
            Invocation::Reply(text) => {
                let message = Message::new(
                    self.session_id.clone(),
                    ctx.participant.participant_id.clone(),
                    ctx.role,
                    text,
                );
                self.commit_turn(&mut session, message, pending).await
            }
            Invocation::Cancelled => Err(NegotiationError::SessionClosed(self.session_id.clone())),
            Invocation::Failed(detail) => self.fail(&mut session, detail, pending).await,
        }
    }

    async fn inject_locked(
        &self,
        participant_id: &str,
        text: String,
        pending: &mut Pending,
    ) -> NegotiationResult<TurnState> {
        let mut session = self.session.lock().await;
        self.flush(&mut session, pending).await?;
        self.require_open_for_turn(&session)?;

        let participant = session
            .participant(participant_id)
            .cloned()
            .ok_or_else(|| NegotiationError::NotFound(format!("participant {}", participant_id)))?;
        if !participant.is_active {
            return Err(NegotiationError::MissingParticipant(participant.role));
        }
        if participant.role != session.turn_state.next_role {
            return Err(NegotiationError::InvalidState(format!(
                "it is the {}'s turn, not {}'s",
                session.turn_state.next_role, participant_id
            )));
        }
        self.activate(&mut session);

        let turn = session.turn_state.turn_count + 1;
        pending.push(NegotiationEvent::TurnStarted {
            session_id: self.session_id.clone(),
            participant_id: participant.participant_id.clone(),
            role: participant.role,
            turn,
        });
        self.publish(
            Frame::TurnStarted {
                participant_id: participant.participant_id.clone(),
                role: participant.role,
                turn,
                streaming: false,
            },
            pending,
        );

        let message = Message::new(
            self.session_id.clone(),
            participant.participant_id,
            participant.role,
            text,
        )
        .injected();
        self.commit_turn(&mut session, message, pending).await
    }

    async fn pause_locked(&self, pending: &mut Pending) -> NegotiationResult<TurnState> {
        let mut session = self.session.lock().await;
        self.flush(&mut session, pending).await?;
        self.transition(&mut session, SessionStatus::Paused)?;
        self.flush(&mut session, pending).await?;
        log::info!("Session {} paused", self.session_id);
        pending.push(NegotiationEvent::SessionPaused {
            session_id: self.session_id.clone(),
        });
        Ok(session.turn_state.clone())
    }

    async fn resume_locked(&self, pending: &mut Pending) -> NegotiationResult<TurnState> {
        let mut session = self.session.lock().await;
        self.flush(&mut session, pending).await?;
        if session.status != SessionStatus::Paused {
            return Err(NegotiationError::InvalidState(format!(
                "session {} is {}, not paused",
                self.session_id, session.status
            )));
        }
        self.transition(&mut session, SessionStatus::Active)?;
        self.flush(&mut session, pending).await?;
        log::info!("Session {} resumed", self.session_id);
        pending.push(NegotiationEvent::SessionResumed {
            session_id: self.session_id.clone(),
        });
        Ok(session.turn_state.clone())
    }

    async fn cancel_locked(&self, pending: &mut Pending) -> NegotiationResult<TurnState> {
        let mut session = self.session.lock().await;
        match session.status {
            SessionStatus::Cancelled => return Ok(session.turn_state.clone()),
            SessionStatus::Completed => {
                return Err(NegotiationError::InvalidState(format!(
                    "session {} already completed",
                    self.session_id
                )))
            }
            _ => {}
        }
        self.end(&mut session, TerminationReason::Cancelled, None, pending)
            .await?;
        Ok(session.turn_state.clone())
    }

    fn require_open_for_turn(&self, session: &Session) -> NegotiationResult<()> {
        match session.status {
            SessionStatus::Pending | SessionStatus::Active if self.cancel_requested() => {
                Err(NegotiationError::SessionClosed(self.session_id.clone()))
            }
            SessionStatus::Pending | SessionStatus::Active => Ok(()),
            status => Err(NegotiationError::InvalidState(format!(
                "cannot take a turn on session {} while {}",
                self.session_id, status
            ))),
        }
    }

    fn activate(&self, session: &mut Session) {
        if session.status == SessionStatus::Pending {
            self.record_status(session, SessionStatus::Active);
            log::info!("Session {} is now active", self.session_id);
        }
    }

    fn transition(&self, session: &mut Session, next: SessionStatus) -> NegotiationResult<()> {
        if !session.status.can_transition_to(next) {
            return Err(NegotiationError::InvalidState(format!(
                "session {} cannot go from {} to {}",
                self.session_id, session.status, next
            )));
        }
        self.record_status(session, next);
        Ok(())
    }

    fn record_status(&self, session: &mut Session, status: SessionStatus) {
        self.checkpointer.record(
            session,
            WriteKind::StatusChanged {
                status,
                termination_reason: None,
                agreement: None,
            },
        );
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    async fn invoke(&self, ctx: &AgentContext) -> Invocation {
        let streaming = self.responder.supports_streaming();
        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                self.emit(NegotiationEvent::ResponderRetry {
                    session_id: self.session_id.clone(),
                    role: ctx.role,
                    attempt,
                    error: last_error.clone(),
                })
                .await;
                tokio::select! {
                    biased;
                    _ = wait_cancelled(&mut cancel_rx) => return Invocation::Cancelled,
                    _ = tokio::time::sleep(self.config.backoff_for(attempt)) => {}
                }
            }

            // A fresh turn_started resets the replay buffer of any partial
            // stream left by the failed attempt.
            self.publish_now(Frame::TurnStarted {
                participant_id: ctx.participant.participant_id.clone(),
                role: ctx.role,
                turn: ctx.turn,
                streaming,
            })
            .await;

            let outcome = tokio::select! {
                biased;
                _ = wait_cancelled(&mut cancel_rx) => return Invocation::Cancelled,
                outcome = tokio::time::timeout(
                    self.config.responder_timeout,
                    self.attempt(ctx, streaming),
                ) => outcome,
            };

            match outcome {
                Ok(Ok(text)) => return Invocation::Reply(text),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "responder timed out after {:?}",
                        self.config.responder_timeout
                    )
                }
            }
            log::warn!(
                "Session {} turn {}: {} responder attempt {}/{} failed: {}",
                self.session_id,
                ctx.turn,
                ctx.role,
                attempt,
                self.config.max_attempts,
                last_error
            );
        }

        Invocation::Failed(format!(
            "{} responder failed after {} attempts: {}",
            ctx.role, self.config.max_attempts, last_error
        ))
    }

    async fn attempt(&self, ctx: &AgentContext, streaming: bool) -> Result<String, ResponderError> {
        if !streaming {
            return self.responder.respond(ctx).await;
        }

        let (tx, mut rx) = mpsc::channel::<String>(self.config.chunk_channel_capacity);
        let producer = self.responder.respond_stream(ctx, ChunkSink::new(tx));
        let consumer = async {
            let mut full = String::new();
            while let Some(chunk) = rx.recv().await {
                full.push_str(&chunk);
                self.publish_now(Frame::Chunk { text: chunk }).await;
            }
            full
        };
        let (produced, full) = tokio::join!(producer, consumer);
        produced?;
        Ok(full)
    }

    async fn commit_turn(
        &self,
        session: &mut Session,
        message: Message,
        pending: &mut Pending,
    ) -> NegotiationResult<TurnState> {
        let turn = session.turn_state.turn_count + 1;
        let participant_id = message.participant_id.clone();
        let role = message.role;
        let response_length = message.content.chars().count();
        let injected = message.injected;

        self.publish(
            Frame::TurnCompleted {
                message: message.clone(),
            },
            pending,
        );
        let verdict = self.predicate.evaluate(&message);
        let details = match verdict {
            Some(TerminationReason::Agreement) => Some(agreement_details(&message, turn)),
            _ => None,
        };
        self.checkpointer
            .record(session, WriteKind::MessageAppended { message });

        pending.push(NegotiationEvent::TurnCompleted {
            session_id: self.session_id.clone(),
            participant_id,
            role,
            turn,
            response_length,
            injected,
        });

        let reason = verdict.or_else(|| {
            (session.turn_state.turn_count >= self.config.max_turns)
                .then_some(TerminationReason::MaxTurns)
        });
        match reason {
            Some(reason) => self.end(session, reason, details, pending).await?,
            None => self.flush(session, pending).await?,
        }
        Ok(session.turn_state.clone())
    }

    async fn fail(
        &self,
        session: &mut Session,
        detail: String,
        pending: &mut Pending,
    ) -> NegotiationResult<TurnState> {
        log::error!("Session {}: {}", self.session_id, detail);
        self.publish(
            Frame::Error {
                detail: detail.clone(),
            },
            pending,
        );
        self.end(session, TerminationReason::AgentFailure, None, pending)
            .await?;
        Err(NegotiationError::AgentFailure(detail))
    }

    /// Move to the terminal state for `reason`, tell subscribers, checkpoint.
    async fn end(
        &self,
        session: &mut Session,
        reason: TerminationReason,
        agreement: Option<AgreementDetails>,
        pending: &mut Pending,
    ) -> NegotiationResult<()> {
        let status = reason.terminal_status();
        self.checkpointer.record(
            session,
            WriteKind::StatusChanged {
                status,
                termination_reason: Some(reason),
                agreement: agreement.clone(),
            },
        );
        if let Some(details) = agreement {
            self.publish(Frame::AgreementReached { details }, pending);
        }
        self.publish(Frame::SessionCompleted { reason }, pending);

        log::info!(
            "Session {} {} after {} turns: {}",
            self.session_id,
            status,
            session.turn_state.turn_count,
            reason
        );
        pending.push(NegotiationEvent::SessionEnded {
            session_id: self.session_id.clone(),
            status,
            reason,
            turn_count: session.turn_state.turn_count,
        });
        self.flush(session, pending).await
    }

    async fn flush(&self, session: &mut Session, pending: &mut Pending) -> NegotiationResult<()> {
        let written = self.checkpointer.flush(session).await?;
        pending.extend(written.into_iter().map(|sequence_id| {
            NegotiationEvent::CheckpointWritten {
                session_id: self.session_id.clone(),
                sequence_id,
            }
        }));
        Ok(())
    }

    fn publish(&self, frame: Frame, pending: &mut Pending) {
        match self.router.route(&self.session_id, frame) {
            Ok(report) => {
                pending.extend(report.overflowed.into_iter().map(|subscriber_id| {
                    NegotiationEvent::SubscriberOverflowed {
                        session_id: self.session_id.clone(),
                        subscriber_id,
                    }
                }));
            }
            Err(e) => log::warn!("Session {}: frame not published: {}", self.session_id, e),
        }
    }

    /// Publish outside the session lock.
    async fn publish_now(&self, frame: Frame) {
        let mut pending = Pending::new();
        self.publish(frame, &mut pending);
        self.emit_all(pending).await;
    }

    async fn emit(&self, event: NegotiationEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_negotiation_event(&event).await;
        }
    }

    async fn emit_all(&self, events: Pending) {
        for event in events {
            self.emit(event).await;
        }
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let cancelled = *rx.borrow_and_update();
        if cancelled {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
