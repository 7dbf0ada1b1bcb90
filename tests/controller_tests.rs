use async_trait::async_trait;
use rentnego::event::{EventHandler, NegotiationEvent};
use rentnego::{
    CreateSessionRequest, Frame, MemoryCheckpointStore, Message, NegotiationConfig,
    NegotiationError, NegotiationService, Role, ScriptStep, ScriptedResponder, SessionStatus,
    TerminationPredicate, TerminationReason,
};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

fn service(responder: Arc<ScriptedResponder>, config: NegotiationConfig) -> NegotiationService {
    NegotiationService::new(responder, Arc::new(MemoryCheckpointStore::new()), config)
}

async fn create(service: &NegotiationService) -> String {
    service
        .create_session(CreateSessionRequest::new("P1", ["T1"], "L1"))
        .await
        .unwrap()
        .session_id
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<NegotiationEvent>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_negotiation_event(&self, event: &NegotiationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn test_agreement_scenario_completes_after_three_turns() {
    let responder = Arc::new(ScriptedResponder::new([
        "I'd like £1200",
        "I can do £1400",
        "Deal, £1300 works, agreement reached",
    ]));
    let service = service(
        responder.clone(),
        NegotiationConfig::default().with_first_speaker(Role::Tenant),
    );
    let id = create(&service).await;

    let state = service.controller(&id).unwrap().run_to_completion().await.unwrap();

    assert_eq!(state.turn_count, 3);
    assert_eq!(state.termination_reason, Some(TerminationReason::Agreement));
    let details = state.agreement.unwrap();
    assert_eq!(details.price, Some(1300.0));
    assert_eq!(details.currency.as_deref(), Some("GBP"));
    assert_eq!(details.participant_id, "T1");
    assert_eq!(details.turn, 3);

    let session = service.get(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.turn_state.active_participant_id, None);
    assert_eq!(
        responder.roles(),
        vec![Role::Tenant, Role::Landlord, Role::Tenant]
    );
}

#[tokio::test]
async fn test_roles_alternate_until_turn_budget() {
    let responder = Arc::new(ScriptedResponder::repeating("Let me think about it."));
    let service = service(responder, NegotiationConfig::default());
    let id = create(&service).await;

    let state = service.controller(&id).unwrap().run_to_completion().await.unwrap();
    assert_eq!(state.turn_count, 30);
    assert_eq!(state.termination_reason, Some(TerminationReason::MaxTurns));

    let session = service.get(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.history.len(), 30);
    assert_eq!(session.history[0].role, Role::Landlord);
    for pair in session.history.windows(2) {
        assert_ne!(pair[0].role, pair[1].role);
    }

    // No turn past the budget.
    let err = service.advance(&id).await.unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidState(_)));
    assert_eq!(service.get(&id).await.unwrap().history.len(), 30);
}

#[tokio::test]
async fn test_responder_timeouts_cancel_with_agent_failure() {
    let responder = Arc::new(ScriptedResponder::hanging());
    let config = NegotiationConfig::default()
        .with_responder_timeout(Duration::from_millis(50))
        .with_retry_backoff(Duration::from_millis(5));
    let service = service(responder.clone(), config);
    let id = create(&service).await;
    let viewer = service.subscribe(&id).unwrap();

    let err = service.advance(&id).await.unwrap_err();
    assert!(matches!(err, NegotiationError::AgentFailure(_)));
    assert_eq!(responder.calls().len(), 3);

    let session = service.get(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(
        session.turn_state.termination_reason,
        Some(TerminationReason::AgentFailure)
    );
    assert!(session.history.is_empty());

    let (frames, overflow) = viewer.collect().await;
    assert!(overflow.is_none());
    let starts = frames
        .iter()
        .filter(|f| matches!(f, Frame::TurnStarted { .. }))
        .count();
    assert_eq!(starts, 3);
    assert!(matches!(frames[frames.len() - 2], Frame::Error { .. }));
    assert_eq!(
        frames.last(),
        Some(&Frame::SessionCompleted {
            reason: TerminationReason::AgentFailure
        })
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let responder = Arc::new(ScriptedResponder::from_steps([
        ScriptStep::Fail("upstream 503".into()),
        ScriptStep::Reply("I can do £1400".into()),
    ]));
    let recorder = Arc::new(Recorder::default());
    let config = NegotiationConfig::default().with_retry_backoff(Duration::from_millis(1));
    let service = service(responder.clone(), config).with_event_handler(recorder.clone());
    let id = create(&service).await;

    let state = service.advance(&id).await.unwrap();
    assert_eq!(state.turn_count, 1);
    assert_eq!(responder.calls().len(), 2);

    let events = recorder.events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        NegotiationEvent::ResponderRetry { attempt: 2, .. }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, NegotiationEvent::TurnCompleted { turn: 1, .. })));
}

#[tokio::test]
async fn test_concurrent_advances_are_serialized() {
    let responder = Arc::new(
        ScriptedResponder::repeating("Still thinking it over")
            .streaming()
            .with_chunk_delay(Duration::from_millis(5)),
    );
    let service = service(responder, NegotiationConfig::default());
    let id = create(&service).await;
    let controller = service.controller(&id).unwrap();

    let (a, b) = tokio::join!(controller.advance(), controller.advance());
    a.unwrap();
    b.unwrap();

    let session = service.get(&id).await.unwrap();
    assert_eq!(session.turn_state.turn_count, 2);
    assert_eq!(session.history.len(), 2);
    assert_eq!(session.history[0].role, Role::Landlord);
    assert_eq!(session.history[1].role, Role::Tenant);
}

#[tokio::test]
async fn test_streamed_chunks_concatenate_to_message() {
    let responder = Arc::new(ScriptedResponder::new(["Rent is £1400 per month"]).streaming());
    let service = service(responder, NegotiationConfig::default());
    let id = create(&service).await;
    let mut viewer = service.subscribe(&id).unwrap();

    service.advance(&id).await.unwrap();

    let mut chunks = String::new();
    let mut completed = None;
    while let Ok(Some(frame)) = viewer.try_recv() {
        match frame {
            Frame::TurnStarted { streaming, role, .. } => {
                assert!(streaming);
                assert_eq!(role, Role::Landlord);
            }
            Frame::Chunk { text } => chunks.push_str(&text),
            Frame::TurnCompleted { message } => completed = Some(message),
            other => panic!("unexpected frame {:?}", other),
        }
    }
    let message = completed.unwrap();
    assert_eq!(chunks, "Rent is £1400 per month");
    assert_eq!(message.content, chunks);
}

#[tokio::test]
async fn test_cancel_abandons_inflight_turn() {
    let responder = Arc::new(ScriptedResponder::hanging());
    let service = service(responder, NegotiationConfig::default());
    let id = create(&service).await;
    let viewer = service.subscribe(&id).unwrap();
    let controller = service.controller(&id).unwrap();

    let turn = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.advance().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = controller.cancel().await.unwrap();
    assert_eq!(state.termination_reason, Some(TerminationReason::Cancelled));
    assert!(matches!(
        turn.await.unwrap(),
        Err(NegotiationError::SessionClosed(_))
    ));

    let session = service.get(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert!(session.history.is_empty());

    let (frames, _) = viewer.collect().await;
    assert_eq!(
        frames.last(),
        Some(&Frame::SessionCompleted {
            reason: TerminationReason::Cancelled
        })
    );

    // Second cancel is a no-op.
    assert!(controller.cancel().await.is_ok());
}

#[tokio::test]
async fn test_cancel_completed_session_is_rejected() {
    let responder = Arc::new(ScriptedResponder::new(["We have a deal at £1300"]));
    let service = service(responder, NegotiationConfig::default());
    let id = create(&service).await;

    service.advance(&id).await.unwrap();
    assert_eq!(
        service.get(&id).await.unwrap().status,
        SessionStatus::Completed
    );
    assert!(matches!(
        service.cancel(&id).await,
        Err(NegotiationError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_pause_blocks_turns_until_resume() {
    let responder = Arc::new(ScriptedResponder::repeating("Let me check my diary."));
    let service = service(
        responder,
        NegotiationConfig::default().with_auto_advance(false),
    );
    let id = create(&service).await;

    // Nothing to pause before the first turn.
    assert!(matches!(
        service.pause(&id).await,
        Err(NegotiationError::InvalidState(_))
    ));

    service.advance(&id).await.unwrap();
    service.pause(&id).await.unwrap();
    assert_eq!(service.get(&id).await.unwrap().status, SessionStatus::Paused);
    assert!(matches!(
        service.advance(&id).await,
        Err(NegotiationError::InvalidState(_))
    ));

    service.resume(&id).await.unwrap();
    let state = service.advance(&id).await.unwrap();
    assert_eq!(state.turn_count, 2);
    assert!(matches!(
        service.resume(&id).await,
        Err(NegotiationError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_human_injection_takes_the_turn() {
    let responder = Arc::new(ScriptedResponder::new(["I can do £1400"]));
    let service = service(
        responder.clone(),
        NegotiationConfig::default().with_first_speaker(Role::Tenant),
    );
    let id = create(&service).await;

    let state = service
        .inject(&id, "T1", "Would £1250 work if I sign for two years?")
        .await
        .unwrap();
    assert_eq!(state.turn_count, 1);
    assert_eq!(state.next_role, Role::Landlord);

    assert!(matches!(
        service.inject(&id, "T1", "Hello?").await,
        Err(NegotiationError::InvalidState(_))
    ));
    assert!(matches!(
        service.inject(&id, "ghost", "Hello?").await,
        Err(NegotiationError::NotFound(_))
    ));

    service.advance(&id).await.unwrap();
    let session = service.get(&id).await.unwrap();
    assert!(session.history[0].injected);
    assert!(!session.history[1].injected);

    // The landlord's responder saw the human message as coming from a human.
    let ctx = &responder.calls()[0];
    assert_eq!(ctx.history.len(), 1);
    assert_eq!(ctx.history[0].speaker, rentnego::Speaker::Human);
}

#[tokio::test]
async fn test_custom_predicate_replaces_lexicon() {
    struct EndOnQuestion;

    impl TerminationPredicate for EndOnQuestion {
        fn evaluate(&self, message: &Message) -> Option<TerminationReason> {
            message
                .content
                .ends_with('?')
                .then_some(TerminationReason::Rejected)
        }
    }

    let responder = Arc::new(ScriptedResponder::new(["Deal?"]));
    let service = service(responder, NegotiationConfig::default())
        .with_predicate(Arc::new(EndOnQuestion));
    let id = create(&service).await;

    let state = service.advance(&id).await.unwrap();
    assert_eq!(state.termination_reason, Some(TerminationReason::Rejected));
}

#[tokio::test]
async fn test_started_loop_runs_to_completion() {
    let responder = Arc::new(ScriptedResponder::new([
        "The flat is £1450 a month",
        "That's more than I hoped, how about £1300?",
        "I accept £1350",
    ]));
    let recorder = Arc::new(Recorder::default());
    let service = service(responder, NegotiationConfig::default()).with_event_handler(recorder.clone());
    let id = create(&service).await;

    service.start(&id).unwrap();
    // Starting twice does not spawn a second loop.
    service.start(&id).unwrap();
    let state = service.wait(&id).await.unwrap();

    assert_eq!(state.turn_count, 3);
    assert_eq!(state.termination_reason, Some(TerminationReason::Agreement));

    let events = recorder.events.lock().unwrap();
    let completed = events
        .iter()
        .filter(|e| matches!(e, NegotiationEvent::TurnCompleted { .. }))
        .count();
    assert_eq!(completed, 3);
    assert!(matches!(
        events.last(),
        Some(NegotiationEvent::CheckpointWritten { .. })
    ));
    assert!(events.iter().any(|e| matches!(
        e,
        NegotiationEvent::SessionEnded {
            reason: TerminationReason::Agreement,
            ..
        }
    )));
}

#[tokio::test]
async fn test_reads_do_not_wait_for_an_inflight_turn() {
    let responder = Arc::new(ScriptedResponder::hanging());
    let service = Arc::new(service(responder, NegotiationConfig::default()));
    let first = create(&service).await;
    service
        .create_session(CreateSessionRequest::new("P2", ["T2"], "L2"))
        .await
        .unwrap();

    let turn = {
        let service = service.clone();
        let id = first.clone();
        tokio::spawn(async move { service.advance(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let listed = tokio::time::timeout(
        Duration::from_millis(500),
        service.list_for_participant("T2"),
    )
    .await
    .expect("listing another session waited on the turn");
    assert_eq!(listed.len(), 1);

    let session = tokio::time::timeout(Duration::from_millis(500), service.get(&first))
        .await
        .expect("reading the session waited on its turn")
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert!(session.history.is_empty());

    service.cancel(&first).await.unwrap();
    assert!(matches!(
        turn.await.unwrap(),
        Err(NegotiationError::SessionClosed(_))
    ));
}

/// Reads the session back from inside the event callback.
#[derive(Default)]
struct Inspector {
    service: OnceLock<Arc<NegotiationService>>,
    history_lengths: Mutex<Vec<usize>>,
}

#[async_trait]
impl EventHandler for Inspector {
    async fn on_negotiation_event(&self, event: &NegotiationEvent) {
        if let NegotiationEvent::TurnCompleted { session_id, .. } = event {
            if let Some(service) = self.service.get() {
                let session = service.get(session_id).await.unwrap();
                self.history_lengths.lock().unwrap().push(session.history.len());
            }
        }
    }
}

#[tokio::test]
async fn test_event_handler_can_read_the_session() {
    let responder = Arc::new(ScriptedResponder::new(["The flat is £1450 a month", "How about £1300?"]));
    let inspector = Arc::new(Inspector::default());
    let service = Arc::new(
        service(responder, NegotiationConfig::default()).with_event_handler(inspector.clone()),
    );
    let _ = inspector.service.set(service.clone());
    let id = create(&service).await;

    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(2), service.advance(&id))
            .await
            .expect("turn blocked on its own event handler")
            .unwrap();
    }
    assert_eq!(*inspector.history_lengths.lock().unwrap(), vec![1, 2]);
}
