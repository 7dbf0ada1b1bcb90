use rentnego::{
    Audience, CreateSessionRequest, Frame, MemoryCheckpointStore, Message, NegotiationConfig,
    NegotiationError, NegotiationService, Role, ScriptedResponder, TerminationReason,
    TransportHub,
};
use std::sync::Arc;

fn chunk(text: &str) -> Frame {
    Frame::Chunk {
        text: text.to_string(),
    }
}

fn turn_started(turn: u32) -> Frame {
    Frame::TurnStarted {
        participant_id: "L1".into(),
        role: Role::Landlord,
        turn,
        streaming: true,
    }
}

fn turn_completed(text: &str) -> Frame {
    Frame::TurnCompleted {
        message: Message::new("s1", "L1", Role::Landlord, text),
    }
}

fn ended(reason: TerminationReason) -> Frame {
    Frame::SessionCompleted { reason }
}

#[tokio::test]
async fn test_every_subscriber_sees_publish_order() {
    let hub = Arc::new(TransportHub::new(256));
    hub.open_channel("s1");
    let viewers: Vec<_> = (0..5).map(|_| hub.subscribe("s1").unwrap()).collect();
    let readers: Vec<_> = viewers
        .into_iter()
        .map(|v| tokio::spawn(v.collect()))
        .collect();

    let mut published = Vec::new();
    for turn in 1..=10 {
        let frames = vec![
            turn_started(turn),
            chunk("I can "),
            chunk("do "),
            chunk(&format!("£{}", 1400 - turn)),
            turn_completed(&format!("I can do £{}", 1400 - turn)),
        ];
        for frame in frames {
            hub.publish("s1", frame.clone()).unwrap();
            published.push(frame);
            tokio::task::yield_now().await;
        }
    }
    let last = ended(TerminationReason::MaxTurns);
    hub.publish("s1", last.clone()).unwrap();
    published.push(last);

    for reader in readers {
        let (frames, error) = reader.await.unwrap();
        assert!(error.is_none());
        assert_eq!(frames, published);
    }
    assert_eq!(hub.published_count("s1"), 51);
}

#[tokio::test]
async fn test_slow_subscriber_is_dropped_alone() {
    let hub = TransportHub::new(4);
    hub.open_channel("s1");
    let mut slow = hub.subscribe("s1").unwrap();
    let mut fast = hub.subscribe("s1").unwrap();

    let mut fast_seen = Vec::new();
    let mut overflowed = Vec::new();
    for i in 0..10 {
        let report = hub.publish("s1", chunk(&i.to_string())).unwrap();
        overflowed.extend(report.overflowed);
        while let Some(frame) = fast.try_recv().unwrap() {
            fast_seen.push(frame);
        }
    }

    assert_eq!(overflowed, vec![slow.id().to_string()]);
    assert_eq!(fast_seen.len(), 10);
    assert_eq!(hub.subscriber_count("s1"), 1);

    // Frames queued before the overflow still arrive, then the error.
    for i in 0..4 {
        assert_eq!(slow.recv().await.unwrap(), Some(chunk(&i.to_string())));
    }
    assert!(matches!(
        slow.recv().await,
        Err(NegotiationError::Overflow(_))
    ));
}

#[tokio::test]
async fn test_late_subscriber_gets_inflight_replay() {
    let hub = TransportHub::new(16);
    hub.open_channel("s1");

    hub.publish("s1", turn_started(1)).unwrap();
    hub.publish("s1", chunk("I can ")).unwrap();
    hub.publish("s1", chunk("do ")).unwrap();

    let late = hub.subscribe("s1").unwrap();
    hub.publish("s1", chunk("£1400")).unwrap();
    hub.publish("s1", turn_completed("I can do £1400")).unwrap();

    // Joined after the turn completed: nothing to replay.
    let later = hub.subscribe("s1").unwrap();
    hub.publish("s1", ended(TerminationReason::Rejected)).unwrap();

    let (frames, _) = late.collect().await;
    assert_eq!(
        frames,
        vec![
            turn_started(1),
            chunk("I can "),
            chunk("do "),
            chunk("£1400"),
            turn_completed("I can do £1400"),
            ended(TerminationReason::Rejected),
        ]
    );
    let (frames, _) = later.collect().await;
    assert_eq!(frames, vec![ended(TerminationReason::Rejected)]);
}

#[tokio::test]
async fn test_closed_channel_behaviour() {
    let hub = TransportHub::default();
    hub.open_channel("s1");
    let viewer = hub.subscribe("s1").unwrap();

    hub.unsubscribe(&viewer);
    hub.unsubscribe(&viewer);
    assert_eq!(hub.subscriber_count("s1"), 0);

    hub.publish("s1", ended(TerminationReason::Cancelled)).unwrap();
    assert!(hub.is_closed("s1"));
    assert!(matches!(
        hub.publish("s1", chunk("too late")),
        Err(NegotiationError::SessionClosed(_))
    ));

    let after = hub.subscribe("s1").unwrap();
    let (frames, error) = after.collect().await;
    assert_eq!(frames, vec![ended(TerminationReason::Cancelled)]);
    assert!(error.is_none());

    assert!(matches!(
        hub.subscribe("nope"),
        Err(NegotiationError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_role_scoped_frames() {
    let hub = TransportHub::default();
    hub.open_channel("s1");
    let mut tenant = hub.subscribe_as("s1", Some(Role::Tenant)).unwrap();
    let mut everyone = hub.subscribe("s1").unwrap();

    let report = hub
        .publish_to("s1", Audience::Role(Role::Landlord), chunk("landlord only"))
        .unwrap();
    assert_eq!(report.delivered, 1);
    hub.publish("s1", chunk("shared")).unwrap();

    assert_eq!(tenant.try_recv().unwrap(), Some(chunk("shared")));
    assert_eq!(everyone.try_recv().unwrap(), Some(chunk("landlord only")));
    assert_eq!(everyone.try_recv().unwrap(), Some(chunk("shared")));
}

#[tokio::test]
async fn test_overflow_never_stalls_the_session() {
    let responder = Arc::new(
        ScriptedResponder::repeating("one two three four five six seven eight").streaming(),
    );
    let service = NegotiationService::new(
        responder,
        Arc::new(MemoryCheckpointStore::new()),
        NegotiationConfig::default()
            .with_subscriber_buffer(3)
            .with_max_turns(4),
    );
    let session = service
        .create_session(CreateSessionRequest::new("P1", ["T1"], "L1"))
        .await
        .unwrap();
    let id = session.session_id;
    let slow = service.subscribe(&id).unwrap();

    let state = service
        .controller(&id)
        .unwrap()
        .run_to_completion()
        .await
        .unwrap();
    assert_eq!(state.turn_count, 4);
    assert_eq!(state.termination_reason, Some(TerminationReason::MaxTurns));

    let (frames, error) = slow.collect().await;
    assert_eq!(frames.len(), 3);
    assert!(matches!(error, Some(NegotiationError::Overflow(_))));
}

#[tokio::test]
async fn test_late_subscriber_learns_why_the_session_ended() {
    let hub = TransportHub::default();
    hub.open_channel("s1");

    // An error from an earlier turn that was retried is not part of the ending.
    hub.publish("s1", Frame::Error { detail: "upstream 503".into() }).unwrap();
    hub.publish("s1", turn_started(2)).unwrap();
    hub.publish("s1", chunk("I can ")).unwrap();

    let failure = Frame::Error {
        detail: "landlord responder failed after 3 attempts: timed out".into(),
    };
    hub.publish("s1", failure.clone()).unwrap();
    hub.publish("s1", ended(TerminationReason::AgentFailure)).unwrap();

    let (frames, error) = hub.subscribe("s1").unwrap().collect().await;
    assert!(error.is_none());
    assert_eq!(frames, vec![failure, ended(TerminationReason::AgentFailure)]);
}

#[tokio::test]
async fn test_late_viewer_of_failed_session_gets_error_frame() {
    let service = NegotiationService::new(
        Arc::new(ScriptedResponder::failing("upstream 503")),
        Arc::new(MemoryCheckpointStore::new()),
        NegotiationConfig::default().with_retry_backoff(std::time::Duration::from_millis(1)),
    );
    let id = service
        .create_session(CreateSessionRequest::new("P1", ["T1"], "L1"))
        .await
        .unwrap()
        .session_id;
    assert!(matches!(
        service.advance(&id).await,
        Err(NegotiationError::AgentFailure(_))
    ));

    let (frames, _) = service.subscribe(&id).unwrap().collect().await;
    assert_eq!(frames.len(), 2);
    match &frames[0] {
        Frame::Error { detail } => assert!(detail.contains("upstream 503")),
        other => panic!("expected an error frame, got {:?}", other),
    }
    assert_eq!(frames[1], ended(TerminationReason::AgentFailure));
}
