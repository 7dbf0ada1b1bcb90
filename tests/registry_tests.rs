use rentnego::{
    Checkpointer, CreateSessionRequest, InMemoryDirectory, MemoryCheckpointStore,
    NegotiationConfig, NegotiationError, NegotiationService, Participant, Role,
    ScriptedResponder, SessionRegistry, SessionStatus,
};
use serde_json::{json, Map};
use std::sync::Arc;

fn registry() -> SessionRegistry {
    let store = Arc::new(MemoryCheckpointStore::new());
    let checkpointer = Checkpointer::new(store, &NegotiationConfig::default());
    SessionRegistry::new(checkpointer, Role::Landlord)
}

fn service() -> NegotiationService {
    NegotiationService::new(
        Arc::new(ScriptedResponder::repeating("Let me think about it.")),
        Arc::new(MemoryCheckpointStore::new()),
        NegotiationConfig::default(),
    )
}

#[tokio::test]
async fn test_create_validates_participants() {
    let registry = registry();

    let cases = vec![
        vec![Participant::tenant("T1", "Tara")],
        vec![
            Participant::tenant("T1", "Tara"),
            Participant::landlord("L1", "Lee"),
            Participant::landlord("L2", "Lou"),
        ],
        vec![Participant::landlord("L1", "Lee")],
        vec![
            Participant::tenant("T1", "Tara"),
            Participant::tenant("T1", "Tara again"),
            Participant::landlord("L1", "Lee"),
        ],
        vec![
            Participant::tenant("", "Nobody"),
            Participant::landlord("L1", "Lee"),
        ],
    ];
    for participants in cases {
        let err = registry
            .create("P1", participants, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidParticipants(_)));
        assert_eq!(err.status_code(), 400);
    }

    let err = registry
        .create(
            " ",
            vec![Participant::tenant("T1", "Tara"), Participant::landlord("L1", "Lee")],
            Map::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidRequest(_)));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_created_session_is_pending_and_retrievable() {
    let registry = registry();
    let mut context = Map::new();
    context.insert("asking_rent".into(), json!(1400));

    let created = registry
        .create(
            "P1",
            vec![Participant::tenant("T1", "Tara"), Participant::landlord("L1", "Lee")],
            context,
        )
        .await
        .unwrap();
    assert_eq!(created.status, SessionStatus::Pending);
    assert!(created.history.is_empty());
    assert_eq!(created.turn_state.turn_count, 0);
    assert_eq!(created.turn_state.next_role, Role::Landlord);
    assert_eq!(created.pending_checkpoint_writes(), 0);

    let fetched = registry.get(&created.session_id).await.unwrap();
    assert_eq!(fetched.property_id, "P1");
    assert_eq!(fetched.context["asking_rent"], json!(1400));
    assert!(registry.contains(&created.session_id));
    assert_eq!(registry.session_ids(), vec![created.session_id.clone()]);

    let err = registry.get("missing").await.unwrap_err();
    assert!(matches!(err, NegotiationError::NotFound(_)));
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_add_participant_rules() {
    let registry = registry();
    let session = registry
        .create(
            "P1",
            vec![Participant::tenant("T1", "Tara"), Participant::landlord("L1", "Lee")],
            Map::new(),
        )
        .await
        .unwrap();
    let id = session.session_id;

    let updated = registry
        .add_participant(&id, Participant::tenant("T2", "Tom"))
        .await
        .unwrap();
    assert_eq!(updated.participants.len(), 3);
    assert_eq!(updated.active_tenants().len(), 2);

    let err = registry
        .add_participant(&id, Participant::tenant("T2", "Tom"))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::DuplicateParticipant(_)));
    assert_eq!(err.status_code(), 409);

    let err = registry
        .add_participant(&id, Participant::landlord("L2", "Lou"))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidParticipants(_)));

    let err = registry
        .add_participant("missing", Participant::tenant("T3", "Tia"))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::NotFound(_)));

    assert_eq!(registry.get(&id).await.unwrap().participants.len(), 3);
}

#[tokio::test]
async fn test_join_after_cancel_is_rejected() {
    let service = service();
    let session = service
        .create_session(CreateSessionRequest::new("P1", ["T1"], "L1"))
        .await
        .unwrap();
    let id = session.session_id;

    service.cancel(&id).await.unwrap();
    let err = service
        .join(&id, Participant::tenant("T2", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::SessionClosed(_)));
    assert_eq!(err.status_code(), 409);
}

#[tokio::test]
async fn test_list_excludes_terminal_sessions() {
    let service = service();
    let mut ids = Vec::new();
    for property in ["P1", "P2", "P3"] {
        let session = service
            .create_session(CreateSessionRequest::new(property, ["T1"], "L1"))
            .await
            .unwrap();
        ids.push(session.session_id);
    }
    service
        .create_session(CreateSessionRequest::new("P4", ["T9"], "L1"))
        .await
        .unwrap();

    service.cancel(&ids[1]).await.unwrap();

    let listed: Vec<String> = service
        .list_for_participant("T1")
        .await
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(listed, vec![ids[0].clone(), ids[2].clone()]);

    assert_eq!(service.list_for_participant("L1").await.len(), 3);
    assert!(service.list_for_participant("nobody").await.is_empty());
}

#[tokio::test]
async fn test_directory_resolves_participants() {
    let directory = InMemoryDirectory::new()
        .with_tenant("T1", "Tara")
        .with_tenant("T2", "Tom")
        .with_landlord("L1", "Lee");
    let service = service().with_directory(Arc::new(directory));

    let session = service
        .create_session(CreateSessionRequest::new("P1", ["T1"], "L1"))
        .await
        .unwrap();
    assert_eq!(session.landlord().unwrap().name, "Lee");

    let err = service
        .create_session(CreateSessionRequest::new("P1", ["T404"], "L1"))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::NotFound(_)));

    // A known landlord id cannot be joined as a tenant.
    let err = service
        .join(&session.session_id, Participant::tenant("L1", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::NotFound(_)));

    let joined = service
        .join(&session.session_id, Participant::tenant("T2", ""))
        .await
        .unwrap();
    let tom = joined.participant("T2").unwrap();
    assert_eq!(tom.name, "Tom");
    assert_eq!(tom.role, Role::Tenant);
}

#[tokio::test]
async fn test_request_shape_errors() {
    let service = service();

    let err = service
        .create_session(CreateSessionRequest::new("P1", Vec::<String>::new(), "L1"))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidParticipants(_)));

    let err = service
        .create_session(CreateSessionRequest::new("P1", ["L1"], "L1"))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidParticipants(_)));

    let err = service
        .create_session(CreateSessionRequest::new("", ["T1"], "L1"))
        .await
        .unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidRequest(_)));
    assert!(service.registry().is_empty());
}
