//! HTTP and WebSocket boundary (feature `server`).
//!
//! | Method | Path                                         | Result                         |
//! |--------|----------------------------------------------|--------------------------------|
//! | POST   | `/negotiation/create`                        | `{session_id, status, participants}` |
//! | POST   | `/negotiation/{session_id}/join`             | updated session                |
//! | GET    | `/negotiation/{session_id}`                  | full session                   |
//! | POST   | `/negotiation/{session_id}/start`            | `202`, turn loop spawned       |
//! | POST   | `/negotiation/{session_id}/pause`            | turn state                     |
//! | POST   | `/negotiation/{session_id}/resume`           | turn state                     |
//! | POST   | `/negotiation/{session_id}/cancel`           | turn state                     |
//! | GET    | `/negotiation/{session_id}/stream`           | WebSocket, see [`protocol`](crate::negotiation::protocol) |
//! | GET    | `/participant/{participant_id}/negotiations` | open sessions                  |
//!
//! Errors are returned as `{"error": "...", "kind": "..."}` with the status
//! from [`NegotiationError::status_code`].

use crate::negotiation::error::NegotiationError;
use crate::negotiation::model::{Participant, Session, SessionStatus, TurnState};
use crate::negotiation::protocol::{ClientFrame, ServerFrame};
use crate::negotiation::service::{CreateSessionRequest, NegotiationService};
use crate::negotiation::transport::Subscription;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Response body of `POST /negotiation/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub participants: Vec<Participant>,
}

/// Body of `POST /negotiation/{session_id}/join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub participant: Participant,
}

/// [`NegotiationError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub NegotiationError);

impl From<NegotiationError> for ApiError {
    fn from(err: NegotiationError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Routes for the negotiation surface.
pub fn router(service: Arc<NegotiationService>) -> Router {
    Router::new()
        .route("/negotiation/create", post(create_session))
        .route("/negotiation/{session_id}", get(get_session))
        .route("/negotiation/{session_id}/join", post(join_session))
        .route("/negotiation/{session_id}/start", post(start_session))
        .route("/negotiation/{session_id}/pause", post(pause_session))
        .route("/negotiation/{session_id}/resume", post(resume_session))
        .route("/negotiation/{session_id}/cancel", post(cancel_session))
        .route("/negotiation/{session_id}/stream", get(stream_session))
        .route(
            "/participant/{participant_id}/negotiations",
            get(list_for_participant),
        )
        .with_state(service)
}

/// Bind `addr` and serve until the task is dropped.
pub async fn serve(
    service: Arc<NegotiationService>,
    addr: SocketAddr,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("Negotiation server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(service)).await?;
    Ok(())
}

async fn create_session(
    State(service): State<Arc<NegotiationService>>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<CreateSessionResponse>)> {
    let session = service.create_session(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.session_id,
            status: session.status,
            participants: session.participants,
        }),
    ))
}

async fn get_session(
    State(service): State<Arc<NegotiationService>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(service.get(&session_id).await?))
}

async fn join_session(
    State(service): State<Arc<NegotiationService>>,
    Path(session_id): Path<String>,
    Json(request): Json<JoinRequest>,
) -> ApiResult<Json<Session>> {
    Ok(Json(service.join(&session_id, request.participant).await?))
}

async fn start_session(
    State(service): State<Arc<NegotiationService>>,
    Path(session_id): Path<String>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    if service.get(&session_id).await?.status.is_terminal() {
        return Err(NegotiationError::InvalidState(format!("session {} has ended", session_id)).into());
    }
    service.start(&session_id)?;
    Ok((StatusCode::ACCEPTED, Json(service.get(&session_id).await?)))
}

async fn pause_session(
    State(service): State<Arc<NegotiationService>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<TurnState>> {
    Ok(Json(service.pause(&session_id).await?))
}

async fn resume_session(
    State(service): State<Arc<NegotiationService>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<TurnState>> {
    Ok(Json(service.resume(&session_id).await?))
}

async fn cancel_session(
    State(service): State<Arc<NegotiationService>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<TurnState>> {
    Ok(Json(service.cancel(&session_id).await?))
}

async fn list_for_participant(
    State(service): State<Arc<NegotiationService>>,
    Path(participant_id): Path<String>,
) -> Json<Vec<Session>> {
    Json(service.list_for_participant(&participant_id).await)
}

async fn stream_session(
    ws: WebSocketUpgrade,
    State(service): State<Arc<NegotiationService>>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    // Subscribe before upgrading so unknown sessions get a plain 404.
    let subscription = service.subscribe(&session_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, service, session_id, subscription)))
}

async fn handle_socket(
    socket: WebSocket,
    service: Arc<NegotiationService>,
    session_id: String,
    mut subscription: Subscription,
) {
    log::info!(
        "Viewer {} connected to session {}",
        subscription.id(),
        session_id
    );
    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerFrame>(16);

    let reader_service = service.clone();
    let reader_session = session_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let text = match msg {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => break,
                _ => continue,
            };
            let outcome = match ClientFrame::parse(&text) {
                Ok(ClientFrame::Ready) => reader_service.start(&reader_session),
                Ok(ClientFrame::Inject {
                    participant_id,
                    message,
                }) => reader_service
                    .inject(&reader_session, &participant_id, message)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                if reply_tx.send(ServerFrame::error(&e)).await.is_err() {
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = subscription.recv() => match frame {
                Ok(Some(frame)) => {
                    let frame = ServerFrame::from(frame);
                    let last = frame.is_final();
                    if !send_frame(&mut sender, &frame).await || last {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    send_frame(&mut sender, &ServerFrame::error(&e)).await;
                    break;
                }
            },
            Some(reply) = reply_rx.recv() => {
                if !send_frame(&mut sender, &reply).await {
                    break;
                }
            }
        }
    }

    service.unsubscribe(&subscription);
    reader.abort();
    let _ = sender.send(Message::Close(None)).await;
    log::info!(
        "Viewer {} disconnected from session {}",
        subscription.id(),
        session_id
    );
}

async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> bool {
    match frame.to_json() {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            log::error!("Could not encode frame: {}", e);
            true
        }
    }
}
