use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;

use crate::protocol::{AnalysisRequest, CreateAnalysisResponse, SessionEvent};
use crate::session::{Session, SessionSnapshot, SessionSummary};

use super::error::ApiError;
use super::{get_session, AppState};

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// `POST /api/analyze`: create a session and start its job.
///
/// Returns as soon as the session is registered; the job runs in the
/// background and the client follows it over `/ws/{id}`.
pub(super) async fn analyze(
    State(state): State<AppState>,
    payload: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Result<Json<CreateAnalysisResponse>, ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    let Json(request) = payload.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;

    let session = state.sessions.create(request)?;
    tracing::info!(
        session = %session.id,
        company = %session.request.company_name,
        stock_code = %session.request.stock_code,
        market = %session.request.market,
        "analysis session created"
    );
    state.runner.launch(session.clone());

    Ok(Json(CreateAnalysisResponse {
        session_id: session.id,
    }))
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session = get_session(&state.sessions, &id)?;
    Ok(Json(session.snapshot()))
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}

pub(super) async fn session_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = get_session(&state.sessions, &id)?;
    if !session.cancel() {
        return Err(ApiError::SessionFinished(id));
    }
    tracing::info!(session = %id, "cancellation requested");
    Ok(StatusCode::ACCEPTED)
}

/// `GET /ws/{id}`: stream a session's events.
///
/// The session is looked up before the upgrade so an unknown id gets a
/// plain 404 instead of an empty socket.
pub(super) async fn session_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let session = get_session(&state.sessions, &id)?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws.on_upgrade(move |socket| handle_session_ws(socket, session, state)))
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_event(ws_tx: &mut WsSink, event: &SessionEvent) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode session event");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await
}

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}

async fn handle_session_ws(socket: WebSocket, session: Session, state: AppState) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (replay, mut subscription) = session.attach();
    tracing::debug!(
        session = %session.id,
        subscriber = subscription.id(),
        replay = replay.len(),
        "subscriber attached"
    );

    // History goes out before anything live; the subscription buffers
    // whatever is published meanwhile.
    for event in &replay {
        if send_event(&mut ws_tx, event).await.is_err() {
            tracing::debug!(session = %session.id, "subscriber went away during replay");
            return;
        }
    }
    if replay.last().is_some_and(SessionEvent::is_terminal) {
        send_close(&mut ws_tx, close_code::NORMAL, "session finished").await;
        return;
    }
    if *shutdown_rx.borrow() {
        send_close(&mut ws_tx, close_code::AWAY, "server shutting down").await;
        return;
    }

    loop {
        // Queued events go out before a pending shutdown close.
        tokio::select! {
            biased;

            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        if send_event(&mut ws_tx, &event).await.is_err() {
                            tracing::debug!(session = %session.id, "subscriber write failed");
                            break;
                        }
                        if terminal {
                            send_close(&mut ws_tx, close_code::NORMAL, "session finished").await;
                            break;
                        }
                    }
                    None => {
                        // The terminal event always precedes the end of the
                        // queue, so this subscriber was dropped for lagging.
                        tracing::warn!(session = %session.id, "closing lagging subscriber");
                        send_close(&mut ws_tx, close_code::AGAIN, "subscriber fell behind").await;
                        break;
                    }
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(session = %session.id, error = %e, "subscriber read failed");
                        break;
                    }
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!("WebSocket received shutdown signal, closing");
                    send_close(&mut ws_tx, close_code::AWAY, "server shutting down").await;
                    break;
                }
            }
        }
    }

    tracing::debug!(session = %session.id, subscriber = subscription.id(), "subscriber disconnected");
    // `subscription` and `_guard` drop here: detach, then decrement the
    // active connection count.
}
