//! # HTTP and WebSocket surface
//!
//! ## Endpoints
//!
//! - `GET /ws` - WebSocket upgrade. Each socket gets its own [`Connection`].
//!   Text frames carry JSON control envelopes, binary frames carry raw
//!   terminal bytes in both directions.
//! - `GET /api/sessions` - JSON listing of live sessions. Requires the shared
//!   token as `Authorization: Bearer <token>` or `?token=<token>`.
//!
//! Every socket loop also watches the [`Shutdown`] signal so graceful
//! shutdown is not held up by idle viewers.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::TokenValidator;
use crate::session::{SessionRegistry, SessionSummary};
use crate::shutdown::Shutdown;

mod connection;
mod protocol;

pub use connection::{Connection, Outbound, resolve_cwd};
pub use protocol::{ControlRequest, Envelope, ProtocolError, ServerMessage};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub auth: Arc<dyn TokenValidator>,
    /// Working directory for sessions created without one.
    pub default_cwd: PathBuf,
    pub shutdown: Shutdown,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handle_ws))
        .route("/api/sessions", get(list_sessions))
        .with_state(state)
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<SessionSummary>>, StatusCode> {
    let token = bearer_token(&headers).or(query.token).unwrap_or_default();
    let auth = state.auth.clone();
    let valid = tokio::task::spawn_blocking(move || auth.validate(&token))
        .await
        .unwrap_or(false);

    if !valid {
        warn!("Rejected session listing with a missing or invalid token");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(state.registry.list()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut connection = Connection::new(
        state.registry.clone(),
        state.auth.clone(),
        state.default_cwd.clone(),
    );
    info!("WebSocket client connected");

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => {
                        let replies = connection.handle_control(text.as_str().as_bytes()).await;
                        if send_all(&mut ws_sender, replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Binary(data) => connection.handle_input(&data),
                    Message::Close(_) => {
                        debug!("WebSocket close frame received");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            event = connection.next_event() => {
                if let Some(outbound) = event {
                    if send(&mut ws_sender, outbound).await.is_err() {
                        break;
                    }
                }
            }
            _ = state.shutdown.wait() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    connection.detach();
    info!("WebSocket client disconnected");
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send(ws_sender: &mut WsSender, outbound: Outbound) -> Result<(), axum::Error> {
    let message = match outbound {
        Outbound::Output(chunk) => Message::Binary(chunk),
        Outbound::Control(control) => match serde_json::to_string(&control) {
            Ok(json) => Message::Text(json.into()),
            Err(e) => {
                warn!("Failed to encode control message: {}", e);
                return Ok(());
            }
        },
    };
    ws_sender.send(message).await
}

async fn send_all(ws_sender: &mut WsSender, replies: Vec<Outbound>) -> Result<(), axum::Error> {
    for outbound in replies {
        send(ws_sender, outbound).await?;
    }
    Ok(())
}
