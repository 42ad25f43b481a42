//! HTTP/WebSocket surface: wires the five endpoints from SPEC_FULL.md §6
//! onto an axum `Router`, mirroring this codebase's `server.rs` shape of a
//! shared `ServerState` plus a `terminal_handler`/`handle_terminal_socket`
//! pair, generalized here from one hardcoded shell to the full session
//! registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::MtError;
use crate::mux::{DimensionAuthority, MuxConnection};
use crate::security::{self, ConnectionTracker, RateLimitConfig, RateLimiter};
use crate::session::{CreateOptions, SessionManager};

#[derive(Clone)]
pub struct ServerState {
    pub manager: Arc<SessionManager>,
    pub dims: Arc<DimensionAuthority>,
    pub connections: Arc<ConnectionTracker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth_token: Arc<SecretString>,
}

impl ServerState {
    pub fn new(manager: Arc<SessionManager>, auth_token: SecretString) -> Self {
        Self {
            manager,
            dims: Arc::new(DimensionAuthority::new()),
            connections: Arc::new(ConnectionTracker::default()),
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            auth_token: Arc::new(auth_token),
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws/state", get(state_ws_handler))
        .route("/ws/mux", get(mux_ws_handler))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", delete(close_session))
        .route("/api/sessions/:id/name", put(rename_session))
        .route("/api/sessions/:id/resize", post(resize_session))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

async fn state_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(auth): Query<AuthQuery>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    if security::validate_auth_token(auth.token.as_deref(), &state.auth_token).is_err() {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let Ok(_guard) = state.connections.try_acquire(addr.ip()) else {
        return (StatusCode::TOO_MANY_REQUESTS, "too many connections").into_response();
    };
    ws.on_upgrade(move |socket| async move {
        let _guard = _guard;
        crate::state_channel::run(socket, state.manager).await;
    })
    .into_response()
}

async fn mux_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(auth): Query<AuthQuery>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    if security::validate_auth_token(auth.token.as_deref(), &state.auth_token).is_err() {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    if state.rate_limiter.check(addr.ip()).is_err() {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }
    let Ok(guard) = state.connections.try_acquire(addr.ip()) else {
        return (StatusCode::TOO_MANY_REQUESTS, "too many connections").into_response();
    };

    ws.on_upgrade(move |socket| async move {
        let _guard = guard;
        handle_mux_socket(socket, state).await;
    })
    .into_response()
}

async fn handle_mux_socket(socket: WebSocket, state: ServerState) {
    use futures::{SinkExt, StreamExt};

    let client_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(512);

    let writer = tokio::spawn(async move {
        while let Some(message) = ws_rx.recv().await {
            if sink.send(message).await.is_err() {
                return;
            }
        }
    });

    let connection = Arc::new(MuxConnection::new(
        client_id.clone(),
        state.manager.clone(),
        state.dims.clone(),
        ws_tx,
    ));

    if connection.send_init().await.is_err() {
        writer.abort();
        return;
    }

    info!(client_id = %client_id, "mux client attached");

    while let Some(Ok(message)) = stream.next().await {
        let bytes = match message {
            Message::Binary(b) => b,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => continue,
        };

        if security::validate_message_size(&bytes).is_err() {
            warn!(client_id = %client_id, "oversized mux frame, dropping connection");
            break;
        }

        if let Err(e) = route_client_frame(&connection, &bytes).await {
            warn!(client_id = %client_id, error = %e, "mux frame handling failed");
        }
    }

    info!(client_id = %client_id, "mux client detached");
    writer.abort();
}

async fn route_client_frame(connection: &Arc<MuxConnection>, bytes: &[u8]) -> Result<(), MtError> {
    use crate::mux::frame::MuxFrame;
    let frame = MuxFrame::decode(bytes)?;
    match &frame {
        MuxFrame::BufferRequest { session_id } | MuxFrame::Input { session_id, .. } => {
            connection.attach(session_id).await?;
        }
        MuxFrame::Resize { session_id, cols, rows } => {
            security::validate_terminal_dimensions(*cols, *rows)
                .map_err(|e| MtError::ProtocolError(e.to_string()))?;
            connection.attach(session_id).await?;
        }
        _ => {}
    }
    connection.handle_client_frame(bytes).await
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    shell: Option<String>,
    cwd: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
}

async fn create_session(
    State(state): State<ServerState>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let shell_path = req.shell.unwrap_or_else(default_shell);
    let result = state
        .manager
        .create(CreateOptions {
            shell_path: shell_path.clone(),
            shell_type: shell_path,
            args: Vec::new(),
            cwd: req.cwd,
            cols: req.cols.unwrap_or(80),
            rows: req.rows.unwrap_or(24),
            env: Vec::new(),
        })
        .await;

    match result {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn close_session(State(state): State<ServerState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.close(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct RenameRequest {
    name: String,
}

#[derive(Deserialize)]
struct RenameQuery {
    #[serde(default)]
    auto: bool,
}

async fn rename_session(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<RenameQuery>,
    Json(req): Json<RenameRequest>,
) -> impl IntoResponse {
    match state.manager.rename(&id, req.name, query.auto) {
        Ok(_session) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

async fn resize_session(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> impl IntoResponse {
    if let Err(e) = security::validate_terminal_dimensions(req.cols, req.rows) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    match state.manager.resize(&id, req.cols, req.rows).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: MtError) -> axum::response::Response {
    let status = match &err {
        MtError::UnknownSession(_) => StatusCode::NOT_FOUND,
        MtError::LimitReached => StatusCode::TOO_MANY_REQUESTS,
        MtError::AuthError(_) => StatusCode::UNAUTHORIZED,
        MtError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

#[cfg(unix)]
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(windows)]
fn default_shell() -> String {
    std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
}
