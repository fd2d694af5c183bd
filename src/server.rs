use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Request, State},
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use crossbeam_channel::Sender;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::aggregate::merge_match;
use crate::hub::{BroadcastHub, Frame, Notice};
use crate::registry::{GameRegistry, MatchKey};
use crate::snapshot::game_snapshot;
use crate::uploads::UploadStore;

/// Uploader posts and handler work are bounded; a hung request cannot pin a
/// connection task forever.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A websocket send that blocks this long means the client is gone or too
/// slow to keep.
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub struct AppState {
    pub registry: Arc<GameRegistry>,
    pub uploads: Arc<UploadStore>,
    pub hub: Arc<BroadcastHub>,
    pub notices: Sender<Notice>,
    pub started: Instant,
}

impl AppState {
    fn game_snapshots(&self) -> Vec<Value> {
        let streams = self.uploads.views();
        self.registry
            .confirmed()
            .into_iter()
            .map(|record| {
                let merged = merge_match(&record, &streams);
                serde_json::to_value(game_snapshot(&record, &merged)).unwrap_or(Value::Null)
            })
            .collect()
    }
}

pub fn http_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/games", get(api_games))
        .route("/api/events/{key}", get(api_events))
        .route("/api/gamelog", post(api_gamelog_replace))
        .route("/api/gamelog/append", post(api_gamelog_append))
        .fallback(api_not_found)
        .layer(middleware::from_fn(http_guard))
        .with_state(state)
}

pub async fn run_http_server(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr().context("http listener address")?;
    info!("http api listening on http://{addr}/api/status");
    axum::serve(listener, http_router(state))
        .await
        .context("http serve failed")?;
    Ok(())
}

/// Permissive CORS on every response, 204 preflights, and the request-level
/// time bound.
async fn http_guard(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(&mut response);
        return response;
    }
    let mut response = match timeout(REQUEST_TIMEOUT, next.run(req)).await {
        Ok(response) => response,
        Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "request timed out"),
    };
    apply_cors(&mut response);
    response
}

fn apply_cors(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        header::HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        header::HeaderValue::from_static("Content-Type"),
    );
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn api_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "activeGames": state.registry.confirmed().len(),
        "uptime": state.started.elapsed().as_secs(),
    }))
}

async fn api_games(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "games": state.game_snapshots() }))
}

async fn api_events(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    let empty = || {
        Json(json!({
            "gameId": Value::Null,
            "killFeed": [],
            "chat": [],
            "timeline": [],
            "startTime": Value::Null,
        }))
        .into_response()
    };
    let Ok(key) = key.parse::<MatchKey>() else {
        return empty();
    };
    let Some(record) = state.registry.get_clone(&key) else {
        return empty();
    };
    let merged = merge_match(&record, &state.uploads.views());
    Json(json!({
        "gameId": record.game_id,
        "killFeed": merged.kill_feed,
        "chat": merged.chat,
        "timeline": merged.timeline,
        "startTime": record.first_registered,
    }))
    .into_response()
}

/// Pulls `{playerName, content}` out of an upload body; the error string is
/// what the 400 response carries.
fn parse_upload_body(body: &str) -> std::result::Result<(String, String), &'static str> {
    let parsed: Value = serde_json::from_str(body).map_err(|_| "body is not valid json")?;
    let player = parsed
        .get("playerName")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or("playerName is required")?;
    let content = parsed
        .get("content")
        .and_then(Value::as_str)
        .ok_or("content is required")?;
    Ok((player.to_owned(), content.to_owned()))
}

async fn api_gamelog_replace(State(state): State<Arc<AppState>>, body: String) -> Response {
    let (player, content) = match parse_upload_body(&body) {
        Ok(parts) => parts,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, message),
    };
    match state.uploads.replace(&player, &content) {
        Ok(stats) => {
            debug!(player = %player, events = stats.events_received, "gamelog replaced");
            let _ = state.notices.send(Notice::SnapshotDirty);
            Json(json!({
                "ok": true,
                "eventsReceived": stats.events_received,
                "totalClients": stats.total_clients,
            }))
            .into_response()
        }
        Err(err) => {
            warn!(%err, player = %player, "gamelog upload failed to parse");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn api_gamelog_append(State(state): State<Arc<AppState>>, body: String) -> Response {
    let (player, content) = match parse_upload_body(&body) {
        Ok(parts) => parts,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, message),
    };
    match state.uploads.append(&player, &content) {
        Ok(stats) => {
            let _ = state.notices.send(Notice::SnapshotDirty);
            Json(json!({
                "ok": true,
                "newEvents": stats.new_events,
                "totalEvents": stats.total_events,
            }))
            .into_response()
        }
        Err(err) => {
            warn!(%err, player = %player, "gamelog append failed to parse");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn api_not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "not found")
}

pub fn ws_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/{*rest}", get(ws_upgrade))
        .with_state(state)
}

pub async fn run_ws_server(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr().context("ws listener address")?;
    info!("websocket feed listening on ws://{addr}/");
    axum::serve(listener, ws_router(state))
        .await
        .context("ws serve failed")?;
    Ok(())
}

async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_client(socket, state))
}

/// Server-push only: replay `init` + `snapshot`, then forward hub frames.
/// Client frames are read solely to notice the close.
async fn handle_ws_client(socket: WebSocket, state: Arc<AppState>) {
    let (id, mut frames) = state.hub.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let init = Frame::new(
        "init",
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "serverTime": Utc::now(),
        }),
    );
    let snapshot = Frame::new("snapshot", json!({ "games": state.game_snapshots() }));
    for frame in [init, snapshot] {
        if send_frame(&mut sender, frame.to_json()).await.is_err() {
            state.hub.unsubscribe(id);
            return;
        }
    }
    debug!(client = id, clients = state.hub.client_count(), "websocket client connected");

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(text) = frame else { break };
                if send_frame(&mut sender, text).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // ignored; the feed is one-way
                }
            }
        }
    }

    state.hub.unsubscribe(id);
    debug!(client = id, "websocket client disconnected");
}

async fn send_frame(
    sender: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    text: String,
) -> std::result::Result<(), ()> {
    match timeout(WS_SEND_TIMEOUT, sender.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(%err, "websocket send failed");
            Err(())
        }
        Err(_) => {
            debug!("websocket send timed out, dropping client");
            Err(())
        }
    }
}
