use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use vocalink_core::{ProtocolError, RegistrationRequest, SessionId};

use crate::connection::Connection;
use crate::coordinator::Coordinator;
use crate::dashboard::DashboardConnect;
use crate::socket;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub send_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            send_queue_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/info", get(info_handler))
        .route("/info/name", post(rename_handler))
        .route("/sessions", get(list_sessions_handler).post(register_handler))
        .route("/ws/session", get(session_ws_handler))
        .route("/ws/dashboard", get(dashboard_ws_handler))
        .route("/ws/sync", get(sync_ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener. Separate from [`serve`] so the caller can learn the real port first.
pub async fn bind(config: &ServerConfig) -> std::io::Result<TcpListener> {
    TcpListener::bind((config.host.as_str(), config.port)).await
}

/// Serve on an already-bound listener. Returns a handle to shut it down.
pub fn serve(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    config: ServerConfig,
) -> std::io::Result<ServerHandle> {
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let state = AppState {
        coordinator,
        config: Arc::new(config),
        shutdown: shutdown.clone(),
    };
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();

    info!(%addr, "vocalink server listening");

    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle { addr, shutdown, task })
}

/// Bind and serve in one step.
pub async fn start(config: ServerConfig, coordinator: Arc<Coordinator>) -> std::io::Result<ServerHandle> {
    let listener = bind(&config).await?;
    serve(listener, coordinator, config)
}

/// Handle returned by [`serve`]. Dropping it leaves the server running.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Close open sockets with "going away" and wait for the listener to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "server task failed");
        }
    }
}

// ── HTTP ────────────────────────────────────────────────────────────────

// Undecodable bodies get the same `{error, message}` shape as validation failures.
fn malformed_body(rejection: JsonRejection) -> Response {
    let payload = ProtocolError::MalformedMessage(rejection.body_text()).to_payload();
    (StatusCode::BAD_REQUEST, Json(payload)).into_response()
}

async fn ping_handler() -> impl IntoResponse {
    Json(json!({ "_VOCAL_LINK_SERVER_": "running" }))
}

async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.server_info())
}

#[derive(Deserialize)]
struct RenameBody {
    name: String,
}

async fn rename_handler(
    State(state): State<AppState>,
    body: Result<Json<RenameBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return malformed_body(rejection),
    };
    match state.coordinator.rename(&body.name) {
        Ok(info) => Json(info).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(e.to_payload())).into_response(),
    }
}

#[derive(Deserialize)]
struct RegisterBody {
    name: String,
    ip: Option<String>,
    #[serde(alias = "batteryLevel")]
    battery_level: Option<i64>,
}

async fn register_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return malformed_body(rejection),
    };
    let ip = body.ip.unwrap_or_else(|| peer.ip().to_string());
    match RegistrationRequest::new(&body.name, ip, body.battery_level) {
        Ok(request) => {
            let meta = state.coordinator.stage_session(request);
            (StatusCode::CREATED, Json(meta)).into_response()
        }
        Err(e) => {
            let payload = json!({ "error": e.code(), "message": e.to_string() });
            (StatusCode::BAD_REQUEST, Json(payload)).into_response()
        }
    }
}

async fn list_sessions_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.registry().list_metadata())
}

// ── WebSocket ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionQuery {
    #[serde(default, alias = "sessionId")]
    session_id: String,
}

async fn session_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let id = SessionId::from_raw(query.session_id);
    ws.on_upgrade(move |socket| session_socket(socket, state, id))
}

async fn session_socket(socket: WebSocket, state: AppState, id: SessionId) {
    let (connection, outbound) = Connection::new(state.config.send_queue_capacity);
    let coordinator = Arc::clone(&state.coordinator);
    let claimed = coordinator.claim_session(&id, connection).is_ok();

    socket::pump(socket, outbound, state.config.heartbeat(), state.shutdown.clone(), |text| {
        if claimed {
            coordinator.handle_session_message(&id, text);
        }
    })
    .await;

    if claimed {
        coordinator.end_session(&id);
    }
}

async fn dashboard_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| dashboard_socket(socket, state))
}

async fn dashboard_socket(socket: WebSocket, state: AppState) {
    let (connection, outbound) = Connection::new(state.config.send_queue_capacity);
    let coordinator = Arc::clone(&state.coordinator);
    let token = match coordinator.connect_dashboard(connection) {
        DashboardConnect::Accepted(token) => Some(token),
        DashboardConnect::Rejected => None,
    };

    socket::pump(socket, outbound, state.config.heartbeat(), state.shutdown.clone(), |text| {
        if token.is_some() {
            coordinator.handle_dashboard_message(text);
        }
    })
    .await;

    if let Some(token) = token {
        coordinator.release_dashboard(&token);
    }
}

async fn sync_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let id = SessionId::from_raw(query.session_id);
    ws.on_upgrade(move |socket| sync_socket(socket, state, id))
}

async fn sync_socket(socket: WebSocket, state: AppState, id: SessionId) {
    let (connection, outbound) = Connection::new(state.config.send_queue_capacity);
    let coordinator = Arc::clone(&state.coordinator);
    let token = coordinator.open_sync(&id, connection).ok();

    socket::pump(socket, outbound, state.config.heartbeat(), state.shutdown.clone(), |text| {
        if token.is_some() {
            coordinator.handle_sync_message(&id, text);
        }
    })
    .await;

    if let Some(token) = token {
        coordinator.close_sync(&id, &token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ServerIdentity;
    use crate::discovery::NoopAdvertiser;

    fn test_coordinator() -> Arc<Coordinator> {
        let identity = ServerIdentity {
            name: "Test".into(),
            ip: "127.0.0.1".into(),
            port: 0,
        };
        Arc::new(Coordinator::new(identity, Arc::new(NoopAdvertiser)))
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn server_starts_and_answers_ping() {
        let handle = start(local_config(), test_coordinator()).await.unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://{}/ping", handle.addr);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["_VOCAL_LINK_SERVER_"], "running");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn register_defaults_ip_to_peer() {
        let handle = start(local_config(), test_coordinator()).await.unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{}/sessions", handle.addr))
            .json(&json!({"name": "Mic", "battery_level": 70}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED.as_u16());
        let meta: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(meta["ip"], "127.0.0.1");
        assert_eq!(meta["state"], "idle");
        assert_eq!(meta["battery_level"], 70);
        assert!(meta["last_sync"].is_null());
        assert!(meta["id"].as_str().unwrap().starts_with("sess_"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn register_rejects_bad_input() {
        let handle = start(local_config(), test_coordinator()).await.unwrap();
        let client = reqwest::Client::new();

        for (body, code) in [
            (json!({"name": ""}), "INVALID_NAME"),
            (json!({"name": "Mic", "battery_level": 150}), "INVALID_BATTERY_LEVEL"),
        ] {
            let resp = client
                .post(format!("http://{}/sessions", handle.addr))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 400);
            let err: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(err["error"], code);
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn undecodable_bodies_get_structured_errors() {
        let handle = start(local_config(), test_coordinator()).await.unwrap();
        let client = reqwest::Client::new();

        let cases = [
            ("/sessions", json!({"battery_level": 50})),
            ("/sessions", json!({"name": "Mic", "battery_level": 12.5})),
            ("/info/name", json!({"title": "Booth"})),
        ];
        for (path, body) in cases {
            let resp = client
                .post(format!("http://{}{}", handle.addr, path))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 400, "{path} {body}");
            let err: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(err["error"], "MALFORMED_MESSAGE");
            assert!(err["message"].is_string());
        }

        let resp = client
            .post(format!("http://{}/sessions", handle.addr))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let err: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(err["error"], "MALFORMED_MESSAGE");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn rename_over_http() {
        let handle = start(local_config(), test_coordinator()).await.unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{}/info/name", handle.addr))
            .json(&json!({"name": "Booth"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let info: serde_json::Value = reqwest::get(format!("http://{}/info", handle.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["name"], "Booth");
        assert_eq!(info["session_count"], 0);

        let resp = client
            .post(format!("http://{}/info/name", handle.addr))
            .json(&json!({"name": "x".repeat(51)}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        handle.shutdown().await;
    }

    #[test]
    fn heartbeat_has_a_floor() {
        let config = ServerConfig {
            heartbeat_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.heartbeat(), Duration::from_secs(1));
    }
}
