//! Relay HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::gateway::protocol::{
    decode_client_frame, ClientFrame, ConnectParams, HelloOk, HelloPolicy, WsRequest, WsResponse,
};
use crate::relay::{
    spawn_relay, Connection, RelayHandle, SessionRelay, SubscriptionHandle, SHUTDOWN_FRAME,
};
use crate::session::Snapshot;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const PROTOCOL_VERSION: u32 = 1;

/// Shared state for the relay server.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, WebSocket connect must provide params.auth.token matching this.
    pub required_token: Option<String>,
    /// Handle to the relay task that owns all subscriptions.
    pub relay: RelayHandle,
}

/// When auth mode is token and a token is configured, returns it for connect validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.relay.auth.mode == config::RelayAuthMode::Token {
        config::resolve_relay_token(config)
    } else {
        None
    }
}

/// Build the router: health, HTTP snapshot, and the WebSocket endpoint.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/sessions/:session_id/snapshot", get(snapshot_http))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Run the relay server; binds to config.relay.bind:config.relay.port.
/// When bind is not loopback, a relay token must be configured or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.relay.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_relay_token(&config);
        if token.is_none() || config.relay.auth.mode != config::RelayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind relay to {} without auth (set relay.auth.mode to \"token\" and relay.auth.token or TALLY_RELAY_TOKEN)",
                bind
            );
        }
    }

    let bind_addr = format!("{}:{}", bind, config.relay.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("relay listening on {}", bind_addr);

    serve(listener, config, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` completes, then tell every
/// subscriber the relay is going away and wait for the relay task to finish.
pub async fn serve<F>(listener: TcpListener, config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (relay, relay_task) = spawn_relay(SessionRelay::new(config.relay.policy()));
    let state = GatewayState {
        required_token: require_connect_token(&config),
        config: Arc::new(config),
        relay: relay.clone(),
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutdown signal received, notifying subscribers and draining connections");
            let _ = relay.shutdown();
        })
        .await
        .context("relay server exited")?;

    let _ = relay_task.await;
    log::info!("relay stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let stats = state.relay.stats().await.unwrap_or_default();
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.relay.port,
        "sessions": stats.sessions,
        "subscribers": stats.subscribers,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotQuery {
    #[serde(default)]
    user_id: String,
}

/// GET /sessions/:session_id/snapshot?userId= returns the catch-up snapshot over HTTP.
async fn snapshot_http(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<Snapshot>, StatusCode> {
    state
        .relay
        .snapshot(session_id, query.user_id)
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

/// GET /ws upgrades to WebSocket. First frame must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Check a connect token against the required one, if any.
fn check_token(required: Option<&str>, provided: Option<&str>) -> Result<(), &'static str> {
    let Some(required) = required else {
        return Ok(());
    };
    let provided = provided.unwrap_or("").trim();
    if provided.is_empty() {
        return Err("unauthorized: relay token missing (set TALLY_RELAY_TOKEN or relay.auth.token)");
    }
    if provided != required {
        return Err("unauthorized: relay token mismatch");
    }
    Ok(())
}

async fn send_text(socket: &mut WebSocket, text: String) -> bool {
    socket.send(Message::Text(text)).await.is_ok()
}

/// Read frames until a valid connect request arrives. Returns None if the socket closes first.
async fn await_connect(socket: &mut WebSocket, state: &GatewayState) -> Option<(String, ConnectParams)> {
    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };
        let req = match decode_client_frame(&text) {
            Ok(ClientFrame::Request(req)) => req,
            Ok(ClientFrame::Event(event)) => {
                log::debug!("ws: dropping {} sent before connect", event.kind());
                continue;
            }
            Err(e) => {
                log::debug!("ws: dropping frame before connect: {}", e);
                continue;
            }
        };
        match req.method.as_str() {
            "connect" => {
                let params: ConnectParams = match serde_json::from_value(req.params.clone()) {
                    Ok(p) => p,
                    Err(_) => {
                        let res = WsResponse::err(&req.id, "invalid connect params");
                        if !send_text(socket, res.to_frame()).await {
                            return None;
                        }
                        continue;
                    }
                };
                if params.session_id.trim().is_empty() {
                    let res = WsResponse::err(&req.id, "sessionId must not be empty");
                    if !send_text(socket, res.to_frame()).await {
                        return None;
                    }
                    continue;
                }
                if let Err(e) = check_token(state.required_token.as_deref(), params.auth.token.as_deref()) {
                    let res = WsResponse::err(&req.id, e);
                    if !send_text(socket, res.to_frame()).await {
                        return None;
                    }
                    continue;
                }
                return Some((req.id, params));
            }
            "health" => {
                let res = WsResponse::ok(
                    &req.id,
                    json!({ "runtime": "running", "protocol": PROTOCOL_VERSION }),
                );
                if !send_text(socket, res.to_frame()).await {
                    return None;
                }
            }
            _ => {
                let res = WsResponse::err(&req.id, "connect required");
                if !send_text(socket, res.to_frame()).await {
                    return None;
                }
            }
        }
    }
    None
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let timeout = state.config.relay.handshake_timeout();
    let (request_id, params) = match tokio::time::timeout(timeout, await_connect(&mut socket, &state)).await {
        Ok(Some(accepted)) => accepted,
        Ok(None) => {
            log::debug!("ws client disconnected before sending connect");
            return;
        }
        Err(_) => {
            log::debug!("ws client did not connect within {:?}, closing", timeout);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (outbox, mut inbox) = mpsc::channel(state.config.relay.send_queue());
    let conn = Connection::new(params.user_id.clone(), outbox);
    let connection_id = conn.id;
    let handle = match state.relay.subscribe(params.session_id.clone(), conn).await {
        Ok(handle) => handle,
        Err(e) => {
            let res = WsResponse::err(&request_id, e.to_string());
            let _ = send_text(&mut socket, res.to_frame()).await;
            return;
        }
    };

    let policy = state.config.relay.policy();
    let hello = HelloOk {
        typ: "hello-ok".to_string(),
        protocol: PROTOCOL_VERSION,
        connection_id: connection_id.to_string(),
        session_id: params.session_id.clone(),
        policy: HelloPolicy {
            echo_to_sender: policy.echo_to_sender,
            snapshot_on_subscribe: policy.snapshot_on_subscribe,
        },
    };
    let res = WsResponse::ok(&request_id, serde_json::to_value(&hello).unwrap_or(json!({})));
    if send_text(&mut socket, res.to_frame()).await {
        log::debug!(
            "ws client {} joined session {} as {}",
            connection_id,
            params.session_id,
            params.user_id
        );
        relay_loop(&mut socket, &mut inbox, &state, &handle, &params.user_id).await;
    }

    let _ = state.relay.unsubscribe(handle);
    log::debug!("ws client {} left session {}", connection_id, params.session_id);
}

/// Pump relay frames out and client frames in until either side goes away.
async fn relay_loop(
    socket: &mut WebSocket,
    inbox: &mut mpsc::Receiver<String>,
    state: &GatewayState,
    handle: &SubscriptionHandle,
    user_id: &str,
) {
    loop {
        tokio::select! {
            biased;

            frame = inbox.recv() => {
                // None: the relay removed us (slow consumer or shutdown).
                let Some(text) = frame else { break };
                let is_shutdown = text == SHUTDOWN_FRAME;
                if !send_text(socket, text).await || is_shutdown {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                match decode_client_frame(&text) {
                    Ok(ClientFrame::Event(event)) => {
                        if state
                            .relay
                            .publish(handle.session_id.clone(), Some(handle.connection_id), event)
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(ClientFrame::Request(req)) => {
                        let res = handle_request(state, handle, user_id, req).await;
                        if !send_text(socket, res.to_frame()).await {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("ws client {}: dropping frame: {}", handle.connection_id, e);
                    }
                }
            }
        }
    }
}

/// Answer a request from a connected client.
async fn handle_request(
    state: &GatewayState,
    handle: &SubscriptionHandle,
    user_id: &str,
    req: WsRequest,
) -> WsResponse {
    match req.method.as_str() {
        "health" => WsResponse::ok(
            &req.id,
            json!({ "runtime": "running", "protocol": PROTOCOL_VERSION }),
        ),
        "snapshot" => match state.relay.snapshot(handle.session_id.clone(), user_id).await {
            Ok(snapshot) => {
                WsResponse::ok(&req.id, serde_json::to_value(&snapshot).unwrap_or(json!({})))
            }
            Err(e) => WsResponse::err(&req.id, e.to_string()),
        },
        "connect" => WsResponse::err(&req.id, "already connected"),
        _ => WsResponse::err(&req.id, format!("unknown method: {}", req.method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_not_required() {
        assert!(check_token(None, None).is_ok());
        assert!(check_token(None, Some("anything")).is_ok());
    }

    #[test]
    fn token_required() {
        assert!(check_token(Some("s3cret"), None).is_err());
        assert!(check_token(Some("s3cret"), Some("  ")).is_err());
        assert_eq!(
            check_token(Some("s3cret"), Some("wrong")),
            Err("unauthorized: relay token mismatch")
        );
        assert!(check_token(Some("s3cret"), Some(" s3cret ")).is_ok());
    }

    #[test]
    fn token_only_required_in_token_mode() {
        let mut config = Config::default();
        config.relay.auth.token = Some("abc".to_string());
        assert!(require_connect_token(&config).is_none());
        config.relay.auth.mode = config::RelayAuthMode::Token;
        assert!(require_connect_token(&config).is_some());
    }

    #[tokio::test]
    async fn refuses_public_bind_without_token() {
        let mut config = Config::default();
        config.relay.bind = "0.0.0.0".to_string();
        let err = run_gateway(config).await.unwrap_err();
        assert!(err.to_string().contains("refusing to bind"));
    }
}
