use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use protocol::InitMessage;
use tracing::{info, warn};

use crate::middleware::client_ip;
use crate::streaming::CloseReason;
use crate::AppState;

/// Key/value parameters carried in the handshake argument string.
#[derive(Debug, Default, Clone)]
pub(crate) struct SessionParams {
    pairs: HashMap<String, String>,
}

impl SessionParams {
    /// Parses a query-style argument string, with or without a leading `?`.
    pub(crate) fn parse(arguments: &str) -> anyhow::Result<Self> {
        let query = arguments.strip_prefix('?').unwrap_or(arguments);
        if query.chars().any(|ch| ch.is_ascii_control()) {
            anyhow::bail!("argument string contains control characters");
        }
        let pairs = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Ok(Self { pairs })
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// Session state machine: Pending -> Admitted -> Streaming -> Closed, with
/// Pending -> Rejected when admission declines. Every terminal transition
/// releases the admission counter; in single-shot mode it also triggers
/// global shutdown.
pub(crate) async fn session_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let remote_addr = client_ip(&headers, peer);

    if state.config.once && !state.admission.try_consume_single_shot_slot() {
        info!(remote_addr = %remote_addr, "single-shot slot already consumed, refusing session");
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    let admission = state.admission.admit();
    if !admission.admitted {
        let remaining = state.admission.release();
        warn!(
            remote_addr = %remote_addr,
            connections = remaining,
            max_connections = state.admission.max_connections(),
            "session rejected: exceeding max number of connections"
        );
        if state.config.once {
            state.admission.trigger_shutdown();
        }
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    info!(
        remote_addr = %remote_addr,
        seq = admission.seq,
        connections = admission.live,
        max_connections = state.admission.max_connections(),
        "new session admitted"
    );
    // The upgrade itself can fail after admission; that path never reaches
    // run_session, so it must balance the counter here.
    let failed_state = state.clone();
    let failed_addr = remote_addr.clone();
    ws.on_failed_upgrade(move |err| {
        close_session(&failed_state, &failed_addr, &format!("upgrade failure: {err}"));
    })
    .on_upgrade(move |socket| run_session(socket, state, remote_addr))
}

async fn run_session(socket: WebSocket, state: AppState, remote_addr: String) {
    let close_reason = match serve_session(socket, &state, &remote_addr).await {
        Ok(reason) => reason.to_string(),
        Err(err) => format!("an error: {err:#}"),
    };
    close_session(&state, &remote_addr, &close_reason);
}

/// Terminal transition shared by every exit path of an admitted session:
/// release the slot and, in single-shot mode, bring the gateway down.
fn close_session(state: &AppState, remote_addr: &str, reason: &str) {
    let remaining = state.admission.release();
    info!(
        remote_addr = %remote_addr,
        reason = %reason,
        connections = remaining,
        max_connections = state.admission.max_connections(),
        "session closed"
    );
    if state.config.once {
        state.admission.trigger_shutdown();
    }
}

async fn serve_session(
    mut socket: WebSocket,
    state: &AppState,
    remote_addr: &str,
) -> anyhow::Result<CloseReason> {
    // Handshake: the first frame must be text JSON carrying the credential.
    // Failures here close the session before it is ever registered.
    let frame = socket
        .recv()
        .await
        .context("websocket closed before handshake")?
        .context("failed to read handshake frame")?;
    let Message::Text(payload) = frame else {
        anyhow::bail!("handshake must be a text frame");
    };
    let init: InitMessage =
        serde_json::from_str(&payload).context("malformed handshake payload")?;
    if init.auth_token != state.config.credential {
        anyhow::bail!("handshake credential mismatch");
    }

    let params = if state.config.permit_arguments && !init.arguments.is_empty() {
        SessionParams::parse(&init.arguments).context("failed to parse arguments")?
    } else {
        SessionParams::default()
    };

    let session_id = session_id(remote_addr);
    let session_name = params.get("session").map(str::to_string);
    let arguments = if init.arguments.is_empty() {
        None
    } else {
        Some(init.arguments.clone())
    };
    state
        .registry
        .add(&session_id, remote_addr, session_name, arguments);

    let result = state
        .streamer
        .run(socket, &params, state.admission.shutdown_token())
        .await;
    state.registry.remove(&session_id);
    result
}

/// Unique enough for the registry: remote address plus a nanosecond stamp.
fn session_id(remote_addr: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{remote_addr}-{nanos}")
}
