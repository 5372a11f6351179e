use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{
    ConnectionHistoryResponse, ConnectionsListResponse, ExecRequest, ExecResponse,
    SessionActionResponse, SessionListResponse,
};
use serde::Deserialize;
use tracing::info;

use crate::middleware::client_ip;
use crate::tmux::{self, DestroyOutcome};
use crate::AppState;

/// Runs one ad-hoc command under a deadline. The transport status is 200
/// even for non-zero exit codes; only malformed requests fail at the HTTP
/// level.
pub(crate) async fn handle_exec(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ExecRequest>,
) -> Response {
    if request.command.is_empty() {
        return (StatusCode::BAD_REQUEST, "command cannot be empty").into_response();
    }
    let remote_addr = client_ip(&headers, peer);
    info!(remote_addr = %remote_addr, command = %request.command, "exec request");

    let timeout = request
        .timeout
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    let outcome = state.executor.run(&request.command, timeout).await;

    info!(
        remote_addr = %remote_addr,
        exit_code = outcome.exit_code,
        duration = %protocol::format_duration(outcome.elapsed),
        "exec completed"
    );
    let response = match outcome.error {
        Some(message) => {
            ExecResponse::failed(outcome.stdout, outcome.stderr, message, outcome.elapsed)
        }
        None => ExecResponse::completed(
            outcome.stdout,
            outcome.stderr,
            outcome.exit_code,
            outcome.elapsed,
        ),
    };
    Json(response).into_response()
}

pub(crate) async fn handle_connections_list(
    State(state): State<AppState>,
) -> Json<ConnectionsListResponse> {
    let connections = state.registry.list();
    Json(ConnectionsListResponse {
        count: connections.len(),
        connections,
    })
}

pub(crate) async fn handle_connections_history(
    State(state): State<AppState>,
) -> Json<ConnectionHistoryResponse> {
    let history = state.registry.history();
    Json(ConnectionHistoryResponse {
        count: history.len(),
        history,
    })
}

pub(crate) async fn handle_session_list(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Json<SessionListResponse> {
    let remote_addr = client_ip(&headers, peer);
    info!(remote_addr = %remote_addr, "session list request");
    let sessions = tmux::list_remote_sessions(&state.executor).await;
    info!(count = sessions.len(), "session list completed");
    Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct DestroyQuery {
    name: Option<String>,
}

pub(crate) async fn handle_session_destroy(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DestroyQuery>,
) -> Response {
    let Some(name) = query.name.filter(|name| !name.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "session name is required").into_response();
    };
    let remote_addr = client_ip(&headers, peer);
    info!(remote_addr = %remote_addr, session = %name, "session destroy request");

    match tmux::destroy_remote_session(&state.executor, &name).await {
        DestroyOutcome::Destroyed => {
            info!(session = %name, "session destroyed");
            Json(SessionActionResponse::ok(
                format!("session '{name}' destroyed successfully"),
                name,
            ))
            .into_response()
        }
        DestroyOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(SessionActionResponse::failure(
                format!("session '{name}' not found"),
                name,
            )),
        )
            .into_response(),
        DestroyOutcome::Failed(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SessionActionResponse::failure(message, name)),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use axum::routing::post;
    use axum::Router;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::admission::AdmissionController;
    use crate::config::GatewayConfig;
    use crate::exec::CommandExecutor;
    use crate::registry::SessionRegistry;
    use crate::streaming::PtyStreamer;

    fn exec_app() -> Router {
        let config = GatewayConfig::default();
        let state = crate::AppState {
            admission: Arc::new(AdmissionController::new(
                config.max_connections,
                CancellationToken::new(),
            )),
            registry: Arc::new(SessionRegistry::new(config.max_history)),
            executor: Arc::new(CommandExecutor::new(&config.exec)),
            streamer: Arc::new(PtyStreamer::new(config.command.clone(), config.permit_write)),
            config: Arc::new(config),
        };
        Router::new()
            .route("/api/exec", post(handle_exec))
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242))))
            .with_state(state)
    }

    fn exec_request(payload: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/exec")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn empty_command_is_a_client_error() {
        let response = exec_app().oneshot(exec_request(r#"{"command":""}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"command cannot be empty");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_still_responds_ok() {
        let response = exec_app()
            .oneshot(exec_request(r#"{"command":"exit 3"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["exit_code"], 3);
        assert!(body.get("error").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_maps_to_the_failure_shape() {
        let response = exec_app()
            .oneshot(exec_request(r#"{"command":"sleep 30","timeout":1}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["exit_code"], -1);
        assert!(body["error"]
            .as_str()
            .is_some_and(|error| error.contains("timed out")));
    }
}
