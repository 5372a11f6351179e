use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// First frame a client sends over the session websocket. Must arrive as a
/// text frame before any streaming takes place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitMessage {
    #[serde(default)]
    pub auth_token: String,
    /// Query-style argument string (`session=...&name=...`). Only honored
    /// when the gateway permits argument passthrough.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    /// Deadline in seconds. Falls back to the gateway default (30s).
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: String,
}

impl ExecResponse {
    pub fn completed(stdout: String, stderr: String, exit_code: i32, elapsed: Duration) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            error: None,
            duration: format_duration(elapsed),
        }
    }

    /// Exit code -1 marks executions that cannot be judged to have exited
    /// normally (spawn failure, deadline exceeded, signal death).
    pub fn failed(
        stdout: String,
        stderr: String,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: -1,
            error: Some(message.into()),
            duration: format_duration(elapsed),
        }
    }
}

/// A live session as reported by the connections listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: String,
    pub remote_addr: String,
    pub connected_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// A completed (or, in the combined view, still-open) session. A live
/// session is rendered with `disconnected_at` absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionHistoryEntry {
    pub remote_addr: String,
    pub connected_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<String>,
    pub duration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionsListResponse {
    pub connections: Vec<ConnectionInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionHistoryResponse {
    pub history: Vec<ConnectionHistoryEntry>,
    pub count: usize,
}

/// A tmux session on the execution host, parsed best-effort from the
/// remote listing command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteSession {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_name: Option<String>,
    pub created: String,
    pub windows: u32,
    pub attached: bool,
    pub last_active: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionListResponse {
    pub sessions: Vec<RemoteSession>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl SessionActionResponse {
    pub fn ok(message: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            session: Some(session.into()),
        }
    }

    pub fn failure(message: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            session: Some(session.into()),
        }
    }
}

/// Human-readable elapsed time, second resolution.
pub fn format_duration(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        return "< 1s".to_string();
    }
    humantime::format_duration(Duration::from_secs(elapsed.as_secs())).to_string()
}

pub fn format_timestamp(at: SystemTime) -> String {
    humantime::format_rfc3339_seconds(at).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_response_omits_empty_error() {
        let response = ExecResponse::completed(String::new(), String::new(), 3, Duration::ZERO);
        let payload = serde_json::to_value(&response).expect("serialize");
        assert_eq!(payload["exit_code"], 3);
        assert!(payload.get("error").is_none());
    }

    #[test]
    fn exec_response_failure_carries_error_and_sentinel_code() {
        let response = ExecResponse::failed(
            String::new(),
            String::new(),
            "command timed out after 30 seconds",
            Duration::from_secs(30),
        );
        assert_eq!(response.exit_code, -1);
        let payload = serde_json::to_value(&response).expect("serialize");
        assert_eq!(payload["error"], "command timed out after 30 seconds");
    }

    #[test]
    fn exec_request_timeout_defaults_to_none() {
        let request: ExecRequest = serde_json::from_str(r#"{"command":"uptime"}"#).expect("parse");
        assert_eq!(request.command, "uptime");
        assert_eq!(request.timeout, None);
    }

    #[test]
    fn init_message_tolerates_missing_fields() {
        let init: InitMessage = serde_json::from_str("{}").expect("parse");
        assert!(init.auth_token.is_empty());
        assert!(init.arguments.is_empty());
    }

    #[test]
    fn live_history_entry_has_no_disconnected_at() {
        let entry = ConnectionHistoryEntry {
            remote_addr: "10.0.0.1".to_string(),
            connected_at: "2024-01-01T00:00:00Z".to_string(),
            disconnected_at: None,
            duration: "< 1s".to_string(),
            session_name: None,
            arguments: None,
        };
        let payload = serde_json::to_value(&entry).expect("serialize");
        assert!(payload.get("disconnected_at").is_none());
        assert!(payload.get("session_name").is_none());
    }

    #[test]
    fn format_duration_is_human_readable() {
        assert_eq!(format_duration(Duration::from_millis(200)), "< 1s");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        // sub-second remainder is dropped
        assert_eq!(format_duration(Duration::from_millis(5400)), "5s");
    }

    #[test]
    fn format_timestamp_is_rfc3339() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(format_timestamp(at), "2023-11-14T22:13:20Z");
    }
}
