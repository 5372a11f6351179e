use std::collections::HashMap;
use std::time::{Duration, UNIX_EPOCH};

use protocol::RemoteSession;
use tracing::warn;

use crate::exec::CommandExecutor;

const LIST_SESSIONS: &str = "tmux list-sessions -F '#{session_name}|#{session_created}|#{session_windows}|#{session_attached}|#{session_activity}' 2>/dev/null || echo 'NO_SESSIONS'";
const LIST_WINDOWS: &str =
    "tmux list-windows -a -F '#{session_name}|#{window_index}|#{window_name}' 2>/dev/null";
const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Lists tmux sessions on the execution host. Best-effort: any failure,
/// including tmux being absent, degrades to an empty list.
pub(crate) async fn list_remote_sessions(executor: &CommandExecutor) -> Vec<RemoteSession> {
    let listing = executor.run(LIST_SESSIONS, Some(TMUX_TIMEOUT)).await;
    if let Some(error) = listing.error {
        warn!(error = %error, "session listing failed");
        return Vec::new();
    }
    if listing.exit_code != 0 {
        return Vec::new();
    }
    // second pass for friendly window names; also best-effort
    let windows = executor.run(LIST_WINDOWS, Some(TMUX_TIMEOUT)).await;
    let window_names = parse_window_names(&windows.stdout);
    parse_sessions(&listing.stdout, &window_names)
}

pub(crate) enum DestroyOutcome {
    Destroyed,
    NotFound,
    Failed(String),
}

pub(crate) async fn destroy_remote_session(
    executor: &CommandExecutor,
    name: &str,
) -> DestroyOutcome {
    let command = format!("tmux kill-session -t {} 2>&1", shell_escape(name));
    let outcome = executor.run(&command, Some(TMUX_TIMEOUT)).await;
    if let Some(error) = outcome.error {
        return DestroyOutcome::Failed(error);
    }
    if outcome.exit_code == 0 {
        return DestroyOutcome::Destroyed;
    }
    let output = format!("{}{}", outcome.stdout, outcome.stderr);
    let output = output.trim();
    if output.contains("can't find session") || output.contains("no server running") {
        DestroyOutcome::NotFound
    } else {
        DestroyOutcome::Failed(format!("failed to destroy session: {output}"))
    }
}

fn parse_sessions(output: &str, window_names: &HashMap<String, String>) -> Vec<RemoteSession> {
    let output = output.trim();
    if output.is_empty() || output == "NO_SESSIONS" {
        return Vec::new();
    }
    let mut sessions = Vec::new();
    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            continue;
        }
        let name = parts[0].to_string();
        sessions.push(RemoteSession {
            window_name: window_names.get(&name).cloned(),
            name,
            created: format_unix_timestamp(parts[1]),
            windows: parts[2].trim().parse().unwrap_or(0),
            attached: parts[3] == "1",
            last_active: format_unix_timestamp(parts[4]),
        });
    }
    sessions
}

/// Maps each session to the name of its first window (index 0), where the
/// friendly name lives.
fn parse_window_names(output: &str) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for line in output.trim().lines() {
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 3 {
            continue;
        }
        if parts[1] == "0" && !parts[2].is_empty() {
            names.insert(parts[0].to_string(), parts[2].to_string());
        }
    }
    names
}

/// tmux reports Unix timestamps; malformed values pass through verbatim.
fn format_unix_timestamp(raw: &str) -> String {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => {
            protocol::format_timestamp(UNIX_EPOCH + Duration::from_secs(secs))
        }
        _ => raw.to_string(),
    }
}

fn shell_escape(value: &str) -> String {
    let mut escaped = String::from("'");
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_session_listing() {
        let output = "main|1700000000|2|1|1700000100\nscratch|1700000050|1|0|1700000060\n";
        let mut window_names = HashMap::new();
        window_names.insert("main".to_string(), "editor".to_string());
        let sessions = parse_sessions(output, &window_names);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "main");
        assert_eq!(sessions[0].window_name.as_deref(), Some("editor"));
        assert_eq!(sessions[0].windows, 2);
        assert!(sessions[0].attached);
        assert_eq!(sessions[0].created, "2023-11-14T22:13:20Z");
        assert_eq!(sessions[1].name, "scratch");
        assert!(sessions[1].window_name.is_none());
        assert!(!sessions[1].attached);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let output = "good|1700000000|1|0|1700000000\nbad-line\nshort|1|2\n";
        let sessions = parse_sessions(output, &HashMap::new());
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "good");
    }

    #[test]
    fn sentinel_and_empty_output_mean_no_sessions() {
        assert!(parse_sessions("NO_SESSIONS", &HashMap::new()).is_empty());
        assert!(parse_sessions("", &HashMap::new()).is_empty());
        assert!(parse_sessions("  \n ", &HashMap::new()).is_empty());
    }

    #[test]
    fn window_names_keep_only_the_first_window() {
        let output = "main|0|editor\nmain|1|logs\nother|1|skipped\nblank|0|\n";
        let names = parse_window_names(output);
        assert_eq!(names.len(), 1);
        assert_eq!(names.get("main").map(String::as_str), Some("editor"));
    }

    #[test]
    fn unparseable_timestamps_pass_through() {
        assert_eq!(format_unix_timestamp("not-a-number"), "not-a-number");
        assert_eq!(format_unix_timestamp("0"), "0");
        assert_eq!(format_unix_timestamp("1700000000"), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn shell_escape_wraps_and_escapes() {
        assert_eq!(shell_escape("plain"), "'plain'");
        assert_eq!(shell_escape("has space"), "'has space'");
        assert_eq!(shell_escape("a'b"), "'a'\"'\"'b'");
    }
}
