use std::fmt;
use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::thread;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::session::SessionParams;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_TERM: &str = "xterm-256color";

/// Why a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// The client closed the websocket.
    Client,
    /// The backing process exited or closed its side.
    Backend,
    /// The process-wide shutdown signal fired.
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Client => write!(f, "client"),
            CloseReason::Backend => write!(f, "backend"),
            CloseReason::Cancelled => write!(f, "cancellation"),
        }
    }
}

/// The streaming component the orchestrator hands an admitted session to.
/// It owns the socket until the session ends and must react promptly to the
/// cancellation token.
#[async_trait]
pub(crate) trait Streamer: Send + Sync {
    async fn run(
        &self,
        socket: WebSocket,
        params: &SessionParams,
        cancel: CancellationToken,
    ) -> anyhow::Result<CloseReason>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SessionFrame {
    Input { data: String },
    Close,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GatewayFrame {
    Ready { title: String },
    Output { data: String },
    Exit { code: Option<i32> },
    Error { message: String },
}

enum PtyOutput {
    Data(Vec<u8>),
    Closed,
    Error(String),
}

/// Default streamer: runs the configured command in a PTY and bridges it to
/// the websocket. Output travels as base64 text frames; input frames are
/// honored only when writes are permitted.
pub(crate) struct PtyStreamer {
    command: Vec<String>,
    permit_write: bool,
}

impl PtyStreamer {
    pub(crate) fn new(command: Vec<String>, permit_write: bool) -> Self {
        Self {
            command,
            permit_write,
        }
    }
}

#[async_trait]
impl Streamer for PtyStreamer {
    async fn run(
        &self,
        mut socket: WebSocket,
        params: &SessionParams,
        cancel: CancellationToken,
    ) -> anyhow::Result<CloseReason> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| anyhow::anyhow!("failed to open pty: {err}"))?;

        let mut builder = CommandBuilder::new(&self.command[0]);
        for arg in &self.command[1..] {
            builder.arg(arg);
        }
        builder.env("TERM", DEFAULT_TERM);
        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| anyhow::anyhow!("failed to spawn session command: {err}"))?;
        let mut killer = child.clone_killer();

        let master = pair.master;
        let (output_tx, mut output_rx) = mpsc::unbounded_channel::<PtyOutput>();
        let (input_tx, input_rx) = std_mpsc::channel::<Vec<u8>>();

        match master.try_clone_reader() {
            Ok(reader) => {
                let output_tx = output_tx.clone();
                thread::spawn(move || read_pty_loop(reader, output_tx));
            }
            Err(err) => anyhow::bail!("failed to clone pty reader: {err}"),
        }
        match master.take_writer() {
            Ok(writer) => {
                thread::spawn(move || write_pty_loop(writer, input_rx));
            }
            Err(err) => anyhow::bail!("failed to take pty writer: {err}"),
        }

        let (exit_tx, mut exit_rx) = tokio::sync::oneshot::channel();
        spawn_blocking(move || {
            let code = child
                .wait()
                .ok()
                .map(|status| status.exit_code() as i32);
            let _ = exit_tx.send(code);
        });

        let title = params.get("name").unwrap_or_default().to_string();
        send_frame(&mut socket, GatewayFrame::Ready { title }).await?;

        let reason = loop {
            tokio::select! {
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SessionFrame>(&text) {
                                Ok(SessionFrame::Input { data }) if self.permit_write => {
                                    if let Ok(bytes) = BASE64_ENGINE.decode(data) {
                                        let _ = input_tx.send(bytes);
                                    }
                                }
                                Ok(SessionFrame::Input { .. }) => {}
                                Ok(SessionFrame::Close) => break CloseReason::Client,
                                Err(err) => {
                                    warn!(error = %err, "ignoring malformed session frame");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break CloseReason::Client,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "session websocket error");
                            break CloseReason::Client;
                        }
                    }
                }
                Some(output) = output_rx.recv() => {
                    match output {
                        PtyOutput::Data(bytes) => {
                            let frame = GatewayFrame::Output { data: BASE64_ENGINE.encode(bytes) };
                            if send_frame(&mut socket, frame).await.is_err() {
                                break CloseReason::Client;
                            }
                        }
                        PtyOutput::Closed => break CloseReason::Backend,
                        PtyOutput::Error(message) => {
                            let _ = send_frame(&mut socket, GatewayFrame::Error { message }).await;
                            break CloseReason::Backend;
                        }
                    }
                }
                code = &mut exit_rx => {
                    let _ = send_frame(
                        &mut socket,
                        GatewayFrame::Exit { code: code.ok().flatten() },
                    ).await;
                    break CloseReason::Backend;
                }
                _ = cancel.cancelled() => break CloseReason::Cancelled,
            }
        };

        let _ = killer.kill();
        Ok(reason)
    }
}

fn read_pty_loop(mut reader: Box<dyn Read + Send>, output_tx: mpsc::UnboundedSender<PtyOutput>) {
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                let _ = output_tx.send(PtyOutput::Closed);
                break;
            }
            Ok(n) => {
                if output_tx.send(PtyOutput::Data(buffer[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = output_tx.send(PtyOutput::Error(format!("pty read failed: {err}")));
                break;
            }
        }
    }
}

fn write_pty_loop(mut writer: Box<dyn Write + Send>, input_rx: std_mpsc::Receiver<Vec<u8>>) {
    while let Ok(chunk) = input_rx.recv() {
        if writer.write_all(&chunk).is_err() {
            break;
        }
        let _ = writer.flush();
    }
}

async fn send_frame(socket: &mut WebSocket, frame: GatewayFrame) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(&frame) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize gateway frame");
            return Ok(());
        }
    };
    socket.send(Message::Text(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_frames_parse_by_tag() {
        let input: SessionFrame =
            serde_json::from_str(r#"{"type":"input","data":"aGk="}"#).expect("parse");
        assert!(matches!(input, SessionFrame::Input { data } if data == "aGk="));
        let close: SessionFrame = serde_json::from_str(r#"{"type":"close"}"#).expect("parse");
        assert!(matches!(close, SessionFrame::Close));
        assert!(serde_json::from_str::<SessionFrame>(r#"{"type":"resize"}"#).is_err());
    }

    #[test]
    fn gateway_frames_serialize_with_tags() {
        let frame = GatewayFrame::Output {
            data: "aGk=".to_string(),
        };
        let payload = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(payload["type"], "output");
        assert_eq!(payload["data"], "aGk=");
    }

    #[test]
    fn close_reasons_render_for_logs() {
        assert_eq!(CloseReason::Client.to_string(), "client");
        assert_eq!(CloseReason::Cancelled.to_string(), "cancellation");
    }
}
