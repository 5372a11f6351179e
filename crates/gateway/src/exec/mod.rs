mod process;
mod stream;

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::process::Command;

use crate::config::ExecConfig;

use process::{apply_process_group, kill_process_group};
use stream::read_stream_capture;

/// Where API commands run: on the gateway host through `sh -c`, or on a
/// remote host over ssh.
#[derive(Debug, Clone)]
pub(crate) enum ExecTarget {
    Local,
    Ssh { host: String, args: Vec<String> },
}

/// Classified result of one execution. `exit_code` is -1 and `error` is set
/// exactly when the process could not be judged to have exited normally;
/// a non-zero exit is a successful execution, not an error.
#[derive(Debug, Clone)]
pub(crate) struct ExecOutcome {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: i32,
    pub(crate) error: Option<String>,
    pub(crate) elapsed: Duration,
}

impl ExecOutcome {
    fn failure(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            error: Some(message.into()),
            elapsed,
        }
    }
}

/// Runs one external command to completion or to a deadline, whichever
/// comes first. Single-shot: retry policy belongs to the caller.
#[derive(Debug)]
pub(crate) struct CommandExecutor {
    target: ExecTarget,
    default_timeout: Duration,
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub(crate) fn new(config: &ExecConfig) -> Self {
        let target = if config.ssh_host.trim().is_empty() {
            ExecTarget::Local
        } else {
            ExecTarget::Ssh {
                host: config.ssh_host.trim().to_string(),
                args: config.ssh_args.clone(),
            }
        };
        Self {
            target,
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            max_output_bytes: usize::try_from(config.max_output_bytes).unwrap_or(usize::MAX),
        }
    }

    pub(crate) async fn run(&self, command: &str, timeout: Option<Duration>) -> ExecOutcome {
        let deadline = timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();
        match self.run_process(command, deadline, start).await {
            Ok(outcome) => outcome,
            Err(err) => ExecOutcome::failure(format!("{err:#}"), start.elapsed()),
        }
    }

    async fn run_process(
        &self,
        command: &str,
        deadline: Duration,
        start: Instant,
    ) -> anyhow::Result<ExecOutcome> {
        let mut cmd = self.build_command(command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        apply_process_group(&mut cmd);
        let mut child = cmd.spawn().context("spawn command")?;

        let stdout = child.stdout.take().context("missing stdout")?;
        let stderr = child.stderr.take().context("missing stderr")?;
        let stdout_task = tokio::spawn(read_stream_capture(stdout, self.max_output_bytes));
        let stderr_task = tokio::spawn(read_stream_capture(stderr, self.max_output_bytes));

        let mut timed_out = false;
        let status = tokio::select! {
            status = child.wait() => Some(status.context("wait on command")?),
            _ = tokio::time::sleep(deadline) => {
                timed_out = true;
                kill_process_group(&child);
                let _ = child.start_kill();
                None
            }
        };
        // Elapsed time is measured at race resolution, before draining the
        // capture tasks.
        let elapsed = start.elapsed();
        if timed_out {
            // reap so the killed process is not left behind
            let _ = child.wait().await;
        }

        let (stdout_bytes, stdout_truncated) = stdout_task
            .await
            .context("stdout task join")?
            .context("stdout read")?;
        let (stderr_bytes, stderr_truncated) = stderr_task
            .await
            .context("stderr task join")?
            .context("stderr read")?;
        let stdout = format_output(&stdout_bytes, stdout_truncated);
        let stderr = format_output(&stderr_bytes, stderr_truncated);

        if timed_out {
            return Ok(ExecOutcome {
                stdout,
                stderr,
                exit_code: -1,
                error: Some(format!(
                    "command timed out after {} seconds",
                    deadline.as_secs()
                )),
                elapsed,
            });
        }
        match status.and_then(|status| status.code()) {
            Some(code) => Ok(ExecOutcome {
                stdout,
                stderr,
                exit_code: code,
                error: None,
                elapsed,
            }),
            None => Ok(ExecOutcome {
                stdout,
                stderr,
                exit_code: -1,
                error: Some("process terminated by signal".to_string()),
                elapsed,
            }),
        }
    }

    fn build_command(&self, command: &str) -> Command {
        match &self.target {
            ExecTarget::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c");
                cmd.arg(command);
                cmd
            }
            ExecTarget::Ssh { host, args } => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-q");
                cmd.arg("-o").arg("StrictHostKeyChecking=no");
                cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
                cmd.arg("-o").arg("ConnectTimeout=5");
                cmd.args(args);
                cmd.arg(host);
                cmd.arg(command);
                cmd
            }
        }
    }
}

fn format_output(bytes: &[u8], truncated: bool) -> String {
    let mut out = String::from_utf8_lossy(bytes).to_string();
    if truncated {
        out.push_str("\n[output truncated]");
    }
    out
}
