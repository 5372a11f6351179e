use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

use crate::cli::Args;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_MAX_HISTORY: usize = 100;
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct GatewayConfig {
    pub(crate) listen_addr: String,
    pub(crate) credential: String,
    pub(crate) enable_basic_auth: bool,
    pub(crate) permit_write: bool,
    pub(crate) permit_arguments: bool,
    /// Concurrent session ceiling, 0 = unlimited.
    pub(crate) max_connections: i64,
    /// Serve a single session, then shut the gateway down.
    pub(crate) once: bool,
    /// Idle-shutdown deadline in seconds, 0 = disabled.
    pub(crate) idle_timeout_secs: u64,
    pub(crate) max_history: usize,
    /// Command spawned in the session PTY.
    pub(crate) command: Vec<String>,
    pub(crate) exec: ExecConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct ExecConfig {
    pub(crate) default_timeout_secs: u64,
    pub(crate) max_output_bytes: u64,
    /// `user@host` to run API commands over ssh; empty = run locally.
    pub(crate) ssh_host: String,
    pub(crate) ssh_args: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            credential: String::new(),
            enable_basic_auth: false,
            permit_write: false,
            permit_arguments: false,
            max_connections: 0,
            once: false,
            idle_timeout_secs: 0,
            max_history: DEFAULT_MAX_HISTORY,
            command: vec!["bash".to_string()],
            exec: ExecConfig::default(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_EXEC_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            ssh_host: String::new(),
            ssh_args: Vec::new(),
        }
    }
}

pub(crate) fn load_gateway_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: GatewayConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    if config.command.is_empty() {
        anyhow::bail!("command must not be empty");
    }
    Ok(config)
}

/// Config file first (defaults when absent), CLI flags on top.
pub(crate) fn resolve_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => load_gateway_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(listen_addr) = &args.listen_addr {
        config.listen_addr = listen_addr.clone();
    }
    if let Some(credential) = &args.credential {
        config.credential = credential.clone();
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }
    if let Some(idle_timeout) = args.idle_timeout {
        config.idle_timeout_secs = idle_timeout;
    }
    if args.once {
        config.once = true;
    }
    if args.permit_write {
        config.permit_write = true;
    }
    if args.permit_arguments {
        config.permit_arguments = true;
    }
    Ok(config)
}
