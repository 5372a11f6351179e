use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ttygate", version, about = "Browser terminal gateway")]
pub(crate) struct Args {
    /// Optional TOML config file; flags below override its values.
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    #[arg(long)]
    pub(crate) listen_addr: Option<String>,
    /// Shared credential for the websocket handshake and basic auth.
    #[arg(long)]
    pub(crate) credential: Option<String>,
    /// Maximum concurrent sessions (0 = unlimited).
    #[arg(long)]
    pub(crate) max_connections: Option<i64>,
    /// Serve exactly one session, then shut down.
    #[arg(long)]
    pub(crate) once: bool,
    /// Shut down if no session is admitted within this many seconds (0 = never).
    #[arg(long)]
    pub(crate) idle_timeout: Option<u64>,
    /// Allow clients to write to the session terminal.
    #[arg(long)]
    pub(crate) permit_write: bool,
    /// Honor the argument string clients send in the handshake.
    #[arg(long)]
    pub(crate) permit_arguments: bool,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
