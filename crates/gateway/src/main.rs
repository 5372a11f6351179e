mod admission;
mod api;
mod cli;
mod config;
mod exec;
mod middleware;
mod registry;
mod session;
mod streaming;
mod tmux;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::AdmissionController;
use crate::cli::Args;
use crate::config::{resolve_config, GatewayConfig};
use crate::exec::CommandExecutor;
use crate::registry::SessionRegistry;
use crate::streaming::{PtyStreamer, Streamer};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) admission: Arc<AdmissionController>,
    pub(crate) executor: Arc<CommandExecutor>,
    pub(crate) streamer: Arc<dyn Streamer>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_to_stderr);

    let config = resolve_config(&args)?;
    if config.enable_basic_auth && config.credential.is_empty() {
        anyhow::bail!("basic auth requires a credential");
    }
    info!(
        listen_addr = %config.listen_addr,
        max_connections = config.max_connections,
        once = config.once,
        idle_timeout_secs = config.idle_timeout_secs,
        "gateway starting"
    );

    let shutdown = CancellationToken::new();
    let admission = Arc::new(AdmissionController::new(
        config.max_connections,
        shutdown.clone(),
    ));
    admission.spawn_watchdog(Duration::from_secs(config.idle_timeout_secs));

    let registry = Arc::new(SessionRegistry::new(config.max_history));
    let executor = Arc::new(CommandExecutor::new(&config.exec));
    let streamer: Arc<dyn Streamer> = Arc::new(PtyStreamer::new(
        config.command.clone(),
        config.permit_write,
    ));
    let app_state = AppState {
        config: Arc::new(config.clone()),
        registry,
        admission,
        executor,
        streamer,
    };

    let mut app = Router::new()
        .route("/ws", get(session::session_ws_handler))
        .route("/api/exec", post(api::handle_exec))
        .route("/api/connections", get(api::handle_connections_list))
        .route(
            "/api/connections/history",
            get(api::handle_connections_history),
        )
        .route(
            "/api/sessions",
            get(api::handle_session_list).delete(api::handle_session_destroy),
        )
        .with_state(app_state.clone());
    if config.enable_basic_auth {
        app = app.layer(axum::middleware::from_fn_with_state(
            app_state,
            middleware::require_basic_auth,
        ));
    }
    let app = app.layer(axum::middleware::from_fn(middleware::log_http_request));

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
    .await?;
    info!("gateway shut down");
    Ok(())
}

fn init_tracing(log_to_stderr: bool) {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );
    if log_to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

/// Resolves when either ctrl-c or an internal trigger (idle watchdog,
/// single-shot completion) requests shutdown.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {
            info!("internal shutdown requested");
        }
    }
}
