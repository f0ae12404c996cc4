//! devhub daemon
//!
//! Exposes the hub over HTTP for operators and over WebSocket for devices.
//! Devices register, connect to `/ws/device/{id}`, authenticate with their token,
//! then receive commands and post replies that resolve screenshot tasks.

mod auth;
mod config;
mod http_server;
mod ws;

use std::{io, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use devhub_core::Hub;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{CliOverrides, SECRET_ENV};

#[derive(Parser, Debug)]
#[command(name = "devhubd", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to devhub.toml (or use DEVHUB_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP server to
    #[arg(long)]
    host: Option<String>,

    /// Port to bind the HTTP server to (or use PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Secret used to sign device tokens (or use DEVHUB_SECRET)
    #[arg(long)]
    secret: Option<String>,

    /// Bearer token accepted on the /api routes (repeatable)
    #[arg(long = "api-token", value_name = "TOKEN")]
    api_tokens: Vec<String>,

    /// JSON file with bearer tokens: {"tokens":[{"token":"..."}]}
    #[arg(long, value_name = "PATH")]
    tokens_file: Option<PathBuf>,

    /// Allowed CORS origin (repeatable; any origin when none given)
    #[arg(long = "cors-origin", value_name = "ORIGIN")]
    cors_origins: Vec<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log filter directive, e.g. "info,devhub_core=debug" (overrides RUST_LOG)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            host: self.host.clone(),
            port: self.port,
            secret: self.secret.clone(),
            tokens: self.api_tokens.clone(),
            tokens_file: self.tokens_file.clone(),
            cors_origins: self.cors_origins.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let env = |key: &str| std::env::var(key).ok();
    let working_dir = std::env::current_dir().context("Failed to read current directory")?;
    let config_path = config::locate_config(cli.config.clone(), env);
    let file_cfg = config::load_file_config(config_path.as_deref())?;
    let daemon_cfg = config::resolve(&cli.overrides(), file_cfg.as_ref(), env, &working_dir)?;

    info!(
        "{}",
        devhub_build_info::formatted_banner("devhubd", env!("CARGO_PKG_VERSION"))
    );
    if let Some(path) = config_path.as_deref() {
        info!(path = %path.display(), "Configuration file");
    }

    if daemon_cfg.hub.uses_default_secret() {
        warn!("Using default secret - set {} in production!", SECRET_ENV);
    }

    let hub = Arc::new(Hub::new(&daemon_cfg.hub).context("Invalid hub configuration")?);
    info!(
        auth_timeout_secs = daemon_cfg.hub.auth_timeout_secs,
        task_retention_secs = daemon_cfg.hub.task_retention_secs,
        fail_pending_on_disconnect = daemon_cfg.hub.fail_pending_on_disconnect,
        "Hub ready"
    );

    let shutdown_hub = Arc::clone(&hub);
    http_server::run_http_server(hub, daemon_cfg.http, async move {
        wait_for_shutdown_signal().await;
        shutdown_hub.shutdown();
    })
    .await?;

    info!("devhubd stopped");
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = match (&cli.log_level, cli.debug) {
        (Some(directive), _) => EnvFilter::new(directive),
        (None, true) => EnvFilter::new("debug"),
        (None, false) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C; shutting down"),
        _ = terminate => info!("Received SIGTERM; shutting down"),
    }
}
