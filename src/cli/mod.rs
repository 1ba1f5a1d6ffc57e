//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- run the polling server
//! - `config show|path` -- inspect configuration
//! - `version` -- print build/version info

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config};
use crate::server::{self, AppState};

/// Live polling server: one question at a time, votes over WebSocket.
#[derive(Parser, Debug)]
#[command(
    name = "pollcast",
    version = env!("CARGO_PKG_VERSION"),
    about = "Pollcast: a live yes/no voting server over WebSocket"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default when no subcommand is given).
    Start {
        /// Port to listen on (overrides config and PORT).
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind, e.g. 127.0.0.1 (overrides config).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version, build date, and git commit information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the fully loaded configuration (secrets redacted) as JSON.
    Show,

    /// Print the resolved configuration file path.
    Path,
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

/// Run the `start` subcommand until Ctrl-C or SIGTERM.
pub async fn handle_start(
    port: Option<u16>,
    bind: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = config::load_config()?;
    apply_start_overrides(&mut cfg, port, bind);
    cfg.validate()?;

    crate::logging::init(&cfg.logging)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        options = ?cfg.poll.options,
        admin_enabled = cfg.auth.admin_secret.is_some(),
        join_secret = cfg.auth.join_secret.is_some(),
        "starting pollcast"
    );
    if cfg.auth.admin_secret.is_none() {
        tracing::warn!("no admin secret configured; admin joins will be refused");
    }

    let handle = server::start(AppState::new(cfg)?).await?;
    let shutdown = handle.shutdown_token();
    tokio::spawn(cancel_on_signal(shutdown));

    handle.wait().await?;
    tracing::info!("server stopped");
    Ok(())
}

fn apply_start_overrides(cfg: &mut Config, port: Option<u16>, bind: Option<String>) {
    if let Some(port) = port {
        cfg.server.port = port;
    }
    if let Some(bind) = bind {
        cfg.server.bind = bind;
    }
}

async fn cancel_on_signal(token: CancellationToken) {
    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    token.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable, waiting for Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Run the `config show` subcommand.
pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    let pretty = serde_json::to_string_pretty(&cfg.redacted())?;
    println!("{}", pretty);
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("pollcast {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("POLLCAST_BUILD_DATE"));
    println!("  Git commit: {}", env!("POLLCAST_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}
