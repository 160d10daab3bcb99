//! termhost-server: PTY session host.
//!
//! Runs shell processes on pseudo-terminals under caller-chosen execution
//! ids, retains their recent output, and streams lifecycle events to
//! WebSocket clients speaking a JSON request protocol.

mod config;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::TermServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// termhost-server: PTY session host
#[derive(Parser, Debug)]
#[command(name = "termhost-server", version, about = "PTY session host")]
struct Cli {
    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.termhost/config.toml")]
    config: String,

    /// Shell used when a spawn request names none
    #[arg(long)]
    default_shell: Option<String>,

    /// Inactivity timeout in milliseconds
    #[arg(long)]
    inactivity_timeout_ms: Option<u64>,

    /// Delay between process exit and removal, in milliseconds
    #[arg(long)]
    grace_period_ms: Option<u64>,

    /// Maximum retained output lines per session
    #[arg(long)]
    max_buffer_lines: Option<usize>,

    /// Maximum retained output bytes per session
    #[arg(long)]
    max_buffer_bytes: Option<usize>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termhost-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        default_shell: cli.default_shell,
        inactivity_timeout_ms: cli.inactivity_timeout_ms,
        exit_grace_period_ms: cli.grace_period_ms,
        max_buffer_lines: cli.max_buffer_lines,
        max_buffer_bytes: cli.max_buffer_bytes,
        max_sessions: cli.max_sessions,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = TermServer::new(server_config);
    let sessions = server.sessions();

    // Run until shutdown signal
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                sessions.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let remaining = sessions.count().await;
    info!(sessions = remaining, "terminating sessions");
    sessions.shutdown().await;

    info!("termhost-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
