//! rshd - reverse shell server core
//!
//! **`rshd shell`**: registers the local terminal as a client and runs an
//! interactive session against it, exactly as a remote channel would be
//! served.
//!
//! **`rshd probe`**: reports the detected host version and the backend a
//! terminal session would get.
//!
//! **`rshd config`**: prints the effective configuration.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rshd::channel::{Channel, ChannelRequest, TerminalGeometry};
use rshd::config::{ConfigError, ServerConfig};
use rshd::registry::ClientConnection;
use rshd::server::{Server, ServerError};
use rshd::shell::{select_backend, ShellDispatcher};
use rshd::terminal::{self, RawModeGuard, StdioChannel};
use rshd::PrefixIndex;

#[derive(ClapParser, Debug)]
#[command(name = "rshd", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file
    #[arg(long, global = true, env = "RSHD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an interactive shell session on this terminal
    Shell {
        /// Skip the pseudo-terminal and use plain pipes
        #[arg(long)]
        raw: bool,
    },

    /// Show the detected host version and selected backend
    Probe,

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Error, Debug)]
pub enum RshdError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("terminal error: {0}")]
    Terminal(#[from] terminal::TerminalError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// The local terminal as a registered client.
struct LocalConnection {
    user: String,
}

impl LocalConnection {
    fn detect() -> Self {
        let user = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self { user }
    }
}

impl ClientConnection for LocalConnection {
    fn user(&self) -> &str {
        &self.user
    }

    fn remote_addr(&self) -> String {
        "local".to_string()
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ServerConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rshd: {}", e);
            std::process::exit(2);
        }
    };
    init_tracing(config.log.filter());

    let result = match cli.command {
        Commands::Shell { raw } => run_shell(config, raw).await,
        Commands::Probe => run_probe(config).map(|()| 0),
        Commands::Config => run_config(&config).map(|()| 0),
    };

    // A stdin reader may still be blocked; exiting directly avoids waiting on it.
    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("rshd: {}", e);
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr; stdout carries the session.
fn init_tracing(config_filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config_filter.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_shell(config: ServerConfig, raw: bool) -> Result<i32, RshdError> {
    let server: Server<LocalConnection> = Server::new(config, Arc::new(PrefixIndex::new()))?;
    server.start()?;
    let (id, user) = server.register(LocalConnection::detect())?;

    let geometry = if raw {
        None
    } else {
        Some(terminal::terminal_size().unwrap_or(TerminalGeometry::new(80, 24)))
    };
    tracing::debug!(session_id = %id, user = %user, ?geometry, "local session");

    let raw_guard = match geometry {
        Some(_) => Some(RawModeGuard::new()?),
        None => None,
    };

    let (requests_tx, requests_rx) = mpsc::channel::<ChannelRequest>(4);
    if geometry.is_some() {
        spawn_resize_watcher(requests_tx);
    } else {
        drop(requests_tx);
    }

    let channel: Arc<dyn Channel> = Arc::new(StdioChannel::new());
    let outcome = server.open_shell(channel, requests_rx, geometry)?.await?;

    drop(raw_guard);
    server.unregister(&id);
    server.stop();

    tracing::info!(
        backend = ?outcome.backend,
        attempts = ?outcome.attempts,
        exit_code = ?outcome.exit_code,
        "rshd exiting"
    );
    Ok(outcome.exit_code.map(|c| c as i32).unwrap_or(1))
}

#[cfg(unix)]
fn spawn_resize_watcher(requests: mpsc::Sender<ChannelRequest>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(_) => return,
        };
        loop {
            sigwinch.recv().await;
            if let Ok(geometry) = terminal::terminal_size() {
                let request = ChannelRequest::window_change(geometry.columns, geometry.rows);
                if requests.send(request).await.is_err() {
                    break;
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_resize_watcher(requests: mpsc::Sender<ChannelRequest>) {
    // No resize notifications; the session keeps its opening size.
    drop(requests);
}

fn run_probe(config: ServerConfig) -> Result<(), RshdError> {
    let dispatcher = ShellDispatcher::from_config(config.shell)?;
    let version = dispatcher.probe().os_version();
    let backend = select_backend(Some(TerminalGeometry::new(80, 24)), Some(version));
    println!("os version: {}", version);
    println!("native console: {}", version.supports_native_console());
    println!("80x24 session backend: {:?}", backend);
    Ok(())
}

fn run_config(config: &ServerConfig) -> Result<(), RshdError> {
    print!("{}", config.to_toml()?);
    Ok(())
}
