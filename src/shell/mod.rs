//! Interactive shell sessions.
//!
//! A session with terminal geometry gets a pseudo-terminal: the native,
//! resizable one when the host supports it, otherwise the legacy fixed-size
//! one. Without geometry, or when no pseudo-terminal can be opened, the shell
//! runs on plain pipes.

mod bridge;
pub mod probe;
mod pty;
mod raw;

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelRequest, TerminalGeometry};
use crate::config::{ConfigError, ShellConfig};
use bridge::ShellIo;
use probe::{CapabilityProbe, FixedProbe, HostProbe, OsVersion};

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("failed to open pseudo-terminal: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn shell: {0}")]
    Spawn(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pseudo-terminal: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("shell stream error: {0}")]
    Stream(#[source] io::Error),

    #[error("failed to wait for shell: {0}")]
    Wait(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Resizable pseudo-console.
    Native,
    /// Fixed-size pseudo-terminal.
    Legacy,
    /// Plain pipes, no terminal.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchState {
    #[default]
    Init,
    SelectingBackend,
    Bridging,
    Closed,
}

/// What happened during one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutcome {
    /// Backend that actually ran the shell.
    pub backend: Option<BackendKind>,
    /// Backends tried, in order.
    pub attempts: Vec<BackendKind>,
    pub exit_code: Option<u32>,
    pub final_state: DispatchState,
}

impl ShellOutcome {
    fn advance(&mut self, next: DispatchState) {
        tracing::debug!(from = ?self.final_state, to = ?next, "dispatch state");
        self.final_state = next;
    }
}

/// The backend a session starts with.
///
/// `version` is only relevant when geometry is present; an unknown version
/// counts as a host without a native console.
pub fn select_backend(
    geometry: Option<TerminalGeometry>,
    version: Option<OsVersion>,
) -> BackendKind {
    match (geometry, version) {
        (None, _) => BackendKind::Raw,
        (Some(_), Some(v)) if v.supports_native_console() => BackendKind::Native,
        (Some(_), _) => BackendKind::Legacy,
    }
}

/// Chooses a backend per session, falls back when it cannot be opened and
/// bridges the session until it ends.
pub struct ShellDispatcher {
    config: ShellConfig,
    probe: Arc<dyn CapabilityProbe>,
}

impl ShellDispatcher {
    pub fn new(config: ShellConfig, probe: Arc<dyn CapabilityProbe>) -> Self {
        Self { config, probe }
    }

    /// Dispatcher using `shell.os_version` when set and the host otherwise.
    pub fn from_config(config: ShellConfig) -> Result<Self, ConfigError> {
        let probe: Arc<dyn CapabilityProbe> = match config.os_version_override()? {
            Some(version) => {
                tracing::info!(%version, "using configured OS version");
                Arc::new(FixedProbe(version))
            }
            None => Arc::new(HostProbe),
        };
        Ok(Self::new(config, probe))
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn probe(&self) -> &dyn CapabilityProbe {
        self.probe.as_ref()
    }

    /// Run one session on `channel` until either side ends it.
    ///
    /// Never fails: problems are logged, reported to the remote side where
    /// possible and reflected in the returned outcome. The channel is closed
    /// on return.
    pub async fn run(
        &self,
        channel: Arc<dyn Channel>,
        requests: mpsc::Receiver<ChannelRequest>,
        geometry: Option<TerminalGeometry>,
    ) -> ShellOutcome {
        let mut outcome = ShellOutcome::default();
        outcome.advance(DispatchState::SelectingBackend);

        let version = geometry.map(|_| self.probe.os_version());
        let first = select_backend(geometry, version);
        tracing::info!(backend = ?first, os_version = ?version, ?geometry, "selected shell backend");

        let io = match self.open_with_fallback(first, geometry, &mut outcome).await {
            Ok(io) => io,
            Err(e) => {
                tracing::error!(error = %e, attempts = ?outcome.attempts, "no shell backend could be started");
                report_and_close(channel, format!("Unable to start shell: {e}\n")).await;
                outcome.advance(DispatchState::Closed);
                return outcome;
            }
        };

        outcome.backend = Some(io.kind);
        outcome.advance(DispatchState::Bridging);

        match bridge::run(io, channel, requests, self.config.drain_timeout()).await {
            Ok(code) => outcome.exit_code = code,
            Err(e) => tracing::error!(error = %e, "shell session ended abnormally"),
        }

        outcome.advance(DispatchState::Closed);
        tracing::info!(backend = ?outcome.backend, exit_code = ?outcome.exit_code, "shell session closed");
        outcome
    }

    async fn open_with_fallback(
        &self,
        first: BackendKind,
        geometry: Option<TerminalGeometry>,
        outcome: &mut ShellOutcome,
    ) -> Result<ShellIo, ShellError> {
        if let (Some(geometry), BackendKind::Native | BackendKind::Legacy) = (geometry, first) {
            outcome.attempts.push(first);
            match self.open_backend(first, Some(geometry)).await {
                Ok(io) => return Ok(io),
                Err(e) => tracing::warn!(
                    backend = ?first,
                    error = %e,
                    "pseudo-terminal unavailable, falling back to raw shell"
                ),
            }
        }
        outcome.attempts.push(BackendKind::Raw);
        self.open_backend(BackendKind::Raw, None).await
    }

    async fn open_backend(
        &self,
        kind: BackendKind,
        geometry: Option<TerminalGeometry>,
    ) -> Result<ShellIo, ShellError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || match (kind, geometry) {
            (BackendKind::Native | BackendKind::Legacy, Some(geometry)) => {
                pty::open(kind, geometry, &config)
            }
            _ => raw::open(&config),
        })
        .await
        .map_err(|e| ShellError::Stream(io::Error::other(e)))?
    }
}

async fn report_and_close(channel: Arc<dyn Channel>, message: String) {
    let result = tokio::task::spawn_blocking(move || {
        if let Err(e) = channel.write_all(message.as_bytes()) {
            tracing::debug!(error = %e, "could not report shell failure to remote");
        }
        channel.close();
    })
    .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "closing channel failed");
    }
}
