//! The service object owning the client registry and the shell dispatcher.
//!
//! Transports construct one [`Server`], call [`Server::start`], and hand it
//! every accepted connection and shell channel.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::autocomplete::Autocomplete;
use crate::channel::{Channel, ChannelRequest, TerminalGeometry};
use crate::config::{ConfigError, ServerConfig};
use crate::registry::{ClientConnection, ClientRegistry, RegistryError, SessionId};
use crate::shell::{ShellDispatcher, ShellOutcome};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server is not running")]
    NotRunning,

    #[error("server is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Config(#[from] ConfigError),
}

pub struct Server<C> {
    config: ServerConfig,
    registry: ClientRegistry<C>,
    dispatcher: Arc<ShellDispatcher>,
    /// Present while running; cancelled by `stop`.
    running: Mutex<Option<CancellationToken>>,
}

impl<C: ClientConnection> Server<C> {
    pub fn new(config: ServerConfig, autocomplete: Arc<dyn Autocomplete>) -> Result<Self, ServerError> {
        let dispatcher = ShellDispatcher::from_config(config.shell.clone())?;
        Ok(Self::with_parts(config, ClientRegistry::new(autocomplete), dispatcher))
    }

    pub fn with_parts(
        config: ServerConfig,
        registry: ClientRegistry<C>,
        dispatcher: ShellDispatcher,
    ) -> Self {
        Self {
            config,
            registry,
            dispatcher: Arc::new(dispatcher),
            running: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<(), ServerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        *running = Some(CancellationToken::new());
        tracing::info!("server started");
        Ok(())
    }

    /// Stop accepting work, close open shell channels and drop every client.
    ///
    /// Returns the connections that were registered. Calling `stop` on a
    /// stopped server returns an empty list.
    pub fn stop(&self) -> Vec<(SessionId, Arc<C>)> {
        let mut running = self.running.lock();
        let Some(token) = running.take() else {
            return Vec::new();
        };
        token.cancel();
        let drained = self.registry.drain();
        drop(running);
        tracing::info!(clients = drained.len(), "server stopped");
        drained
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Token cancelled when the server stops, for accept loops.
    pub fn shutdown_token(&self) -> Result<CancellationToken, ServerError> {
        self.running.lock().clone().ok_or(ServerError::NotRunning)
    }

    pub fn register(&self, conn: C) -> Result<(SessionId, String), ServerError> {
        // Held across the add so a concurrent `stop` drains this client too.
        let running = self.running.lock();
        if running.is_none() {
            return Err(ServerError::NotRunning);
        }
        let (id, user) = self.registry.add(conn)?;
        drop(running);
        tracing::info!(session_id = %id, user = %user, "client registered");
        Ok((id, user))
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<C>> {
        let removed = self.registry.remove(id);
        if removed.is_some() {
            tracing::info!(session_id = %id, "client unregistered");
        }
        removed
    }

    pub fn registry(&self) -> &ClientRegistry<C> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &ShellDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start an interactive shell on `channel`.
    ///
    /// The session's channel is closed if the server stops first.
    pub fn open_shell(
        &self,
        channel: Arc<dyn Channel>,
        requests: mpsc::Receiver<ChannelRequest>,
        geometry: Option<TerminalGeometry>,
    ) -> Result<JoinHandle<ShellOutcome>, ServerError> {
        let shutdown = self.shutdown_token()?;
        let dispatcher = Arc::clone(&self.dispatcher);

        Ok(tokio::spawn(async move {
            let closer = {
                let channel = Arc::clone(&channel);
                tokio::spawn(async move {
                    shutdown.cancelled().await;
                    tracing::debug!("server stopping, closing shell channel");
                    channel.close();
                })
            };
            let outcome = dispatcher.run(channel, requests, geometry).await;
            closer.abort();
            outcome
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autocomplete::PrefixIndex;
    use crate::registry::ClientEvent;

    struct Conn(&'static str);

    impl ClientConnection for Conn {
        fn user(&self) -> &str {
            self.0
        }

        fn remote_addr(&self) -> String {
            "192.0.2.1:40000".to_string()
        }
    }

    fn server() -> Server<Conn> {
        Server::new(ServerConfig::default(), Arc::new(PrefixIndex::new())).unwrap()
    }

    #[test]
    fn register_requires_running_server() {
        let server = server();
        assert!(matches!(server.register(Conn("a")), Err(ServerError::NotRunning)));

        server.start().unwrap();
        assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));
        server.register(Conn("a")).unwrap();

        server.stop();
        assert!(matches!(server.register(Conn("b")), Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn stop_drains_registry_and_emits_removals() {
        let server = server();
        server.start().unwrap();
        let (id, _) = server.register(Conn("alpha")).unwrap();
        let mut events = server.registry().subscribe_events();

        let drained = server.stop();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, id);
        assert!(server.registry().is_empty());
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Removed { id });
        assert!(server.stop().is_empty());
    }

    #[test]
    fn restart_after_stop() {
        let server = server();
        server.start().unwrap();
        server.stop();
        server.start().unwrap();
        assert!(server.register(Conn("again")).is_ok());
    }

    #[test]
    fn stop_racing_registrations_leaves_no_clients() {
        let server = Arc::new(server());
        server.start().unwrap();

        let registrars: Vec<_> = (0..4)
            .map(|_| {
                let server = Arc::clone(&server);
                std::thread::spawn(move || {
                    let mut accepted = 0usize;
                    while server.register(Conn("racer")).is_ok() {
                        accepted += 1;
                    }
                    accepted
                })
            })
            .collect();
        while server.registry().len() < 8 {
            std::thread::yield_now();
        }

        let drained = server.stop();
        let accepted: usize = registrars.into_iter().map(|t| t.join().unwrap()).sum();

        assert_eq!(drained.len(), accepted);
        assert!(server.registry().is_empty());
    }

    #[test]
    fn unregister_unknown_is_none() {
        let server = server();
        server.start().unwrap();
        assert!(server.unregister("nope").is_none());
    }

    #[test]
    fn open_shell_requires_running_server() {
        let server = server();
        let (_tx, rx) = mpsc::channel(1);
        let channel: Arc<dyn Channel> = Arc::new(crate::channel::MemoryChannel::new());
        assert!(matches!(
            server.open_shell(channel, rx, None),
            Err(ServerError::NotRunning)
        ));
    }
}
