use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::broadcast;

use crate::alias::AliasRelation;
use crate::autocomplete::Autocomplete;
use crate::glob::{Glob, GlobError};

/// Opaque, randomly generated primary key of a registered client.
pub type SessionId = String;

/// Bytes of entropy in a generated [`SessionId`].
pub const SESSION_ID_BYTES: usize = 20;

/// How many fresh ids are drawn before giving up on finding an unused one.
const MAX_ID_ATTEMPTS: usize = 8;

/// What the registry needs from an authenticated inbound connection.
///
/// Both values are read once, at registration time.
pub trait ClientConnection: Send + Sync + 'static {
    /// User name the remote side reported during authentication.
    fn user(&self) -> &str;
    /// Remote network address, e.g. `"10.0.0.5:51234"`.
    fn remote_addr(&self) -> String;
}

/// Source of fresh session ids.
pub trait IdSource: Send + Sync {
    fn generate(&self) -> Result<SessionId, rand::Error>;
}

/// Hex-encoded ids drawn from the operating system's random source.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn generate(&self) -> Result<SessionId, rand::Error> {
        let mut raw = [0u8; SESSION_ID_BYTES];
        OsRng.try_fill_bytes(&mut raw)?;
        Ok(raw.iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// Lowercase `user` and replace every character outside `[a-z0-9_-]` with `.`.
pub fn normalize_username(user: &str) -> String {
    user.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '.'
            }
        })
        .collect()
}

/// One candidate listed in an [`RegistryError::AmbiguousAlias`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasMatch {
    pub id: SessionId,
    pub user: String,
    pub address: String,
}

fn render_ambiguous(alias: &str, matches: &[AliasMatch]) -> String {
    let lines: Vec<String> = matches
        .iter()
        .map(|m| format!("{} ({} {})", m.id, m.user, m.address))
        .collect();
    format!(
        "{} connections match alias '{}'\n{}",
        matches.len(),
        alias,
        lines.join("\n")
    )
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("filter is not well formed: {0}")]
    InvalidPattern(#[from] GlobError),

    #[error("{0} Not found.")]
    NotFound(String),

    #[error("{}", render_ambiguous(.alias, .matches))]
    AmbiguousAlias {
        alias: String,
        /// Sorted by id.
        matches: Vec<AliasMatch>,
    },

    #[error("failed to generate session id: {0}")]
    IdGeneration(#[source] rand::Error),

    #[error("no unused session id found after {0} attempts")]
    IdSpaceExhausted(usize),
}

/// Registry lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Registered { id: SessionId, user: String },
    Removed { id: SessionId },
}

struct ClientEntry<C> {
    conn: Arc<C>,
    user: String,
    address: String,
}

struct RegistryInner<C> {
    clients: HashMap<SessionId, ClientEntry<C>>,
    aliases: AliasRelation,
}

/// Connected clients indexed by id and by alias.
///
/// One lock covers the connection table, both directions of the alias
/// relation and every mutation of the autocomplete index.
pub struct ClientRegistry<C> {
    inner: Arc<RwLock<RegistryInner<C>>>,
    autocomplete: Arc<dyn Autocomplete>,
    ids: Arc<dyn IdSource>,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl<C> Clone for ClientRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            autocomplete: Arc::clone(&self.autocomplete),
            ids: Arc::clone(&self.ids),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<C: ClientConnection> ClientRegistry<C> {
    pub fn new(autocomplete: Arc<dyn Autocomplete>) -> Self {
        Self::with_id_source(autocomplete, Arc::new(RandomIds))
    }

    pub fn with_id_source(autocomplete: Arc<dyn Autocomplete>, ids: Arc<dyn IdSource>) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                clients: HashMap::new(),
                aliases: AliasRelation::new(),
            })),
            autocomplete,
            ids,
            events_tx,
        }
    }

    /// Register a connection.
    ///
    /// Returns the new id and the normalized user alias.
    pub fn add(&self, conn: C) -> Result<(SessionId, String), RegistryError> {
        let user = conn.user().to_string();
        let address = conn.remote_addr();
        let username = normalize_username(&user);

        let mut inner = self.inner.write();
        let id = self.fresh_id(&inner)?;

        inner.aliases.insert(&id, &username);
        inner.aliases.insert(&id, &address);
        inner.clients.insert(
            id.clone(),
            ClientEntry {
                conn: Arc::new(conn),
                user: user.clone(),
                address: address.clone(),
            },
        );

        self.autocomplete.add(&id);
        self.autocomplete.add(&username);
        self.autocomplete.add(&address);

        tracing::debug!(session_id = %id, user = %user, address = %address, "client registered");
        let _ = self.events_tx.send(ClientEvent::Registered {
            id: id.clone(),
            user,
        });

        Ok((id, username))
    }

    fn fresh_id(&self, inner: &RegistryInner<C>) -> Result<SessionId, RegistryError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.generate().map_err(RegistryError::IdGeneration)?;
            if !inner.clients.contains_key(&id) {
                return Ok(id);
            }
            tracing::warn!(session_id = %id, "generated session id collides, drawing another");
        }
        Err(RegistryError::IdSpaceExhausted(MAX_ID_ATTEMPTS))
    }

    /// Resolve an exact id, or failing that an alias that names exactly one
    /// client.
    pub fn get(&self, identifier: &str) -> Result<Arc<C>, RegistryError> {
        let inner = self.inner.read();

        if let Some(entry) = inner.clients.get(identifier) {
            return Ok(Arc::clone(&entry.conn));
        }

        let ids = inner
            .aliases
            .ids_for(identifier)
            .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))?;

        if ids.len() == 1 {
            return ids
                .iter()
                .next()
                .and_then(|id| inner.clients.get(id))
                .map(|entry| Arc::clone(&entry.conn))
                .ok_or_else(|| RegistryError::NotFound(identifier.to_string()));
        }

        let matches = ids
            .iter()
            .filter_map(|id| {
                inner.clients.get(id).map(|entry| AliasMatch {
                    id: id.clone(),
                    user: entry.user.clone(),
                    address: entry.address.clone(),
                })
            })
            .collect();

        Err(RegistryError::AmbiguousAlias {
            alias: identifier.to_string(),
            matches,
        })
    }

    /// Clients whose id, any alias, or remote address matches `pattern`.
    ///
    /// An empty pattern matches every client.
    pub fn search(&self, pattern: &str) -> Result<HashMap<SessionId, Arc<C>>, RegistryError> {
        let glob = Glob::new(pattern)?;
        let inner = self.inner.read();

        let found = inner
            .clients
            .iter()
            .filter(|(id, entry)| {
                pattern.is_empty()
                    || glob.matches(id)
                    || inner.aliases.aliases_of(id).iter().any(|a| glob.matches(a))
                    || glob.matches(&entry.address)
            })
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.conn)))
            .collect();

        Ok(found)
    }

    /// Remove a client and prune aliases it was the last holder of.
    ///
    /// Removing an unknown id does nothing.
    pub fn remove(&self, id: &str) -> Option<Arc<C>> {
        let mut inner = self.inner.write();
        let entry = inner.clients.remove(id)?;

        let orphaned = inner.aliases.remove_id(id);
        if !inner.aliases.contains_alias(id) {
            self.autocomplete.remove(id);
        }
        for alias in &orphaned {
            if !inner.clients.contains_key(alias) {
                self.autocomplete.remove(alias);
            }
        }

        tracing::debug!(session_id = %id, pruned = orphaned.len(), "client removed");
        let _ = self.events_tx.send(ClientEvent::Removed { id: id.to_string() });

        Some(entry.conn)
    }

    /// Remove every client at once, returning what was registered.
    pub fn drain(&self) -> Vec<(SessionId, Arc<C>)> {
        let mut inner = self.inner.write();

        for alias in inner.aliases.aliases() {
            self.autocomplete.remove(alias);
        }
        inner.aliases.clear();

        let drained: Vec<(SessionId, Arc<C>)> = inner
            .clients
            .drain()
            .map(|(id, entry)| (id, entry.conn))
            .collect();
        for (id, _) in &drained {
            self.autocomplete.remove(id);
            let _ = self.events_tx.send(ClientEvent::Removed { id: id.clone() });
        }
        drained
    }

    /// Snapshot of every id and its aliases.
    pub fn get_all(&self) -> HashMap<SessionId, Vec<String>> {
        self.inner.read().aliases.snapshot()
    }

    pub fn list(&self) -> Vec<SessionId> {
        self.inner.read().clients.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn autocomplete(&self) -> &Arc<dyn Autocomplete> {
        &self.autocomplete
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }
}
