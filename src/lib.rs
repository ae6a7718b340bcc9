pub mod alias;
pub mod autocomplete;
pub mod channel;
pub mod config;
pub mod glob;
pub mod registry;
pub mod server;
pub mod shell;
pub mod terminal;

pub use autocomplete::{Autocomplete, PrefixIndex};
pub use channel::{Channel, ChannelRequest, MemoryChannel, TerminalGeometry};
pub use config::ServerConfig;
pub use registry::{ClientConnection, ClientEvent, ClientRegistry, RegistryError, SessionId};
pub use server::{Server, ServerError};
pub use shell::{BackendKind, DispatchState, ShellDispatcher, ShellOutcome};
