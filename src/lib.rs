//! Presence-aware chat relay.
//!
//! Clients connect over a WebSocket, announce who they are, and every chat
//! message is fanned out to all connected clients. The relay also keeps the
//! online roster and typing indicators up to date.

pub mod config;
pub mod mentions;
pub mod messages;
pub mod registry;
pub mod relay;
pub mod server;
pub mod typing;

pub use config::Config;
pub use messages::{ChatMessage, ClientMessage, FilePayload, ServerMessage};
pub use registry::{ConnectionId, ConnectionRegistry, Identity, RegistryError};
pub use relay::{Relay, RelayConfig, RelayError};
