use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const PLACEHOLDER_USERNAME: &str = "anonymous";
pub const PLACEHOLDER_COLOR: &str = "#000000";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("Connection {0} not found")]
    NotFound(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who a connection claims to be. Accepted verbatim from the login handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub color: String,
    #[serde(default, alias = "profilePic", skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>, color: impl Into<String>) -> Self {
        Identity {
            username: username.into(),
            color: color.into(),
            avatar: None,
        }
    }

    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn placeholder() -> Self {
        Self::new(PLACEHOLDER_USERNAME, PLACEHOLDER_COLOR)
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    /// False while the identity is still the placeholder.
    pub announced: bool,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    order: Vec<ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usernames are not required to be unique; only the id is.
    pub fn register(
        &mut self,
        id: ConnectionId,
        identity: Identity,
    ) -> Result<(), RegistryError> {
        if self.connections.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }

        self.connections.insert(
            id,
            Connection {
                id,
                identity,
                announced: false,
            },
        );
        self.order.push(id);
        Ok(())
    }

    pub fn unregister(&mut self, id: ConnectionId) -> Result<Connection, RegistryError> {
        let connection = self
            .connections
            .remove(&id)
            .ok_or(RegistryError::NotFound(id))?;
        self.order.retain(|existing| *existing != id);
        Ok(connection)
    }

    pub fn lookup(&self, id: ConnectionId) -> Result<&Connection, RegistryError> {
        self.connections.get(&id).ok_or(RegistryError::NotFound(id))
    }

    pub fn update_identity(
        &mut self,
        id: ConnectionId,
        identity: Identity,
    ) -> Result<Identity, RegistryError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        connection.announced = true;
        Ok(std::mem::replace(&mut connection.identity, identity))
    }

    pub fn list_usernames(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|id| self.connections.get(id))
            .map(|connection| connection.identity.username.clone())
            .collect()
    }

    pub fn ids(&self) -> &[ConnectionId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
        self.order.clear();
    }
}
