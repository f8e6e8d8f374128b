use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::mentions::extract_mentions;
use crate::messages::{ChatMessage, ClientMessage, FilePayload, ServerMessage};
use crate::registry::{ConnectionId, ConnectionRegistry, Identity, RegistryError};
use crate::typing::TypingTracker;

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
}

impl RelayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::Registry(RegistryError::NotFound(_)))
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub typing_timeout: Duration,
    pub send_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }
}

type Outbox = mpsc::Sender<ServerMessage>;

#[derive(Default)]
struct RelayState {
    registry: ConnectionRegistry,
    typing: TypingTracker,
    outboxes: HashMap<ConnectionId, Outbox>,
}

impl RelayState {
    fn broadcast(&self, message: &ServerMessage, except: Option<ConnectionId>) {
        for id in self.registry.ids() {
            if Some(*id) == except {
                continue;
            }
            let Some(outbox) = self.outboxes.get(id) else {
                continue;
            };
            match outbox.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Send queue full for {}, dropping event", id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Send queue closed for {}, skipping", id);
                }
            }
        }
    }

    fn broadcast_roster(&self) {
        let usernames = self.registry.list_usernames();
        self.broadcast(&ServerMessage::RosterUpdated { usernames }, None);
    }

    fn broadcast_typing(&self, username: String, is_typing: bool, origin: ConnectionId) {
        self.broadcast(
            &ServerMessage::TypingUpdated {
                username,
                is_typing,
            },
            Some(origin),
        );
    }

    fn apply_identity(&mut self, id: ConnectionId, identity: Identity) -> Result<(), RelayError> {
        let previous = self.registry.update_identity(id, identity)?;
        if let Some(username) = self.typing.clear(id) {
            self.broadcast_typing(username, false, id);
        }
        info!(
            "Connection {} is now '{}' (was '{}')",
            id,
            self.registry.lookup(id)?.identity.username,
            previous.username
        );
        self.broadcast_roster();
        Ok(())
    }
}

/// Every mutation and the broadcast it triggers run under a single lock, so
/// all connections see events in the order the relay processed them.
#[derive(Clone)]
pub struct Relay {
    state: Arc<RwLock<RelayState>>,
    config: Arc<RelayConfig>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Relay {
            state: Arc::new(RwLock::new(RelayState::default())),
            config: Arc::new(config),
        }
    }

    pub async fn on_connect(
        &self,
        id: ConnectionId,
    ) -> Result<mpsc::Receiver<ServerMessage>, RelayError> {
        let mut state = self.state.write().await;
        state.registry.register(id, Identity::placeholder())?;

        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity);
        state.outboxes.insert(id, tx);
        info!(
            "Connection {} registered ({} online)",
            id,
            state.registry.len()
        );

        state.broadcast_roster();
        Ok(rx)
    }

    pub async fn on_disconnect(&self, id: ConnectionId) -> Result<(), RelayError> {
        let mut state = self.state.write().await;
        let connection = state.registry.unregister(id)?;
        state.outboxes.remove(&id);

        if let Some(username) = state.typing.clear(id) {
            state.broadcast_typing(username, false, id);
        }
        info!(
            "Connection {} ('{}') unregistered ({} online)",
            connection.id,
            connection.identity.username,
            state.registry.len()
        );

        state.broadcast_roster();
        Ok(())
    }

    pub async fn on_announce(&self, id: ConnectionId, identity: Identity) -> Result<(), RelayError> {
        let mut state = self.state.write().await;
        state.apply_identity(id, identity)
    }

    pub async fn on_typing(&self, id: ConnectionId, is_typing: bool) -> Result<(), RelayError> {
        let mut state = self.state.write().await;
        let username = state.registry.lookup(id)?.identity.username.clone();

        if is_typing {
            let relay = self.clone();
            let timeout = self.config.typing_timeout;
            state.typing.arm(id, username.clone(), move |generation| {
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    relay.expire_typing(id, generation).await;
                })
            });
        } else {
            state.typing.clear(id);
        }

        state.broadcast_typing(username, is_typing, id);
        Ok(())
    }

    async fn expire_typing(&self, id: ConnectionId, generation: u64) {
        let mut state = self.state.write().await;
        if let Some(username) = state.typing.expire(id, generation) {
            debug!("Typing idle timeout for {} ('{}')", id, username);
            state.broadcast_typing(username, false, id);
        }
    }

    pub async fn on_message(
        &self,
        id: ConnectionId,
        text: String,
        file: Option<FilePayload>,
        author_hint: Option<Identity>,
    ) -> Result<Arc<ChatMessage>, RelayError> {
        let mut state = self.state.write().await;
        let announced = state.registry.lookup(id)?.announced;

        if text.is_empty() && file.is_none() {
            return Err(RelayError::MalformedEvent(
                "send_message without text or file".to_string(),
            ));
        }

        if let (false, Some(identity)) = (announced, author_hint) {
            state.apply_identity(id, identity)?;
        }

        let author = state.registry.lookup(id)?.identity.clone();
        let mentions = extract_mentions(&text);
        let message = Arc::new(ChatMessage {
            id: Uuid::new_v4(),
            author,
            text,
            file,
            mentions,
            timestamp: Utc::now(),
        });

        debug!(
            "Message {} from {} ({} mentions)",
            message.id,
            id,
            message.mentions.len()
        );
        state.broadcast(
            &ServerMessage::MessageBroadcast {
                message: Arc::clone(&message),
            },
            None,
        );
        Ok(message)
    }

    pub async fn dispatch(&self, id: ConnectionId, message: ClientMessage) -> Result<(), RelayError> {
        match message {
            ClientMessage::Announce {
                username,
                color,
                avatar,
            } => {
                self.on_announce(
                    id,
                    Identity {
                        username,
                        color,
                        avatar,
                    },
                )
                .await
            }
            ClientMessage::Typing { is_typing } => self.on_typing(id, is_typing).await,
            ClientMessage::SendMessage { text, file, user } => {
                self.on_message(id, text, file, user).await.map(|_| ())
            }
        }
    }

    pub async fn dispatch_text(&self, id: ConnectionId, text: &str) -> Result<(), RelayError> {
        let message = serde_json::from_str::<ClientMessage>(text)
            .map_err(|e| RelayError::MalformedEvent(e.to_string()))?;
        self.dispatch(id, message).await
    }

    pub async fn roster(&self) -> Vec<String> {
        self.state.read().await.registry.list_usernames()
    }

    pub async fn typing_usernames(&self) -> Vec<String> {
        self.state.read().await.typing.typing_usernames()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.registry.len()
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        state.typing.clear_all();
        state.outboxes.clear();
        let remaining = state.registry.len();
        state.registry.clear();
        info!("Relay shut down, released {} connections", remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn roster(names: &[&str]) -> ServerMessage {
        ServerMessage::RosterUpdated {
            usernames: names.iter().map(ToString::to_string).collect(),
        }
    }

    fn typing(username: &str, is_typing: bool) -> ServerMessage {
        ServerMessage::TypingUpdated {
            username: username.to_string(),
            is_typing,
        }
    }

    async fn join(
        relay: &Relay,
        username: &str,
    ) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = ConnectionId::new();
        let rx = relay.on_connect(id).await.unwrap();
        relay
            .on_announce(id, Identity::new(username, "#15fa00"))
            .await
            .unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn connect_registers_placeholder_and_broadcasts_roster() {
        let relay = Relay::new(RelayConfig::default());
        let (_alice, mut alice_rx) = join(&relay, "alice").await;
        drain(&mut alice_rx);

        let newcomer = ConnectionId::new();
        let mut newcomer_rx = relay.on_connect(newcomer).await.unwrap();

        assert_eq!(drain(&mut alice_rx), vec![roster(&["alice", "anonymous"])]);
        assert_eq!(drain(&mut newcomer_rx), vec![roster(&["alice", "anonymous"])]);
        assert!(matches!(
            relay.on_connect(newcomer).await,
            Err(RelayError::Registry(RegistryError::DuplicateConnection(_)))
        ));
        assert_eq!(relay.connection_count().await, 2);
    }

    #[tokio::test]
    async fn end_to_end_two_users() {
        let relay = Relay::new(RelayConfig::default());
        let (alice, mut alice_rx) = join(&relay, "alice").await;
        let (bob, mut bob_rx) = join(&relay, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let sent = relay
            .on_message(alice, "hello @bob".to_string(), None, None)
            .await
            .unwrap();
        assert_eq!(sent.mentions, vec!["bob"]);
        assert_eq!(sent.author.username, "alice");

        for rx in [&mut alice_rx, &mut bob_rx] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            let ServerMessage::MessageBroadcast { message } = &events[0] else {
                panic!("expected message_broadcast, got {:?}", events[0]);
            };
            assert_eq!(message.id, sent.id);
            assert_eq!(message.mentions, vec!["bob"]);
        }

        relay.on_disconnect(bob).await.unwrap();
        assert_eq!(drain(&mut alice_rx), vec![roster(&["alice"])]);
        assert_eq!(relay.roster().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn message_snapshots_author_identity() {
        let relay = Relay::new(RelayConfig::default());
        let (alice, _alice_rx) = join(&relay, "alice").await;

        let first = relay
            .on_message(alice, "one".to_string(), None, None)
            .await
            .unwrap();
        relay
            .on_announce(alice, Identity::new("alicia", "#0000ff"))
            .await
            .unwrap();

        assert_eq!(first.author.username, "alice");
        assert_eq!(first.author.color, "#15fa00");
    }

    #[tokio::test]
    async fn first_message_author_announces_identity() {
        let relay = Relay::new(RelayConfig::default());
        let id = ConnectionId::new();
        let mut rx = relay.on_connect(id).await.unwrap();
        drain(&mut rx);

        let hint = Identity::new("carol", "#abcdef").with_avatar("blob:carol");
        let message = relay
            .on_message(id, "hi".to_string(), None, Some(hint.clone()))
            .await
            .unwrap();

        assert_eq!(message.author, hint);
        let events = drain(&mut rx);
        assert_eq!(events[0], roster(&["carol"]));
        assert!(matches!(events[1], ServerMessage::MessageBroadcast { .. }));

        // Once announced, a differing hint is ignored.
        let second = relay
            .on_message(id, "again".to_string(), None, Some(Identity::new("eve", "#000000")))
            .await
            .unwrap();
        assert_eq!(second.author.username, "carol");
    }

    #[tokio::test]
    async fn empty_message_is_malformed() {
        let relay = Relay::new(RelayConfig::default());
        let (alice, mut alice_rx) = join(&relay, "alice").await;
        drain(&mut alice_rx);

        let result = relay.on_message(alice, String::new(), None, None).await;
        assert!(matches!(result, Err(RelayError::MalformedEvent(_))));

        let result = relay.dispatch_text(alice, "{not json").await;
        assert!(matches!(result, Err(RelayError::MalformedEvent(_))));

        assert!(drain(&mut alice_rx).is_empty());

        let file_only = relay
            .on_message(
                alice,
                String::new(),
                Some(FilePayload::new("image/png", vec![1, 2, 3])),
                None,
            )
            .await
            .unwrap();
        assert!(file_only.mentions.is_empty());
        assert_eq!(drain(&mut alice_rx).len(), 1);
    }

    #[tokio::test]
    async fn unknown_connection_is_suppressed() {
        let relay = Relay::new(RelayConfig::default());
        let (_alice, mut alice_rx) = join(&relay, "alice").await;
        drain(&mut alice_rx);
        let ghost = ConnectionId::new();

        let message = relay.on_message(ghost, "boo".to_string(), None, None).await;
        assert!(message.unwrap_err().is_not_found());
        assert!(relay.on_typing(ghost, true).await.unwrap_err().is_not_found());
        assert!(relay.on_disconnect(ghost).await.unwrap_err().is_not_found());

        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn typing_is_not_echoed_to_sender() {
        let relay = Relay::new(RelayConfig::default());
        let (alice, mut alice_rx) = join(&relay, "alice").await;
        let (_bob, mut bob_rx) = join(&relay, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        relay.on_typing(alice, true).await.unwrap();
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx), vec![typing("alice", true)]);
        assert_eq!(relay.typing_usernames().await, vec!["alice"]);

        relay.on_typing(alice, false).await.unwrap();
        assert_eq!(drain(&mut bob_rx), vec![typing("alice", false)]);
        assert!(relay.typing_usernames().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_expires_once_after_idle() {
        let relay = Relay::new(RelayConfig::default());
        let (alice, mut alice_rx) = join(&relay, "alice").await;
        let (_bob, mut bob_rx) = join(&relay, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        relay.on_typing(alice, true).await.unwrap();
        assert_eq!(drain(&mut bob_rx), vec![typing("alice", true)]);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(drain(&mut bob_rx).is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(drain(&mut bob_rx), vec![typing("alice", false)]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(drain(&mut bob_rx).is_empty());
        assert!(drain(&mut alice_rx).is_empty());
        assert!(relay.typing_usernames().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_rearm_the_idle_timer() {
        let relay = Relay::new(RelayConfig::default());
        let (alice, _alice_rx) = join(&relay, "alice").await;
        let (_bob, mut bob_rx) = join(&relay, "bob").await;
        drain(&mut bob_rx);

        relay.on_typing(alice, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        relay.on_typing(alice, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![typing("alice", true), typing("alice", true)]
        );

        tokio::time::sleep(Duration::from_millis(401)).await;
        assert_eq!(drain(&mut bob_rx), vec![typing("alice", false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_typing_clears_state() {
        let relay = Relay::new(RelayConfig::default());
        let (_alice, mut alice_rx) = join(&relay, "alice").await;
        let (bob, _bob_rx) = join(&relay, "bob").await;
        drain(&mut alice_rx);

        relay.on_typing(bob, true).await.unwrap();
        relay.on_disconnect(bob).await.unwrap();

        assert_eq!(
            drain(&mut alice_rx),
            vec![typing("bob", true), typing("bob", false), roster(&["alice"])]
        );
        assert!(relay.typing_usernames().await.is_empty());
        assert_eq!(relay.roster().await, vec!["alice"]);

        // The cancelled timer never fires.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn reannounce_withdraws_old_typing_name() {
        let relay = Relay::new(RelayConfig::default());
        let (alice, _alice_rx) = join(&relay, "alice").await;
        let (_bob, mut bob_rx) = join(&relay, "bob").await;
        relay.on_typing(alice, true).await.unwrap();
        drain(&mut bob_rx);

        relay
            .on_announce(alice, Identity::new("alicia", "#15fa00"))
            .await
            .unwrap();

        assert_eq!(
            drain(&mut bob_rx),
            vec![typing("alice", false), roster(&["alicia", "bob"])]
        );
    }

    #[tokio::test]
    async fn slow_consumer_does_not_block_peers() {
        let relay = Relay::new(RelayConfig {
            send_queue_capacity: 2,
            ..RelayConfig::default()
        });
        let (alice, mut alice_rx) = join(&relay, "alice").await;
        let (_bob, mut bob_rx) = join(&relay, "bob").await;
        drain(&mut alice_rx);

        // Bob never reads; his queue already holds two roster updates.
        for n in 0..5 {
            relay
                .on_message(alice, format!("message {n}"), None, None)
                .await
                .unwrap();
            assert_eq!(drain(&mut alice_rx).len(), 1);
        }

        assert_eq!(drain(&mut bob_rx).len(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_every_queue() {
        let relay = Relay::new(RelayConfig::default());
        let (alice, mut alice_rx) = join(&relay, "alice").await;
        relay.on_typing(alice, true).await.unwrap();
        drain(&mut alice_rx);

        relay.shutdown().await;

        assert!(alice_rx.recv().await.is_none());
        assert_eq!(relay.connection_count().await, 0);
        assert!(relay.typing_usernames().await.is_empty());
        assert!(relay.on_disconnect(alice).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn roster_tracks_arbitrary_sequences() {
        let relay = Relay::new(RelayConfig::default());
        let mut live: Vec<(ConnectionId, String)> = Vec::new();
        let mut receivers = Vec::new();

        for step in 0..24usize {
            if step % 3 == 2 && !live.is_empty() {
                let (id, _) = live.remove((step * 7) % live.len());
                relay.on_disconnect(id).await.unwrap();
            } else {
                let name = format!("user{}", step % 5);
                let (id, rx) = join(&relay, &name).await;
                live.push((id, name));
                receivers.push(rx);
            }

            let expected: Vec<String> = live.iter().map(|(_, name)| name.clone()).collect();
            assert_eq!(relay.roster().await, expected);
        }
    }
}
