use std::path::PathBuf;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::registry::ConnectionId;
use crate::relay::{Relay, RelayError};

/// Lifecycle of one socket. Reconnecting always starts a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

struct Session {
    id: ConnectionId,
    state: ConnectionState,
}

impl Session {
    fn new() -> Self {
        Session {
            id: ConnectionId::new(),
            state: ConnectionState::Connecting,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        info!("Connection {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}

pub fn routes(
    relay: Relay,
    static_dir: PathBuf,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let relay = relay.clone();
            ws.on_upgrade(move |socket| handle_connection(relay, socket))
        });

    let static_files = warp::fs::dir(static_dir);

    ws_route
        .or(static_files)
        .with(warp::cors().allow_any_origin())
}

pub async fn handle_connection(relay: Relay, ws: WebSocket) {
    let mut session = Session::new();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut outbox = match relay.on_connect(session.id).await {
        Ok(outbox) => outbox,
        Err(e) => {
            error!("Failed to register connection {}: {}", session.id, e);
            return;
        }
    };
    session.transition(ConnectionState::Connected);

    let id = session.id;
    let writer = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode event for {}: {}", id, e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::text(text)).await {
                debug!("Failed to send WebSocket message to {}: {}", id, e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) if msg.is_close() => break,
            Ok(msg) => {
                if let Ok(text) = msg.to_str() {
                    log_dispatch_error(id, relay.dispatch_text(id, text).await);
                } else if msg.is_binary() {
                    debug!("Ignoring binary frame from {}", id);
                }
            }
            Err(e) => {
                warn!("WebSocket error on {}: {}", id, e);
                break;
            }
        }
    }

    if let Err(e) = relay.on_disconnect(id).await {
        debug!("Disconnect of {} after relay teardown: {}", id, e);
    }
    session.transition(ConnectionState::Disconnected);

    if let Err(e) = writer.await {
        debug!("Writer for {} ended abnormally: {}", id, e);
    }
}

fn log_dispatch_error(id: ConnectionId, result: Result<(), RelayError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_not_found() => debug!("Dropped event from {}: {}", id, e),
        Err(e) => warn!("Dropped event from {}: {}", id, e),
    }
}
