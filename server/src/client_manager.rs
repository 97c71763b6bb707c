//! Connection table for the game server
//!
//! This module tracks which transport session belongs to which player:
//! - Admission of new sessions up to the configured capacity
//! - Per-connection inbound draining that preserves each sender's order
//! - Unicast and broadcast of outgoing protocol messages
//! - Detection of sessions the transport has already closed
//!
//! The manager never touches the entity registry; the game loop pairs its
//! entries with player entities.

use log::{debug, info};
use shared::protocol::{encode, Message};
use shared::transport::{ConnectionId, Session};
use shared::EntityId;
use std::collections::HashMap;
use std::time::Instant;

/// A connected client and the player entity it controls
pub struct Client<S: Session> {
    pub session: S,
    /// Player entity owned by this connection
    pub player_id: EntityId,
    pub connected_at: Instant,
}

impl<S: Session> Client<S> {
    pub fn new(session: S, player_id: EntityId) -> Self {
        Self {
            session,
            player_id,
            connected_at: Instant::now(),
        }
    }
}

/// Manages every connected client session
///
/// Enforces the capacity limit and routes messages to and from sessions.
/// Generic over the session type so the game loop can be driven by TCP
/// connections in production and in-memory pairs in tests.
pub struct ClientManager<S: Session> {
    /// Connected clients indexed by their connection id
    clients: HashMap<ConnectionId, Client<S>>,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl<S: Session> ClientManager<S> {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    /// Attempts to admit a session for the given player
    ///
    /// Hands the session back when the server is at capacity so the caller
    /// can tell the client why it is being turned away.
    pub fn add_client(&mut self, session: S, player_id: EntityId) -> Result<ConnectionId, S> {
        if self.is_full() {
            return Err(session);
        }

        let connection_id = session.id();
        info!(
            "Client {} connected as player {}",
            connection_id, player_id
        );
        self.clients
            .insert(connection_id, Client::new(session, player_id));
        Ok(connection_id)
    }

    /// Removes a client, returning it if it was still registered
    pub fn remove_client(&mut self, connection_id: ConnectionId) -> Option<Client<S>> {
        let client = self.clients.remove(&connection_id)?;
        info!(
            "Client {} disconnected after {:.1?} (player {})",
            connection_id,
            client.connected_at.elapsed(),
            client.player_id
        );
        Some(client)
    }

    pub fn player_for(&self, connection_id: ConnectionId) -> Option<EntityId> {
        self.clients.get(&connection_id).map(|c| c.player_id)
    }

    /// Sends to a single client. Returns false if it is gone or closed.
    pub fn send_to(&self, connection_id: ConnectionId, message: &Message) -> bool {
        let Some(client) = self.clients.get(&connection_id) else {
            return false;
        };
        match client.session.send_message(message) {
            Ok(()) => true,
            Err(e) => {
                debug!("Send to client {} failed: {}", connection_id, e);
                false
            }
        }
    }

    /// Sends the same message to every client except `exclude`
    ///
    /// The message is encoded once. Failed sends are logged and otherwise
    /// ignored; the closed session is reaped by [`closed_clients`](Self::closed_clients).
    pub fn broadcast(&self, message: &Message, exclude: Option<ConnectionId>) {
        let bytes = match encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Dropping unencodable {} broadcast: {}", message.kind(), e);
                return;
            }
        };

        for (connection_id, client) in &self.clients {
            if Some(*connection_id) == exclude {
                continue;
            }
            if let Err(e) = client.session.send(bytes.clone()) {
                debug!("Broadcast to client {} failed: {}", connection_id, e);
            }
        }
    }

    /// Drains every buffered inbound message
    ///
    /// Messages from one connection stay in arrival order; no order is
    /// imposed across connections.
    pub fn drain_inbound(&mut self) -> Vec<(ConnectionId, Vec<u8>)> {
        let mut inbound = Vec::new();
        for (connection_id, client) in self.clients.iter_mut() {
            for bytes in client.session.poll_received() {
                inbound.push((*connection_id, bytes));
            }
        }
        inbound
    }

    /// Connections whose session the transport has already closed
    pub fn closed_clients(&self) -> Vec<ConnectionId> {
        self.clients
            .iter()
            .filter(|(_, client)| !client.session.is_open())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sends a final message to every client, closes them all and empties the table
    ///
    /// Returns the player ids that were attached to the closed sessions.
    pub fn close_all(&mut self, farewell: &Message, reason: &str) -> Vec<EntityId> {
        self.broadcast(farewell, None);
        self.clients
            .drain()
            .map(|(_, client)| {
                client.session.close(reason);
                client.player_id
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
