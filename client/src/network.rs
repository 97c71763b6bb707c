use log::{debug, info, warn};
use shared::protocol::{decode, from_bytes, Greeting, ProtocolError, Shoot};
use shared::transport::{
    accept_all, Connection, ConnectionSender, ConnectionState, StateCallback, TransportError,
    Verdict,
};
use shared::{Endpoint, EntityId, Message, RegistryError, Vector2};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Greeting contained an inconsistent snapshot: {0}")]
    Snapshot(#[from] RegistryError),

    #[error("Connection closed while waiting for {0}")]
    ClosedEarly(&'static str),

    #[error("Server refused the session: {0}")]
    Refused(String),

    #[error("Expected a greeting, got {0}")]
    UnexpectedMessage(&'static str),
}

/// Inbound messages waiting for the game loop.
///
/// The receive task pushes, the game loop drains; both go through one lock.
#[derive(Clone, Default)]
pub struct MessageQueue {
    inner: Arc<Mutex<VecDeque<Message>>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.lock().push_back(message);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Takes every queued message without applying it.
    pub fn drain(&self) -> Vec<Message> {
        self.lock().drain(..).collect()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Asks the matchmaker for the least-loaded game server.
///
/// Waits as long as the matchmaker does; it replies once a server is available.
pub async fn discover(matchmaker: &str) -> Result<Endpoint, ClientError> {
    info!("Asking matchmaker at {} for a server", matchmaker);
    let mut connection = Connection::connect(matchmaker, accept_all()).await?;
    let bytes = connection
        .recv()
        .await
        .ok_or(ClientError::ClosedEarly("discovery reply"))?;
    let endpoint: Endpoint = from_bytes(&bytes)?;
    info!("Matchmaker chose {}", endpoint.address());
    Ok(endpoint)
}

/// Connection to a game server with a background receive task.
pub struct NetworkClient {
    sender: ConnectionSender,
    queue: MessageQueue,
    alive: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
}

impl NetworkClient {
    /// Connects and waits for the greeting. Every later message lands in
    /// [`queue`](Self::queue).
    pub async fn connect(address: &str) -> Result<(NetworkClient, Greeting), ClientError> {
        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let callback: StateCallback = Arc::new(move |id, state| {
            match state {
                ConnectionState::Closed(reason) => {
                    info!("Connection {} to game server closed: {}", id, reason);
                    flag.store(false, Ordering::SeqCst);
                }
                other => debug!("Connection {}: {:?}", id, other),
            }
            Verdict::Accept
        });

        info!("Connecting to game server at {}", address);
        let mut connection = Connection::connect(address, callback).await?;

        let bytes = connection
            .recv()
            .await
            .ok_or(ClientError::ClosedEarly("greeting"))?;
        let greeting = match decode(&bytes)? {
            Message::Greeting(greeting) => greeting,
            Message::NetworkError { what } => return Err(ClientError::Refused(what)),
            other => return Err(ClientError::UnexpectedMessage(other.kind())),
        };
        info!(
            "Joined as player {} with {} other players",
            greeting.player_id,
            greeting.players.len()
        );

        let queue = MessageQueue::new();
        let sender = connection.sender();
        let receiver = tokio::spawn(receive_loop(connection, queue.clone()));

        Ok((
            NetworkClient {
                sender,
                queue,
                alive,
                receiver,
            },
            greeting,
        ))
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn send(&self, message: &Message) -> Result<(), ClientError> {
        Ok(self.sender.send_message(message)?)
    }

    pub fn send_movement(&self, id: EntityId, position: Vector2) -> Result<(), ClientError> {
        self.send(&Message::coords(id, position))
    }

    pub fn send_shoot(&self, shooter_id: EntityId, target: Vector2) -> Result<(), ClientError> {
        self.send(&Message::Shoot(Shoot::request(shooter_id, target)))
    }

    /// False once the transport reported the connection closed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.sender.is_open()
    }

    pub fn close(&self) {
        self.sender.close("client leaving");
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        self.receiver.abort();
        self.sender.close("client dropped");
    }
}

async fn receive_loop(mut connection: Connection, queue: MessageQueue) {
    while let Some(bytes) = connection.recv().await {
        match decode(&bytes) {
            Ok(message) => queue.push(message),
            Err(e) => warn!("Dropping message from server: {}", e),
        }
    }
    debug!("Receive loop for connection {} finished", connection.sender().id());
}
