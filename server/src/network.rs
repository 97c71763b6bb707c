//! Server network layer coordinating connections with the game loop

use crate::client_manager::ClientManager;
use crate::game::{GameState, HitPolicy};
use log::{debug, error, info, warn};
use shared::discovery::ServiceRegistration;
use shared::protocol::{decode, Message};
use shared::transport::{
    Connection, ConnectionId, ConnectionState, Listener, Session, StateCallback, TransportError,
    Verdict,
};
use shared::SessionOptions;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_TICK_RATE: u32 = 60;

/// Longest simulated step; slower ticks are clamped to this.
const MAX_DELTA: f32 = 1.0 / 20.0;

/// Time given to writer tasks to flush farewell messages during drain.
const FLUSH_GRACE: Duration = Duration::from_millis(100);

/// Lifecycle of a [`GameServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Running,
    Draining,
    Stopped,
}

/// Events sent from the accept task and connection callbacks to the game loop
pub enum NetworkEvent {
    Accepted(Connection),
    Closed(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub hit_policy: HitPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".to_string(),
            tick_rate: DEFAULT_TICK_RATE,
            max_clients: 32,
            hit_policy: HitPolicy::Respawn,
        }
    }
}

/// Authoritative game server
///
/// A background task accepts connections and forwards them as
/// [`NetworkEvent`]s; the run loop owns the game state and the connection
/// table, so neither is ever touched concurrently.
pub struct GameServer {
    config: ServerConfig,
    game: GameState,
    clients: ClientManager<Connection>,
    listener: Option<Listener>,
    registration: Option<Arc<ServiceRegistration>>,
    counter_updates: Vec<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
    events_rx: mpsc::UnboundedReceiver<NetworkEvent>,
    state_tx: watch::Sender<ServerState>,
}

impl GameServer {
    pub fn new(options: SessionOptions, config: ServerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ServerState::Idle);

        Self {
            game: GameState::new(options, config.hit_policy),
            clients: ClientManager::new(config.max_clients),
            config,
            listener: None,
            registration: None,
            counter_updates: Vec::new(),
            events_tx,
            events_rx,
            state_tx,
        }
    }

    /// Keeps the registry entry's player counter in step with connections
    /// and removes the entry when the server stops.
    pub fn with_registration(mut self, registration: ServiceRegistration) -> Self {
        self.registration = Some(Arc::new(registration));
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ServerState) {
        info!("Server state: {:?}", state);
        self.state_tx.send_replace(state);
    }

    /// Starts listening. Returns the bound address.
    pub async fn bind(&mut self) -> Result<SocketAddr, TransportError> {
        let listener = Listener::bind(&self.config.address, self.state_callback()).await?;
        let addr = listener.local_addr()?;
        info!("Server listening on {}", addr);

        self.listener = Some(listener);
        self.set_state(ServerState::Listening);
        Ok(addr)
    }

    fn state_callback(&self) -> StateCallback {
        let events = self.events_tx.clone();
        Arc::new(move |id, state| {
            match state {
                ConnectionState::Connecting => debug!("Connection {} connecting", id),
                ConnectionState::Connected => debug!("Connection {} connected", id),
                ConnectionState::Closed(reason) => {
                    info!("Connection {} closed: {}", id, reason);
                    let _ = events.send(NetworkEvent::Closed(id));
                }
            }
            Verdict::Accept
        })
    }

    /// Runs until `shutdown` resolves, then drains every client.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let accept_task = match self.listener.take() {
            Some(listener) => tokio::spawn(accept_loop(listener, self.events_tx.clone())),
            None => return Ok(()),
        };

        let tick_rate = self.config.tick_rate.max(1);
        let mut tick_interval = interval(Duration::from_secs_f32(1.0 / tick_rate as f32));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        self.set_state(ServerState::Running);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                event = self.events_rx.recv() => {
                    match event {
                        Some(NetworkEvent::Accepted(connection)) => self.handle_connection(connection),
                        Some(NetworkEvent::Closed(connection_id)) => self.handle_disconnect(connection_id),
                        None => break,
                    }
                }

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32().min(MAX_DELTA);
                    last_tick = now;
                    self.run_tick(dt);
                }
            }
        }

        accept_task.abort();
        self.drain().await;
        Ok(())
    }

    fn handle_connection(&mut self, connection: Connection) {
        if self.clients.is_full() {
            warn!(
                "Rejecting {}: server full ({} clients)",
                connection.peer_addr(),
                self.clients.len()
            );
            let _ = connection.send_message(&Message::network_error("server full"));
            connection.close("server full");
            return;
        }

        let (player_id, greeting, announcement) = match self.game.add_player() {
            Ok(joined) => joined,
            Err(e) => {
                error!("Failed to spawn player: {}", e);
                connection.close("internal error");
                return;
            }
        };

        let connection_id = match self.clients.add_client(connection, player_id) {
            Ok(id) => id,
            Err(connection) => {
                connection.close("server full");
                self.game.remove_player(player_id);
                return;
            }
        };

        self.clients
            .send_to(connection_id, &Message::Greeting(greeting));
        self.clients.broadcast(&announcement, Some(connection_id));
        self.update_player_count(true);
    }

    fn handle_disconnect(&mut self, connection_id: ConnectionId) {
        let Some(client) = self.clients.remove_client(connection_id) else {
            return;
        };
        if let Some(destroy) = self.game.remove_player(client.player_id) {
            self.clients.broadcast(&destroy, None);
        }
        self.update_player_count(false);
    }

    fn run_tick(&mut self, dt: f32) {
        for connection_id in self.clients.closed_clients() {
            self.handle_disconnect(connection_id);
        }

        for (connection_id, bytes) in self.clients.drain_inbound() {
            let Some(player_id) = self.clients.player_for(connection_id) else {
                continue;
            };
            match decode(&bytes) {
                Ok(message) => {
                    for reply in self.game.handle_message(player_id, message) {
                        self.clients.broadcast(&reply, None);
                    }
                }
                Err(e) => warn!("Dropping message from client {}: {}", connection_id, e),
            }
        }

        for message in self.game.tick(dt) {
            self.clients.broadcast(&message, None);
        }

        if self.game.tick_count() % 60 == 0 && !self.clients.is_empty() {
            debug!(
                "Tick {}: {} clients, {:.1}Hz",
                self.game.tick_count(),
                self.clients.len(),
                1.0 / dt.max(f32::EPSILON)
            );
        }
    }

    /// Updates run off the game loop; drain waits for every one still in
    /// flight before deregistering so none can recreate the counter key.
    fn update_player_count(&mut self, joined: bool) {
        let Some(registration) = self.registration.as_ref().map(Arc::clone) else {
            return;
        };
        self.counter_updates.retain(|update| !update.is_finished());
        let update = tokio::task::spawn_blocking(move || {
            let result = if joined {
                registration.player_joined()
            } else {
                registration.player_left()
            };
            if let Err(e) = result {
                warn!("Failed to update player count: {}", e);
            }
        });
        self.counter_updates.push(update);
    }

    async fn drain(&mut self) {
        self.set_state(ServerState::Draining);

        let farewell = Message::network_error("server shutting down");
        let players = self.clients.close_all(&farewell, "server shutting down");
        for player in &players {
            self.game.remove_player(*player);
        }
        if !players.is_empty() {
            tokio::time::sleep(FLUSH_GRACE).await;
        }

        for update in self.counter_updates.drain(..) {
            if let Err(e) = update.await {
                warn!("Player count update task failed: {}", e);
            }
        }

        if let Some(registration) = self.registration.take() {
            let result = tokio::task::spawn_blocking(move || registration.deregister()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to deregister: {}", e),
                Err(e) => warn!("Deregistration task failed: {}", e),
            }
        }

        self.set_state(ServerState::Stopped);
    }
}

async fn accept_loop(listener: Listener, events: mpsc::UnboundedSender<NetworkEvent>) {
    loop {
        match listener.accept().await {
            Ok(connection) => {
                if events.send(NetworkEvent::Accepted(connection)).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::discovery::{endpoint_key, player_count_key, KeyValueStore, MemoryStore};
    use shared::transport::accept_all;
    use shared::Endpoint;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    async fn next_message(connection: &mut Connection) -> Message {
        let bytes = timeout(Duration::from_secs(2), connection.recv())
            .await
            .expect("timed out waiting for message")
            .expect("connection closed");
        decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let mut server = GameServer::new(SessionOptions::default(), ServerConfig::default());
        let mut states = server.subscribe_state();
        assert_eq!(server.state(), ServerState::Idle);

        server.bind().await.unwrap();
        assert_eq!(*states.borrow_and_update(), ServerState::Listening);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), ServerState::Running);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(*states.borrow(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_full_server_sends_network_error() {
        let config = ServerConfig {
            max_clients: 1,
            ..ServerConfig::default()
        };
        let mut server = GameServer::new(SessionOptions::default(), config);
        let addr = server.bind().await.unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        let mut first = Connection::connect(addr, accept_all()).await.unwrap();
        assert!(matches!(next_message(&mut first).await, Message::Greeting(_)));

        let mut second = Connection::connect(addr, accept_all()).await.unwrap();
        assert_eq!(
            next_message(&mut second).await,
            Message::network_error("server full")
        );

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drain_notifies_clients() {
        let mut server = GameServer::new(SessionOptions::default(), ServerConfig::default());
        let addr = server.bind().await.unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        let mut client = Connection::connect(addr, accept_all()).await.unwrap();
        assert!(matches!(next_message(&mut client).await, Message::Greeting(_)));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        loop {
            match next_message(&mut client).await {
                Message::NetworkError { what } => {
                    assert_eq!(what, "server shutting down");
                    break;
                }
                Message::Coords(_) => continue,
                other => panic!("Unexpected message {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_counter_updates_before_deregister() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut server = GameServer::new(SessionOptions::default(), ServerConfig::default());
        let addr = server.bind().await.unwrap();
        let registration = ServiceRegistration::register(
            Arc::clone(&store),
            "arena",
            &Endpoint::new("127.0.0.1", addr.port()),
        )
        .unwrap();
        let server = server.with_registration(registration);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        // Join and leave right before stopping so both updates are still in flight.
        let mut client = Connection::connect(addr, accept_all()).await.unwrap();
        assert!(matches!(next_message(&mut client).await, Message::Greeting(_)));
        client.close("leaving");
        drop(client);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(store.get(&endpoint_key("arena")).unwrap(), None);
        assert_eq!(store.get(&player_count_key("arena")).unwrap(), None);
    }
}
