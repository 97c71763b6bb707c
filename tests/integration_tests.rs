//! Integration tests for the arena session components
//!
//! These run real servers, matchmakers and clients over loopback TCP, with an
//! in-memory service registry standing in for Redis.

use client::game::ClientGameState;
use client::network::{discover, NetworkClient};
use matchmaker::directory::{scan_once, Scanner, ServerDirectory};
use matchmaker::network::{Matchmaker, MatchmakerConfig};
use server::network::{GameServer, ServerConfig};
use shared::discovery::{player_count_key, KeyValueStore, MemoryStore, ServiceRegistration};
use shared::{Endpoint, EntityKind, Message, SessionOptions, Vector2};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(3);

struct RunningServer {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), shared::transport::TransportError>>,
}

impl RunningServer {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        assert_ok!(self.handle.await.unwrap());
    }
}

async fn start_server(store: Option<(Arc<dyn KeyValueStore>, &str)>) -> RunningServer {
    let config = ServerConfig {
        address: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    let mut server = GameServer::new(SessionOptions::default(), config);
    let addr = server.bind().await.unwrap();

    if let Some((store, name)) = store {
        let registration =
            ServiceRegistration::register(store, name, &Endpoint::new("127.0.0.1", addr.port()))
                .unwrap();
        server = server.with_registration(registration);
    }

    let (stop, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(async {
        let _ = stop_rx.await;
    }));
    RunningServer { addr, stop, handle }
}

async fn start_matchmaker(directory: ServerDirectory) -> (SocketAddr, oneshot::Sender<()>) {
    let config = MatchmakerConfig {
        address: "127.0.0.1:0".to_string(),
        retry: Duration::from_millis(20),
    };
    let mut matchmaker = Matchmaker::new(directory, config);
    let addr = matchmaker.bind().await.unwrap();
    let (stop, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(matchmaker.run(async {
        let _ = stop_rx.await;
    }));
    (addr, stop)
}

/// Drains the client's queue until a message matches, discarding the rest.
async fn wait_for<F>(client: &NetworkClient, mut predicate: F) -> Option<Message>
where
    F: FnMut(&Message) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(found) = client.queue().drain().into_iter().find(|m| predicate(m)) {
            return Some(found);
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn player_count(store: &dyn KeyValueStore, name: &str) -> Option<String> {
    store.get(&player_count_key(name)).ok().flatten()
}

/// GAME SESSION TESTS
mod session_tests {
    use super::*;

    /// Tests greeting snapshots and the connection broadcast to existing players
    #[tokio::test]
    async fn greeting_and_connection_broadcast() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let server = start_server(Some((Arc::clone(&store), "arena"))).await;
        let addr = server.addr.to_string();

        let (first, first_greeting) = NetworkClient::connect(&addr).await.unwrap();
        // Four boundary walls come first.
        assert_eq!(first_greeting.walls.len(), 4);
        assert_eq!(first_greeting.player_id, 4);
        assert!(first_greeting.players.is_empty());

        let (_second, second_greeting) = NetworkClient::connect(&addr).await.unwrap();
        assert_eq!(second_greeting.player_id, 5);
        let known: Vec<_> = second_greeting.players.iter().map(|p| p.id).collect();
        assert_eq!(known, vec![4]);

        let announced = wait_for(&first, |m| matches!(m, Message::Connection(p) if p.id == 5)).await;
        assert!(announced.is_some(), "existing player never heard of the new one");

        assert!(wait_until(|| player_count(store.as_ref(), "arena").as_deref() == Some("2")).await);

        server.shutdown().await;
        assert_eq!(player_count(store.as_ref(), "arena"), None);
    }

    /// Tests shoot rebroadcast and removal of the projectile when it reaches a wall
    #[tokio::test]
    async fn shoot_rebroadcast_and_projectile_lifecycle() {
        let server = start_server(None).await;
        let addr = server.addr.to_string();

        let (shooter, greeting) = NetworkClient::connect(&addr).await.unwrap();
        let (bystander, bystander_greeting) = NetworkClient::connect(&addr).await.unwrap();
        let shooter_id = greeting.player_id;
        let bystander_id = bystander_greeting.player_id;

        // Both spawn at the same point; step the bystander out of the line of fire.
        assert_ok!(bystander.send_movement(bystander_id, Vector2::new(300.0, 500.0)));
        let moved = wait_for(&bystander, |m| {
            matches!(m, Message::Coords(p) if p.id == bystander_id && p.y > 490.0)
        })
        .await;
        assert!(moved.is_some(), "bystander never moved");

        assert_ok!(shooter.send_shoot(shooter_id, Vector2::new(1.0, 0.0)));

        let Some(Message::Shoot(shot)) = wait_for(&shooter, |m| matches!(m, Message::Shoot(_))).await
        else {
            panic!("shooter never saw its shot");
        };
        assert_eq!(shot.shooter_id, shooter_id);
        assert_eq!(shot.target(), Vector2::new(1.0, 0.0));
        let (bullet_id, spawn) = shot.bullet().expect("server filled in the bullet");
        assert_eq!(spawn, Vector2::new(330.0, 300.0));

        let echoed = wait_for(&bystander, |m| matches!(m, Message::Shoot(s) if s == &shot)).await;
        assert!(echoed.is_some(), "bystander never saw the shot");

        // 500 units per second towards the right wall at x = 860.
        let destroyed =
            wait_for(&shooter, |m| matches!(m, Message::Destroy { id } if *id == bullet_id)).await;
        assert!(destroyed.is_some(), "projectile never hit the wall");

        server.shutdown().await;
    }

    /// Tests that a disconnect removes the player everywhere and updates the counter
    #[tokio::test]
    async fn disconnect_cleanup() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let server = start_server(Some((Arc::clone(&store), "arena"))).await;
        let addr = server.addr.to_string();

        let (stayer, _) = NetworkClient::connect(&addr).await.unwrap();
        let (leaver, greeting) = NetworkClient::connect(&addr).await.unwrap();
        assert!(wait_until(|| player_count(store.as_ref(), "arena").as_deref() == Some("2")).await);

        let leaver_id = greeting.player_id;
        leaver.close();
        drop(leaver);

        let destroyed =
            wait_for(&stayer, |m| matches!(m, Message::Destroy { id } if *id == leaver_id)).await;
        assert!(destroyed.is_some(), "remaining player never saw the disconnect");
        assert!(wait_until(|| player_count(store.as_ref(), "arena").as_deref() == Some("1")).await);

        server.shutdown().await;
    }

    /// Tests that the client projection follows joins and leaves
    #[tokio::test]
    async fn client_projection_tracks_players() {
        let server = start_server(None).await;
        let addr = server.addr.to_string();

        let (observer, greeting) = NetworkClient::connect(&addr).await.unwrap();
        let mut game = ClientGameState::from_greeting(&greeting).unwrap();

        let (joiner, joiner_greeting) = NetworkClient::connect(&addr).await.unwrap();
        let joiner_id = joiner_greeting.player_id;

        let joined = wait_until(|| {
            game.process_messages(observer.queue());
            game.flush_removals();
            game.kind_of(joiner_id) == Some(EntityKind::Player)
        })
        .await;
        assert!(joined);

        drop(joiner);
        let left = wait_until(|| {
            game.process_messages(observer.queue());
            game.flush_removals();
            game.kind_of(joiner_id).is_none()
        })
        .await;
        assert!(left);
        assert!(game.is_alive());

        server.shutdown().await;
    }

    /// Tests that shutting the server down ends the client session
    #[tokio::test]
    async fn server_drain_ends_client_session() {
        let server = start_server(None).await;
        let (client, greeting) = NetworkClient::connect(&server.addr.to_string())
            .await
            .unwrap();
        let mut game = ClientGameState::from_greeting(&greeting).unwrap();

        server.shutdown().await;

        let ended = wait_until(|| {
            game.process_messages(client.queue());
            !game.is_alive()
        })
        .await;
        assert!(ended);
        assert!(wait_until(|| !client.is_alive()).await);
    }
}

/// MATCHMAKING TESTS
mod matchmaking_tests {
    use super::*;

    /// Tests that discovery routes to the server with the fewest players
    #[tokio::test]
    async fn routes_to_least_loaded_server() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let busy = ServiceRegistration::register(
            Arc::clone(&store),
            "busy",
            &Endpoint::new("127.0.0.1", 4000),
        )
        .unwrap();
        let quiet = ServiceRegistration::register(
            Arc::clone(&store),
            "quiet",
            &Endpoint::new("127.0.0.1", 4001),
        )
        .unwrap();
        for _ in 0..3 {
            busy.player_joined().unwrap();
        }
        quiet.player_joined().unwrap();

        let directory = ServerDirectory::new();
        assert_eq!(scan_once(store.as_ref(), &directory), 2);
        let (addr, _stop) = start_matchmaker(directory).await;

        let endpoint = timeout(WAIT, discover(&addr.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(endpoint, Endpoint::new("127.0.0.1", 4001));
    }

    /// Tests that discovery waits for a server to register, then joins it
    #[tokio::test]
    async fn discovery_waits_until_server_registers() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let directory = ServerDirectory::new();
        let mut scanner = Scanner::start(
            Arc::clone(&store),
            directory.clone(),
            Duration::from_millis(20),
        )
        .unwrap();
        let (matchmaker_addr, _stop) = start_matchmaker(directory).await;

        let request = tokio::spawn(async move { discover(&matchmaker_addr.to_string()).await });
        sleep(Duration::from_millis(150)).await;
        assert!(!request.is_finished(), "discovery answered with no server registered");

        let server = start_server(Some((Arc::clone(&store), "late"))).await;

        let endpoint = timeout(WAIT, request).await.unwrap().unwrap().unwrap();
        assert_eq!(endpoint, Endpoint::new("127.0.0.1", server.addr.port()));

        let (_client, greeting) = NetworkClient::connect(&endpoint.address()).await.unwrap();
        assert_eq!(greeting.player_id, 4);

        server.shutdown().await;
        scanner.stop();
    }
}
