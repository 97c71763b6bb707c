//! Discovery listener routing clients to game servers

use crate::directory::ServerDirectory;
use log::{debug, error, info, warn};
use shared::protocol::to_bytes;
use shared::transport::{
    Connection, ConnectionState, Listener, Session, StateCallback, TransportError, Verdict,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 32232;
pub const DEFAULT_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MatchmakerConfig {
    pub address: String,
    /// Wait between attempts while no game server is registered.
    pub retry: Duration,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", DEFAULT_PORT),
            retry: DEFAULT_RETRY,
        }
    }
}

/// Answers each discovery connection with the least-loaded server's endpoint.
pub struct Matchmaker {
    directory: ServerDirectory,
    config: MatchmakerConfig,
    listener: Option<Listener>,
}

impl Matchmaker {
    pub fn new(directory: ServerDirectory, config: MatchmakerConfig) -> Self {
        Self {
            directory,
            config,
            listener: None,
        }
    }

    pub async fn bind(&mut self) -> Result<SocketAddr, TransportError> {
        let listener = Listener::bind(&self.config.address, state_callback()).await?;
        let addr = listener.local_addr()?;
        info!("Matchmaker listening on {}", addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Serves discovery requests until `shutdown` resolves.
    ///
    /// Each request runs in its own task, so one client waiting for a server
    /// never holds up another.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let Some(listener) = self.listener.take() else {
            return Ok(());
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Matchmaker shutting down");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok(connection) => {
                        info!("Discovery request from {}", connection.peer_addr());
                        tokio::spawn(serve_discovery(
                            connection,
                            self.directory.clone(),
                            self.config.retry,
                        ));
                    }
                    Err(e) => {
                        error!("Error accepting discovery connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        Ok(())
    }
}

fn state_callback() -> StateCallback {
    Arc::new(|id, state| {
        match state {
            ConnectionState::Closed(reason) => debug!("Discovery connection {} closed: {}", id, reason),
            other => debug!("Discovery connection {}: {:?}", id, other),
        }
        Verdict::Accept
    })
}

/// Waits for a game server, sends its endpoint and closes.
///
/// Gives up if the client disconnects while waiting.
pub async fn serve_discovery(mut connection: Connection, directory: ServerDirectory, retry: Duration) {
    let id = connection.id();

    loop {
        if let Some(server) = directory.least_loaded() {
            match to_bytes(&server.endpoint()) {
                Ok(bytes) => match connection.send(bytes) {
                    Ok(()) => info!(
                        "Sent connection {} to '{}' ({} players)",
                        id, server.name, server.player_count
                    ),
                    Err(e) => warn!("Failed to answer discovery connection {}: {}", id, e),
                },
                Err(e) => warn!("Could not encode endpoint of '{}': {}", server.name, e),
            }
            connection.close("discovery complete");
            return;
        }

        debug!("No game server available for {}, retrying in {:?}", id, retry);
        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            frame = connection.recv() => {
                if frame.is_none() {
                    info!("Discovery client {} left before a server was available", id);
                    return;
                }
            }
        }
    }
}
