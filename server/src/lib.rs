//! # Game Server Library
//!
//! This library provides the authoritative server for an arena session. It
//! owns the canonical entity registry, runs the fixed-rate simulation and
//! broadcasts every state change to the connected clients.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! The server is the only allocator of entity ids. Clients adopt the ids they
//! are sent, so the same number names the same player, projectile or wall on
//! every machine in the session.
//!
//! ### Client Management
//! Handles the lifecycle of client connections:
//! - Admission up to a capacity limit (`network_error` when full)
//! - A player entity and a greeting snapshot for every new connection
//! - Removal of the player and a `destroy` broadcast when a connection drops
//! - Player counter updates in the service registry
//!
//! ### State Broadcasting
//! Every tick broadcasts `coords` for each moving entity and `destroy` for
//! each projectile that hit something. All broadcasts of one tick are queued
//! before the next tick drains inbound messages.
//!
//! ## Architecture Design
//!
//! ### Single Owner Game Loop
//! A background task accepts TCP connections and forwards them over a channel.
//! The run loop owns the game state and the connection table, and alternates
//! between connection events and ticks, so the registry is never shared.
//!
//! ### Tick Order
//! 1. Drain and route inbound messages from every connection
//! 2. Projectiles: walls first, then players other than the shooter
//! 3. Players: wall collisions, then movement
//! 4. Entities marked for destruction are removed after iteration
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Maps transport sessions to player ids and fans messages out to them.
//!
//! ### Game Module (`game`)
//! Message routing and the simulation tick, free of any networking.
//!
//! ### Network Module (`network`)
//! The `GameServer` state machine: `Idle`, `Listening`, `Running`,
//! `Draining`, `Stopped`.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{GameServer, ServerConfig};
//! use shared::SessionOptions;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         address: "127.0.0.1:4000".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     let server = GameServer::new(SessionOptions::default(), config);
//!
//!     // Runs until Ctrl+C, then tells every client the server is going away
//!     server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod game;
pub mod network;
