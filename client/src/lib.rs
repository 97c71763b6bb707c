//! # Game Client Library
//!
//! Client side of an arena session: finding a server through the matchmaker,
//! holding a projection of the server's world and feeding player actions back.
//!
//! ## Architecture Overview
//!
//! ### Discovery
//! The client first asks the matchmaker for a game server. The matchmaker
//! answers once with the least-loaded server's address and closes the
//! connection.
//!
//! ### Server Authority
//! The server allocates every entity id. On connect the client receives a
//! greeting with the session options and a snapshot of walls, players and
//! projectiles, and builds its registry from it using the same ids. From then
//! on it only applies what the server says, except for the local player,
//! which it moves itself and reports with `coords`.
//!
//! ### Ordered Message Processing
//! A background task receives messages and appends them to a locked queue.
//! The game loop drains the queue once per frame, strictly in order. A
//! `shoot` whose bullet id still names an entity awaiting removal stays at the
//! head until the removal is flushed, and nothing behind it is applied first.
//!
//! ## Frame Order
//! 1. Apply queued server messages
//! 2. Move the local player and send its position
//! 3. Send any shot request
//! 4. Remove entities destroyed this frame
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The client-side registry and message application.
//!
//! ### Input Module (`input`)
//! Randomised per-frame input for headless clients.
//!
//! ### Network Module (`network`)
//! Matchmaker discovery, the game server connection and the message queue.

pub mod game;
pub mod input;
pub mod network;
