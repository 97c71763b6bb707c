//! # Matchmaker Library
//!
//! Routes new clients to the least-loaded live game server.
//!
//! Game servers publish themselves in a shared key/value registry. A
//! [`directory::Scanner`] thread rescans that registry at a fixed interval
//! and swaps the result into a [`directory::ServerDirectory`] snapshot; a
//! server that disappears from the registry disappears from the snapshot on
//! the next scan.
//!
//! The [`network::Matchmaker`] accepts discovery connections. Each one gets
//! the endpoint of the server with the fewest players, then the connection is
//! closed. While no server is registered the request waits and retries on
//! its own task.

pub mod directory;
pub mod network;
