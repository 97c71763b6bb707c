//! Types and logic shared by the game server, client and matchmaker
//!
//! The entity registry, components and collision engine run identically on
//! both ends of a session so ids and physics stay consistent. The protocol,
//! transport and discovery modules define how the processes talk to each other.

pub mod collision;
pub mod components;
pub mod discovery;
pub mod entity;
pub mod math;
pub mod options;
pub mod protocol;
pub mod transport;

pub use components::{CircleCollider, EntityKind, LineCollider, LocalPlayerTag, PlayerTag, ProjectileTag};
pub use entity::{EntityId, EntityRegistry, RegistryError};
pub use math::Vector2;
pub use options::{SessionConfig, SessionOptions};
pub use protocol::{Endpoint, Message};

/// Where new players appear, and where hit players respawn.
pub const PLAYER_SPAWN: Vector2 = Vector2::new(300.0, 300.0);
