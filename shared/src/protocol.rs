//! Wire messages exchanged between clients and the game server
//!
//! Every message is a JSON object of the form `{"type": ..., "payload": {...}}`.
//! The framing layer in [`crate::transport`] carries one encoded message per
//! frame, so a decode error only ever affects a single message.

use crate::components::LineCollider;
use crate::entity::EntityId;
use crate::math::Vector2;
use crate::options::SessionOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed message: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    Greeting(Greeting),
    Connection(EntityPosition),
    Coords(EntityPosition),
    Shoot(Shoot),
    Destroy { id: EntityId },
    NetworkError { what: String },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Greeting(_) => "greeting",
            Message::Connection(_) => "connection",
            Message::Coords(_) => "coords",
            Message::Shoot(_) => "shoot",
            Message::Destroy { .. } => "destroy",
            Message::NetworkError { .. } => "network_error",
        }
    }

    pub fn coords(id: EntityId, position: Vector2) -> Self {
        Message::Coords(EntityPosition::new(id, position))
    }

    pub fn network_error(what: impl Into<String>) -> Self {
        Message::NetworkError { what: what.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityPosition {
    pub id: EntityId,
    pub x: f32,
    pub y: f32,
}

impl EntityPosition {
    pub fn new(id: EntityId, position: Vector2) -> Self {
        Self {
            id,
            x: position.x,
            y: position.y,
        }
    }

    pub fn position(&self) -> Vector2 {
        Vector2::new(self.x, self.y)
    }
}

/// A fired projectile.
///
/// Clients send only the shooter and aim direction; the server fills in the
/// bullet fields before rebroadcasting, echoing the target unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shoot {
    pub shooter_id: EntityId,
    pub target_x: f32,
    pub target_y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bullet_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bullet_x: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bullet_y: Option<f32>,
}

impl Shoot {
    pub fn request(shooter_id: EntityId, target: Vector2) -> Self {
        Self {
            shooter_id,
            target_x: target.x,
            target_y: target.y,
            bullet_id: None,
            bullet_x: None,
            bullet_y: None,
        }
    }

    pub fn target(&self) -> Vector2 {
        Vector2::new(self.target_x, self.target_y)
    }

    /// Canonical bullet id and spawn position, present once the server has
    /// accepted the shot.
    pub fn bullet(&self) -> Option<(EntityId, Vector2)> {
        match (self.bullet_id, self.bullet_x, self.bullet_y) {
            (Some(id), Some(x), Some(y)) => Some((id, Vector2::new(x, y))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WallState {
    pub id: EntityId,
    pub start: Vector2,
    pub end: Vector2,
}

impl WallState {
    pub fn collider(&self) -> LineCollider {
        LineCollider::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BulletState {
    pub id: EntityId,
    pub x: f32,
    pub y: f32,
    pub shooter_id: EntityId,
    pub target_x: f32,
    pub target_y: f32,
}

/// Full snapshot sent to a newly connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub player_radius: f32,
    pub player_speed: f32,
    pub bullet_radius: f32,
    pub bullet_speed: f32,
    pub walls: Vec<WallState>,
    /// Every other player already in the session.
    pub players: Vec<EntityPosition>,
    pub bullets: Vec<BulletState>,
    pub player_id: EntityId,
    pub player_x: f32,
    pub player_y: f32,
}

impl Greeting {
    /// Session options as seen by the server. The wall list already contains
    /// the world boundary.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            player_radius: self.player_radius,
            player_speed: self.player_speed,
            bullet_radius: self.bullet_radius,
            bullet_speed: self.bullet_speed,
            walls: self.walls.iter().map(WallState::collider).collect(),
        }
    }

    pub fn player_position(&self) -> Vector2 {
        Vector2::new(self.player_x, self.player_y)
    }
}

/// Matchmaker reply naming the game server a client should join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    to_bytes(message)
}

pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    from_bytes(bytes)
}

pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(ProtocolError::Encode)
}

pub fn from_bytes<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
}
