use crate::entity::{EntityId, EntityRegistry};
use crate::math::Vector2;
use serde::{Deserialize, Serialize};

/// Circular collider owned by a dynamic entity (player or projectile).
///
/// Velocity is in units per second; one tick moves the collider by
/// `velocity * dt`. The radius is fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleCollider {
    pub position: Vector2,
    pub velocity: Vector2,
    radius: f32,
}

impl CircleCollider {
    pub fn new(position: Vector2, radius: f32) -> Self {
        Self {
            position,
            velocity: Vector2::ZERO,
            radius,
        }
    }

    pub fn with_velocity(mut self, velocity: Vector2) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Where the collider will be after a tick of length `dt`.
    pub fn next_position(&self, dt: f32) -> Vector2 {
        self.position.add(&self.velocity.scale(dt))
    }

    /// Moves the collider to its next position.
    pub fn advance(&mut self, dt: f32) {
        self.position = self.next_position(dt);
    }

    pub fn stop(&mut self) {
        self.velocity = Vector2::ZERO;
    }
}

/// Static wall segment. Created once per session and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineCollider {
    pub start: Vector2,
    pub end: Vector2,
}

impl LineCollider {
    pub const fn new(start: Vector2, end: Vector2) -> Self {
        Self { start, end }
    }
}

/// Marks an entity as a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerTag;

/// Marks an entity as a projectile fired by `shooter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectileTag {
    pub shooter: EntityId,
}

/// Marks the player controlled by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalPlayerTag;

/// Role of a dynamic entity, derived from its tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Player,
    Projectile { shooter: EntityId },
    Wall,
}

impl EntityKind {
    /// Classifies an entity by the tags it carries.
    pub fn of(registry: &EntityRegistry, id: EntityId) -> Option<EntityKind> {
        if let Some(tag) = registry.get::<ProjectileTag>(id) {
            Some(EntityKind::Projectile {
                shooter: tag.shooter,
            })
        } else if registry.has::<PlayerTag>(id) {
            Some(EntityKind::Player)
        } else if registry.has::<LineCollider>(id) {
            Some(EntityKind::Wall)
        } else {
            None
        }
    }
}
