use crate::components::LineCollider;
use crate::math::Vector2;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub const WORLD_WIDTH: f32 = 860.0;
pub const WORLD_HEIGHT: f32 = 600.0;

pub const DEFAULT_PLAYER_RADIUS: f32 = 30.0;
pub const DEFAULT_PLAYER_SPEED: f32 = 300.0;
pub const DEFAULT_BULLET_RADIUS: f32 = 5.0;
pub const DEFAULT_BULLET_SPEED: f32 = 500.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read session config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid session config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Session configuration as written in the server's config file.
///
/// Walls listed here are interior walls only; the world boundary is added by
/// [`SessionOptions::from_config`].
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_player_radius")]
    pub player_radius: f32,
    #[serde(default = "default_player_speed")]
    pub player_speed: f32,
    #[serde(default = "default_bullet_radius")]
    pub bullet_radius: f32,
    #[serde(default = "default_bullet_speed")]
    pub bullet_speed: f32,
    #[serde(default)]
    pub walls: Vec<LineCollider>,
}

fn default_player_radius() -> f32 {
    DEFAULT_PLAYER_RADIUS
}

fn default_player_speed() -> f32 {
    DEFAULT_PLAYER_SPEED
}

fn default_bullet_radius() -> f32 {
    DEFAULT_BULLET_RADIUS
}

fn default_bullet_speed() -> f32 {
    DEFAULT_BULLET_SPEED
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}

/// Immutable per-session parameters, identical on the server and every client.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub player_radius: f32,
    pub player_speed: f32,
    pub bullet_radius: f32,
    pub bullet_speed: f32,
    /// Every wall of the session, world boundary included.
    pub walls: Vec<LineCollider>,
}

impl SessionOptions {
    /// Builds the session options and appends the four world-boundary walls.
    pub fn from_config(config: SessionConfig) -> Self {
        let mut walls = config.walls;
        walls.extend(boundary_walls());
        Self {
            player_radius: config.player_radius,
            player_speed: config.player_speed,
            bullet_radius: config.bullet_radius,
            bullet_speed: config.bullet_speed,
            walls,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(SessionConfig {
            player_radius: DEFAULT_PLAYER_RADIUS,
            player_speed: DEFAULT_PLAYER_SPEED,
            bullet_radius: DEFAULT_BULLET_RADIUS,
            bullet_speed: DEFAULT_BULLET_SPEED,
            walls: Vec::new(),
        })
    }
}

/// The four segments enclosing the world rectangle.
pub fn boundary_walls() -> [LineCollider; 4] {
    let top_left = Vector2::new(0.0, 0.0);
    let top_right = Vector2::new(WORLD_WIDTH, 0.0);
    let bottom_right = Vector2::new(WORLD_WIDTH, WORLD_HEIGHT);
    let bottom_left = Vector2::new(0.0, WORLD_HEIGHT);
    [
        LineCollider::new(top_left, top_right),
        LineCollider::new(top_right, bottom_right),
        LineCollider::new(bottom_right, bottom_left),
        LineCollider::new(bottom_left, top_left),
    ]
}
