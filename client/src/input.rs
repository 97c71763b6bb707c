//! Randomised input for headless clients

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::Vector2;

/// What the player does during one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInput {
    /// Unit movement direction, or zero to stand still.
    pub direction: Vector2,
    /// Aim direction when the player fires this frame.
    pub shoot: Option<Vector2>,
}

/// Wanders in a random direction, turning and firing at fixed frame intervals.
pub struct BotInput {
    rng: StdRng,
    frame: u64,
    turn_every: u64,
    shoot_every: u64,
    direction: Vector2,
}

impl BotInput {
    /// `shoot_every` of zero disables firing.
    pub fn new(turn_every: u64, shoot_every: u64) -> Self {
        Self::with_rng(StdRng::from_entropy(), turn_every, shoot_every)
    }

    pub fn seeded(seed: u64, turn_every: u64, shoot_every: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), turn_every, shoot_every)
    }

    fn with_rng(rng: StdRng, turn_every: u64, shoot_every: u64) -> Self {
        Self {
            rng,
            frame: 0,
            turn_every: turn_every.max(1),
            shoot_every,
            direction: Vector2::ZERO,
        }
    }

    /// Samples the input for the next frame.
    pub fn update(&mut self) -> FrameInput {
        if self.frame % self.turn_every == 0 {
            self.direction = self.random_direction();
        }

        let shoot = if self.shoot_every > 0 && self.frame % self.shoot_every == 0 {
            Some(self.random_direction())
        } else {
            None
        };

        self.frame += 1;
        FrameInput {
            direction: self.direction,
            shoot,
        }
    }

    fn random_direction(&mut self) -> Vector2 {
        let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
        Vector2::new(angle.cos(), angle.sin())
    }
}
