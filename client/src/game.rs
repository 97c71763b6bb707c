use crate::network::MessageQueue;
use log::{debug, info, warn};
use shared::collision::collide_circle_walls;
use shared::protocol::{EntityPosition, Greeting, Shoot};
use shared::{
    CircleCollider, EntityId, EntityKind, EntityRegistry, LineCollider, LocalPlayerTag, Message,
    PlayerTag, ProjectileTag, RegistryError, SessionOptions, Vector2,
};

/// Polls a message may stay at the head of the queue before a warning is logged.
pub const DEFERRAL_WARNING: u32 = 120;

enum Applied {
    Done,
    Deferred,
}

/// Client-side projection of the server's registry.
///
/// Entities are created with the ids the server assigned. The only entity
/// this client moves on its own is the local player; everything else follows
/// the server's messages.
pub struct ClientGameState {
    registry: EntityRegistry,
    options: SessionOptions,
    player_id: EntityId,
    alive: bool,
    head_deferrals: u32,
}

impl ClientGameState {
    /// Builds the initial world from the server's greeting.
    pub fn from_greeting(greeting: &Greeting) -> Result<Self, RegistryError> {
        let options = greeting.session_options();
        let mut registry = EntityRegistry::new();

        for wall in &greeting.walls {
            registry.create_with_id(wall.id)?;
            registry.attach(wall.id, wall.collider())?;
        }

        let local = greeting.player_id;
        registry.create_with_id(local)?;
        registry.attach(
            local,
            CircleCollider::new(greeting.player_position(), options.player_radius),
        )?;
        registry.attach(local, PlayerTag)?;
        registry.attach(local, LocalPlayerTag)?;

        for player in &greeting.players {
            spawn_player(&mut registry, player, options.player_radius)?;
        }

        for bullet in &greeting.bullets {
            let direction = Vector2::new(bullet.target_x, bullet.target_y).normalize();
            registry.create_with_id(bullet.id)?;
            registry.attach(
                bullet.id,
                CircleCollider::new(Vector2::new(bullet.x, bullet.y), options.bullet_radius)
                    .with_velocity(direction.scale(options.bullet_speed)),
            )?;
            registry.attach(
                bullet.id,
                ProjectileTag {
                    shooter: bullet.shooter_id,
                },
            )?;
        }

        info!(
            "World built from greeting: {} walls, {} players, {} projectiles",
            greeting.walls.len(),
            greeting.players.len() + 1,
            greeting.bullets.len()
        );

        Ok(Self {
            registry,
            options,
            player_id: local,
            alive: true,
            head_deferrals: 0,
        })
    }

    pub fn player_id(&self) -> EntityId {
        self.player_id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// False after the server reported an error or destroyed our player.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn position_of(&self, id: EntityId) -> Option<Vector2> {
        self.registry.get::<CircleCollider>(id).map(|c| c.position)
    }

    pub fn local_position(&self) -> Option<Vector2> {
        self.position_of(self.player_id)
    }

    pub fn player_ids(&self) -> Vec<EntityId> {
        self.registry.ids_with::<PlayerTag>()
    }

    pub fn projectile_ids(&self) -> Vec<EntityId> {
        self.registry.ids_with::<ProjectileTag>()
    }

    /// Applies queued server messages in arrival order.
    ///
    /// A message that cannot be applied yet stays at the head and ends this
    /// poll, so nothing behind it overtakes it. It is never dropped; a warning
    /// is logged once it has waited [`DEFERRAL_WARNING`] polls. Returns the
    /// number of messages consumed.
    pub fn process_messages(&mut self, queue: &MessageQueue) -> usize {
        let mut queue = queue.lock();
        let mut consumed = 0;

        while let Some(message) = queue.front() {
            match self.apply(message) {
                Applied::Done => {
                    queue.pop_front();
                    self.head_deferrals = 0;
                    consumed += 1;
                }
                Applied::Deferred => {
                    self.head_deferrals = self.head_deferrals.saturating_add(1);
                    if self.head_deferrals == DEFERRAL_WARNING {
                        warn!(
                            "{} message still waiting after {} polls",
                            message.kind(),
                            self.head_deferrals
                        );
                    }
                    break;
                }
            }

            if !self.alive {
                break;
            }
        }

        consumed
    }

    fn apply(&mut self, message: &Message) -> Applied {
        match message {
            Message::Coords(coords) => {
                if self.registry.is_queued_for_destroy(coords.id) {
                    return Applied::Done;
                }
                let position = coords.position();
                if !self
                    .registry
                    .patch::<CircleCollider>(coords.id, |c| c.position = position)
                {
                    debug!("Ignoring coords for unknown entity {}", coords.id);
                }
                Applied::Done
            }
            Message::Connection(player) => {
                if self.registry.valid(player.id) {
                    if self.registry.has::<PlayerTag>(player.id)
                        && !self.registry.is_queued_for_destroy(player.id)
                    {
                        debug!("Player {} already known", player.id);
                        return Applied::Done;
                    }
                    return Applied::Deferred;
                }
                match spawn_player(&mut self.registry, player, self.options.player_radius) {
                    Ok(()) => info!("Player {} joined", player.id),
                    Err(e) => warn!("Could not add player {}: {}", player.id, e),
                }
                Applied::Done
            }
            Message::Shoot(shoot) => self.apply_shoot(shoot),
            Message::Destroy { id } => {
                match self.kind_of(*id) {
                    Some(EntityKind::Player) if *id == self.player_id => {
                        info!("Our player {} was destroyed", id);
                        self.alive = false;
                    }
                    Some(EntityKind::Player) => info!("Player {} left", id),
                    Some(kind) => debug!("Destroying {:?} {}", kind, id),
                    None if self.registry.valid(*id) => {}
                    None => {
                        debug!("Ignoring destroy for unknown entity {}", id);
                        return Applied::Done;
                    }
                }
                self.registry.queue_destroy(*id);
                Applied::Done
            }
            Message::NetworkError { what } => {
                warn!("Server reported an error: {}", what);
                self.alive = false;
                Applied::Done
            }
            Message::Greeting(_) => {
                warn!("Ignoring unexpected greeting");
                Applied::Done
            }
        }
    }

    fn apply_shoot(&mut self, shoot: &Shoot) -> Applied {
        let Some((bullet, position)) = shoot.bullet() else {
            warn!("Ignoring shoot from {} without a bullet", shoot.shooter_id);
            return Applied::Done;
        };

        // The id still names an entity waiting for removal.
        if self.registry.valid(bullet) {
            return Applied::Deferred;
        }

        let direction = shoot.target().normalize();
        let collider = CircleCollider::new(position, self.options.bullet_radius)
            .with_velocity(direction.scale(self.options.bullet_speed));

        let created = self
            .registry
            .create_with_id(bullet)
            .and_then(|id| self.registry.attach(id, collider))
            .and_then(|_| {
                self.registry.attach(
                    bullet,
                    ProjectileTag {
                        shooter: shoot.shooter_id,
                    },
                )
            });
        if let Err(e) = created {
            warn!("Could not add projectile {}: {}", bullet, e);
        }
        Applied::Done
    }

    /// Moves the local player one frame in `direction`, stopping at walls.
    ///
    /// Returns the coords message to send, or `None` once the player is gone.
    pub fn step_local_player(&mut self, direction: Vector2, dt: f32) -> Option<Message> {
        if !self.alive || self.registry.is_queued_for_destroy(self.player_id) {
            return None;
        }

        let velocity = direction.normalize().scale(self.options.player_speed);
        let walls: Vec<LineCollider> = self
            .registry
            .iter::<LineCollider>()
            .map(|(_, wall)| *wall)
            .collect();

        let mut position = None;
        self.registry
            .patch::<CircleCollider>(self.player_id, |collider| {
                collider.velocity = velocity;
                collide_circle_walls(collider, &walls, dt);
                collider.advance(dt);
                collider.stop();
                position = Some(collider.position);
            });

        position.map(|p| Message::coords(self.player_id, p))
    }

    /// Shot request aimed along `direction` from the local player.
    pub fn shoot_request(&self, direction: Vector2) -> Option<Message> {
        if !self.alive || direction.is_zero() {
            return None;
        }
        Some(Message::Shoot(Shoot::request(self.player_id, direction)))
    }

    /// Removes entities destroyed during this frame.
    pub fn flush_removals(&mut self) -> Vec<EntityId> {
        let removed = self.registry.flush_destroyed();
        for id in &removed {
            debug!("Removed entity {}", id);
        }
        removed
    }

    pub fn kind_of(&self, id: EntityId) -> Option<EntityKind> {
        EntityKind::of(&self.registry, id)
    }
}

fn spawn_player(
    registry: &mut EntityRegistry,
    player: &EntityPosition,
    radius: f32,
) -> Result<(), RegistryError> {
    registry.create_with_id(player.id)?;
    registry.attach(player.id, CircleCollider::new(player.position(), radius))?;
    registry.attach(player.id, PlayerTag)
}
