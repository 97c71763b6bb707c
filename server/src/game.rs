use log::{debug, info, warn};
use shared::collision::{circle_touches_segment, circles_touch, collide_circle_walls};
use shared::protocol::{BulletState, EntityPosition, Greeting, Shoot, WallState};
use shared::{
    CircleCollider, EntityId, EntityKind, EntityRegistry, LineCollider, Message, PlayerTag,
    ProjectileTag, SessionOptions, Vector2, PLAYER_SPAWN,
};

/// What happens to a player hit by a projectile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum HitPolicy {
    /// Move the player back to the spawn point.
    #[default]
    Respawn,
    /// Remove the player entity; the connection stays open.
    Destroy,
}

/// Authoritative session state.
///
/// Inbound messages are routed through [`handle_message`](Self::handle_message)
/// and the world advances in [`tick`](Self::tick). Both return the messages
/// to broadcast; nothing here touches the network.
pub struct GameState {
    registry: EntityRegistry,
    options: SessionOptions,
    hit_policy: HitPolicy,
    tick: u64,
}

impl GameState {
    pub fn new(options: SessionOptions, hit_policy: HitPolicy) -> Self {
        let mut registry = EntityRegistry::new();
        for wall in &options.walls {
            let id = registry.create();
            // A freshly created id is always alive.
            let _ = registry.attach(id, *wall);
        }
        info!(
            "Session created with {} walls, hit policy {:?}",
            options.walls.len(),
            hit_policy
        );

        Self {
            registry,
            options,
            hit_policy,
            tick: 0,
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn player_count(&self) -> usize {
        self.registry.ids_with::<PlayerTag>().len()
    }

    pub fn position_of(&self, id: EntityId) -> Option<Vector2> {
        self.registry.get::<CircleCollider>(id).map(|c| c.position)
    }

    /// Spawns a player for a new connection.
    ///
    /// Returns the player's id, the greeting for the new client and the
    /// `connection` announcement for everybody else.
    pub fn add_player(&mut self) -> Result<(EntityId, Greeting, Message), shared::RegistryError> {
        let id = self.registry.create();
        self.registry
            .attach(id, CircleCollider::new(PLAYER_SPAWN, self.options.player_radius))?;
        self.registry.attach(id, PlayerTag)?;
        info!("Added player {} at ({}, {})", id, PLAYER_SPAWN.x, PLAYER_SPAWN.y);

        let greeting = self.greeting_for(id);
        let announcement = Message::Connection(EntityPosition::new(id, PLAYER_SPAWN));
        Ok((id, greeting, announcement))
    }

    /// Removes a player, returning the `destroy` to broadcast if it still existed.
    pub fn remove_player(&mut self, id: EntityId) -> Option<Message> {
        if EntityKind::of(&self.registry, id) != Some(EntityKind::Player) {
            return None;
        }
        if !self.registry.destroy(id) {
            return None;
        }
        info!("Removed player {}", id);
        Some(Message::Destroy { id })
    }

    fn walls(&self) -> Vec<LineCollider> {
        self.registry
            .iter::<LineCollider>()
            .map(|(_, wall)| *wall)
            .collect()
    }

    fn greeting_for(&self, player_id: EntityId) -> Greeting {
        let mut walls: Vec<WallState> = self
            .registry
            .iter::<LineCollider>()
            .map(|(id, wall)| WallState {
                id,
                start: wall.start,
                end: wall.end,
            })
            .collect();
        walls.sort_by_key(|w| w.id);

        let players = self
            .registry
            .ids_with::<PlayerTag>()
            .into_iter()
            .filter(|id| *id != player_id && !self.registry.is_queued_for_destroy(*id))
            .filter_map(|id| self.position_of(id).map(|p| EntityPosition::new(id, p)))
            .collect();

        let bullets = self
            .registry
            .iter_with::<ProjectileTag, CircleCollider>()
            .map(|(id, tag, collider)| {
                let direction = collider.velocity.normalize();
                BulletState {
                    id,
                    x: collider.position.x,
                    y: collider.position.y,
                    shooter_id: tag.shooter,
                    target_x: direction.x,
                    target_y: direction.y,
                }
            })
            .collect();

        Greeting {
            player_radius: self.options.player_radius,
            player_speed: self.options.player_speed,
            bullet_radius: self.options.bullet_radius,
            bullet_speed: self.options.bullet_speed,
            walls,
            players,
            bullets,
            player_id,
            player_x: PLAYER_SPAWN.x,
            player_y: PLAYER_SPAWN.y,
        }
    }

    /// Routes one message received from the client controlling `sender`.
    pub fn handle_message(&mut self, sender: EntityId, message: Message) -> Vec<Message> {
        match message {
            Message::Coords(coords) => {
                if coords.id != sender {
                    warn!("Player {} sent coords for entity {}", sender, coords.id);
                    return Vec::new();
                }
                if self.registry.has::<PlayerTag>(sender) {
                    self.move_player(sender, coords.position());
                }
                Vec::new()
            }
            Message::Shoot(shoot) => {
                if shoot.shooter_id != sender {
                    warn!("Player {} tried to shoot as {}", sender, shoot.shooter_id);
                    return Vec::new();
                }
                self.spawn_projectile(shoot).into_iter().collect()
            }
            other => {
                warn!("Ignoring {} message from player {}", other.kind(), sender);
                Vec::new()
            }
        }
    }

    /// Moves a player straight to `target`, stopping at the first wall in the way.
    ///
    /// Applied on receipt so later messages from the same client see the new
    /// position; the next tick broadcasts it.
    fn move_player(&mut self, player: EntityId, target: Vector2) {
        let walls = self.walls();
        self.registry.patch::<CircleCollider>(player, |c| {
            c.velocity = target.sub(&c.position);
            collide_circle_walls(c, walls.iter(), 1.0);
            c.advance(1.0);
            c.stop();
        });
    }

    fn spawn_projectile(&mut self, request: Shoot) -> Option<Message> {
        if !self.registry.has::<PlayerTag>(request.shooter_id) {
            return None;
        }
        let shooter = self.position_of(request.shooter_id)?;

        let direction = request.target().normalize();
        if direction.is_zero() {
            debug!("Ignoring shot with no direction from {}", request.shooter_id);
            return None;
        }

        let position = shooter.add(&direction.scale(self.options.player_radius));
        let velocity = direction.scale(self.options.bullet_speed);

        let bullet = self.registry.create();
        let collider =
            CircleCollider::new(position, self.options.bullet_radius).with_velocity(velocity);
        self.registry.attach(bullet, collider).ok()?;

        let reply = Message::Shoot(Shoot {
            bullet_id: Some(bullet),
            bullet_x: Some(position.x),
            bullet_y: Some(position.y),
            ..request
        });

        // Joins the tick cycle only once the creation message exists.
        self.registry
            .attach(
                bullet,
                ProjectileTag {
                    shooter: request.shooter_id,
                },
            )
            .ok()?;
        debug!("Player {} fired projectile {}", request.shooter_id, bullet);

        Some(reply)
    }

    /// Advances the world by `dt` seconds and returns the resulting broadcasts.
    pub fn tick(&mut self, dt: f32) -> Vec<Message> {
        self.tick += 1;
        let mut outgoing = Vec::new();

        let walls = self.walls();
        let players = self.registry.ids_with::<PlayerTag>();
        let projectiles: Vec<(EntityId, EntityId, CircleCollider)> = self
            .registry
            .iter_with::<ProjectileTag, CircleCollider>()
            .map(|(id, tag, collider)| (id, tag.shooter, *collider))
            .collect();

        for (bullet, shooter, collider) in projectiles {

            // Walls first: a wall hit wins over a player hit in the same tick.
            if walls
                .iter()
                .any(|wall| circle_touches_segment(&collider, wall, dt))
            {
                debug!("Projectile {} hit a wall", bullet);
                self.registry.queue_destroy(bullet);
                outgoing.push(Message::Destroy { id: bullet });
                continue;
            }

            let victim = players.iter().copied().find(|player| {
                *player != shooter
                    && !self.registry.is_queued_for_destroy(*player)
                    && self
                        .registry
                        .get::<CircleCollider>(*player)
                        .is_some_and(|target| circles_touch(target, &collider, dt))
            });
            if let Some(victim) = victim {
                debug!("Projectile {} hit player {}", bullet, victim);
                self.registry.queue_destroy(bullet);
                outgoing.push(Message::Destroy { id: bullet });
                outgoing.push(self.hit_player(victim));
                continue;
            }

            self.registry
                .patch::<CircleCollider>(bullet, |c| c.advance(dt));
            outgoing.push(Message::coords(bullet, collider.next_position(dt)));
        }

        for player in players {
            if self.registry.is_queued_for_destroy(player) {
                continue;
            }
            self.registry.patch::<CircleCollider>(player, |c| {
                collide_circle_walls(c, walls.iter(), dt);
                c.advance(dt);
                c.stop();
            });

            if let Some(position) = self.position_of(player) {
                outgoing.push(Message::coords(player, position));
            }
        }

        for id in self.registry.flush_destroyed() {
            debug!("Entity {} removed at end of tick {}", id, self.tick);
        }

        if self.tick % 60 == 0 {
            debug!(
                "Tick {}: {} entities, {} broadcasts",
                self.tick,
                self.registry.len(),
                outgoing.len()
            );
        }

        outgoing
    }

    fn hit_player(&mut self, player: EntityId) -> Message {
        match self.hit_policy {
            HitPolicy::Respawn => {
                self.registry.patch::<CircleCollider>(player, |c| {
                    c.position = PLAYER_SPAWN;
                    c.stop();
                });
                info!("Player {} was hit and respawned", player);
                Message::coords(player, PLAYER_SPAWN)
            }
            HitPolicy::Destroy => {
                self.registry.queue_destroy(player);
                info!("Player {} was hit and destroyed", player);
                Message::Destroy { id: player }
            }
        }
    }
}
