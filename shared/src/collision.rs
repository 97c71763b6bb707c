//! Swept collision tests over a single tick
//!
//! Every test looks at where a circle will be after `dt`, not where it is now,
//! so fast projectiles cannot skip over a thin wall between two ticks. The
//! `*_touch*` predicates are pure; the `collide_*` variants additionally stop
//! the colliders involved, which is the default contact response. Callers that
//! want a different response (the server destroys projectiles instead) use the
//! pure predicates directly.

use crate::components::{CircleCollider, LineCollider};
use crate::math::segment_distance;

/// True if the two circles overlap at their next positions.
pub fn circles_touch(a: &CircleCollider, b: &CircleCollider, dt: f32) -> bool {
    let reach = a.radius() + b.radius();
    a.next_position(dt).distance(&b.next_position(dt)) <= reach
}

/// True if the circle's path over the tick comes within its radius of the segment.
///
/// The path is the segment from the current to the next position, so this
/// covers both "ends the tick touching the wall" and "crosses it mid-tick".
pub fn circle_touches_segment(circle: &CircleCollider, segment: &LineCollider, dt: f32) -> bool {
    let from = circle.position;
    let to = circle.next_position(dt);
    segment_distance(from, to, segment.start, segment.end) <= circle.radius()
}

/// Tests two circles and stops both on contact.
pub fn collide_circles(a: &mut CircleCollider, b: &mut CircleCollider, dt: f32) -> bool {
    let hit = circles_touch(a, b, dt);
    if hit {
        a.stop();
        b.stop();
    }
    hit
}

/// Tests a circle against a wall and stops the circle on contact.
pub fn collide_circle_segment(circle: &mut CircleCollider, segment: &LineCollider, dt: f32) -> bool {
    let hit = circle_touches_segment(circle, segment, dt);
    if hit {
        circle.stop();
    }
    hit
}

/// Tests a circle against every wall, stopping at the first contact.
pub fn collide_circle_walls<'a>(
    circle: &mut CircleCollider,
    walls: impl IntoIterator<Item = &'a LineCollider>,
    dt: f32,
) -> bool {
    walls
        .into_iter()
        .any(|wall| collide_circle_segment(circle, wall, dt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vector2;

    fn wall(x1: f32, y1: f32, x2: f32, y2: f32) -> LineCollider {
        LineCollider::new(Vector2::new(x1, y1), Vector2::new(x2, y2))
    }

    fn moving(x: f32, y: f32, vx: f32, vy: f32, radius: f32) -> CircleCollider {
        CircleCollider::new(Vector2::new(x, y), radius).with_velocity(Vector2::new(vx, vy))
    }

    #[test]
    fn test_projectile_crossing_wall_within_tick() {
        let segment = wall(0.0, 0.0, 100.0, 0.0);
        let mut projectile = moving(50.0, -5.0, 0.0, 10.0, 2.0);

        assert!(collide_circle_segment(&mut projectile, &segment, 1.0));
        assert_eq!(projectile.velocity, Vector2::ZERO);
    }

    #[test]
    fn test_fast_projectile_does_not_tunnel() {
        let segment = wall(0.0, 0.0, 100.0, 0.0);
        let projectile = moving(50.0, -200.0, 0.0, 500.0, 1.0);

        assert!(circle_touches_segment(&projectile, &segment, 1.0));
    }

    #[test]
    fn test_circle_clear_of_wall() {
        let segment = wall(0.0, 0.0, 100.0, 0.0);
        let mut circle = moving(50.0, -50.0, 0.0, 10.0, 2.0);

        assert!(!collide_circle_segment(&mut circle, &segment, 1.0));
        assert_eq!(circle.velocity, Vector2::new(0.0, 10.0));
    }

    #[test]
    fn test_circle_past_segment_end() {
        let segment = wall(0.0, 0.0, 100.0, 0.0);
        let circle = moving(110.0, -5.0, 0.0, 10.0, 2.0);

        assert!(!circle_touches_segment(&circle, &segment, 1.0));
    }

    #[test]
    fn test_stationary_circle_touching_wall() {
        let segment = wall(0.0, 0.0, 0.0, 100.0);
        let circle = moving(3.0, 50.0, 0.0, 0.0, 3.0);

        assert!(circle_touches_segment(&circle, &segment, 1.0 / 60.0));
    }

    #[test]
    fn test_circles_touch_at_next_position() {
        let mut a = moving(0.0, 0.0, 10.0, 0.0, 5.0);
        let mut b = moving(30.0, 0.0, -10.0, 0.0, 5.0);

        // Now 30 apart, after the tick 10 apart: radii sum is 10.
        assert!(!circles_touch(&a, &b, 0.5));
        assert!(collide_circles(&mut a, &mut b, 1.0));
        assert_eq!(a.velocity, Vector2::ZERO);
        assert_eq!(b.velocity, Vector2::ZERO);
    }

    #[test]
    fn test_circles_apart() {
        let mut a = moving(0.0, 0.0, 0.0, 0.0, 5.0);
        let mut b = moving(100.0, 0.0, 0.0, 0.0, 5.0);

        assert!(!collide_circles(&mut a, &mut b, 1.0));
    }

    #[test]
    fn test_collision_is_deterministic() {
        let segment = wall(0.0, 0.0, 100.0, 0.0);
        let projectile = moving(20.0, -7.5, 3.0, 9.0, 2.0);
        let other = moving(25.0, 3.0, -1.0, -1.0, 4.0);

        let first = (
            circle_touches_segment(&projectile, &segment, 0.75),
            circles_touch(&projectile, &other, 0.75),
        );
        for _ in 0..10 {
            assert_eq!(circles_touch(&other, &projectile, 0.75), first.1);
            assert_eq!(circle_touches_segment(&projectile, &segment, 0.75), first.0);
        }
    }

    #[test]
    fn test_collide_circle_walls_stops_on_first_contact() {
        let walls = [wall(0.0, 0.0, 100.0, 0.0), wall(0.0, 50.0, 100.0, 50.0)];
        let mut circle = moving(50.0, 10.0, 0.0, -20.0, 2.0);

        assert!(collide_circle_walls(&mut circle, walls.iter(), 1.0));
        assert!(circle.velocity.is_zero());
    }
}
