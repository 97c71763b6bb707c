use serde::{Deserialize, Serialize};

///Represents a vector in 2D space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vector2 {
    ///Value along the x-axis.
    pub x: f32,
    ///Value along the y-axis.
    /// Screen convention: positive direction is down.
    pub y: f32,
}

impl Vector2 {
    pub const ZERO: Vector2 = Vector2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Vector2 { x, y }
    }

    ///Returns the magnitude of the vector.
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    ///Returns the normalized vector, or zero for a zero-length vector.
    pub fn normalize(&self) -> Vector2 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vector2::ZERO
        } else {
            Vector2 {
                x: self.x / mag,
                y: self.y / mag,
            }
        }
    }

    ///Returns the scaled vector.
    pub fn scale(&self, scalar: f32) -> Vector2 {
        Vector2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    ///Returns the sum of two vectors.
    pub fn add(&self, other: &Vector2) -> Vector2 {
        Vector2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }

    ///Returns the difference of two vectors.
    pub fn sub(&self, other: &Vector2) -> Vector2 {
        Vector2 {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    pub fn dot(&self, other: &Vector2) -> f32 {
        self.x * other.x + self.y * other.y
    }

    /// 2D cross product (z component of the 3D cross product).
    pub fn cross(&self, other: &Vector2) -> f32 {
        self.x * other.y - self.y * other.x
    }

    pub fn distance(&self, other: &Vector2) -> f32 {
        self.sub(other).magnitude()
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }
}

/// Shortest distance from `point` to the segment `start`-`end`.
///
/// A degenerate segment (start == end) is treated as a point.
pub fn distance_to_segment(point: Vector2, start: Vector2, end: Vector2) -> f32 {
    let dir = end.sub(&start);
    let len_sq = dir.dot(&dir);
    if len_sq == 0.0 {
        return point.distance(&start);
    }
    let t = (point.sub(&start).dot(&dir) / len_sq).clamp(0.0, 1.0);
    point.distance(&start.add(&dir.scale(t)))
}

/// Returns true if segments `a1`-`a2` and `b1`-`b2` intersect, touching included.
pub fn segments_intersect(a1: Vector2, a2: Vector2, b1: Vector2, b2: Vector2) -> bool {
    let d1 = orientation(b1, b2, a1);
    let d2 = orientation(b1, b2, a2);
    let d3 = orientation(a1, a2, b1);
    let d4 = orientation(a1, a2, b2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(b1, b2, a1))
        || (d2 == 0.0 && on_segment(b1, b2, a2))
        || (d3 == 0.0 && on_segment(a1, a2, b1))
        || (d4 == 0.0 && on_segment(a1, a2, b2))
}

/// Shortest distance between two segments; zero when they intersect.
pub fn segment_distance(a1: Vector2, a2: Vector2, b1: Vector2, b2: Vector2) -> f32 {
    if segments_intersect(a1, a2, b1, b2) {
        return 0.0;
    }
    distance_to_segment(a1, b1, b2)
        .min(distance_to_segment(a2, b1, b2))
        .min(distance_to_segment(b1, a1, a2))
        .min(distance_to_segment(b2, a1, a2))
}

fn orientation(start: Vector2, end: Vector2, point: Vector2) -> f32 {
    end.sub(&start).cross(&point.sub(&start))
}

// Caller guarantees the three points are collinear.
fn on_segment(start: Vector2, end: Vector2, point: Vector2) -> bool {
    point.x >= start.x.min(end.x)
        && point.x <= start.x.max(end.x)
        && point.y >= start.y.min(end.y)
        && point.y <= start.y.max(end.y)
}
