//! Axis-aligned rectangles in map coordinates.
//! All coordinate math uses f64 for precision.
use geo::{coord, Rect};
use serde::{Deserialize, Serialize};

/// An axis-aligned rectangle `(min_x, min_y, max_x, max_y)`.
///
/// In the canonical reference this is `(west, south, east, north)` in degrees.
/// A zero-area rectangle is valid; it simply selects nothing of substance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Build bounds from two opposite corners given in any order.
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }

    /// The enclosing rectangle of a set of points. `None` for an empty set or
    /// when any coordinate is not finite.
    pub fn enclosing<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut acc: Option<Self> = None;
        for (x, y) in points {
            if !x.is_finite() || !y.is_finite() {
                return None;
            }
            acc = Some(match acc {
                None => Self { min_x: x, min_y: y, max_x: x, max_y: y },
                Some(b) => Self {
                    min_x: b.min_x.min(x),
                    min_y: b.min_y.min(y),
                    max_x: b.max_x.max(x),
                    max_y: b.max_y.max(y),
                },
            });
        }
        acc
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Closed-interval overlap test (touching edges count).
    pub fn overlaps(&self, other: &Bounds) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_y < other.min_y
            || self.min_y > other.max_y)
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub fn contains(&self, other: &Bounds) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    /// Grow every side by `pad`, then clamp to `limit`.
    pub fn padded(&self, pad: f64, limit: &Bounds) -> Bounds {
        Bounds::new(
            (self.min_x - pad).max(limit.min_x),
            (self.min_y - pad).max(limit.min_y),
            (self.max_x + pad).min(limit.max_x),
            (self.max_y + pad).min(limit.max_y),
        )
    }

    /// Corners in ring order: SW, SE, NE, NW.
    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ]
    }

    /// Points along the boundary: the four corners plus `per_edge` evenly
    /// spaced interior points on every edge.
    pub fn boundary_points(&self, per_edge: usize) -> Vec<(f64, f64)> {
        let corners = self.corners();
        let mut out = Vec::with_capacity(4 * (per_edge + 1));
        for i in 0..4 {
            let (x0, y0) = corners[i];
            let (x1, y1) = corners[(i + 1) % 4];
            out.push((x0, y0));
            for k in 1..=per_edge {
                let t = k as f64 / (per_edge + 1) as f64;
                out.push((x0 + (x1 - x0) * t, y0 + (y1 - y0) * t));
            }
        }
        out
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.min_x, y: self.min_y },
            coord! { x: self.max_x, y: self.max_y },
        )
    }
}

impl From<Rect<f64>> for Bounds {
    fn from(r: Rect<f64>) -> Self {
        Self::new(r.min().x, r.min().y, r.max().x, r.max().y)
    }
}
