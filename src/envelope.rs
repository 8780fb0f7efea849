//! Axis-aligned bounding envelopes.
//!
//! An [`Envelope`] is the shape every node identifier and every stored entry is
//! keyed by. It carries one `[min, max]` interval per dimension. The empty
//! envelope (all intervals inverted) is the identity for [`Envelope::union`]
//! and is what an empty leaf reports as its bounds.

use crate::error::{Result, SpatreeError};
use geo::{Coord, Point, Rect};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};

type Coords = SmallVec<[f64; 3]>;

/// Immutable axis-aligned bounding region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    min: Coords,
    max: Coords,
}

impl Envelope {
    /// Create an envelope from per-dimension minimum and maximum coordinates.
    ///
    /// Fails when the slices differ in length, are empty, contain non-finite
    /// values, or when `min[i] > max[i]` for some dimension.
    ///
    /// # Examples
    ///
    /// ```
    /// use spatree::Envelope;
    ///
    /// let env = Envelope::new(&[0.0, 0.0], &[2.0, 1.0]).unwrap();
    /// assert_eq!(env.area(), 2.0);
    /// ```
    pub fn new(min: &[f64], max: &[f64]) -> Result<Self> {
        if min.len() != max.len() {
            return Err(SpatreeError::InvalidInput(format!(
                "min has {} dimensions but max has {}",
                min.len(),
                max.len()
            )));
        }
        let env = Self {
            min: Coords::from_slice(min),
            max: Coords::from_slice(max),
        };
        env.validate(min.len())?;
        Ok(env)
    }

    /// Two-dimensional envelope from any two opposite corners.
    pub fn rect(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            min: Coords::from_slice(&[x1.min(x2), y1.min(y2)]),
            max: Coords::from_slice(&[x1.max(x2), y1.max(y2)]),
        }
    }

    /// Degenerate envelope covering a single point.
    pub fn point(coords: &[f64]) -> Self {
        Self {
            min: Coords::from_slice(coords),
            max: Coords::from_slice(coords),
        }
    }

    /// The empty sentinel for `dimensions` axes.
    pub fn empty(dimensions: usize) -> Self {
        Self {
            min: SmallVec::from_elem(f64::INFINITY, dimensions),
            max: SmallVec::from_elem(f64::NEG_INFINITY, dimensions),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.min.len()
    }

    pub fn min(&self) -> &[f64] {
        &self.min
    }

    pub fn max(&self) -> &[f64] {
        &self.max
    }

    /// True for the empty sentinel (any inverted interval).
    pub fn is_empty(&self) -> bool {
        self.min.iter().zip(&self.max).any(|(lo, hi)| lo > hi)
    }

    /// Closed-interval overlap test. Touching boundaries intersect.
    pub fn intersects(&self, other: &Envelope) -> bool {
        if self.is_empty() || other.is_empty() || self.dimensions() != other.dimensions() {
            return false;
        }
        (0..self.dimensions()).all(|i| self.min[i] <= other.max[i] && other.min[i] <= self.max[i])
    }

    /// True when `other` lies entirely inside `self`. Everything contains the
    /// empty envelope; the empty envelope contains nothing else.
    pub fn contains(&self, other: &Envelope) -> bool {
        if other.is_empty() {
            return true;
        }
        if self.is_empty() || self.dimensions() != other.dimensions() {
            return false;
        }
        (0..self.dimensions()).all(|i| self.min[i] <= other.min[i] && other.max[i] <= self.max[i])
    }

    /// Smallest envelope covering both.
    pub fn union(&self, other: &Envelope) -> Envelope {
        let mut merged = self.clone();
        merged.expand_to_include(other);
        merged
    }

    /// Grow in place to cover `other`.
    pub fn expand_to_include(&mut self, other: &Envelope) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
            return;
        }
        for i in 0..self.dimensions().min(other.dimensions()) {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    /// Product of the extents. Zero for empty and degenerate envelopes.
    pub fn area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// Area increase needed for `self` to also cover `other`.
    pub fn enlargement(&self, other: &Envelope) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Reject shapes that cannot be stored in an index of `dimensions` axes.
    pub fn validate(&self, dimensions: usize) -> Result<()> {
        if self.dimensions() != dimensions {
            return Err(SpatreeError::InvalidInput(format!(
                "expected {} dimensions, got {}",
                dimensions,
                self.dimensions()
            )));
        }
        if dimensions == 0 {
            return Err(SpatreeError::InvalidInput(
                "envelope must have at least one dimension".into(),
            ));
        }
        if self.min.iter().chain(&self.max).any(|c| !c.is_finite()) {
            return Err(SpatreeError::InvalidInput(
                "envelope coordinates must be finite".into(),
            ));
        }
        if self.is_empty() {
            return Err(SpatreeError::InvalidInput(
                "envelope min must not exceed max".into(),
            ));
        }
        Ok(())
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.min == other.min && self.max == other.max
    }
}

impl Eq for Envelope {}

impl Hash for Envelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dimensions().hash(state);
        for c in self.min.iter().chain(&self.max) {
            // -0.0 == 0.0, so they must hash alike
            let c = if *c == 0.0 { 0.0f64 } else { *c };
            c.to_bits().hash(state);
        }
    }
}

impl From<Rect<f64>> for Envelope {
    fn from(rect: Rect<f64>) -> Self {
        Self::rect(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

impl From<Point<f64>> for Envelope {
    fn from(point: Point<f64>) -> Self {
        Self::point(&[point.x(), point.y()])
    }
}

impl TryFrom<&Envelope> for Rect<f64> {
    type Error = SpatreeError;

    fn try_from(env: &Envelope) -> Result<Self> {
        if env.dimensions() != 2 || env.is_empty() {
            return Err(SpatreeError::InvalidInput(
                "only non-empty 2D envelopes convert to geo::Rect".into(),
            ));
        }
        Ok(Rect::new(
            Coord {
                x: env.min[0],
                y: env.min[1],
            },
            Coord {
                x: env.max[0],
                y: env.max[1],
            },
        ))
    }
}
