use crate::core::geo::Point;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in projection units.
///
/// The empty extent is represented by `min = +inf, max = -inf` so that
/// [`Extent::extend`] works from it without special-casing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Creates empty extent (invalid bounds that can be extended)
    pub fn empty() -> Self {
        Self::new(
            f64::INFINITY,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::NEG_INFINITY,
        )
    }

    /// Smallest extent containing all the given points
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point>) -> Self {
        let mut extent = Self::empty();
        for point in points {
            extent.extend_point(point);
        }
        extent
    }

    pub fn from_center_and_size(center: Point, width: f64, height: f64) -> Self {
        Self::new(
            center.x - width / 2.0,
            center.y - height / 2.0,
            center.x + width / 2.0,
            center.y + height / 2.0,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.max_x < self.min_x || self.max_y < self.min_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn area(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.width() * self.height()
        }
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn bottom_left(&self) -> Point {
        Point::new(self.min_x, self.min_y)
    }

    pub fn bottom_right(&self) -> Point {
        Point::new(self.max_x, self.min_y)
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.min_x, self.max_y)
    }

    pub fn top_right(&self) -> Point {
        Point::new(self.max_x, self.max_y)
    }

    /// Gets the four corner points, counter-clockwise from bottom-left
    pub fn corners(&self) -> [Point; 4] {
        [
            self.bottom_left(),
            self.bottom_right(),
            self.top_right(),
            self.top_left(),
        ]
    }

    /// Edges count as inside
    pub fn contains_coordinate(&self, point: &Point) -> bool {
        point.x >= self.min_x
            && point.x <= self.max_x
            && point.y >= self.min_y
            && point.y <= self.max_y
    }

    pub fn contains_extent(&self, other: &Extent) -> bool {
        self.min_x <= other.min_x
            && other.max_x <= self.max_x
            && self.min_y <= other.min_y
            && other.max_y <= self.max_y
    }

    /// True if the rectangles overlap; touching edges count as intersecting
    pub fn intersects(&self, other: &Extent) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Overlapping rectangle, or [`Extent::empty`] when the extents do not intersect
    pub fn intersection(&self, other: &Extent) -> Extent {
        if !self.intersects(other) {
            return Extent::empty();
        }
        Extent::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        )
    }

    pub fn extend_point(&mut self, point: &Point) {
        self.min_x = self.min_x.min(point.x);
        self.min_y = self.min_y.min(point.y);
        self.max_x = self.max_x.max(point.x);
        self.max_y = self.max_y.max(point.y);
    }

    pub fn extend(&mut self, other: &Extent) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Returns a new extent grown by `amount` on every side
    pub fn buffer(&self, amount: f64) -> Extent {
        Extent::new(
            self.min_x - amount,
            self.min_y - amount,
            self.max_x + amount,
            self.max_y + amount,
        )
    }

    /// Scales the extent in place around its own center
    pub fn scale_from_center(&mut self, factor: f64) {
        let delta_x = (self.width() / 2.0) * (factor - 1.0);
        let delta_y = (self.height() / 2.0) * (factor - 1.0);
        self.min_x -= delta_x;
        self.max_x += delta_x;
        self.min_y -= delta_y;
        self.max_y += delta_y;
    }

    /// Bounding box of the extent after mapping it through `transform`.
    ///
    /// The four corners are always transformed. With `stops`, each edge is
    /// additionally sampled at `stops` evenly spaced points, which matters for
    /// non-linear transforms whose extremes do not fall on a corner.
    pub fn apply_transform<F>(&self, transform: F, stops: Option<usize>) -> Extent
    where
        F: Fn(Point) -> Point,
    {
        if self.is_empty() {
            return Extent::empty();
        }

        let mut samples: Vec<Point> = self.corners().to_vec();
        if let Some(stops) = stops.filter(|s| *s > 0) {
            let width = self.width();
            let height = self.height();
            for i in 1..stops {
                let t = i as f64 / stops as f64;
                samples.push(Point::new(self.min_x + width * t, self.min_y));
                samples.push(Point::new(self.max_x, self.min_y + height * t));
                samples.push(Point::new(self.max_x - width * t, self.max_y));
                samples.push(Point::new(self.min_x, self.max_y - height * t));
            }
        }

        let transformed: Vec<Point> = samples.into_iter().map(transform).collect();
        Extent::from_points(transformed.iter())
    }
}

impl Default for Extent {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<[f64; 4]> for Extent {
    fn from(values: [f64; 4]) -> Self {
        Extent::new(values[0], values[1], values[2], values[3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_creation() {
        let extent = Extent::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(extent.width(), 20.0);
        assert_eq!(extent.height(), 20.0);
        assert_eq!(extent.center(), Point::new(20.0, 30.0));
        assert!(!extent.is_empty());
        assert!(Extent::empty().is_empty());
    }

    #[test]
    fn test_touching_edges_intersect() {
        let a = Extent::new(0.0, 0.0, 10.0, 10.0);
        let b = Extent::new(10.0, 0.0, 20.0, 10.0);
        assert!(a.intersects(&b));
        let overlap = a.intersection(&b);
        assert_eq!(overlap, Extent::new(10.0, 0.0, 10.0, 10.0));
        assert_eq!(overlap.area(), 0.0);
    }

    #[test]
    fn test_intersection() {
        let a = Extent::new(0.0, 0.0, 10.0, 10.0);
        let b = Extent::new(5.0, 5.0, 15.0, 15.0);
        assert_eq!(a.intersection(&b), Extent::new(5.0, 5.0, 10.0, 10.0));

        let far = Extent::new(20.0, 20.0, 30.0, 30.0);
        assert!(a.intersection(&far).is_empty());
    }

    #[test]
    fn test_scale_from_center() {
        let mut extent = Extent::new(0.0, 0.0, 10.0, 20.0);
        extent.scale_from_center(2.0);
        assert_eq!(extent, Extent::new(-5.0, -10.0, 15.0, 30.0));
        assert_eq!(extent.center(), Point::new(5.0, 10.0));
    }

    #[test]
    fn test_apply_transform_bounding_box() {
        let extent = Extent::new(-1.0, -1.0, 1.0, 1.0);
        // 45 degree rotation: corners land on the axes at distance sqrt(2)
        let rotated = extent.apply_transform(
            |p| {
                let (s, c) = std::f64::consts::FRAC_PI_4.sin_cos();
                Point::new(p.x * c - p.y * s, p.x * s + p.y * c)
            },
            None,
        );
        let r = 2f64.sqrt();
        assert!((rotated.max_x - r).abs() < 1e-12);
        assert!((rotated.min_y + r).abs() < 1e-12);
    }

    #[test]
    fn test_apply_transform_with_stops_catches_bulge() {
        let extent = Extent::new(-1.0, 0.0, 1.0, 1.0);
        // Parabola peaks mid-edge, which corner-only sampling misses
        let bulge = |p: Point| Point::new(p.x, p.y + (1.0 - p.x * p.x));
        assert_eq!(extent.apply_transform(bulge, None).max_y, 1.0);
        assert!((extent.apply_transform(bulge, Some(2)).max_y - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_nan_propagates() {
        let extent = Extent::new(0.0, 0.0, f64::NAN, 1.0);
        assert!(extent.width().is_nan());
    }
}
