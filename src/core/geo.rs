use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Web Mercator projection constants
pub const EARTH_RADIUS: f64 = 6378137.0;
pub const MAX_LATITUDE: f64 = 85.0511287798;
const POLE_LATITUDE: f64 = 89.999_999;

/// Represents a geographical coordinate with latitude and longitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    /// Creates a new LatLng coordinate
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Validates that the coordinates are within valid ranges
    pub fn is_valid(&self) -> bool {
        self.lat >= -90.0 && self.lat <= 90.0 && self.lng >= -180.0 && self.lng <= 180.0
    }

    /// Clamps latitude to the range Web Mercator can represent
    pub fn clamp_lat(lat: f64) -> f64 {
        lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
    }

    /// Converts to Web Mercator projection (EPSG:3857)
    pub fn to_mercator(&self) -> Point {
        let x = self.lng.to_radians() * EARTH_RADIUS;
        let lat = Self::clamp_lat(self.lat);
        let y = ((PI / 4.0 + lat.to_radians() / 2.0).tan().ln()) * EARTH_RADIUS;
        Point::new(x, y)
    }

    /// Web Mercator without the latitude clamp: latitudes beyond
    /// [`MAX_LATITUDE`] land outside the mercator square instead of on its
    /// edge. The poles themselves are nudged so the result stays finite.
    pub fn to_mercator_unclamped(&self) -> Point {
        let x = self.lng.to_radians() * EARTH_RADIUS;
        let lat = self.lat.clamp(-POLE_LATITUDE, POLE_LATITUDE);
        let y = ((PI / 4.0 + lat.to_radians() / 2.0).tan().ln()) * EARTH_RADIUS;
        Point::new(x, y)
    }

    /// Creates LatLng from Web Mercator coordinates
    pub fn from_mercator(point: Point) -> Self {
        let lng = (point.x / EARTH_RADIUS).to_degrees();
        let lat = (2.0 * (point.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
        Self::new(lat, lng)
    }

    /// Projected point with x = longitude, y = latitude (EPSG:4326 axis order used by the grids)
    pub fn to_point(&self) -> Point {
        Point::new(self.lng, self.lat)
    }
}

impl Default for LatLng {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// A coordinate in projection units (or pixels, depending on context)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn add(&self, other: &Point) -> Point {
        Point::new(self.x + other.x, self.y + other.y)
    }

    pub fn subtract(&self, other: &Point) -> Point {
        Point::new(self.x - other.x, self.y - other.y)
    }

    pub fn multiply(&self, scalar: f64) -> Point {
        Point::new(self.x * scalar, self.y * scalar)
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        self.squared_distance_to(other).sqrt()
    }

    pub fn squared_distance_to(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Default for Point {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Point::new(x, y)
    }
}

/// Address of one tile in a tile grid.
///
/// `x` grows to the right and `y` grows downwards from the grid origin, so
/// both may be negative for grids whose origin is not the top-left corner of
/// the projection extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: i32,
    pub y: i32,
}

impl TileCoord {
    pub fn new(z: u8, x: i32, y: i32) -> Self {
        Self { z, x, y }
    }

    /// Canonical `z:x:y` key used by caches and frame bookkeeping
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.z, self.x, self.y)
    }

    /// Parses a key produced by [`TileCoord::key`]
    pub fn from_key(key: &str) -> Option<Self> {
        let mut parts = key.split(':');
        let z = parts.next()?.parse().ok()?;
        let x = parts.next()?.parse().ok()?;
        let y = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(z, x, y))
    }

    /// Gets the parent tile in a power-of-two pyramid
    pub fn parent(&self) -> Option<TileCoord> {
        if self.z == 0 {
            None
        } else {
            Some(TileCoord::new(
                self.z - 1,
                self.x.div_euclid(2),
                self.y.div_euclid(2),
            ))
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.z, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mercator_round_trip() {
        let nyc = LatLng::new(40.7128, -74.0060);
        let back = LatLng::from_mercator(nyc.to_mercator());
        assert!((back.lat - nyc.lat).abs() < 1e-9);
        assert!((back.lng - nyc.lng).abs() < 1e-9);
    }

    #[test]
    fn test_mercator_world_edge() {
        let edge = LatLng::new(0.0, 180.0).to_mercator();
        assert!((edge.x - 20037508.342789244).abs() < 1e-6);
        assert!(edge.y.abs() < 1e-9);
    }

    #[test]
    fn test_tile_coord_key() {
        let coord = TileCoord::new(1, 2, -3);
        assert_eq!(coord.key(), "1:2:-3");
        assert_eq!(TileCoord::from_key("1:2:-3"), Some(coord));
        assert_eq!(TileCoord::from_key("1:2"), None);
        assert_eq!(TileCoord::from_key("1:2:3:4"), None);
    }

    #[test]
    fn test_parent_of_negative_coord() {
        let coord = TileCoord::new(3, -1, -3);
        assert_eq!(coord.parent(), Some(TileCoord::new(2, -1, -2)));
        assert_eq!(TileCoord::new(0, 0, 0).parent(), None);
    }
}
