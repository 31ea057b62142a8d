//! Tile grid: the relationship between zoom level, resolution and tile addressing

use crate::core::constants::TILE_COORD_DECIMALS;
use crate::core::extent::Extent;
use crate::core::geo::{Point, TileCoord};
use crate::{MapError, Result};
use serde::{Deserialize, Serialize};

/// Inclusive rectangle of tile indices at one zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRange {
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

impl TileRange {
    pub fn new(min_x: i32, max_x: i32, min_y: i32, max_y: i32) -> Self {
        Self {
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    pub fn contains(&self, coord: &TileCoord) -> bool {
        self.contains_xy(coord.x, coord.y)
    }

    pub fn contains_xy(&self, x: i32, y: i32) -> bool {
        self.min_x <= x && x <= self.max_x && self.min_y <= y && y <= self.max_y
    }

    pub fn contains_range(&self, other: &TileRange) -> bool {
        self.min_x <= other.min_x
            && other.max_x <= self.max_x
            && self.min_y <= other.min_y
            && other.max_y <= self.max_y
    }

    pub fn intersects(&self, other: &TileRange) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn extend(&mut self, other: &TileRange) {
        self.min_x = self.min_x.min(other.min_x);
        self.max_x = self.max_x.max(other.max_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_y = self.max_y.max(other.max_y);
    }

    pub fn width(&self) -> i64 {
        (self.max_x as i64 - self.min_x as i64 + 1).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.max_y as i64 - self.min_y as i64 + 1).max(0)
    }

    pub fn tile_count(&self) -> i64 {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.tile_count() == 0
    }

    /// Row-major iteration over `(x, y)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32)> {
        let range = *self;
        (range.min_x..=range.max_x)
            .flat_map(move |x| (range.min_y..=range.max_y).map(move |y| (x, y)))
    }
}

/// Which neighbouring zoom to prefer when a resolution falls between levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomDirection {
    /// Closest resolution; exact midpoints go to the finer level
    Nearest,
    /// Never finer than the requested resolution
    Coarser,
    /// Never coarser than the requested resolution
    Finer,
}

/// Inputs for [`TileGrid::new`]
#[derive(Debug, Clone, Default)]
pub struct TileGridOptions {
    /// Resolutions indexed by zoom, strictly decreasing
    pub resolutions: Vec<f64>,
    pub min_zoom: u8,
    /// Top-left corner of tile `(z, 0, 0)` for all zooms
    pub origin: Option<Point>,
    /// Per-zoom origins, overriding `origin`
    pub origins: Option<Vec<Point>>,
    pub tile_size: Option<(u32, u32)>,
    pub tile_sizes: Option<Vec<(u32, u32)>>,
    /// Area covered by the grid; also provides the origin when none is given
    pub extent: Option<Extent>,
}

#[derive(Debug, Clone)]
pub struct TileGrid {
    resolutions: Vec<f64>,
    min_zoom: u8,
    max_zoom: u8,
    origin: Option<Point>,
    origins: Option<Vec<Point>>,
    tile_size: Option<(u32, u32)>,
    tile_sizes: Option<Vec<(u32, u32)>>,
    extent: Option<Extent>,
    full_tile_ranges: Option<Vec<TileRange>>,
    zoom_factor: Option<f64>,
}

impl TileGrid {
    pub fn new(options: TileGridOptions) -> Result<Self> {
        let TileGridOptions {
            resolutions,
            min_zoom,
            origin,
            origins,
            tile_size,
            tile_sizes,
            extent,
        } = options;

        if resolutions.is_empty() {
            return Err(MapError::InvalidTileGrid(
                "at least one resolution is required".to_string(),
            ));
        }
        if resolutions.len() > u8::MAX as usize + 1 {
            return Err(MapError::InvalidTileGrid(format!(
                "{} resolutions exceed the zoom range",
                resolutions.len()
            )));
        }
        if resolutions.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            return Err(MapError::InvalidTileGrid(
                "resolutions must be finite and positive".to_string(),
            ));
        }
        if resolutions.windows(2).any(|pair| pair[1] >= pair[0]) {
            return Err(MapError::InvalidTileGrid(
                "resolutions must be strictly decreasing".to_string(),
            ));
        }

        let max_zoom = (resolutions.len() - 1) as u8;
        if min_zoom > max_zoom {
            return Err(MapError::InvalidTileGrid(format!(
                "min zoom {} exceeds max zoom {}",
                min_zoom, max_zoom
            )));
        }

        if let Some(origins) = &origins {
            if origins.len() != resolutions.len() {
                return Err(MapError::InvalidTileGrid(
                    "one origin per resolution is required".to_string(),
                ));
            }
        }
        if let Some(sizes) = &tile_sizes {
            if sizes.len() != resolutions.len() {
                return Err(MapError::InvalidTileGrid(
                    "one tile size per resolution is required".to_string(),
                ));
            }
        }
        if tile_size.is_none() && tile_sizes.is_none() {
            return Err(MapError::InvalidTileGrid("tile size is required".to_string()));
        }
        let sizes_valid = tile_size.iter().chain(tile_sizes.iter().flatten()).all(|(w, h)| *w > 0 && *h > 0);
        if !sizes_valid {
            return Err(MapError::InvalidTileGrid(
                "tile sizes must be positive".to_string(),
            ));
        }

        let origin = match (origin, &origins, &extent) {
            (Some(origin), _, _) => Some(origin),
            (None, Some(_), _) => None,
            (None, None, Some(extent)) => Some(extent.top_left()),
            (None, None, None) => {
                return Err(MapError::InvalidTileGrid(
                    "an origin, per-zoom origins or an extent is required".to_string(),
                ))
            }
        };

        let zoom_factor = {
            let ratios: Vec<f64> = resolutions.windows(2).map(|p| p[0] / p[1]).collect();
            match ratios.first() {
                None => None,
                Some(first) if ratios.iter().all(|r| (r - first).abs() < 1e-9) => Some(*first),
                Some(_) => None,
            }
        };

        let mut grid = Self {
            resolutions,
            min_zoom,
            max_zoom,
            origin,
            origins,
            tile_size,
            tile_sizes,
            extent,
            full_tile_ranges: None,
            zoom_factor,
        };

        if let Some(extent) = grid.extent {
            let ranges = (0..=grid.max_zoom)
                .map(|z| {
                    if z < grid.min_zoom {
                        Ok(TileRange::new(0, -1, 0, -1))
                    } else {
                        grid.tile_range_for_extent_and_z(&extent, z)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            grid.full_tile_ranges = Some(ranges);
        }

        Ok(grid)
    }

    /// Power-of-two pyramid over `extent` with origin at its top-left corner
    pub fn create_xyz(extent: Extent, max_zoom: u8, tile_size: u32) -> Self {
        let max_resolution = (extent.width() / tile_size as f64).max(extent.height() / tile_size as f64);
        let resolutions: Vec<f64> = (0..=max_zoom)
            .map(|z| max_resolution / 2f64.powi(z as i32))
            .collect();
        let max_zoom = (resolutions.len() - 1) as u8;
        let full_tile_ranges = (0..=max_zoom)
            .map(|z| {
                let count_x = ((extent.width() / resolutions[z as usize] / tile_size as f64).ceil() as i32).max(1);
                let count_y = ((extent.height() / resolutions[z as usize] / tile_size as f64).ceil() as i32).max(1);
                TileRange::new(0, count_x - 1, 0, count_y - 1)
            })
            .collect();

        Self {
            resolutions,
            min_zoom: 0,
            max_zoom,
            origin: Some(extent.top_left()),
            origins: None,
            tile_size: Some((tile_size, tile_size)),
            tile_sizes: None,
            extent: Some(extent),
            full_tile_ranges: Some(full_tile_ranges),
            zoom_factor: Some(2.0),
        }
    }

    pub fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    pub fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    pub fn resolutions(&self) -> &[f64] {
        &self.resolutions
    }

    pub fn extent(&self) -> Option<&Extent> {
        self.extent.as_ref()
    }

    fn check_zoom(&self, z: u8) -> Result<usize> {
        if z < self.min_zoom || z > self.max_zoom {
            return Err(MapError::ZoomOutOfRange {
                z,
                min: self.min_zoom,
                max: self.max_zoom,
            });
        }
        Ok(z as usize)
    }

    pub fn resolution(&self, z: u8) -> Result<f64> {
        let index = self.check_zoom(z)?;
        Ok(self.resolutions[index])
    }

    pub fn origin(&self, z: u8) -> Result<Point> {
        let index = self.check_zoom(z)?;
        match (&self.origins, self.origin) {
            (Some(origins), _) => Ok(origins[index]),
            (None, Some(origin)) => Ok(origin),
            (None, None) => Err(MapError::InvalidTileGrid("grid has no origin".to_string())),
        }
    }

    /// Tile size in pixels as `(width, height)`
    pub fn tile_size(&self, z: u8) -> Result<(u32, u32)> {
        let index = self.check_zoom(z)?;
        match (&self.tile_sizes, self.tile_size) {
            (Some(sizes), _) => Ok(sizes[index]),
            (None, Some(size)) => Ok(size),
            (None, None) => Err(MapError::InvalidTileGrid("grid has no tile size".to_string())),
        }
    }

    /// Fractional tile position of `point`, before snapping
    fn fractional_tile_xy(&self, point: &Point, z: u8, resolution: f64) -> Result<(f64, f64)> {
        let origin = self.origin(z)?;
        let (tile_w, tile_h) = self.tile_size(z)?;
        let scale = self.resolution(z)? / resolution;
        let x = scale * (point.x - origin.x) / resolution / tile_w as f64;
        let y = scale * (origin.y - point.y) / resolution / tile_h as f64;
        Ok((x, y))
    }

    fn tile_xy(&self, point: &Point, z: u8, resolution: f64, reverse: bool) -> Result<(i32, i32)> {
        let (x, y) = self.fractional_tile_xy(point, z, resolution)?;
        Ok(if reverse {
            (snap(x).ceil() as i32 - 1, snap(y).ceil() as i32 - 1)
        } else {
            (snap(x).floor() as i32, snap(y).floor() as i32)
        })
    }

    /// Tile containing `point` at zoom `z`.
    ///
    /// A point on a tile boundary belongs to the tile whose left or top edge
    /// it lies on.
    pub fn tile_coord_for_coord_and_z(&self, point: &Point, z: u8) -> Result<TileCoord> {
        let resolution = self.resolution(z)?;
        let (x, y) = self.tile_xy(point, z, resolution, false)?;
        Ok(TileCoord::new(z, x, y))
    }

    /// Tile containing `point` at the zoom nearest to `resolution`
    pub fn tile_coord_for_coord_and_resolution(&self, point: &Point, resolution: f64) -> Result<TileCoord> {
        let z = self.z_for_resolution(resolution, ZoomDirection::Nearest);
        self.tile_coord_for_coord_and_z(point, z)
    }

    pub fn tile_coord_origin(&self, coord: &TileCoord) -> Result<Point> {
        let origin = self.origin(coord.z)?;
        let resolution = self.resolution(coord.z)?;
        let (tile_w, tile_h) = self.tile_size(coord.z)?;
        Ok(Point::new(
            origin.x + coord.x as f64 * tile_w as f64 * resolution,
            origin.y - coord.y as f64 * tile_h as f64 * resolution,
        ))
    }

    /// World rectangle covered by a tile
    pub fn tile_coord_extent(&self, coord: &TileCoord) -> Result<Extent> {
        let origin = self.origin(coord.z)?;
        let resolution = self.resolution(coord.z)?;
        let (tile_w, tile_h) = self.tile_size(coord.z)?;
        let min_x = origin.x + coord.x as f64 * tile_w as f64 * resolution;
        let min_y = origin.y - (coord.y as f64 + 1.0) * tile_h as f64 * resolution;
        let max_x = min_x + tile_w as f64 * resolution;
        let max_y = min_y + tile_h as f64 * resolution;
        Ok(Extent::new(min_x, min_y, max_x, max_y))
    }

    pub fn tile_coord_center(&self, coord: &TileCoord) -> Result<Point> {
        Ok(self.tile_coord_extent(coord)?.center())
    }

    pub fn tile_coord_resolution(&self, coord: &TileCoord) -> Result<f64> {
        self.resolution(coord.z)
    }

    /// Inclusive range of tiles at `z` intersecting `extent`; tiles that
    /// only touch the right or bottom edge are excluded
    pub fn tile_range_for_extent_and_z(&self, extent: &Extent, z: u8) -> Result<TileRange> {
        let resolution = self.resolution(z)?;
        let (min_x, min_y) = self.tile_xy(&extent.top_left(), z, resolution, false)?;
        let (max_x, max_y) = self.tile_xy(&extent.bottom_right(), z, resolution, true)?;
        Ok(TileRange::new(min_x, max_x, min_y, max_y))
    }

    pub fn tile_range_extent(&self, z: u8, range: &TileRange) -> Result<Extent> {
        let min = self.tile_coord_extent(&TileCoord::new(z, range.min_x, range.max_y))?;
        let max = self.tile_coord_extent(&TileCoord::new(z, range.max_x, range.min_y))?;
        Ok(Extent::new(min.min_x, min.min_y, max.max_x, max.max_y))
    }

    /// Every tile at `z`; only grids with an extent have one
    pub fn full_tile_range(&self, z: u8) -> Option<TileRange> {
        if z < self.min_zoom || z > self.max_zoom {
            return None;
        }
        self.full_tile_ranges
            .as_ref()
            .and_then(|ranges| ranges.get(z as usize).copied())
    }

    /// Zoom level for `resolution`, clamped to `[min_zoom, max_zoom]`
    pub fn z_for_resolution(&self, resolution: f64, direction: ZoomDirection) -> u8 {
        let index = find_nearest(&self.resolutions, resolution, direction) as u8;
        index.clamp(self.min_zoom, self.max_zoom)
    }

    /// Tiles at `z + 1` covering `coord`, if that zoom exists
    pub fn tile_coord_child_range(&self, coord: &TileCoord) -> Option<TileRange> {
        if coord.z >= self.max_zoom {
            return None;
        }
        if self.zoom_factor == Some(2.0) {
            let x = coord.x * 2;
            let y = coord.y * 2;
            return Some(TileRange::new(x, x + 1, y, y + 1));
        }
        let extent = self.tile_coord_extent(coord).ok()?;
        self.tile_range_for_extent_and_z(&extent, coord.z + 1).ok()
    }

    /// Calls `callback` with the range covering `coord` at each coarser zoom,
    /// finest first, until it returns `true`. Returns whether it did.
    pub fn for_each_tile_coord_parent_range<F>(&self, coord: &TileCoord, mut callback: F) -> bool
    where
        F: FnMut(u8, &TileRange) -> bool,
    {
        let Ok(extent) = self.tile_coord_extent(coord) else {
            return false;
        };
        let mut z = coord.z;
        while z > self.min_zoom {
            z -= 1;
            let range = if self.zoom_factor == Some(2.0) {
                let shift = (coord.z - z) as u32;
                let x = coord.x >> shift;
                let y = coord.y >> shift;
                TileRange::new(x, x, y, y)
            } else {
                match self.tile_range_for_extent_and_z(&extent, z) {
                    Ok(range) => range,
                    Err(_) => return false,
                }
            };
            if callback(z, &range) {
                return true;
            }
        }
        false
    }

    /// Wraps `x` into the grid's full range, for sources covering a wrapping world
    pub fn wrap_x(&self, coord: &TileCoord) -> TileCoord {
        match self.full_tile_range(coord.z) {
            Some(range) if !range.is_empty() => {
                let width = range.width() as i32;
                let x = (coord.x - range.min_x).rem_euclid(width) + range.min_x;
                TileCoord::new(coord.z, x, coord.y)
            }
            _ => *coord,
        }
    }
}

fn snap(value: f64) -> f64 {
    let factor = 10f64.powi(TILE_COORD_DECIMALS);
    (value * factor).round() / factor
}

/// Index into descending `resolutions` for `target`
fn find_nearest(resolutions: &[f64], target: f64, direction: ZoomDirection) -> usize {
    let n = resolutions.len();
    if resolutions[0] <= target {
        return 0;
    }
    if target <= resolutions[n - 1] {
        return n - 1;
    }
    for i in 1..n {
        let finer = resolutions[i];
        let coarser = resolutions[i - 1];
        match direction {
            ZoomDirection::Coarser if finer < target => return i - 1,
            ZoomDirection::Finer if finer <= target => return i,
            ZoomDirection::Nearest if finer == target => return i,
            ZoomDirection::Nearest if finer < target => {
                return if coarser - target < target - finer { i - 1 } else { i };
            }
            _ => {}
        }
    }
    n - 1
}
