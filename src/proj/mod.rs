//! Projection boundary consumed by the tile subsystem
//!
//! The tile code never does projection math itself; it only needs a
//! projection's code, extent and units plus an opaque transform between two
//! projections. The registry ships the EPSG:4326 / EPSG:3857 pair and accepts
//! any other transform from the embedder.

pub mod registry;

pub use registry::{identity_transform, ProjectionRegistry, TransformFn};

use crate::core::constants::{DEFAULT_MAX_ZOOM, TILE_SIZE};
use crate::core::extent::Extent;
use crate::core::geo::EARTH_RADIUS;
use crate::tiles::grid::TileGrid;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

/// Half the width of the EPSG:3857 world square.
pub const MERCATOR_HALF_SIZE: f64 = PI * EARTH_RADIUS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    Degrees,
    Meters,
    Pixels,
}

impl Units {
    /// Meters per unit, when the unit has a fixed ground size
    pub fn meters_per_unit(&self) -> Option<f64> {
        match self {
            Units::Degrees => Some(2.0 * PI * EARTH_RADIUS / 360.0),
            Units::Meters => Some(1.0),
            Units::Pixels => None,
        }
    }
}

/// A coordinate reference system as seen by the tile subsystem.
///
/// The default tile grid is created on first use and cached on the
/// projection, so every source asking for a grid in this projection shares
/// the same instance.
#[derive(Debug)]
pub struct Projection {
    code: String,
    units: Units,
    extent: Option<Extent>,
    global: bool,
    default_tile_grid: OnceCell<Arc<TileGrid>>,
}

impl Projection {
    pub fn new(code: impl Into<String>, units: Units, extent: Option<Extent>) -> Self {
        Self {
            code: code.into(),
            units,
            extent,
            global: false,
            default_tile_grid: OnceCell::new(),
        }
    }

    /// Marks the projection as covering the whole world, so x can wrap
    pub fn with_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    /// Web Mercator (EPSG:3857)
    pub fn web_mercator() -> Self {
        Self::new(
            "EPSG:3857",
            Units::Meters,
            Some(Extent::new(
                -MERCATOR_HALF_SIZE,
                -MERCATOR_HALF_SIZE,
                MERCATOR_HALF_SIZE,
                MERCATOR_HALF_SIZE,
            )),
        )
        .with_global(true)
    }

    /// Geographic WGS 84 with longitude as x (EPSG:4326)
    pub fn wgs84() -> Self {
        Self::new(
            "EPSG:4326",
            Units::Degrees,
            Some(Extent::new(-180.0, -90.0, 180.0, 90.0)),
        )
        .with_global(true)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn extent(&self) -> Option<&Extent> {
        self.extent.as_ref()
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn can_wrap_x(&self) -> bool {
        self.global && self.extent.is_some()
    }

    pub fn meters_per_unit(&self) -> Option<f64> {
        self.units.meters_per_unit()
    }

    /// XYZ-style grid covering the projection extent, created once.
    ///
    /// Projections without an extent get a grid over a 256 unit square
    /// around the origin, which is only useful for pixel-space data.
    pub fn default_tile_grid(&self) -> Arc<TileGrid> {
        self.default_tile_grid
            .get_or_init(|| {
                let extent = self
                    .extent
                    .unwrap_or_else(|| Extent::new(-128.0, -128.0, 128.0, 128.0));
                Arc::new(TileGrid::create_xyz(extent, DEFAULT_MAX_ZOOM, TILE_SIZE))
            })
            .clone()
    }
}

impl PartialEq for Projection {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}
