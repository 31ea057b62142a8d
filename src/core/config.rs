//! Configuration for tile scheduling and reprojection
//!
//! Options can be picked from a preset profile, tuned field by field, or
//! loaded from JSON.

use crate::core::constants::*;
use crate::{MapError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TilePerformanceProfile {
    Balanced,
    LowResource,
    HighThroughput,
    Custom(TilePerformanceOptions),
}

impl TilePerformanceProfile {
    pub fn resolve(&self) -> TilePerformanceOptions {
        match self {
            Self::Balanced => TilePerformanceOptions::default(),
            Self::LowResource => TilePerformanceOptions {
                loading: TileLoadingConfig {
                    cache_high_water_mark: 256,
                    max_total_loading: 4,
                    max_new_loads: 2,
                    interacting_max_total_loading: 2,
                    interacting_max_new_loads: 1,
                    preload: 0,
                },
                reprojection: ReprojectionConfig {
                    warp_cell_size: 16,
                    edge_stops: 4,
                    max_source_tiles: 32,
                    sampling: SamplingMode::Nearest,
                    scratch_retained: 1,
                },
            },
            Self::HighThroughput => TilePerformanceOptions {
                loading: TileLoadingConfig {
                    cache_high_water_mark: 8192,
                    max_total_loading: 64,
                    max_new_loads: 32,
                    interacting_max_total_loading: 16,
                    interacting_max_new_loads: 8,
                    preload: 2,
                },
                reprojection: ReprojectionConfig {
                    warp_cell_size: 4,
                    edge_stops: 16,
                    max_source_tiles: 256,
                    sampling: SamplingMode::Bilinear,
                    scratch_retained: 8,
                },
            },
            Self::Custom(options) => options.clone(),
        }
    }
}

impl Default for TilePerformanceProfile {
    fn default() -> Self {
        Self::Balanced
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TilePerformanceOptions {
    pub loading: TileLoadingConfig,
    pub reprojection: ReprojectionConfig,
}

impl TilePerformanceOptions {
    /// Parses options from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        self.loading.validate()?;
        self.reprojection.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileLoadingConfig {
    /// Nominal tile cache capacity; exceeded transiently while tiles are in use
    pub cache_high_water_mark: usize,
    pub max_total_loading: usize,
    pub max_new_loads: usize,
    pub interacting_max_total_loading: usize,
    pub interacting_max_new_loads: usize,
    /// Coarser zoom levels below the current one whose tiles are fetched
    pub preload: u8,
}

impl TileLoadingConfig {
    /// `(max_total_loading, max_new_loads)` for the current view hints
    pub fn load_limits(&self, animating_or_interacting: bool) -> (usize, usize) {
        if animating_or_interacting {
            (
                self.interacting_max_total_loading,
                self.interacting_max_new_loads,
            )
        } else {
            (self.max_total_loading, self.max_new_loads)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_high_water_mark == 0 {
            return Err(MapError::Config(
                "cache_high_water_mark must be positive".to_string(),
            ));
        }
        if self.max_total_loading == 0 || self.max_new_loads == 0 {
            return Err(MapError::Config(
                "load limits must allow at least one tile".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TileLoadingConfig {
    fn default() -> Self {
        Self {
            cache_high_water_mark: DEFAULT_CACHE_HIGH_WATER_MARK,
            max_total_loading: DEFAULT_MAX_TOTAL_LOADING,
            max_new_loads: DEFAULT_MAX_NEW_LOADS,
            interacting_max_total_loading: INTERACTING_MAX_TOTAL_LOADING,
            interacting_max_new_loads: INTERACTING_MAX_NEW_LOADS,
            preload: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMode {
    Nearest,
    Bilinear,
}

impl Default for SamplingMode {
    fn default() -> Self {
        Self::Nearest
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReprojectionConfig {
    /// Spacing of the exactly transformed lattice; 1 transforms every pixel
    pub warp_cell_size: u32,
    /// Samples per extent edge when transforming tile extents
    pub edge_stops: usize,
    /// Reprojected tiles needing more source tiles than this fail
    pub max_source_tiles: usize,
    pub sampling: SamplingMode,
    /// Stitch buffers the scratch pool keeps between warps
    pub scratch_retained: usize,
}

impl ReprojectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.warp_cell_size == 0 {
            return Err(MapError::Config(
                "warp_cell_size must be at least 1".to_string(),
            ));
        }
        if self.max_source_tiles == 0 {
            return Err(MapError::Config(
                "max_source_tiles must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ReprojectionConfig {
    fn default() -> Self {
        Self {
            warp_cell_size: DEFAULT_WARP_CELL_SIZE,
            edge_stops: DEFAULT_EDGE_STOPS,
            max_source_tiles: DEFAULT_MAX_SOURCE_TILES,
            sampling: SamplingMode::Nearest,
            scratch_retained: DEFAULT_SCRATCH_RETAINED,
        }
    }
}
