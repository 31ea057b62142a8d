//! # tilewarp
//!
//! Tile pyramid management and raster tile reprojection for map engines.
//!
//! The crate decides which tiles a view needs, loads them with bounded
//! concurrency, keeps recently shown tiles in per-projection LRU caches and
//! serves tiles in projections other than their source's by warping source
//! tiles through a coordinate transform. Rendering, projection math beyond
//! EPSG:4326/3857 and network I/O are left to the embedder; the
//! [`tiles::ImageLoader`] and [`proj::ProjectionRegistry`] seams are where
//! they plug in.

pub mod core;
pub mod prelude;
pub mod proj;
pub mod tiles;
pub use crate::core::constants;

// Re-export public API
pub use crate::core::{Extent, LatLng, Point, TileCoord};
pub use proj::{Projection, ProjectionRegistry};
pub use tiles::{
    manage_tile_pyramid, FrameState, ReprojTile, Tile, TileCache, TileGrid, TileQueue,
    TileScheduler, TileSource, TileState,
};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, MapError>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "http")]
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Invalid tile grid: {0}")]
    InvalidTileGrid(String),

    #[error("Zoom {z} outside grid range {min}..={max}")]
    ZoomOutOfRange { z: u8, min: u8, max: u8 },

    #[error("Tile grid has no extent")]
    MissingExtent,

    #[error("Unknown projection: {0}")]
    UnknownProjection(String),

    #[error("No transform from {from} to {to}")]
    MissingTransform { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Tile load failed: {0}")]
    Load(String),
}

/// Error type alias for convenience
pub type Error = MapError;
