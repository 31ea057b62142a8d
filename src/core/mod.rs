pub mod config;
pub mod constants;
pub mod extent;
pub mod geo;

// Re-export main types
pub use config::{
    ReprojectionConfig, SamplingMode, TileLoadingConfig, TilePerformanceOptions,
    TilePerformanceProfile,
};
pub use extent::Extent;
pub use geo::{LatLng, Point, TileCoord};
