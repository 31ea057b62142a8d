//! Prelude module for common tilewarp types and traits
//!
//! This module re-exports the most commonly used types, traits, and functions
//! for easy importing with `use tilewarp::prelude::*;`

pub use crate::core::{
    config::{
        ReprojectionConfig, SamplingMode, TileLoadingConfig, TilePerformanceOptions,
        TilePerformanceProfile,
    },
    extent::Extent,
    geo::{LatLng, Point, TileCoord},
};

pub use crate::proj::{identity_transform, Projection, ProjectionRegistry, TransformFn, Units};

pub use crate::tiles::{
    fn_loader, manage_tile_pyramid, schedule_expire_cache, url_template, FnImageLoader,
    FrameState, ImageLoader, LoadCompletion, ManualImageLoader, ReprojTile, ScratchPool, Tile,
    TileCache, TileGrid, TileGridOptions, TileQueue, TileRange, TileRef, TileScheduler,
    TileSource, TileSourceOptions, TileState, ViewHints, ViewState, ZoomDirection,
};

#[cfg(feature = "http")]
pub use crate::tiles::HttpImageLoader;

pub use crate::{Error as MapError, Result};

pub use std::sync::Arc;

pub use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet, FxHasher};
