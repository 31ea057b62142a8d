//! Engine-wide defaults for tile scheduling and reprojection.
//! Keeping them in a single place makes it easier to tweak the magic numbers.

/// Default square tile size in pixels.
pub const TILE_SIZE: u32 = 256;

/// Default maximum zoom for generated XYZ grids.
pub const DEFAULT_MAX_ZOOM: u8 = 42;

/// Default nominal capacity of a tile cache.
pub const DEFAULT_CACHE_HIGH_WATER_MARK: usize = 2048;

/// Tiles in flight across all sources.
pub const DEFAULT_MAX_TOTAL_LOADING: usize = 16;

/// Tiles started per scheduling tick.
pub const DEFAULT_MAX_NEW_LOADS: usize = 16;

/// Limits applied while the view is animating or being interacted with.
pub const INTERACTING_MAX_TOTAL_LOADING: usize = 8;
pub const INTERACTING_MAX_NEW_LOADS: usize = 2;

/// Queue priority cost of one zoom level of distance, in squared tile pixels.
pub const ZOOM_LEVEL_PRIORITY_PENALTY: f64 = 65536.0;

/// Decimal places kept when snapping fractional tile coordinates.
pub const TILE_COORD_DECIMALS: i32 = 5;

/// Extent edge samples per side used when transforming tile extents.
pub const DEFAULT_EDGE_STOPS: usize = 8;

/// Interpolation lattice spacing, in target pixels, for the warp.
pub const DEFAULT_WARP_CELL_SIZE: u32 = 8;

/// Upper bound on source tiles stitched into one reprojected tile.
pub const DEFAULT_MAX_SOURCE_TILES: usize = 100;

/// Stitch buffers kept alive in a scratch pool between warps.
pub const DEFAULT_SCRATCH_RETAINED: usize = 4;
