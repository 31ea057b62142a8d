//! Tile sources: where tiles come from and where they are cached
//!
//! A [`TileSource`] serves tiles in its own projection straight from its
//! loader, and tiles in any other projection as reprojected tiles built from
//! its own. Each projection it is viewed in gets its own cache and grid.

use super::cache::TileCache;
use super::grid::TileGrid;
use super::loader::ImageLoader;
use super::reproj::{ReprojTile, ReprojTileOptions, SourceTileFn};
use super::scratch::ScratchPool;
use super::state::TileState;
use super::tile::{Tile, TileRef};
use super::url::TileUrlFn;
use crate::core::config::ReprojectionConfig;
use crate::core::constants::DEFAULT_CACHE_HIGH_WATER_MARK;
use crate::core::geo::TileCoord;
use crate::prelude::{HashMap, HashSet};
use crate::proj::{Projection, ProjectionRegistry};
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

pub struct TileSourceOptions {
    pub projection: Arc<Projection>,
    /// Defaults to the projection's default grid
    pub tile_grid: Option<Arc<TileGrid>>,
    pub loader: Arc<dyn ImageLoader>,
    /// Without one every tile is `Empty`
    pub url_function: Option<TileUrlFn>,
    pub gutter: u32,
    pub wrap_x: bool,
    pub cache_size: usize,
    pub reprojection: ReprojectionConfig,
    pub registry: Arc<ProjectionRegistry>,
    /// Shared stitch buffers; one is created per source when absent
    pub scratch: Option<Arc<ScratchPool>>,
    /// Initial revision key
    pub key: String,
}

impl TileSourceOptions {
    pub fn new(projection: Arc<Projection>, loader: Arc<dyn ImageLoader>) -> Self {
        Self {
            projection,
            tile_grid: None,
            loader,
            url_function: None,
            gutter: 0,
            wrap_x: true,
            cache_size: DEFAULT_CACHE_HIGH_WATER_MARK,
            reprojection: ReprojectionConfig::default(),
            registry: ProjectionRegistry::global(),
            scratch: None,
            key: String::new(),
        }
    }
}

pub struct TileSource {
    uid: String,
    revision: RwLock<String>,
    projection: Arc<Projection>,
    tile_grid: Arc<TileGrid>,
    loader: Arc<dyn ImageLoader>,
    url_function: Option<TileUrlFn>,
    gutter: u32,
    wrap_x: bool,
    cache_size: usize,
    reprojection: ReprojectionConfig,
    registry: Arc<ProjectionRegistry>,
    scratch: Arc<ScratchPool>,
    caches: Mutex<HashMap<String, TileCache>>,
    grids: Mutex<HashMap<String, Arc<TileGrid>>>,
    refreshes: AtomicU64,
}

impl TileSource {
    pub fn new(options: TileSourceOptions) -> Arc<Self> {
        let tile_grid = options
            .tile_grid
            .unwrap_or_else(|| options.projection.default_tile_grid());
        let scratch = options
            .scratch
            .unwrap_or_else(|| Arc::new(ScratchPool::new(options.reprojection.scratch_retained)));
        Arc::new(Self {
            uid: format!("source-{}", NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)),
            revision: RwLock::new(options.key),
            projection: options.projection,
            tile_grid,
            loader: options.loader,
            url_function: options.url_function,
            gutter: options.gutter,
            wrap_x: options.wrap_x,
            cache_size: options.cache_size,
            reprojection: options.reprojection,
            registry: options.registry,
            scratch,
            caches: Mutex::new(HashMap::default()),
            grids: Mutex::new(HashMap::default()),
            refreshes: AtomicU64::new(0),
        })
    }

    /// Identity used to key wanted/used bookkeeping and queue entries
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn projection(&self) -> &Arc<Projection> {
        &self.projection
    }

    pub fn tile_grid(&self) -> &Arc<TileGrid> {
        &self.tile_grid
    }

    pub fn gutter(&self) -> u32 {
        self.gutter
    }

    /// Current revision key; tiles created under an older key get replaced
    pub fn key(&self) -> String {
        self.revision.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Changes the revision key. Cached tiles are replaced on their next
    /// request, keeping the old tile as the interim until the new one loads.
    pub fn set_key(&self, key: impl Into<String>) {
        let key = key.into();
        let mut revision = self.revision.write().unwrap_or_else(|e| e.into_inner());
        if *revision != key {
            log::debug!("source {} revision {} -> {}", self.uid, *revision, key);
            *revision = key;
        }
    }

    /// Reloads every tile while still showing the current ones
    pub fn refresh(&self) {
        let n = self.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        let base = self.key();
        let base = base.split('#').next().unwrap_or_default().to_string();
        self.set_key(format!("{}#{}", base, n));
    }

    fn is_native(&self, projection: &Projection) -> bool {
        self.registry.equivalent(projection, &self.projection)
    }

    fn cache_key(&self, projection: &Projection) -> String {
        self.registry.canonical(projection.code())
    }

    fn cache_for(&self, projection: &Projection) -> TileCache {
        let key = self.cache_key(projection);
        self.caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert_with(|| TileCache::new(self.cache_size))
            .clone()
    }

    /// The cache holding tiles for `projection`
    pub fn tile_cache(&self, projection: &Projection) -> TileCache {
        self.cache_for(projection)
    }

    /// Grid tiles are addressed in when viewed in `projection`
    pub fn tile_grid_for_projection(&self, projection: &Projection) -> Arc<TileGrid> {
        if self.is_native(projection) {
            return self.tile_grid.clone();
        }
        self.grids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(self.cache_key(projection))
            .or_insert_with(|| projection.default_tile_grid())
            .clone()
    }

    /// Overrides the grid reprojected tiles use in `projection`
    pub fn set_tile_grid_for_projection(&self, projection: &Projection, grid: Arc<TileGrid>) {
        if self.is_native(projection) {
            log::warn!("ignoring grid override for native projection {}", projection.code());
            return;
        }
        self.grids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.cache_key(projection), grid);
    }

    /// The tile at `(z, x, y)` in `projection`, cached and reused.
    ///
    /// Repeated requests return the same tile object until it is evicted or
    /// the revision key changes.
    pub fn get_tile(
        self: &Arc<Self>,
        z: u8,
        x: i32,
        y: i32,
        pixel_ratio: f64,
        projection: &Arc<Projection>,
    ) -> Result<TileRef> {
        if self.is_native(projection) {
            return self.get_native_tile(z, x, y, pixel_ratio);
        }

        let coord = TileCoord::new(z, x, y);
        let key = coord.key();
        let revision = self.key();
        let cache = self.cache_for(projection);
        let cached = cache.get(&key);
        if let Some(tile) = &cached {
            if tile.key() == revision {
                return Ok(tile.clone());
            }
        }

        let target_grid = self.tile_grid_for_projection(projection);
        target_grid.resolution(z)?;
        let transform = self.registry.get_transform(projection, &self.projection)?;
        let wrapped_coord = if self.wrap_x && projection.can_wrap_x() {
            target_grid.wrap_x(&coord)
        } else {
            coord
        };

        let weak = Arc::downgrade(self);
        let fetch: SourceTileFn = Arc::new(move |z, x, y, pixel_ratio| match weak.upgrade() {
            Some(source) => source.get_native_tile(z, x, y, pixel_ratio),
            None => Err(crate::MapError::Load("tile source dropped".to_string())),
        });

        let tile = ReprojTile::create(ReprojTileOptions {
            source_projection: self.projection.clone(),
            source_grid: self.tile_grid.clone(),
            target_projection: projection.clone(),
            target_grid,
            coord,
            wrapped_coord,
            pixel_ratio,
            gutter: self.gutter,
            transform,
            fetch,
            config: self.reprojection.clone(),
            scratch: self.scratch.clone(),
            key: revision,
        });
        self.install(&cache, &key, tile.clone(), cached);
        Ok(tile)
    }

    fn get_native_tile(&self, z: u8, x: i32, y: i32, pixel_ratio: f64) -> Result<TileRef> {
        let coord = TileCoord::new(z, x, y);
        let key = coord.key();
        let revision = self.key();
        let cache = self.cache_for(&self.projection);
        let cached = cache.get(&key);
        if let Some(tile) = &cached {
            if tile.key() == revision {
                return Ok(tile.clone());
            }
        }

        let tile = self.create_tile(coord, pixel_ratio, revision)?;
        self.install(&cache, &key, tile.clone(), cached);
        Ok(tile)
    }

    fn create_tile(&self, coord: TileCoord, pixel_ratio: f64, revision: String) -> Result<TileRef> {
        self.tile_grid.resolution(coord.z)?;
        let url_coord = self.url_coord(&coord);
        let src = match (&self.url_function, url_coord) {
            (Some(url), Some(url_coord)) => url(&url_coord, pixel_ratio, &self.projection),
            _ => None,
        };
        Ok(Tile::new_image(coord, revision, src, self.loader.clone()))
    }

    /// Coordinate used to build the URL: wrapped on global sources, `None`
    /// outside the grid's extent
    fn url_coord(&self, coord: &TileCoord) -> Option<TileCoord> {
        let coord = if self.wrap_x && self.projection.can_wrap_x() {
            self.tile_grid.wrap_x(coord)
        } else {
            *coord
        };
        match self.tile_grid.full_tile_range(coord.z) {
            Some(range) if !range.contains(&coord) => None,
            _ => Some(coord),
        }
    }

    /// Puts `tile` in the cache, chaining any stale tile it replaces as its
    /// interim
    fn install(&self, cache: &TileCache, key: &str, tile: TileRef, stale: Option<TileRef>) {
        match stale {
            Some(old) => {
                if old.state() != TileState::Idle {
                    tile.set_interim(Some(old));
                    tile.refresh_interim_chain();
                } else {
                    old.dispose();
                }
                cache.replace(key, tile);
            }
            None => {
                cache.set(key, tile);
            }
        }
    }

    /// Marks a tile as recently used without creating it.
    /// Returns whether it was cached.
    pub fn use_tile(&self, z: u8, x: i32, y: i32, projection: &Projection) -> bool {
        self.cache_for(projection)
            .get(&TileCoord::new(z, x, y).key())
            .is_some()
    }

    pub fn can_expire_cache(&self) -> bool {
        self.caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|cache| cache.can_expire_cache())
    }

    /// Expires the cache for `projection` keeping `used`; caches of other
    /// projections keep nothing.
    pub fn expire_cache(&self, projection: &Projection, used: &HashSet<String>) {
        let current = self.cache_key(projection);
        let caches: Vec<(String, TileCache)> = self
            .caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(key, cache)| (key.clone(), cache.clone()))
            .collect();
        let nothing = HashSet::default();
        for (key, cache) in caches {
            cache.expire_cache(if key == current { used } else { &nothing });
        }
    }

    /// Grows the cache for `projection` so `tile_count` tiles fit twice over
    pub fn update_cache_size(&self, tile_count: usize, projection: &Projection) {
        let cache = self.cache_for(projection);
        let wanted = tile_count.saturating_mul(2);
        if wanted > cache.high_water_mark() {
            log::debug!(
                "growing {} cache for {} to {}",
                self.uid,
                projection.code(),
                wanted
            );
            cache.set_high_water_mark(wanted);
        }
    }

    /// Disposes every cached tile in every projection
    pub fn clear(&self) {
        let caches: Vec<TileCache> = self
            .caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for cache in caches {
            cache.clear();
        }
    }
}

impl std::fmt::Debug for TileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileSource")
            .field("uid", &self.uid)
            .field("projection", &self.projection.code())
            .field("key", &self.key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::extent::Extent;
    use crate::core::geo::Point;
    use crate::proj::Units;
    use crate::tiles::grid::TileGridOptions;
    use crate::tiles::loader::ManualImageLoader;
    use crate::tiles::url::url_template;
    use image::RgbaImage;

    fn mercator_source(loader: &Arc<ManualImageLoader>) -> Arc<TileSource> {
        let projection = Arc::new(Projection::web_mercator());
        let grid = projection.default_tile_grid();
        let mut options = TileSourceOptions::new(projection, loader.clone());
        options.url_function = Some(url_template("{z}/{x}/{y}", grid).unwrap());
        TileSource::new(options)
    }

    #[test]
    fn test_same_tile_object_per_coordinate() {
        let loader = Arc::new(ManualImageLoader::new());
        let source = mercator_source(&loader);
        let proj = source.projection().clone();
        let a = source.get_tile(2, 1, 1, 1.0, &proj).unwrap();
        let b = source.get_tile(2, 1, 1, 1.0, &proj).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.tile_cache(&proj).len(), 1);
    }

    #[test]
    fn test_x_wraps_for_urls() {
        let loader = Arc::new(ManualImageLoader::new());
        let source = mercator_source(&loader);
        let proj = source.projection().clone();
        let tile = source.get_tile(1, 3, 0, 1.0, &proj).unwrap();
        assert_eq!(tile.coord(), TileCoord::new(1, 3, 0));
        tile.load();
        assert_eq!(loader.requests(), vec!["1/1/0".to_string()]);
    }

    #[test]
    fn test_outside_rows_are_empty() {
        let loader = Arc::new(ManualImageLoader::new());
        let source = mercator_source(&loader);
        let proj = source.projection().clone();
        let tile = source.get_tile(1, 0, 5, 1.0, &proj).unwrap();
        assert_eq!(tile.state(), TileState::Empty);
    }

    #[test]
    fn test_no_url_function_gives_empty_tiles() {
        let loader = Arc::new(ManualImageLoader::new());
        let source = TileSource::new(TileSourceOptions::new(
            Arc::new(Projection::web_mercator()),
            loader,
        ));
        let proj = source.projection().clone();
        assert_eq!(source.get_tile(0, 0, 0, 1.0, &proj).unwrap().state(), TileState::Empty);
    }

    #[test]
    fn test_key_change_keeps_interim() {
        let loader = Arc::new(ManualImageLoader::new());
        let source = mercator_source(&loader);
        let proj = source.projection().clone();
        let old = source.get_tile(1, 0, 0, 1.0, &proj).unwrap();
        old.load();
        loader.resolve("1/0/0", RgbaImage::new(2, 2));

        source.refresh();
        let fresh = source.get_tile(1, 0, 0, 1.0, &proj).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.state(), TileState::Idle);
        assert!(Arc::ptr_eq(&fresh.interim_tile(), &old));
        assert!(Arc::ptr_eq(&source.get_tile(1, 0, 0, 1.0, &proj).unwrap(), &fresh));
    }

    #[test]
    fn test_reprojected_tiles_use_their_own_cache() {
        let loader = Arc::new(ManualImageLoader::new());
        let source = mercator_source(&loader);
        let wgs84 = Arc::new(Projection::wgs84());
        let tile = source.get_tile(1, 1, 0, 1.0, &wgs84).unwrap();
        assert!(tile.is_reprojected());
        assert_eq!(source.tile_cache(&wgs84).len(), 1);
        let native = source.tile_cache(source.projection());
        assert!(native.len() >= 1);

        let again = source.get_tile(1, 1, 0, 1.0, &wgs84).unwrap();
        assert!(Arc::ptr_eq(&tile, &again));
    }

    #[test]
    fn test_missing_transform_is_an_error() {
        let loader = Arc::new(ManualImageLoader::new());
        let source = mercator_source(&loader);
        let other = Arc::new(Projection::new(
            "EPSG:27700",
            Units::Meters,
            Some(Extent::new(0.0, 0.0, 700000.0, 1300000.0)),
        ));
        assert!(matches!(
            source.get_tile(0, 0, 0, 1.0, &other),
            Err(crate::MapError::MissingTransform { .. })
        ));
    }

    #[test]
    fn test_update_cache_size_only_grows() {
        let loader = Arc::new(ManualImageLoader::new());
        let mut options = TileSourceOptions::new(Arc::new(Projection::web_mercator()), loader);
        options.cache_size = 10;
        let source = TileSource::new(options);
        let proj = source.projection().clone();
        source.update_cache_size(20, &proj);
        assert_eq!(source.tile_cache(&proj).high_water_mark(), 40);
        source.update_cache_size(3, &proj);
        assert_eq!(source.tile_cache(&proj).high_water_mark(), 40);
    }

    #[test]
    fn test_expire_and_clear() {
        let loader = Arc::new(ManualImageLoader::new());
        let projection = Arc::new(Projection::new("PIXELS", Units::Pixels, None));
        let grid = Arc::new(
            TileGrid::new(TileGridOptions {
                resolutions: vec![1.0],
                origin: Some(Point::new(0.0, 0.0)),
                tile_size: Some((256, 256)),
                ..Default::default()
            })
            .unwrap(),
        );
        let mut options = TileSourceOptions::new(projection.clone(), loader.clone());
        options.tile_grid = Some(grid.clone());
        options.cache_size = 2;
        options.url_function = Some(url_template("{x}/{y}", grid).unwrap());
        let source = TileSource::new(options);

        let tiles: Vec<TileRef> = (0..4)
            .map(|x| source.get_tile(0, x, 0, 1.0, &projection).unwrap())
            .collect();
        assert!(source.can_expire_cache());

        let used: HashSet<String> = ["0:3:0".to_string()].into_iter().collect();
        source.expire_cache(&projection, &used);
        assert!(!source.can_expire_cache());
        assert_eq!(tiles[0].state(), TileState::Abort);

        source.clear();
        assert!(tiles.iter().all(|t| t.state() == TileState::Abort));
        assert!(source.tile_cache(&projection).is_empty());
    }
}
