//! Per-frame tile pyramid management
//!
//! Every rendered frame opens a [`FrameState`], walks the pyramid of each
//! tile layer with [`manage_tile_pyramid`] and closes the frame with
//! [`FrameState::finish`]. Walking only records and enqueues; loads start in
//! `finish`, bounded by the configured limits, and cache expiration runs last
//! as a post-render callback.

use super::grid::{TileGrid, ZoomDirection};
use super::queue::{tile_priority, QueueEntry, TileQueue, DROP};
use super::source::TileSource;
use super::state::TileState;
use super::tile::TileRef;
use crate::core::config::TileLoadingConfig;
use crate::core::extent::Extent;
use crate::core::geo::{Point, TileCoord};
use crate::prelude::{HashMap, HashSet};
use crate::proj::Projection;
use crate::Result;
use std::sync::Arc;

/// What the view is doing; loads are throttled harder while it moves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewHints {
    pub animating: bool,
    pub interacting: bool,
}

impl ViewHints {
    pub fn is_moving(&self) -> bool {
        self.animating || self.interacting
    }
}

#[derive(Debug, Clone)]
pub struct ViewState {
    pub center: Point,
    /// Projection units per CSS pixel
    pub resolution: f64,
    pub projection: Arc<Projection>,
    pub pixel_ratio: f64,
    /// Visible extent in projection units
    pub extent: Extent,
    pub hints: ViewHints,
}

impl ViewState {
    /// View of `size` CSS pixels centered on `center`
    pub fn new(
        center: Point,
        resolution: f64,
        projection: Arc<Projection>,
        size: (u32, u32),
        pixel_ratio: f64,
    ) -> Self {
        let extent = Extent::from_center_and_size(
            center,
            size.0 as f64 * resolution,
            size.1 as f64 * resolution,
        );
        Self {
            center,
            resolution,
            projection,
            pixel_ratio,
            extent,
            hints: ViewHints::default(),
        }
    }

    pub fn with_hints(mut self, hints: ViewHints) -> Self {
        self.hints = hints;
        self
    }
}

type PostRenderFn = Box<dyn FnOnce(&FrameState<'_>)>;

/// Bookkeeping for one render pass
pub struct FrameState<'q> {
    pub view: ViewState,
    pub queue: &'q mut TileQueue,
    /// Idle tiles each source wants loaded, by source uid then tile key
    pub wanted_tiles: HashMap<String, HashSet<String>>,
    /// Tiles each source must keep cached, by source uid then tile key
    pub used_tiles: HashMap<String, HashSet<String>>,
    load_limits: (usize, usize),
    preload: u8,
    post_render: Vec<PostRenderFn>,
}

impl<'q> FrameState<'q> {
    pub fn new(view: ViewState, queue: &'q mut TileQueue, loading: &TileLoadingConfig) -> Self {
        let load_limits = loading.load_limits(view.hints.is_moving());
        Self {
            view,
            queue,
            wanted_tiles: HashMap::default(),
            used_tiles: HashMap::default(),
            load_limits,
            preload: loading.preload,
            post_render: Vec::new(),
        }
    }

    /// `(max_total_loading, max_new_loads)` for this frame
    pub fn load_limits(&self) -> (usize, usize) {
        self.load_limits
    }

    /// Coarser levels fetched below the current zoom
    pub fn preload(&self) -> u8 {
        self.preload
    }

    /// Walks `source` for this frame's view at the zoom nearest the view
    /// resolution, then schedules its cache expiration
    pub fn render_source(
        &mut self,
        source: &Arc<TileSource>,
        tile_callback: Option<&mut dyn FnMut(&TileRef)>,
    ) -> Result<usize> {
        let projection = self.view.projection.clone();
        let grid = source.tile_grid_for_projection(&projection);
        let z = grid.z_for_resolution(self.view.resolution, ZoomDirection::Nearest);
        let extent = self.view.extent;
        let pixel_ratio = self.view.pixel_ratio;
        let preload = self.preload;
        let count = manage_tile_pyramid(
            self,
            source,
            &grid,
            pixel_ratio,
            &projection,
            &extent,
            z,
            preload,
            tile_callback,
        )?;
        schedule_expire_cache(self, source);
        Ok(count)
    }

    pub fn is_wanted(&self, source_key: &str, tile_key: &str) -> bool {
        self.wanted_tiles
            .get(source_key)
            .map_or(false, |keys| keys.contains(tile_key))
    }

    pub fn is_used(&self, source_key: &str, tile_key: &str) -> bool {
        self.used_tiles
            .get(source_key)
            .map_or(false, |keys| keys.contains(tile_key))
    }

    /// Marks a tile as displayed, protecting it from cache expiration
    pub fn use_tile(&mut self, source_key: &str, coord: &TileCoord) {
        self.used_tiles
            .entry(source_key.to_string())
            .or_default()
            .insert(coord.key());
    }

    /// Runs after the frame's loads are scheduled, in registration order
    pub fn add_post_render<F>(&mut self, callback: F)
    where
        F: FnOnce(&FrameState<'_>) + 'static,
    {
        self.post_render.push(Box::new(callback));
    }

    pub fn tile_priority(&self, entry: &QueueEntry) -> f64 {
        frame_tile_priority(&self.view, &self.wanted_tiles, entry)
    }

    /// Ends the frame: reprioritizes the queue for this view, starts loads
    /// within the frame's limits and runs post-render callbacks.
    /// Returns how many loads were started.
    pub fn finish(mut self) -> usize {
        let view = &self.view;
        let wanted = &self.wanted_tiles;
        self.queue
            .reprioritize(|entry| frame_tile_priority(view, wanted, entry));

        let (max_total, max_new) = self.load_limits;
        let started = self.queue.load_more_tiles(max_total, max_new);

        let callbacks = std::mem::take(&mut self.post_render);
        for callback in callbacks {
            callback(&self);
        }
        started
    }
}

/// Queue priority for `entry` in a frame; [`DROP`] once the tile is no
/// longer wanted by its source
pub fn frame_tile_priority(
    view: &ViewState,
    wanted: &HashMap<String, HashSet<String>>,
    entry: &QueueEntry,
) -> f64 {
    let is_wanted = wanted
        .get(&entry.source_key)
        .map_or(false, |keys| keys.contains(&entry.tile.coord_key()));
    if !is_wanted {
        return DROP;
    }
    tile_priority(view.center, view.resolution, entry)
}

/// Walks the tile pyramid of `source` for one frame.
///
/// For each zoom from the grid's minimum up to `current_z`, every tile
/// intersecting `extent` is marked used. Tiles no more than `preload` levels
/// below `current_z` are also fetched from the source; idle ones are marked
/// wanted and queued, and every fetched tile is passed to `tile_callback`.
/// Deeper levels only refresh cache recency.
#[allow(clippy::too_many_arguments)]
pub fn manage_tile_pyramid(
    frame: &mut FrameState<'_>,
    source: &Arc<TileSource>,
    grid: &TileGrid,
    pixel_ratio: f64,
    projection: &Arc<Projection>,
    extent: &Extent,
    current_z: u8,
    preload: u8,
    mut tile_callback: Option<&mut dyn FnMut(&TileRef)>,
) -> Result<usize> {
    let source_key = source.uid().to_string();
    let FrameState {
        view,
        queue,
        wanted_tiles,
        used_tiles,
        ..
    } = frame;
    let wanted = wanted_tiles.entry(source_key.clone()).or_default();
    let used = used_tiles.entry(source_key.clone()).or_default();

    let mut tile_count = 0;
    let mut queued = 0;
    if current_z >= grid.min_zoom() {
        for z in grid.min_zoom()..=current_z {
            let range = grid.tile_range_for_extent_and_z(extent, z)?;
            let resolution = grid.resolution(z)?;
            for (x, y) in range.iter() {
                let coord = TileCoord::new(z, x, y);
                used.insert(coord.key());

                if current_z - z > preload {
                    source.use_tile(z, x, y, projection);
                    continue;
                }

                tile_count += 1;
                let tile = source.get_tile(z, x, y, pixel_ratio, projection)?;
                if tile.state() == TileState::Idle {
                    wanted.insert(coord.key());
                    let entry = QueueEntry::new(
                        tile.clone(),
                        source_key.as_str(),
                        grid.tile_coord_center(&coord)?,
                        resolution,
                    );
                    if !queue.is_key_queued(&entry.key()) {
                        let priority = tile_priority(view.center, view.resolution, &entry);
                        if queue.enqueue(entry, priority) {
                            queued += 1;
                        }
                    }
                }
                if let Some(callback) = tile_callback.as_mut() {
                    callback(&tile);
                }
            }
        }
    }

    source.update_cache_size(tile_count, projection);
    log::trace!(
        "pyramid for {} up to z{}: {} tiles, {} queued",
        source_key,
        current_z,
        tile_count,
        queued
    );
    Ok(tile_count)
}

/// Registers a post-render pass expiring `source`'s caches, keeping the
/// tiles this frame used. Does nothing when no cache is over its limit.
pub fn schedule_expire_cache(frame: &mut FrameState<'_>, source: &Arc<TileSource>) {
    if !source.can_expire_cache() {
        return;
    }
    let source = source.clone();
    frame.add_post_render(move |frame| {
        let nothing = HashSet::default();
        let used = frame.used_tiles.get(source.uid()).unwrap_or(&nothing);
        source.expire_cache(&frame.view.projection, used);
    });
}

/// Owns the tile queue across frames and opens a [`FrameState`] per frame
#[derive(Debug, Default)]
pub struct TileScheduler {
    queue: TileQueue,
    loading: TileLoadingConfig,
}

impl TileScheduler {
    pub fn new(loading: TileLoadingConfig) -> Self {
        Self {
            queue: TileQueue::new(),
            loading,
        }
    }

    pub fn config(&self) -> &TileLoadingConfig {
        &self.loading
    }

    pub fn queue(&self) -> &TileQueue {
        &self.queue
    }

    pub fn frame(&mut self, view: ViewState) -> FrameState<'_> {
        FrameState::new(view, &mut self.queue, &self.loading)
    }
}
