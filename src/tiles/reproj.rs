//! Reprojected tiles
//!
//! A reprojected tile covers one tile of the *target* grid. At construction it
//! works out which *source* tiles cover the same ground, fetched through a
//! callback bound to the originating source. Loading it loads those tiles.
//! Once every one of them has settled, the loaded ones are stitched onto a
//! scratch canvas, and each output pixel is mapped back through the
//! target-to-source transform to sample that canvas.
//!
//! Source tiles that fail leave transparent holes; only a tile with no usable
//! source at all ends up `Error` (or `Empty` when there was nothing to fetch).
//! Output pixels whose source point falls outside the source grid or
//! projection stay transparent too.
//!
//! The source tiles are retained from planning until the warp finishes or the
//! tile is disposed, so cache expiration cannot drop them while the tile sits
//! in the queue.

use super::grid::{TileGrid, TileRange, ZoomDirection};
use super::scratch::ScratchPool;
use super::state::TileState;
use super::tile::{ListenerKey, Tile, TileKind, TileRef};
use crate::core::config::{ReprojectionConfig, SamplingMode};
use crate::core::extent::Extent;
use crate::core::geo::{Point, TileCoord};
use crate::proj::{Projection, TransformFn};
use crate::{MapError, Result};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Fetches the source tile `(z, x, y)` at a pixel ratio
pub type SourceTileFn = Arc<dyn Fn(u8, i32, i32, f64) -> Result<TileRef> + Send + Sync>;

/// Everything a reprojected tile needs at construction
pub struct ReprojTileOptions {
    pub source_projection: Arc<Projection>,
    pub source_grid: Arc<TileGrid>,
    pub target_projection: Arc<Projection>,
    pub target_grid: Arc<TileGrid>,
    /// Coordinate the tile is cached under
    pub coord: TileCoord,
    /// Coordinate used for planning, after x wrapping
    pub wrapped_coord: TileCoord,
    pub pixel_ratio: f64,
    /// Border pixels around each source tile image
    pub gutter: u32,
    /// Maps target coordinates to source coordinates
    pub transform: TransformFn,
    pub fetch: SourceTileFn,
    pub config: ReprojectionConfig,
    pub scratch: Arc<ScratchPool>,
    /// Revision key of the owning source
    pub key: String,
}

#[derive(Clone)]
struct SourceTile {
    tile: TileRef,
    coord: TileCoord,
    extent: Extent,
}

struct WarpPlan {
    /// Full target tile extent, mapped onto the whole output
    target_extent: Extent,
    /// Part of the target extent inside the target projection and grid
    valid_extent: Extent,
    output_size: (u32, u32),
    source_z: u8,
    source_range: TileRange,
    source_resolution: f64,
    /// Area of the source grid and projection; source points outside it
    /// are not sampled
    source_limit: Option<Extent>,
    /// Interior pixel size of one source tile image
    source_tile_px: (u32, u32),
}

enum Planned {
    Ready(WarpPlan, Vec<SourceTile>),
    /// Nothing to fetch; carries the output size when it is known
    Empty(Option<(u32, u32)>),
}

pub struct ReprojTile {
    plan: Option<WarpPlan>,
    sources: Mutex<Vec<SourceTile>>,
    /// Whether `sources` currently hold a retain from this tile
    retained: AtomicBool,
    /// Listener keys on `sources`, present while waiting on them
    watching: Mutex<Vec<ListenerKey>>,
    finished: AtomicBool,
    fetch: SourceTileFn,
    transform: TransformFn,
    config: ReprojectionConfig,
    scratch: Arc<ScratchPool>,
    pixel_ratio: f64,
    gutter: u32,
}

fn scaled(size: u32, pixel_ratio: f64) -> u32 {
    ((size as f64 * pixel_ratio).round() as u32).max(1)
}

impl ReprojTile {
    /// Plans the tile and wraps it as an ordinary [`Tile`].
    ///
    /// The returned tile is `Idle` when there are source tiles to wait on,
    /// `Empty` when the target tile has no counterpart in the source
    /// projection, and `Error` when planning fails outright.
    pub fn create(options: ReprojTileOptions) -> TileRef {
        let (state, plan, sources, blank) = match plan(&options) {
            Ok(Planned::Ready(plan, sources)) => (TileState::Idle, Some(plan), sources, None),
            Ok(Planned::Empty(size)) => (TileState::Empty, None, Vec::new(), size),
            Err(err) => {
                log::warn!("cannot reproject tile {}: {}", options.coord, err);
                (TileState::Error, None, Vec::new(), None)
            }
        };

        let reproj = ReprojTile {
            plan,
            sources: Mutex::new(sources),
            retained: AtomicBool::new(false),
            watching: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            fetch: options.fetch,
            transform: options.transform,
            config: options.config,
            scratch: options.scratch,
            pixel_ratio: options.pixel_ratio,
            gutter: options.gutter,
        };
        reproj.retain_sources();
        let tile = Tile::with_kind(options.coord, options.key, state, TileKind::Reproj(reproj));
        if let Some((width, height)) = blank {
            tile.finish_with(TileState::Empty, Some(RgbaImage::new(width, height)));
        }
        tile
    }

    pub fn source_z(&self) -> Option<u8> {
        self.plan.as_ref().map(|plan| plan.source_z)
    }

    pub fn source_range(&self) -> Option<TileRange> {
        self.plan.as_ref().map(|plan| plan.source_range)
    }

    /// Source tiles this tile depends on, in row-major order
    pub fn source_tiles(&self) -> Vec<TileRef> {
        self.lock_sources().iter().map(|source| source.tile.clone()).collect()
    }

    fn lock_sources(&self) -> std::sync::MutexGuard<'_, Vec<SourceTile>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retain_sources(&self) {
        let sources = self.lock_sources();
        if !self.retained.swap(true, Ordering::AcqRel) {
            for source in sources.iter() {
                source.tile.retain();
            }
        }
    }

    fn release_sources(&self) {
        let sources = self.lock_sources();
        if self.retained.swap(false, Ordering::AcqRel) {
            for source in sources.iter() {
                source.tile.release();
            }
        }
    }

    /// Swaps disposed source tiles for fresh ones from the source
    fn refetch_aborted(&self) {
        let aborted: Vec<(usize, TileCoord)> = self
            .lock_sources()
            .iter()
            .enumerate()
            .filter(|(_, source)| source.tile.state() == TileState::Abort)
            .map(|(index, source)| (index, source.coord))
            .collect();
        if aborted.is_empty() {
            return;
        }

        let mut fresh = Vec::with_capacity(aborted.len());
        for (index, coord) in aborted {
            match (self.fetch)(coord.z, coord.x, coord.y, self.pixel_ratio) {
                Ok(tile) => fresh.push((index, tile)),
                Err(err) => log::debug!("cannot refetch source tile {}: {}", coord, err),
            }
        }

        let mut sources = self.lock_sources();
        let retained = self.retained.load(Ordering::Acquire);
        for (index, tile) in fresh {
            log::trace!("refetched disposed source tile {}", tile.coord());
            if retained {
                tile.retain();
            }
            let old = std::mem::replace(&mut sources[index].tile, tile);
            if retained {
                old.release();
            }
        }
    }

    pub(crate) fn load(&self, tile: &TileRef) {
        if self.plan.is_none() || tile.begin_load().is_none() {
            return;
        }
        self.finished.store(false, Ordering::Release);
        self.retain_sources();
        self.refetch_aborted();

        let sources = self.source_tiles();
        {
            let mut watching = self.watching.lock().unwrap_or_else(|e| e.into_inner());
            if watching.is_empty() {
                for source in &sources {
                    let owner: Weak<Tile> = Arc::downgrade(tile);
                    watching.push(source.listen(move |_| {
                        if let Some(owner) = owner.upgrade() {
                            if let TileKind::Reproj(reproj) = owner.kind() {
                                reproj.handle_source_change(&owner);
                            }
                        }
                    }));
                }
            }
        }

        for source in &sources {
            if matches!(source.state(), TileState::Idle | TileState::Error) {
                source.load();
            }
        }
        self.handle_source_change(tile);
    }

    /// Re-scans the dependencies; warps once all of them have settled.
    ///
    /// Safe to call any number of times: only the first call that sees every
    /// dependency settled does any work.
    fn handle_source_change(&self, tile: &Tile) {
        if tile.state() != TileState::Loading {
            return;
        }
        let sources = self.lock_sources().clone();
        if sources.iter().any(|s| !s.tile.state().is_settled()) {
            return;
        }
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut loaded = Vec::new();
        let mut failed = 0;
        for source in sources {
            match (source.tile.state(), source.tile.image()) {
                (TileState::Loaded, Some(image)) => loaded.push((source, image)),
                (TileState::Error, _) | (TileState::Abort, _) => failed += 1,
                _ => {}
            }
        }
        self.unwatch_sources();
        self.release_sources();

        let Some(plan) = self.plan.as_ref() else {
            return;
        };
        if loaded.is_empty() {
            let (width, height) = plan.output_size;
            if failed > 0 {
                log::debug!("all {} source tiles of {} failed", failed, tile.coord());
                tile.finish_with(TileState::Error, None);
            } else {
                tile.finish_with(TileState::Empty, Some(RgbaImage::new(width, height)));
            }
            return;
        }

        log::debug!(
            "warping tile {} from {} source tiles ({} failed)",
            tile.coord(),
            loaded.len(),
            failed
        );
        let image = self.warp(plan, &loaded);
        tile.finish_with(TileState::Loaded, Some(image));
    }

    fn unwatch_sources(&self) {
        let keys = std::mem::take(&mut *self.watching.lock().unwrap_or_else(|e| e.into_inner()));
        for (source, key) in self.source_tiles().iter().zip(keys) {
            source.unlisten(key);
        }
    }

    pub(crate) fn dispose(&self) {
        self.unwatch_sources();
        self.release_sources();
    }

    fn warp(&self, plan: &WarpPlan, loaded: &[(SourceTile, Arc<RgbaImage>)]) -> RgbaImage {
        let pixel_resolution = plan.source_resolution / self.pixel_ratio;
        let gutter_px = if self.gutter == 0 {
            0
        } else {
            scaled(self.gutter, self.pixel_ratio)
        };

        let mut stitch_extent = Extent::empty();
        for (source, _) in loaded {
            stitch_extent.extend(&source.extent);
        }
        let stitch_extent = stitch_extent.buffer(self.gutter as f64 * plan.source_resolution);
        let canvas_w = ((stitch_extent.width() / pixel_resolution).round() as u32).max(1);
        let canvas_h = ((stitch_extent.height() / pixel_resolution).round() as u32).max(1);
        let mut canvas = self.scratch.acquire(canvas_w, canvas_h);

        let (inner_w, inner_h) = plan.source_tile_px;
        let full = (inner_w + 2 * gutter_px, inner_h + 2 * gutter_px);
        let mut placed = Vec::with_capacity(loaded.len());
        for (source, image) in loaded {
            let image = if image.dimensions() == full {
                image.clone()
            } else {
                log::debug!(
                    "source tile {} is {:?}, expected {:?}; resampling",
                    source.tile.coord(),
                    image.dimensions(),
                    full
                );
                Arc::new(imageops::resize(&**image, full.0, full.1, FilterType::Triangle))
            };
            let x = ((source.extent.min_x - stitch_extent.min_x) / pixel_resolution).round() as i64;
            let y = ((stitch_extent.max_y - source.extent.max_y) / pixel_resolution).round() as i64;
            placed.push((image, x, y));
        }

        // gutters first so neighbouring interiors always win
        if gutter_px > 0 {
            for (image, x, y) in &placed {
                imageops::replace(&mut *canvas, &**image, x - gutter_px as i64, y - gutter_px as i64);
            }
        }
        for (image, x, y) in &placed {
            if gutter_px > 0 {
                let interior = imageops::crop_imm(&**image, gutter_px, gutter_px, inner_w, inner_h).to_image();
                imageops::replace(&mut *canvas, &interior, *x, *y);
            } else {
                imageops::replace(&mut *canvas, &**image, *x, *y);
            }
        }

        // canvas position of a target point, if it maps inside the source area
        let to_canvas = |point: Point| -> Option<(f64, f64)> {
            let source = (self.transform)(point);
            let inside = source.is_finite()
                && plan
                    .source_limit
                    .map_or(true, |limit| limit.contains_coordinate(&source));
            inside.then(|| {
                (
                    (source.x - stitch_extent.min_x) / pixel_resolution,
                    (stitch_extent.max_y - source.y) / pixel_resolution,
                )
            })
        };

        let (out_w, out_h) = plan.output_size;
        let res_x = plan.target_extent.width() / out_w as f64;
        let res_y = plan.target_extent.height() / out_h as f64;
        let world_at = |px: f64, py: f64| {
            Point::new(
                plan.target_extent.min_x + px * res_x,
                plan.target_extent.max_y - py * res_y,
            )
        };

        let lattice = Lattice::build(out_w, out_h, self.config.warp_cell_size, |px, py| {
            to_canvas(world_at(px, py))
        });

        let mut output = RgbaImage::new(out_w, out_h);
        for py in 0..out_h {
            for px in 0..out_w {
                let center = world_at(px as f64 + 0.5, py as f64 + 0.5);
                if !plan.valid_extent.contains_coordinate(&center) {
                    continue;
                }
                let position = lattice
                    .as_ref()
                    .and_then(|lattice| lattice.interpolate(px, py))
                    .or_else(|| to_canvas(center));
                let Some((sx, sy)) = position else {
                    continue;
                };
                let sample = match self.config.sampling {
                    SamplingMode::Nearest => sample_nearest(&canvas, sx, sy),
                    SamplingMode::Bilinear => sample_bilinear(&canvas, sx, sy),
                };
                if let Some(pixel) = sample {
                    output.put_pixel(px, py, pixel);
                }
            }
        }
        output
    }
}

impl Drop for ReprojTile {
    fn drop(&mut self) {
        self.unwatch_sources();
        self.release_sources();
    }
}

/// Canvas positions of exactly transformed points every `cell` output
/// pixels; the pixels in between are interpolated. A node is `None` when its
/// point falls outside the source area.
struct Lattice {
    cell: u32,
    columns: usize,
    width: u32,
    height: u32,
    nodes: Vec<Option<(f64, f64)>>,
}

impl Lattice {
    fn build<F>(width: u32, height: u32, cell: u32, map: F) -> Option<Self>
    where
        F: Fn(f64, f64) -> Option<(f64, f64)>,
    {
        if cell <= 1 {
            return None;
        }
        let columns = ((width + cell - 1) / cell + 1) as usize;
        let rows = ((height + cell - 1) / cell + 1) as usize;
        let mut nodes = Vec::with_capacity(columns * rows);
        for row in 0..rows {
            let py = (row as u32 * cell).min(height) as f64;
            for column in 0..columns {
                let px = (column as u32 * cell).min(width) as f64;
                nodes.push(map(px, py));
            }
        }
        Some(Self {
            cell,
            columns,
            width,
            height,
            nodes,
        })
    }

    /// Interpolated canvas position of the center of output pixel `(px, py)`;
    /// `None` when a surrounding node is outside the source area, and the
    /// pixel has to be transformed exactly
    fn interpolate(&self, px: u32, py: u32) -> Option<(f64, f64)> {
        let column = (px / self.cell) as usize;
        let row = (py / self.cell) as usize;
        let x0 = column as u32 * self.cell;
        let y0 = row as u32 * self.cell;
        let x1 = (x0 + self.cell).min(self.width);
        let y1 = (y0 + self.cell).min(self.height);
        let fx = (px as f64 + 0.5 - x0 as f64) / (x1 - x0) as f64;
        let fy = (py as f64 + 0.5 - y0 as f64) / (y1 - y0) as f64;

        let at = |c: usize, r: usize| self.nodes[r * self.columns + c];
        let corners = [
            at(column, row)?,
            at(column + 1, row)?,
            at(column, row + 1)?,
            at(column + 1, row + 1)?,
        ];
        let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;
        let top = (lerp(corners[0].0, corners[1].0, fx), lerp(corners[0].1, corners[1].1, fx));
        let bottom = (lerp(corners[2].0, corners[3].0, fx), lerp(corners[2].1, corners[3].1, fx));
        Some((lerp(top.0, bottom.0, fy), lerp(top.1, bottom.1, fy)))
    }
}

fn sample_nearest(canvas: &RgbaImage, x: f64, y: f64) -> Option<Rgba<u8>> {
    if !(x >= 0.0 && y >= 0.0) {
        return None;
    }
    let (ix, iy) = (x.floor() as u32, y.floor() as u32);
    if ix >= canvas.width() || iy >= canvas.height() {
        return None;
    }
    Some(*canvas.get_pixel(ix, iy))
}

/// Bilinear sample with premultiplied alpha, clamped at the canvas edge
fn sample_bilinear(canvas: &RgbaImage, x: f64, y: f64) -> Option<Rgba<u8>> {
    sample_nearest(canvas, x, y)?;
    let max_x = canvas.width() as i64 - 1;
    let max_y = canvas.height() as i64 - 1;
    let u = x - 0.5;
    let v = y - 0.5;
    let x0 = u.floor();
    let y0 = v.floor();
    let fx = u - x0;
    let fy = v - y0;

    let mut color = [0.0f64; 3];
    let mut alpha = 0.0f64;
    for (dx, dy, weight) in [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ] {
        if weight == 0.0 {
            continue;
        }
        let sx = (x0 as i64 + dx).clamp(0, max_x) as u32;
        let sy = (y0 as i64 + dy).clamp(0, max_y) as u32;
        let pixel = canvas.get_pixel(sx, sy);
        let a = pixel[3] as f64 / 255.0;
        for (channel, value) in color.iter_mut().enumerate() {
            *value += pixel[channel] as f64 * a * weight;
        }
        alpha += a * weight;
    }

    if alpha <= 0.0 {
        return Some(Rgba([0, 0, 0, 0]));
    }
    let channel = |value: f64| (value / alpha).round().clamp(0.0, 255.0) as u8;
    Some(Rgba([
        channel(color[0]),
        channel(color[1]),
        channel(color[2]),
        (alpha * 255.0).round().clamp(0.0, 255.0) as u8,
    ]))
}

/// Source resolution matching `resolution` around `center`, measured by
/// transforming a one-pixel cross
fn local_source_resolution(transform: &TransformFn, center: Point, resolution: f64) -> Option<f64> {
    let half = resolution / 2.0;
    let left = transform(Point::new(center.x - half, center.y));
    let right = transform(Point::new(center.x + half, center.y));
    let bottom = transform(Point::new(center.x, center.y - half));
    let top = transform(Point::new(center.x, center.y + half));
    let measured = (left.distance_to(&right) * bottom.distance_to(&top)).sqrt();
    (measured.is_finite() && measured > 0.0).then_some(measured)
}

fn plan(options: &ReprojTileOptions) -> Result<Planned> {
    let target_grid = &options.target_grid;
    let source_grid = &options.source_grid;
    let z = options.wrapped_coord.z;

    let target_resolution = target_grid.resolution(z)?;
    let target_extent = target_grid.tile_coord_extent(&options.wrapped_coord)?;
    let (tile_w, tile_h) = target_grid.tile_size(z)?;
    let output_size = (
        scaled(tile_w, options.pixel_ratio),
        scaled(tile_h, options.pixel_ratio),
    );

    let mut valid_extent = target_extent;
    for limit in [options.target_projection.extent(), target_grid.extent()]
        .into_iter()
        .flatten()
    {
        valid_extent = valid_extent.intersection(limit);
    }
    if valid_extent.is_empty() || valid_extent.area() <= 0.0 {
        log::trace!("tile {} lies outside the target projection", options.coord);
        return Ok(Planned::Empty(Some(output_size)));
    }

    let transform = &options.transform;
    let transformed = valid_extent.apply_transform(|p| transform(p), Some(options.config.edge_stops));
    if !transformed.bottom_left().is_finite() || !transformed.top_right().is_finite() {
        log::debug!("tile {} does not transform into {}", options.coord, options.source_projection.code());
        return Ok(Planned::Empty(Some(output_size)));
    }

    let source_resolution = local_source_resolution(transform, valid_extent.center(), target_resolution)
        .or_else(|| {
            let pixels = valid_extent.area() / (target_resolution * target_resolution);
            let fallback = (transformed.area() / pixels).sqrt();
            (fallback.is_finite() && fallback > 0.0).then_some(fallback)
        })
        .ok_or_else(|| MapError::Load(format!("no source resolution for tile {}", options.coord)))?;
    let source_z = source_grid.z_for_resolution(source_resolution, ZoomDirection::Nearest);
    let source_z_resolution = source_grid.resolution(source_z)?;

    let mut source_extent = transformed;
    let source_limit = match (source_grid.extent(), options.source_projection.extent()) {
        (Some(grid), Some(projection)) => Some(grid.intersection(projection)),
        (grid, projection) => grid.or(projection).copied(),
    };
    if let Some(limit) = source_limit {
        source_extent = source_extent.intersection(&limit);
    }
    if source_extent.is_empty() || source_extent.area() <= 0.0 {
        return Ok(Planned::Empty(Some(output_size)));
    }

    let source_range = source_grid.tile_range_for_extent_and_z(&source_extent, source_z)?;
    let count = source_range.tile_count();
    if count > options.config.max_source_tiles as i64 {
        return Err(MapError::Load(format!(
            "tile {} needs {} source tiles, limit is {}",
            options.coord, count, options.config.max_source_tiles
        )));
    }

    let mut sources = Vec::with_capacity(count.max(0) as usize);
    for (x, y) in source_range.iter() {
        let coord = TileCoord::new(source_z, x, y);
        match (options.fetch)(source_z, x, y, options.pixel_ratio) {
            Ok(tile) => sources.push(SourceTile {
                tile,
                coord,
                extent: source_grid.tile_coord_extent(&coord)?,
            }),
            Err(err) => log::debug!("source tile {} unavailable: {}", coord, err),
        }
    }
    if sources.is_empty() {
        return Ok(Planned::Empty(Some(output_size)));
    }

    let (source_w, source_h) = source_grid.tile_size(source_z)?;
    log::debug!(
        "tile {} reprojects from {} source tiles at z{} ({} -> {})",
        options.coord,
        sources.len(),
        source_z,
        options.source_projection.code(),
        options.target_projection.code()
    );
    Ok(Planned::Ready(
        WarpPlan {
            target_extent,
            valid_extent,
            output_size,
            source_z,
            source_range,
            source_resolution: source_z_resolution,
            source_limit,
            source_tile_px: (
                scaled(source_w, options.pixel_ratio),
                scaled(source_h, options.pixel_ratio),
            ),
        },
        sources,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proj::{identity_transform, ProjectionRegistry, Units};
    use crate::tiles::grid::TileGridOptions;
    use crate::tiles::loader::ManualImageLoader;
    use std::sync::Mutex as StdMutex;

    fn grid(tile_size: u32, resolutions: Vec<f64>) -> Arc<TileGrid> {
        Arc::new(
            TileGrid::new(TileGridOptions {
                resolutions,
                origin: Some(Point::new(0.0, 0.0)),
                tile_size: Some((tile_size, tile_size)),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn pixel_projection() -> Arc<Projection> {
        Arc::new(Projection::new("PIXELS", Units::Pixels, None))
    }

    /// Fetch callback producing manually loaded tiles, recording each request
    fn manual_fetch(
        loader: &Arc<ManualImageLoader>,
        requested: &Arc<StdMutex<Vec<TileCoord>>>,
    ) -> SourceTileFn {
        let loader = loader.clone();
        let requested = requested.clone();
        Arc::new(move |z, x, y, _ratio| {
            let coord = TileCoord::new(z, x, y);
            requested.lock().unwrap().push(coord);
            Ok(Tile::new_image(coord, "", Some(coord.key()), loader.clone()))
        })
    }

    fn options(
        source_grid: Arc<TileGrid>,
        target_grid: Arc<TileGrid>,
        coord: TileCoord,
        fetch: SourceTileFn,
    ) -> ReprojTileOptions {
        ReprojTileOptions {
            source_projection: pixel_projection(),
            source_grid,
            target_projection: pixel_projection(),
            target_grid,
            coord,
            wrapped_coord: coord,
            pixel_ratio: 1.0,
            gutter: 0,
            transform: identity_transform(),
            fetch,
            config: ReprojectionConfig::default(),
            scratch: Arc::new(ScratchPool::default()),
            key: String::new(),
        }
    }

    fn pattern(size: u32, seed: u8) -> RgbaImage {
        RgbaImage::from_fn(size, size, |x, y| {
            Rgba([(x % 251) as u8, (y % 241) as u8, seed, 255])
        })
    }

    #[test]
    fn test_identity_is_pixel_identical() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let g = grid(256, vec![2.0, 1.0, 0.5]);
        let coord = TileCoord::new(1, 2, -3);
        let tile = ReprojTile::create(options(g.clone(), g, coord, manual_fetch(&loader, &requested)));

        assert_eq!(tile.state(), TileState::Idle);
        assert_eq!(*requested.lock().unwrap(), vec![coord]);

        tile.load();
        assert_eq!(tile.state(), TileState::Loading);
        let source = pattern(256, 7);
        assert_eq!(loader.resolve(&coord.key(), source.clone()), 1);

        assert_eq!(tile.state(), TileState::Loaded);
        assert_eq!(*tile.image().unwrap(), source);
    }

    #[test]
    fn test_identity_bilinear_exact_lattice_is_pixel_identical() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let g = grid(64, vec![4.0, 2.0]);
        let mut opts = options(g.clone(), g, TileCoord::new(1, 0, 0), manual_fetch(&loader, &requested));
        opts.config.sampling = SamplingMode::Bilinear;
        opts.config.warp_cell_size = 1;
        let tile = ReprojTile::create(opts);
        tile.load();
        let source = pattern(64, 3);
        loader.resolve("1:0:0", source.clone());
        assert_eq!(*tile.image().unwrap(), source);
    }

    #[test]
    fn test_partial_failure_leaves_transparent_region() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let source_grid = grid(256, vec![1.0]);
        let target_grid = grid(512, vec![1.0]);
        let tile = ReprojTile::create(options(
            source_grid,
            target_grid,
            TileCoord::new(0, 0, 0),
            manual_fetch(&loader, &requested),
        ));
        assert_eq!(requested.lock().unwrap().len(), 4);

        tile.load();
        loader.reject("0:1:0", "HTTP 500");
        assert_eq!(tile.state(), TileState::Loading);
        for key in ["0:0:0", "0:0:1", "0:1:1"] {
            loader.resolve(key, RgbaImage::from_pixel(256, 256, Rgba([10, 20, 30, 255])));
        }

        assert_eq!(tile.state(), TileState::Loaded);
        let image = tile.image().unwrap();
        assert_eq!(image.dimensions(), (512, 512));
        // (1, 0) is the top right quadrant
        assert_eq!(*image.get_pixel(400, 100), Rgba([0, 0, 0, 0]));
        assert_eq!(*image.get_pixel(100, 100), Rgba([10, 20, 30, 255]));
        assert_eq!(*image.get_pixel(100, 400), Rgba([10, 20, 30, 255]));
        assert_eq!(*image.get_pixel(400, 400), Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn test_all_sources_failing_is_error() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let g = grid(256, vec![1.0]);
        let tile = ReprojTile::create(options(g.clone(), g, TileCoord::new(0, 0, 0), manual_fetch(&loader, &requested)));
        tile.load();
        loader.reject("0:0:0", "gone");
        assert_eq!(tile.state(), TileState::Error);
    }

    #[test]
    fn test_no_source_tiles_is_empty() {
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let sink = requested.clone();
        let fetch: SourceTileFn = Arc::new(move |z, x, y, _| {
            sink.lock().unwrap().push(TileCoord::new(z, x, y));
            Err(MapError::Load("outside source".to_string()))
        });
        let g = grid(256, vec![1.0]);
        let tile = ReprojTile::create(options(g.clone(), g, TileCoord::new(0, 0, 0), fetch));
        assert_eq!(requested.lock().unwrap().len(), 1);
        assert_eq!(tile.state(), TileState::Empty);
        let image = tile.image().unwrap();
        assert_eq!(image.dimensions(), (256, 256));
        assert!(image.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn test_outside_target_projection_is_empty() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let g = grid(256, vec![1.0]);
        let mut opts = options(g.clone(), g, TileCoord::new(0, 5, 5), manual_fetch(&loader, &requested));
        opts.target_projection = Arc::new(Projection::new(
            "BOUNDED",
            Units::Pixels,
            Some(Extent::new(0.0, -256.0, 256.0, 0.0)),
        ));
        let tile = ReprojTile::create(opts);
        assert_eq!(tile.state(), TileState::Empty);
        assert!(requested.lock().unwrap().is_empty());
    }

    #[test]
    fn test_too_many_source_tiles_is_error() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let source_grid = grid(16, vec![1.0]);
        let target_grid = grid(256, vec![1.0]);
        let mut opts = options(source_grid, target_grid, TileCoord::new(0, 0, 0), manual_fetch(&loader, &requested));
        opts.config.max_source_tiles = 10;
        let tile = ReprojTile::create(opts);
        assert_eq!(tile.state(), TileState::Error);
        assert!(requested.lock().unwrap().is_empty());
    }

    #[test]
    fn test_scaled_transform_picks_matching_zoom() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let source_grid = grid(256, vec![4.0, 2.0, 1.0]);
        let target_grid = grid(256, vec![1.0]);
        let mut opts = options(source_grid, target_grid, TileCoord::new(0, 0, 0), manual_fetch(&loader, &requested));
        // target units are half the size of source units
        opts.transform = Arc::new(|p: Point| Point::new(p.x * 2.0, p.y * 2.0));
        let tile = ReprojTile::create(opts);
        let reproj = tile.as_reproj().unwrap();
        assert_eq!(reproj.source_z(), Some(1));
        assert_eq!(reproj.source_range(), Some(TileRange::new(0, 0, 0, 0)));
    }

    #[test]
    fn test_dependencies_retained_until_warped() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let g = grid(256, vec![1.0]);
        let tile = ReprojTile::create(options(g.clone(), g, TileCoord::new(0, 0, 0), manual_fetch(&loader, &requested)));
        let source = tile.as_reproj().unwrap().source_tiles().remove(0);
        // held from planning on, before any load starts
        assert!(source.is_retained());
        assert_eq!(source.listener_count(), 0);

        tile.load();
        assert!(source.is_retained());
        assert_eq!(source.listener_count(), 1);

        loader.resolve("0:0:0", pattern(256, 1));
        assert!(!source.is_retained());
        assert_eq!(source.listener_count(), 0);
    }

    #[test]
    fn test_idle_tile_releases_sources_on_dispose_and_drop() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let g = grid(256, vec![1.0]);

        let tile = ReprojTile::create(options(g.clone(), g.clone(), TileCoord::new(0, 0, 0), manual_fetch(&loader, &requested)));
        let source = tile.as_reproj().unwrap().source_tiles().remove(0);
        tile.dispose();
        assert!(!source.is_retained());

        let tile = ReprojTile::create(options(g.clone(), g, TileCoord::new(0, 0, 0), manual_fetch(&loader, &requested)));
        let source = tile.as_reproj().unwrap().source_tiles().remove(0);
        assert!(source.is_retained());
        drop(tile);
        assert!(!source.is_retained());
    }

    #[test]
    fn test_disposed_source_is_refetched_on_load() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let g = grid(256, vec![1.0]);
        let tile = ReprojTile::create(options(g.clone(), g, TileCoord::new(0, 0, 0), manual_fetch(&loader, &requested)));
        let stale = tile.as_reproj().unwrap().source_tiles().remove(0);
        stale.dispose();

        tile.load();
        assert_eq!(requested.lock().unwrap().len(), 2);
        let fresh = tile.as_reproj().unwrap().source_tiles().remove(0);
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(!stale.is_retained());
        assert!(fresh.is_retained());
        assert_eq!(fresh.state(), TileState::Loading);

        loader.resolve("0:0:0", pattern(256, 4));
        assert_eq!(tile.state(), TileState::Loaded);
        assert!(!fresh.is_retained());
    }

    #[test]
    fn test_outside_source_projection_stays_transparent() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let wgs84 = Arc::new(Projection::wgs84());
        let mercator = Arc::new(Projection::web_mercator());
        let mut opts = options(
            mercator.default_tile_grid(),
            wgs84.default_tile_grid(),
            TileCoord::new(0, 0, 0),
            manual_fetch(&loader, &requested),
        );
        opts.transform = ProjectionRegistry::global().get_transform(&wgs84, &mercator).unwrap();
        opts.source_projection = mercator;
        opts.target_projection = wgs84;
        let tile = ReprojTile::create(opts);
        assert_eq!(tile.as_reproj().unwrap().source_z(), Some(0));

        tile.load();
        let red = Rgba([200, 0, 0, 255]);
        loader.resolve_all(|_| Ok(RgbaImage::from_pixel(256, 256, red)));
        assert_eq!(tile.state(), TileState::Loaded);
        let image = tile.image().unwrap();
        // rows are 1.40625 degrees tall, starting at 90N
        assert_eq!(image.get_pixel(128, 0)[3], 0);
        assert_eq!(image.get_pixel(128, 1)[3], 0);
        assert_eq!(*image.get_pixel(128, 10), red);
        assert_eq!(*image.get_pixel(128, 64), red);
        assert_eq!(image.get_pixel(128, 200)[3], 0);
    }

    #[test]
    fn test_dispose_while_waiting_releases_sources() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let g = grid(256, vec![1.0]);
        let tile = ReprojTile::create(options(g.clone(), g, TileCoord::new(0, 0, 0), manual_fetch(&loader, &requested)));
        let source = tile.as_reproj().unwrap().source_tiles().remove(0);
        tile.load();
        tile.dispose();
        assert_eq!(tile.state(), TileState::Abort);
        assert!(!source.is_retained());

        loader.resolve("0:0:0", pattern(256, 1));
        assert_eq!(tile.state(), TileState::Abort);
        assert_eq!(tile.image().unwrap().dimensions(), (1, 1));
    }

    #[test]
    fn test_gutter_is_stripped() {
        let loader = Arc::new(ManualImageLoader::new());
        let requested = Arc::new(StdMutex::new(Vec::new()));
        let g = grid(32, vec![1.0]);
        let mut opts = options(g.clone(), g, TileCoord::new(0, 0, 0), manual_fetch(&loader, &requested));
        opts.gutter = 2;
        let tile = ReprojTile::create(opts);
        assert_eq!(requested.lock().unwrap().len(), 1);
        tile.load();

        let with_gutter = RgbaImage::from_fn(36, 36, |x, y| {
            if (2..34).contains(&x) && (2..34).contains(&y) {
                Rgba([0, 200, 0, 255])
            } else {
                Rgba([200, 0, 0, 255])
            }
        });
        loader.resolve("0:0:0", with_gutter);
        let image = tile.image().unwrap();
        assert_eq!(image.dimensions(), (32, 32));
        assert!(image.pixels().all(|p| *p == Rgba([0, 200, 0, 255])));
    }
}
