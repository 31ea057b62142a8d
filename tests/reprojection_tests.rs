use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tilewarp::prelude::*;

/// Serving a Web Mercator source in other projections
#[cfg(test)]
mod reprojection_tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([220, 20, 20, 255]);

    fn mercator_source(loader: Arc<dyn ImageLoader>) -> Arc<TileSource> {
        let projection = Arc::new(Projection::web_mercator());
        let grid = projection.default_tile_grid();
        let mut options = TileSourceOptions::new(projection, loader);
        options.url_function = Some(url_template("{z}/{x}/{y}", grid).unwrap());
        TileSource::new(options)
    }

    fn counting_loader(calls: Arc<AtomicUsize>) -> Arc<dyn ImageLoader> {
        fn_loader(move |_src| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(RgbaImage::from_pixel(256, 256, RED))
        })
    }

    /// A geographic view over a mercator source renders reprojected tiles
    #[test]
    fn test_wgs84_view_over_mercator_source() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = mercator_source(counting_loader(calls.clone()));
        let wgs84 = Arc::new(Projection::wgs84());
        let mut scheduler = TileScheduler::new(TileLoadingConfig::default());

        let resolution = 360.0 / 256.0 / 8.0;
        let view = ViewState::new(Point::new(10.0, 20.0), resolution, wgs84.clone(), (256, 256), 1.0);

        let mut tiles = Vec::new();
        for _ in 0..4 {
            let mut frame = scheduler.frame(view.clone());
            tiles.clear();
            let mut collect = |tile: &TileRef| tiles.push(tile.clone());
            frame.render_source(&source, Some(&mut collect)).unwrap();
            frame.finish();
        }

        assert!(!tiles.is_empty());
        assert!(tiles.iter().all(|tile| tile.is_reprojected()));
        assert!(tiles
            .iter()
            .all(|tile| matches!(tile.state(), TileState::Loaded | TileState::Empty)));
        assert!(calls.load(Ordering::SeqCst) > 0);

        let grid = source.tile_grid_for_projection(&wgs84);
        let z = grid.z_for_resolution(resolution, ZoomDirection::Nearest);
        let center = grid.tile_coord_for_coord_and_z(&Point::new(10.0, 20.0), z).unwrap();
        let tile = source.get_tile(center.z, center.x, center.y, 1.0, &wgs84).unwrap();
        assert_eq!(tile.state(), TileState::Loaded);
        let image = tile.image().unwrap();
        assert_eq!(image.dimensions(), (256, 256));
        assert_eq!(*image.get_pixel(128, 128), RED);

        // the source tiles live in the native cache
        assert!(!source.tile_cache(source.projection()).is_empty());
    }

    /// Reprojected tiles keep their sources cached until they finish
    #[test]
    fn test_sources_are_released_after_warp() {
        let loader = Arc::new(ManualImageLoader::new());
        let source = mercator_source(loader.clone());
        let wgs84 = Arc::new(Projection::wgs84());

        let tile = source.get_tile(3, 4, 1, 1.0, &wgs84).unwrap();
        assert_eq!(tile.state(), TileState::Idle);
        let deps = tile.as_reproj().unwrap().source_tiles();
        assert!(!deps.is_empty());

        tile.load();
        assert_eq!(tile.state(), TileState::Loading);
        assert!(deps.iter().all(|dep| dep.is_retained()));

        loader.resolve_all(|_| Ok(RgbaImage::from_pixel(256, 256, RED)));
        assert_eq!(tile.state(), TileState::Loaded);
        assert!(deps.iter().all(|dep| !dep.is_retained()));
        assert!(deps.iter().all(|dep| dep.listener_count() == 0));
    }

    /// Every dependency failing marks the reprojected tile as errored, and a
    /// manual load retries it
    #[test]
    fn test_failed_sources_then_retry() {
        let loader = Arc::new(ManualImageLoader::new());
        let source = mercator_source(loader.clone());
        let wgs84 = Arc::new(Projection::wgs84());

        let tile = source.get_tile(3, 4, 1, 1.0, &wgs84).unwrap();
        tile.load();
        for src in loader.pending_srcs() {
            loader.reject(&src, "unreachable");
        }
        assert_eq!(tile.state(), TileState::Error);

        tile.load();
        assert_eq!(tile.state(), TileState::Loading);
        loader.resolve_all(|_| Ok(RgbaImage::from_pixel(256, 256, RED)));
        assert_eq!(tile.state(), TileState::Loaded);
    }

    /// Custom projections plug in through a registry
    #[test]
    fn test_custom_registry_transform() {
        let registry = Arc::new(ProjectionRegistry::with_builtins());
        let shifted = Arc::new(Projection::new(
            "EXAMPLE:SHIFTED",
            Units::Meters,
            Projection::web_mercator().extent().copied(),
        ));
        registry.add_transform("EXAMPLE:SHIFTED", "EPSG:3857", identity_transform());
        registry.add_transform("EPSG:3857", "EXAMPLE:SHIFTED", identity_transform());

        let projection = Arc::new(Projection::web_mercator());
        let grid = projection.default_tile_grid();
        let loader = Arc::new(ManualImageLoader::new());
        let mut options = TileSourceOptions::new(projection, loader.clone());
        options.url_function = Some(url_template("{z}/{x}/{y}", grid).unwrap());
        options.registry = registry;
        let source = TileSource::new(options);

        let tile = source.get_tile(1, 0, 0, 1.0, &shifted).unwrap();
        assert!(tile.is_reprojected());
        let reproj = tile.as_reproj().unwrap();
        assert_eq!(reproj.source_z(), Some(1));
        tile.load();
        assert_eq!(loader.pending_srcs(), vec!["1/0/0".to_string()]);
    }
}
