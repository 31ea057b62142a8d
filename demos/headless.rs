use anyhow::Context;
use image::{Rgba, RgbaImage};
use tilewarp::prelude::*;

/// Checkerboard tile whose color encodes the zoom level
fn synthetic_tile(src: &str) -> tilewarp::Result<RgbaImage> {
    let z: u32 = src
        .split('/')
        .next()
        .and_then(|z| z.parse().ok())
        .ok_or_else(|| MapError::Load(format!("bad tile url {}", src)))?;
    let shade = (z * 20).min(255) as u8;
    Ok(RgbaImage::from_fn(256, 256, |x, y| {
        if (x / 32 + y / 32) % 2 == 0 {
            Rgba([shade, 80, 255 - shade, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    }))
}

/// Drives a geographic view over a Web Mercator source without any UI
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("🗺️ tilewarp headless example");
    println!("============================");

    let options = TilePerformanceProfile::Balanced.resolve();
    options.validate().context("invalid performance options")?;

    let mercator = Arc::new(Projection::web_mercator());
    let grid = mercator.default_tile_grid();
    let mut source_options = TileSourceOptions::new(mercator, fn_loader(synthetic_tile));
    source_options.url_function = Some(url_template("{z}/{x}/{y}", grid)?);
    source_options.reprojection = options.reprojection.clone();
    source_options.cache_size = options.loading.cache_high_water_mark;
    let source = TileSource::new(source_options);

    let wgs84 = Arc::new(Projection::wgs84());
    let mut scheduler = TileScheduler::new(options.loading.clone());

    let locations = [
        ("San Francisco", LatLng::new(37.7749, -122.4194), 6),
        ("London", LatLng::new(51.5074, -0.1278), 5),
        ("Tokyo", LatLng::new(35.6762, 139.6503), 4),
    ];

    for (name, location, z) in locations {
        let resolution = source.tile_grid_for_projection(&wgs84).resolution(z)?;
        let view = ViewState::new(location.to_point(), resolution, wgs84.clone(), (1024, 768), 1.0);

        let mut frames = 0;
        let mut loaded = 0;
        let mut total = 0;
        while frames < 10 {
            frames += 1;
            let mut frame = scheduler.frame(view.clone());
            let mut states = Vec::new();
            let mut collect = |tile: &TileRef| states.push(tile.state());
            total = frame.render_source(&source, Some(&mut collect))?;
            frame.finish();

            loaded = states.iter().filter(|s| **s == TileState::Loaded).count();
            if states.iter().all(|s| s.is_settled()) && scheduler.queue().is_empty() {
                break;
            }
        }

        println!(
            "✅ {}: z{} {}/{} reprojected tiles loaded after {} frames",
            name, z, loaded, total, frames
        );
    }

    let native = source.tile_cache(source.projection());
    let reprojected = source.tile_cache(&wgs84);
    println!("\n📦 Cache:");
    println!("   Source tiles: {}", native.len());
    println!("   Reprojected tiles: {}", reprojected.len());

    source.clear();
    println!("\n🎉 Done");
    Ok(())
}
