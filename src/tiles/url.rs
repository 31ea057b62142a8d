//! Tile URL templates
//!
//! Templates use `{z}`, `{x}`, `{y}` and `{-y}` placeholders. A range such as
//! `{a-c}` or `{1-4}` expands one template into several, and tiles are spread
//! across them by coordinate.

use super::grid::TileGrid;
use crate::core::geo::TileCoord;
use crate::proj::Projection;
use crate::{MapError, Result};
use std::sync::Arc;

/// Builds the URL of a tile; `None` means the tile has no image
pub type TileUrlFn = Arc<dyn Fn(&TileCoord, f64, &Projection) -> Option<String> + Send + Sync>;

/// Expands the first `{a-c}` / `{1-4}` range in `template`
pub fn expand_url(template: &str) -> Vec<String> {
    let Some((start, end, first, last)) = find_range(template) else {
        return vec![template.to_string()];
    };
    let prefix = &template[..start];
    let suffix = &template[end..];

    if let (Some(a), Some(b)) = (single_char(first), single_char(last)) {
        if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() && a <= b {
            return (a..=b).map(|c| format!("{}{}{}", prefix, c, suffix)).collect();
        }
    }
    match (first.parse::<u32>(), last.parse::<u32>()) {
        (Ok(a), Ok(b)) if a <= b => (a..=b).map(|n| format!("{}{}{}", prefix, n, suffix)).collect(),
        _ => vec![template.to_string()],
    }
}

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

/// Byte span and bounds of the first `{first-last}` group that is not `{-y}`
fn find_range(template: &str) -> Option<(usize, usize, &str, &str)> {
    let mut offset = 0;
    while let Some(open) = template[offset..].find('{') {
        let open = offset + open;
        let close = open + template[open..].find('}')?;
        let body = &template[open + 1..close];
        if let Some((first, last)) = body.split_once('-') {
            if !first.is_empty() && !last.is_empty() {
                return Some((open, close + 1, first, last));
            }
        }
        offset = close + 1;
    }
    None
}

/// Compiles one or more templates against `grid`.
///
/// Fails when a template uses `{-y}` but the grid has no extent to flip
/// rows against.
pub fn template_url_function(templates: &[String], grid: Arc<TileGrid>) -> Result<TileUrlFn> {
    let templates: Vec<String> = templates.iter().flat_map(|t| expand_url(t)).collect();
    if templates.is_empty() {
        return Err(MapError::Config("no tile url templates".to_string()));
    }
    if templates.iter().any(|t| t.contains("{-y}")) && grid.extent().is_none() {
        return Err(MapError::MissingExtent);
    }

    Ok(Arc::new(move |coord: &TileCoord, _pixel_ratio: f64, _projection: &Projection| {
        let index = (coord.x as i64 * 31 + coord.y as i64).rem_euclid(templates.len() as i64) as usize;
        let template = &templates[index];
        let mut url = template
            .replace("{z}", &coord.z.to_string())
            .replace("{x}", &coord.x.to_string())
            .replace("{y}", &coord.y.to_string());
        if url.contains("{-y}") {
            let range = grid.full_tile_range(coord.z)?;
            let flipped = range.min_y as i64 + range.max_y as i64 - coord.y as i64;
            url = url.replace("{-y}", &flipped.to_string());
        }
        Some(url)
    }))
}

/// Compiles a single template; see [`template_url_function`]
pub fn url_template(template: &str, grid: Arc<TileGrid>) -> Result<TileUrlFn> {
    template_url_function(&[template.to_string()], grid)
}
