pub mod cache;
pub mod grid;
pub mod loader;
pub mod pyramid;
pub mod queue;
pub mod reproj;
pub mod scratch;
pub mod source;
pub mod state;
pub mod tile;
pub mod url;

pub use cache::TileCache;
pub use grid::{TileGrid, TileGridOptions, TileRange, ZoomDirection};
#[cfg(feature = "http")]
pub use loader::HttpImageLoader;
pub use loader::{fn_loader, FnImageLoader, ImageLoader, LoadCompletion, ManualImageLoader};
pub use pyramid::{
    frame_tile_priority, manage_tile_pyramid, schedule_expire_cache, FrameState, TileScheduler,
    ViewHints, ViewState,
};
pub use queue::{tile_priority, QueueEntry, TileQueue};
pub use reproj::{ReprojTile, ReprojTileOptions, SourceTileFn};
pub use scratch::{ScratchCanvas, ScratchPool};
pub use source::{TileSource, TileSourceOptions};
pub use state::TileState;
pub use tile::{blank_image, ImageTile, ListenerKey, Tile, TileKind, TileRef};
pub use url::{expand_url, template_url_function, url_template, TileUrlFn};
