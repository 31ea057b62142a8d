//! Tile objects and their change notification
//!
//! A [`Tile`] is shared as a [`TileRef`]: the tile cache owns it, while the
//! renderer, the queue and reprojection tiles hold clones for as long as they
//! need it. Ordinary image tiles and reprojected tiles are two variants of
//! [`TileKind`] behind the same lifecycle, so callers never need to know which
//! one they have.

use super::loader::{ImageLoader, LoadCompletion};
use super::reproj::ReprojTile;
use super::state::TileState;
use crate::core::geo::TileCoord;
use crate::Result;
use futures::channel::oneshot;
use futures::{Future, FutureExt};
use image::RgbaImage;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type TileRef = Arc<Tile>;

/// Handle returned by [`Tile::listen`]
pub type ListenerKey = u64;

type Listener = Arc<dyn Fn(&Tile) + Send + Sync>;
type SettleCallback = Box<dyn FnOnce(TileState) + Send>;

/// Image fetched from a URL through an [`ImageLoader`]
pub struct ImageTile {
    src: Option<String>,
    loader: Arc<dyn ImageLoader>,
}

impl ImageTile {
    pub fn src(&self) -> Option<&str> {
        self.src.as_deref()
    }
}

pub enum TileKind {
    Image(ImageTile),
    Reproj(ReprojTile),
}

struct TileInner {
    state: TileState,
    image: Option<Arc<RgbaImage>>,
    interim: Option<TileRef>,
    /// Bumped per load attempt and on disposal so stale completions can be told apart
    attempt: u64,
}

pub struct Tile {
    coord: TileCoord,
    key: String,
    kind: TileKind,
    inner: Mutex<TileInner>,
    listeners: Mutex<Vec<(ListenerKey, Listener)>>,
    settle_callbacks: Mutex<Vec<SettleCallback>>,
    next_listener: AtomicU64,
    retain_count: AtomicUsize,
}

/// 1x1 transparent image shown in place of anything a disposed tile held
pub fn blank_image() -> Arc<RgbaImage> {
    Arc::new(RgbaImage::new(1, 1))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Tile {
    pub(crate) fn with_kind(coord: TileCoord, key: String, state: TileState, kind: TileKind) -> TileRef {
        Arc::new(Self {
            coord,
            key,
            kind,
            inner: Mutex::new(TileInner {
                state,
                image: None,
                interim: None,
                attempt: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            settle_callbacks: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            retain_count: AtomicUsize::new(0),
        })
    }

    /// Tile fetched from `src`; without a URL the tile starts out `Empty`
    pub fn new_image(
        coord: TileCoord,
        key: impl Into<String>,
        src: Option<String>,
        loader: Arc<dyn ImageLoader>,
    ) -> TileRef {
        let state = if src.is_some() {
            TileState::Idle
        } else {
            TileState::Empty
        };
        Self::with_kind(coord, key.into(), state, TileKind::Image(ImageTile { src, loader }))
    }

    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    /// Canonical `z:x:y` key
    pub fn coord_key(&self) -> String {
        self.coord.key()
    }

    /// Revision key of the source at the time the tile was created
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> &TileKind {
        &self.kind
    }

    pub fn is_reprojected(&self) -> bool {
        matches!(self.kind, TileKind::Reproj(_))
    }

    pub fn as_reproj(&self) -> Option<&ReprojTile> {
        match &self.kind {
            TileKind::Reproj(reproj) => Some(reproj),
            TileKind::Image(_) => None,
        }
    }

    pub fn state(&self) -> TileState {
        lock(&self.inner).state
    }

    /// Pixel data; present once `Loaded`, and a blank image after disposal
    pub fn image(&self) -> Option<Arc<RgbaImage>> {
        lock(&self.inner).image.clone()
    }

    /// Starts loading if the tile is idle, or retries if it errored.
    /// Any other state is left alone.
    pub fn load(self: &Arc<Self>) {
        match &self.kind {
            TileKind::Image(image) => self.load_image(image),
            TileKind::Reproj(reproj) => reproj.load(self),
        }
    }

    fn load_image(self: &Arc<Self>, image: &ImageTile) {
        let Some(attempt) = self.begin_load() else {
            return;
        };

        match &image.src {
            Some(src) => {
                log::trace!("loading tile {} from {}", self.coord, src);
                image
                    .loader
                    .load(src, LoadCompletion::new(Arc::downgrade(self), self.coord, attempt));
            }
            None => self.set_state(TileState::Empty),
        }
    }

    /// Moves an idle or errored tile to `Loading` and returns the new attempt
    /// number. An errored tile passes through `Idle` first, so listeners see
    /// the retry.
    pub(crate) fn begin_load(&self) -> Option<u64> {
        let retry = {
            let mut inner = lock(&self.inner);
            if inner.state == TileState::Error {
                inner.state = TileState::Idle;
                inner.image = None;
                true
            } else {
                false
            }
        };
        if retry {
            log::debug!("retrying tile {}", self.coord);
            self.changed(TileState::Idle);
        }

        let attempt = {
            let mut inner = lock(&self.inner);
            if inner.state != TileState::Idle {
                return None;
            }
            inner.state = TileState::Loading;
            inner.attempt += 1;
            inner.attempt
        };
        self.changed(TileState::Loading);
        Some(attempt)
    }

    /// Applies the outcome of load attempt `attempt`. Outcomes for superseded
    /// attempts, or arriving after disposal, are discarded.
    pub(crate) fn finish_load(&self, attempt: u64, result: Result<RgbaImage>) {
        let state = {
            let mut inner = lock(&self.inner);
            if inner.state != TileState::Loading || inner.attempt != attempt {
                log::debug!(
                    "discarding late load result for tile {} in state {:?}",
                    self.coord,
                    inner.state
                );
                return;
            }
            let state = match result {
                Ok(image) if image.width() == 0 || image.height() == 0 => {
                    inner.image = None;
                    TileState::Empty
                }
                Ok(image) => {
                    inner.image = Some(Arc::new(image));
                    TileState::Loaded
                }
                Err(err) => {
                    log::warn!("tile {} failed to load: {}", self.coord, err);
                    inner.image = None;
                    TileState::Error
                }
            };
            inner.state = state;
            state
        };
        self.changed(state);
    }

    pub(crate) fn is_current_attempt(&self, attempt: u64) -> bool {
        let inner = lock(&self.inner);
        inner.state == TileState::Loading && inner.attempt == attempt
    }

    /// Moves the tile to `state` and notifies, unless it was disposed
    pub(crate) fn set_state(&self, state: TileState) {
        {
            let mut inner = lock(&self.inner);
            if inner.state == TileState::Abort || inner.state == state {
                return;
            }
            inner.state = state;
        }
        self.changed(state);
    }

    /// Publishes the final image together with a settled state
    pub(crate) fn finish_with(&self, state: TileState, image: Option<RgbaImage>) {
        {
            let mut inner = lock(&self.inner);
            if inner.state == TileState::Abort {
                return;
            }
            inner.image = image.map(Arc::new);
            if inner.state == state {
                return;
            }
            inner.state = state;
        }
        self.changed(state);
    }

    /// Terminal: abandons in-flight work and swaps in a blank image
    pub fn dispose(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.state == TileState::Abort {
                return;
            }
            inner.state = TileState::Abort;
            inner.image = Some(blank_image());
            inner.interim = None;
            inner.attempt += 1;
        }
        if let TileKind::Reproj(reproj) = &self.kind {
            reproj.dispose();
        }
        log::trace!("disposed tile {}", self.coord);
        self.changed(TileState::Abort);
    }

    /// Registers a callback fired once per state transition
    pub fn listen<F>(&self, listener: F) -> ListenerKey
    where
        F: Fn(&Tile) + Send + Sync + 'static,
    {
        let key = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((key, Arc::new(listener)));
        key
    }

    pub fn unlisten(&self, key: ListenerKey) {
        lock(&self.listeners).retain(|(k, _)| *k != key);
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Calls `callback` with the first settled state at or after now
    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce(TileState) + Send + 'static,
    {
        let inner = lock(&self.inner);
        if inner.state.is_settled() {
            let state = inner.state;
            drop(inner);
            callback(state);
        } else {
            lock(&self.settle_callbacks).push(Box::new(callback));
        }
    }

    /// Resolves with the first settled state; `Abort` if the tile is dropped first
    pub fn settled(&self) -> impl Future<Output = TileState> {
        let (tx, rx) = oneshot::channel();
        self.on_settled(move |state| {
            let _ = tx.send(state);
        });
        rx.map(|result| result.unwrap_or(TileState::Abort))
    }

    fn changed(&self, state: TileState) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(self);
        }

        if state.is_settled() {
            let callbacks: Vec<SettleCallback> = std::mem::take(&mut *lock(&self.settle_callbacks));
            for callback in callbacks {
                callback(state);
            }
        }
    }

    /// Keeps the tile out of cache eviction until a matching [`Tile::release`]
    pub fn retain(&self) {
        self.retain_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        let _ = self
            .retain_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }

    pub fn is_retained(&self) -> bool {
        self.retain_count.load(Ordering::Acquire) > 0
    }

    pub fn set_interim(&self, interim: Option<TileRef>) {
        lock(&self.inner).interim = interim;
    }

    pub fn interim(&self) -> Option<TileRef> {
        lock(&self.inner).interim.clone()
    }

    /// The newest loaded tile in the interim chain, or this tile itself.
    ///
    /// Renderers draw this while a replacement for a stale tile loads.
    pub fn interim_tile(self: &Arc<Self>) -> TileRef {
        let mut next = self.interim();
        while let Some(tile) = next {
            if tile.state() == TileState::Loaded {
                return tile;
            }
            next = tile.interim();
        }
        self.clone()
    }

    /// Drops interim tiles that can no longer be shown: everything behind the
    /// first loaded one, and idle tiles that never started.
    pub fn refresh_interim_chain(&self) {
        let mut previous_link: Option<TileRef> = None;
        let mut current = self.interim();

        while let Some(tile) = current {
            match tile.state() {
                TileState::Loaded => {
                    tile.set_interim(None);
                    return;
                }
                TileState::Idle => {
                    let skip = tile.interim();
                    match &previous_link {
                        Some(previous) => previous.set_interim(skip.clone()),
                        None => self.set_interim(skip.clone()),
                    }
                    current = skip;
                }
                _ => {
                    current = tile.interim();
                    previous_link = Some(tile);
                }
            }
        }
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("coord", &self.coord)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("reprojected", &self.is_reprojected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::loader::ManualImageLoader;
    use crate::MapError;
    use std::sync::Mutex as StdMutex;

    fn manual_tile(loader: &Arc<ManualImageLoader>) -> TileRef {
        Tile::new_image(
            TileCoord::new(1, 2, 3),
            "rev0",
            Some("tile://1/2/3".to_string()),
            loader.clone(),
        )
    }

    fn record_states(tile: &TileRef) -> Arc<StdMutex<Vec<TileState>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        tile.listen(move |t| sink.lock().unwrap().push(t.state()));
        seen
    }

    #[test]
    fn test_load_success_transitions() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = manual_tile(&loader);
        let seen = record_states(&tile);

        tile.load();
        assert_eq!(tile.state(), TileState::Loading);
        assert_eq!(loader.pending_count(), 1);

        // a second load while in flight does nothing
        tile.load();
        assert_eq!(loader.pending_count(), 1);

        assert_eq!(loader.resolve("tile://1/2/3", RgbaImage::new(4, 4)), 1);
        assert_eq!(tile.state(), TileState::Loaded);
        assert_eq!(tile.image().unwrap().dimensions(), (4, 4));
        assert_eq!(*seen.lock().unwrap(), vec![TileState::Loading, TileState::Loaded]);
    }

    #[test]
    fn test_zero_sized_image_is_empty() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = manual_tile(&loader);
        tile.load();
        loader.resolve("tile://1/2/3", RgbaImage::new(0, 0));
        assert_eq!(tile.state(), TileState::Empty);
        assert!(tile.image().is_none());
    }

    #[test]
    fn test_error_then_retry() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = manual_tile(&loader);
        let seen = record_states(&tile);

        tile.load();
        loader.reject("tile://1/2/3", "connection reset");
        assert_eq!(tile.state(), TileState::Error);

        tile.load();
        assert_eq!(tile.state(), TileState::Loading);
        loader.resolve("tile://1/2/3", RgbaImage::new(2, 2));
        assert_eq!(tile.state(), TileState::Loaded);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                TileState::Loading,
                TileState::Error,
                TileState::Idle,
                TileState::Loading,
                TileState::Loaded
            ]
        );
    }

    #[test]
    fn test_dispose_mid_load_ignores_late_callbacks() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = manual_tile(&loader);
        tile.load();
        let completions = loader.take("tile://1/2/3");
        assert_eq!(completions.len(), 1);

        tile.dispose();
        assert_eq!(tile.state(), TileState::Abort);
        assert_eq!(tile.image().unwrap().dimensions(), (1, 1));

        for completion in completions {
            assert!(!completion.is_current());
            completion.complete(Ok(RgbaImage::new(4, 4)));
        }
        assert_eq!(tile.state(), TileState::Abort);
        assert_eq!(tile.image().unwrap().dimensions(), (1, 1));

        tile.load();
        assert_eq!(tile.state(), TileState::Abort);
    }

    #[test]
    fn test_late_error_after_dispose_is_noop() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = manual_tile(&loader);
        tile.load();
        tile.dispose();
        assert_eq!(loader.reject("tile://1/2/3", "timeout"), 1);
        assert_eq!(tile.state(), TileState::Abort);
    }

    #[test]
    fn test_missing_src_is_empty() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = Tile::new_image(TileCoord::new(0, 0, 0), "rev0", None, loader.clone());
        assert_eq!(tile.state(), TileState::Empty);
        tile.load();
        assert_eq!(loader.pending_count(), 0);
    }

    #[test]
    fn test_unlisten_stops_notifications() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = manual_tile(&loader);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        let key = tile.listen(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        tile.load();
        tile.unlisten(key);
        loader.resolve("tile://1/2/3", RgbaImage::new(1, 1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(tile.listener_count(), 0);
    }

    #[test]
    fn test_settled_future() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = manual_tile(&loader);
        tile.load();
        let settled = tile.settled();
        loader.reject("tile://1/2/3", "404");
        assert_eq!(futures::executor::block_on(settled), TileState::Error);

        // already settled resolves immediately
        assert_eq!(futures::executor::block_on(tile.settled()), TileState::Error);
    }

    #[test]
    fn test_interim_chain() {
        let loader = Arc::new(ManualImageLoader::new());
        let old = manual_tile(&loader);
        old.load();
        loader.resolve("tile://1/2/3", RgbaImage::new(1, 1));

        let fresh = Tile::new_image(
            TileCoord::new(1, 2, 3),
            "rev1",
            Some("tile://1/2/3?rev1".to_string()),
            loader.clone(),
        );
        fresh.set_interim(Some(old.clone()));
        assert!(Arc::ptr_eq(&fresh.interim_tile(), &old));

        fresh.load();
        loader.resolve("tile://1/2/3?rev1", RgbaImage::new(1, 1));
        assert!(Arc::ptr_eq(&fresh.interim_tile(), &old));
        fresh.refresh_interim_chain();
        assert!(fresh.interim().is_some());
        assert!(old.interim().is_none());
    }

    #[test]
    fn test_refresh_interim_chain_skips_idle() {
        let loader = Arc::new(ManualImageLoader::new());
        let idle = manual_tile(&loader);
        let tile = Tile::new_image(TileCoord::new(1, 2, 3), "rev1", Some("x".into()), loader.clone());
        tile.set_interim(Some(idle));
        tile.refresh_interim_chain();
        assert!(tile.interim().is_none());
    }

    #[test]
    fn test_retain_release() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = manual_tile(&loader);
        assert!(!tile.is_retained());
        tile.retain();
        tile.retain();
        tile.release();
        assert!(tile.is_retained());
        tile.release();
        tile.release();
        assert!(!tile.is_retained());
    }

    #[test]
    fn test_error_result_type() {
        let loader = Arc::new(ManualImageLoader::new());
        let tile = manual_tile(&loader);
        tile.load();
        for completion in loader.take("tile://1/2/3") {
            completion.complete(Err(MapError::Load("boom".to_string())));
        }
        assert_eq!(tile.state(), TileState::Error);
    }
}
