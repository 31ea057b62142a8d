use super::tile::Tile;
use crate::core::geo::TileCoord;
use crate::{MapError, Result};
use image::RgbaImage;
use std::sync::{Arc, Mutex, Weak};

/// Fetches and decodes the image behind a tile URL.
///
/// Implementations may finish synchronously inside `load` or hand the
/// [`LoadCompletion`] to another thread and finish later. Either way the
/// completion must be called at most once.
pub trait ImageLoader: Send + Sync {
    fn load(&self, src: &str, completion: LoadCompletion);
}

/// One-shot handle that reports the outcome of a single load attempt.
///
/// Holds only a weak reference, so a tile dropped from its cache is not
/// kept alive by outstanding I/O. Completing a stale or disposed attempt is a
/// no-op.
#[derive(Debug, Clone)]
pub struct LoadCompletion {
    tile: Weak<Tile>,
    coord: TileCoord,
    attempt: u64,
}

impl LoadCompletion {
    pub(crate) fn new(tile: Weak<Tile>, coord: TileCoord, attempt: u64) -> Self {
        Self {
            tile,
            coord,
            attempt,
        }
    }

    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    /// Whether the tile is still waiting on this attempt
    pub fn is_current(&self) -> bool {
        self.tile
            .upgrade()
            .map_or(false, |tile| tile.is_current_attempt(self.attempt))
    }

    pub fn complete(self, result: Result<RgbaImage>) {
        match self.tile.upgrade() {
            Some(tile) => tile.finish_load(self.attempt, result),
            None => log::trace!("tile {} dropped before its load completed", self.coord),
        }
    }

    pub fn succeed(self, image: RgbaImage) {
        self.complete(Ok(image))
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.complete(Err(MapError::Load(reason.into())))
    }
}

/// Loader that records requests and leaves completion to the caller.
///
/// Used to drive load ordering deterministically.
#[derive(Debug, Default)]
pub struct ManualImageLoader {
    pending: Mutex<Vec<(String, LoadCompletion)>>,
    requests: Mutex<Vec<String>>,
}

impl ManualImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every URL requested so far, in request order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// URLs with a completion still outstanding
    pub fn pending_srcs(&self) -> Vec<String> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(src, _)| src.clone())
            .collect()
    }

    /// Removes and returns the outstanding completions for `src`
    pub fn take(&self, src: &str) -> Vec<LoadCompletion> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(pending.len());
        for (pending_src, completion) in pending.drain(..) {
            if pending_src == src {
                taken.push(completion);
            } else {
                kept.push((pending_src, completion));
            }
        }
        *pending = kept;
        taken
    }

    /// Completes every outstanding request for `src` with `image`; returns how many
    pub fn resolve(&self, src: &str, image: RgbaImage) -> usize {
        let completions = self.take(src);
        let count = completions.len();
        for completion in completions {
            completion.succeed(image.clone());
        }
        count
    }

    /// Fails every outstanding request for `src`; returns how many
    pub fn reject(&self, src: &str, reason: &str) -> usize {
        let completions = self.take(src);
        let count = completions.len();
        for completion in completions {
            completion.fail(reason);
        }
        count
    }

    /// Completes all outstanding requests with images produced by `f`
    pub fn resolve_all<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&str) -> Result<RgbaImage>,
    {
        let pending: Vec<(String, LoadCompletion)> =
            std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        let count = pending.len();
        for (src, completion) in pending {
            completion.complete(f(&src));
        }
        count
    }
}

impl ImageLoader for ManualImageLoader {
    fn load(&self, src: &str, completion: LoadCompletion) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(src.to_string());
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((src.to_string(), completion));
    }
}

/// Loader that produces images synchronously from a closure
pub struct FnImageLoader<F> {
    f: F,
}

impl<F> FnImageLoader<F>
where
    F: Fn(&str) -> Result<RgbaImage> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ImageLoader for FnImageLoader<F>
where
    F: Fn(&str) -> Result<RgbaImage> + Send + Sync,
{
    fn load(&self, src: &str, completion: LoadCompletion) {
        completion.complete((self.f)(src));
    }
}

/// Wraps any closure as a shared loader
pub fn fn_loader<F>(f: F) -> Arc<dyn ImageLoader>
where
    F: Fn(&str) -> Result<RgbaImage> + Send + Sync + 'static,
{
    Arc::new(FnImageLoader::new(f))
}

#[cfg(feature = "http")]
pub use http::HttpImageLoader;

#[cfg(feature = "http")]
mod http {
    use super::{ImageLoader, LoadCompletion};
    use crate::{MapError, Result};
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use image::RgbaImage;
    use reqwest::blocking::Client;
    use std::thread;
    use std::time::Duration;

    const MAX_ATTEMPTS: usize = 2;
    const RETRY_DELAY: Duration = Duration::from_millis(100);
    const USER_AGENT: &str = concat!("tilewarp/", env!("CARGO_PKG_VERSION"));

    type Job = (String, LoadCompletion);
    type Done = (LoadCompletion, Result<RgbaImage>);

    /// Downloads tiles on a fixed set of worker threads.
    ///
    /// Workers never touch tile state; finished downloads queue up until the
    /// thread driving the map calls [`HttpImageLoader::dispatch_completed`].
    pub struct HttpImageLoader {
        jobs: Sender<Job>,
        done: Receiver<Done>,
    }

    impl HttpImageLoader {
        pub fn new(workers: usize) -> Result<Self> {
            // public tile servers reject requests without a user agent
            let client = Client::builder().user_agent(USER_AGENT).build()?;
            let (jobs, job_rx) = unbounded::<Job>();
            let (done_tx, done) = unbounded::<Done>();

            for index in 0..workers.max(1) {
                let client = client.clone();
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                thread::Builder::new()
                    .name(format!("tile-fetch-{}", index))
                    .spawn(move || worker(client, job_rx, done_tx))?;
            }

            Ok(Self { jobs, done })
        }

        /// Applies every finished download to its tile; returns how many were applied
        pub fn dispatch_completed(&self) -> usize {
            let mut count = 0;
            while let Ok((completion, result)) = self.done.try_recv() {
                completion.complete(result);
                count += 1;
            }
            count
        }
    }

    impl ImageLoader for HttpImageLoader {
        fn load(&self, src: &str, completion: LoadCompletion) {
            if self.jobs.send((src.to_string(), completion)).is_err() {
                log::error!("tile fetch workers are gone, dropping {}", src);
            }
        }
    }

    fn worker(client: Client, jobs: Receiver<Job>, done: Sender<Done>) {
        for (src, completion) in jobs.iter() {
            if !completion.is_current() {
                log::trace!("skipping fetch of {}, tile no longer waiting", src);
                continue;
            }
            let result = fetch(&client, &src, completion.coord());
            if done.send((completion, result)).is_err() {
                return;
            }
        }
    }

    fn fetch(client: &Client, url: &str, coord: crate::core::geo::TileCoord) -> Result<RgbaImage> {
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            log::debug!("fetch tile {} attempt {}", coord, attempt);
            match download(client, url) {
                Ok(bytes) => {
                    log::info!("downloaded tile {} ({} bytes)", coord, bytes.len());
                    return Ok(image::load_from_memory(&bytes)?.to_rgba8());
                }
                Err(e) => {
                    log::warn!("tile {} download failed on attempt {}: {}", coord, attempt, e);
                    last_error = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }
        log::error!("giving up on tile {}", coord);
        Err(last_error.unwrap_or_else(|| MapError::Load(format!("no attempts made for {}", url))))
    }

    fn download(client: &Client, url: &str) -> Result<Vec<u8>> {
        let response = client.get(url).send()?;
        if !response.status().is_success() {
            return Err(MapError::Load(format!("HTTP {} for {}", response.status(), url)));
        }
        Ok(response.bytes()?.to_vec())
    }
}
