use super::tile::TileRef;
use crate::core::constants::DEFAULT_CACHE_HIGH_WATER_MARK;
use crate::prelude::HashSet;
use lru::LruCache;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// LRU tile store with a high-water mark.
///
/// Unlike a plain bounded LRU, inserting never evicts: eviction happens only
/// in [`TileCache::expire_cache`], which is told which tiles the last frame
/// used and never drops those. The cache may therefore sit above its
/// high-water mark while the view shows more tiles than it holds.
#[derive(Debug)]
pub struct TileCache {
    cache: Arc<Mutex<LruCache<String, TileRef>>>,
    high_water_mark: Arc<AtomicUsize>,
}

impl TileCache {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            cache: Arc::new(Mutex::new(LruCache::unbounded())),
            high_water_mark: Arc::new(AtomicUsize::new(high_water_mark)),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CACHE_HIGH_WATER_MARK)
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, TileRef>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a tile, marking it most recently used
    pub fn get(&self, key: &str) -> Option<TileRef> {
        self.lock().get(key).cloned()
    }

    /// Get a tile without touching its recency
    pub fn peek(&self, key: &str) -> Option<TileRef> {
        self.lock().peek(key).cloned()
    }

    /// Insert or replace a tile, marking it most recently used.
    /// A replaced tile is returned, not disposed.
    pub fn set(&self, key: impl Into<String>, tile: TileRef) -> Option<TileRef> {
        self.lock().put(key.into(), tile)
    }

    /// Swap in a tile for an existing key without changing its recency
    pub fn replace(&self, key: &str, tile: TileRef) -> Option<TileRef> {
        let mut cache = self.lock();
        match cache.peek_mut(key) {
            Some(slot) => Some(std::mem::replace(slot, tile)),
            None => {
                cache.put(key.to_string(), tile);
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn remove(&self, key: &str) -> Option<TileRef> {
        self.lock().pop(key)
    }

    /// Key of the least recently used tile
    pub fn peek_last_key(&self) -> Option<String> {
        self.lock().peek_lru().map(|(key, _)| key.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::Relaxed)
    }

    /// Shared with every clone of this cache
    pub fn set_high_water_mark(&self, high_water_mark: usize) {
        self.high_water_mark.store(high_water_mark, Ordering::Relaxed);
    }

    /// Whether an expire pass could do anything
    pub fn can_expire_cache(&self) -> bool {
        let high_water_mark = self.high_water_mark();
        high_water_mark > 0 && self.len() > high_water_mark
    }

    /// Evicts least recently used tiles until the cache is back under its
    /// high-water mark, stopping at the first one that is in `used` or still
    /// retained by a reprojected tile. Evicted tiles are disposed.
    /// Returns how many tiles were evicted.
    pub fn expire_cache(&self, used: &HashSet<String>) -> usize {
        let high_water_mark = self.high_water_mark();
        let mut evicted = Vec::new();
        {
            let mut cache = self.lock();
            while high_water_mark > 0 && cache.len() > high_water_mark {
                let Some((key, tile)) = cache.peek_lru() else {
                    break;
                };
                if used.contains(key) || tile.is_retained() {
                    break;
                }
                if let Some((_, tile)) = cache.pop_lru() {
                    evicted.push(tile);
                }
            }
        }

        let count = evicted.len();
        if count > 0 {
            log::debug!("expired {} tiles, {} remain", count, self.len());
        }
        // dispose outside the lock, listeners may reach back into the cache
        for tile in evicted {
            tile.dispose();
        }
        count
    }

    /// Disposes and drops every tile
    pub fn clear(&self) {
        let tiles: Vec<TileRef> = {
            let mut cache = self.lock();
            let tiles = cache.iter().map(|(_, tile)| tile.clone()).collect();
            cache.clear();
            tiles
        };
        for tile in tiles {
            tile.dispose();
        }
    }
}

impl Clone for TileCache {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            high_water_mark: Arc::clone(&self.high_water_mark),
        }
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
