use super::state::TileState;
use super::tile::TileRef;
use crate::core::constants::ZOOM_LEVEL_PRIORITY_PENALTY;
use crate::core::geo::Point;
use crate::prelude::HashSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

/// Priority that keeps an entry out of the queue
pub const DROP: f64 = f64::INFINITY;

/// A tile waiting to be loaded
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub tile: TileRef,
    pub source_key: String,
    pub tile_center: Point,
    pub tile_resolution: f64,
}

impl QueueEntry {
    pub fn new(tile: TileRef, source_key: impl Into<String>, tile_center: Point, tile_resolution: f64) -> Self {
        Self {
            tile,
            source_key: source_key.into(),
            tile_center,
            tile_resolution,
        }
    }

    /// Dedup key: source, coordinate and tile revision
    pub fn key(&self) -> String {
        queue_key(&self.source_key, &self.tile.coord_key(), self.tile.key())
    }
}

pub fn queue_key(source_key: &str, coord_key: &str, revision: &str) -> String {
    format!("{}/{}/{}", source_key, coord_key, revision)
}

/// Load priority of a tile for a view; lower loads first.
///
/// Each zoom level between the tile and the view costs a fixed penalty that
/// outweighs distance for any tile within a few hundred tiles of the center;
/// within a level the distance from the view center, in tiles, decides.
pub fn tile_priority(view_center: Point, view_resolution: f64, entry: &QueueEntry) -> f64 {
    let zoom_delta = (entry.tile_resolution / view_resolution).log2().abs();
    let distance = entry.tile_center.distance_to(&view_center) / entry.tile_resolution;
    ZOOM_LEVEL_PRIORITY_PENALTY * zoom_delta + distance
}

#[derive(Debug)]
struct QueuedTile {
    priority: f64,
    /// Tie-break, lower = enqueued earlier
    sequence: u64,
    entry: QueueEntry,
}

impl PartialEq for QueuedTile {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTile {}

impl PartialOrd for QueuedTile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTile {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: lowest priority value, then earliest sequence
        match other.priority.total_cmp(&self.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// Priority queue of tiles waiting to load, with the in-flight count.
///
/// The queue starts loads itself and learns about their end through
/// [`crate::tiles::Tile::on_settled`], so the in-flight count cannot drift
/// from the tiles actually loading.
#[derive(Debug, Default)]
pub struct TileQueue {
    heap: BinaryHeap<QueuedTile>,
    queued: HashSet<String>,
    loading: Arc<AtomicUsize>,
    loading_keys: Arc<Mutex<HashSet<String>>>,
    sequence: u64,
}

impl TileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `entry` unless it is already queued or its priority is [`DROP`].
    /// Returns whether it was queued.
    pub fn enqueue(&mut self, entry: QueueEntry, priority: f64) -> bool {
        if priority == DROP || priority.is_nan() {
            return false;
        }
        let key = entry.key();
        if !self.queued.insert(key) {
            return false;
        }
        self.sequence += 1;
        self.heap.push(QueuedTile {
            priority,
            sequence: self.sequence,
            entry,
        });
        true
    }

    pub fn is_key_queued(&self, key: &str) -> bool {
        self.queued.contains(key)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Tiles started by this queue that have not settled yet
    pub fn loading_count(&self) -> usize {
        self.loading.load(AtomicOrdering::Acquire)
    }

    /// Recomputes every priority, dropping entries that come out as [`DROP`]
    pub fn reprioritize<F>(&mut self, mut priority: F)
    where
        F: FnMut(&QueueEntry) -> f64,
    {
        let entries = std::mem::take(&mut self.heap).into_vec();
        let mut dropped = 0;
        for mut queued in entries {
            let updated = priority(&queued.entry);
            if updated == DROP || updated.is_nan() {
                self.queued.remove(&queued.entry.key());
                dropped += 1;
            } else {
                queued.priority = updated;
                self.heap.push(queued);
            }
        }
        if dropped > 0 {
            log::trace!("dropped {} tiles no longer wanted", dropped);
        }
    }

    /// Starts idle tiles in priority order while fewer than `max_total_loading`
    /// are in flight and fewer than `max_new_loads` were started by this call.
    /// Returns how many were started.
    pub fn load_more_tiles(&mut self, max_total_loading: usize, max_new_loads: usize) -> usize {
        let mut new_loads = 0;
        while self.loading_count() < max_total_loading && new_loads < max_new_loads {
            let Some(queued) = self.heap.pop() else {
                break;
            };
            let key = queued.entry.key();
            self.queued.remove(&key);

            let tile = queued.entry.tile;
            if tile.state() != TileState::Idle {
                continue;
            }
            {
                let mut loading_keys = self.loading_keys.lock().unwrap_or_else(|e| e.into_inner());
                if !loading_keys.insert(key.clone()) {
                    continue;
                }
            }
            self.loading.fetch_add(1, AtomicOrdering::AcqRel);
            new_loads += 1;

            tile.load();
            let loading = self.loading.clone();
            let loading_keys = self.loading_keys.clone();
            tile.on_settled(move |_| {
                loading.fetch_sub(1, AtomicOrdering::AcqRel);
                loading_keys
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
            });
        }
        if new_loads > 0 {
            log::debug!(
                "started {} tile loads, {} in flight, {} queued",
                new_loads,
                self.loading_count(),
                self.len()
            );
        }
        new_loads
    }

    /// Forgets every queued entry; in-flight loads keep counting until they settle
    pub fn clear(&mut self) {
        self.heap.clear();
        self.queued.clear();
    }
}
