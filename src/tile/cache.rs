//! Two-tier tile cache.
//!
//! - **L2** ([`CompressedTileCache`]): compressed payloads as received from
//!   the backend, one LRU per file. Lets a tile be decoded again without
//!   another round trip.
//! - **L1** ([`RasterTileCache`]): decoded rasters, each bound to a texture
//!   slot in the atlas. Tiles in the coarsest `num_persistent_layers` layers
//!   live in an unbounded map and are never evicted by LRU pressure; all
//!   others share a bounded LRU.
//!
//! ```text
//!                  ┌───────────────────────────────┐
//!   decoded tile ─▶│ layer < persistent ?          │
//!                  └──────┬─────────────────┬──────┘
//!                     yes │                 │ no
//!                         ▼                 ▼
//!              ┌──────────────────┐ ┌──────────────────┐
//!              │ persistent map   │ │ bounded LRU      │──▶ evict LRU:
//!              │ (never evicted)  │ │                  │    free buffer,
//!              └────────┬─────────┘ └────────┬─────────┘    return slot
//!                       └────────┬───────────┘
//!                                ▼
//!                      ┌──────────────────┐
//!                      │ TextureSlotPool  │
//!                      └──────────────────┘
//! ```
//!
//! Both tiers are owned by the coordinating task and are not synchronised.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::{debug, warn};

use crate::backend::TilePayload;

use super::atlas::TextureSlotPool;
use super::coordinate::file_id_of;

/// Default number of compressed tiles kept per file.
pub const DEFAULT_SYSTEM_CACHE_CAPACITY: usize = 4096;

/// Default number of decoded tiles in the GPU LRU.
pub const DEFAULT_GPU_CACHE_CAPACITY: u32 = 512;

/// Default number of coarse layers that are always kept resident.
pub const DEFAULT_PERSISTENT_LAYERS: u32 = 3;

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

/// Number of tiles in layers `0..num_layers`.
pub fn persistent_tile_count(num_layers: u32) -> u64 {
    (0..num_layers).map(|layer| 1u64 << (2 * layer)).sum()
}

// =============================================================================
// L2: Compressed Tiles
// =============================================================================

/// A compressed payload held in system memory.
#[derive(Debug, Clone)]
pub struct CompressedTile {
    pub payload: TilePayload,
    pub compression_quality: i32,
}

/// Per-file LRU of compressed payloads keyed by encoded coordinate.
///
/// Only the most recent channel of a file is meaningful; callers clear a
/// file's entries when its channel changes.
#[derive(Debug)]
pub struct CompressedTileCache {
    capacity: NonZeroUsize,
    files: HashMap<i32, LruCache<u32, CompressedTile>>,
}

impl CompressedTileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: non_zero(capacity),
            files: HashMap::new(),
        }
    }

    /// Look up a tile, marking it as recently used.
    pub fn get(&mut self, file_id: i32, encoded: u32) -> Option<&CompressedTile> {
        self.files.get_mut(&file_id)?.get(&encoded)
    }

    pub fn contains(&self, file_id: i32, encoded: u32) -> bool {
        self.files
            .get(&file_id)
            .is_some_and(|cache| cache.contains(&encoded))
    }

    /// Forget one tile, returning it if it was cached.
    pub fn remove(&mut self, file_id: i32, encoded: u32) -> Option<CompressedTile> {
        self.files.get_mut(&file_id)?.pop(&encoded)
    }

    /// Store a tile. Returns the entry pushed out by capacity pressure, if any.
    pub fn put(
        &mut self,
        file_id: i32,
        encoded: u32,
        tile: CompressedTile,
    ) -> Option<(u32, CompressedTile)> {
        let capacity = self.capacity;
        let cache = self
            .files
            .entry(file_id)
            .or_insert_with(|| LruCache::new(capacity));

        match cache.push(encoded, tile) {
            Some((key, evicted)) if key != encoded => Some((key, evicted)),
            _ => None,
        }
    }

    /// Drop every tile of one file.
    pub fn clear_file(&mut self, file_id: i32) {
        self.files.remove(&file_id);
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    /// Total tiles across all files.
    pub fn len(&self) -> usize {
        self.files.values().map(LruCache::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, file_id: i32) -> usize {
        self.files.get(&file_id).map_or(0, LruCache::len)
    }

    /// Capacity of each per-file LRU.
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}

// =============================================================================
// L1: Decoded Rasters
// =============================================================================

/// A decoded tile resident in the atlas.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTile {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub texture_slot: u32,
}

/// Slot assignment made by [`RasterTileCache::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    /// Slot now holding the inserted tile
    pub texture_slot: u32,
    /// Key and slot of every tile evicted to make room, oldest first
    pub evicted: Vec<(u64, u32)>,
}

/// Decoded tiles keyed by file-qualified encoded coordinate.
#[derive(Debug)]
pub struct RasterTileCache {
    lru: LruCache<u64, RasterTile>,
    persistent: HashMap<u64, RasterTile>,
    slots: TextureSlotPool,
    num_persistent_layers: u32,
}

impl RasterTileCache {
    /// Create an L1 cache with `lru_capacity` evictable entries drawing from
    /// `total_slots` texture slots.
    pub fn new(lru_capacity: usize, total_slots: u32, num_persistent_layers: u32) -> Self {
        Self {
            lru: LruCache::new(non_zero(lru_capacity)),
            persistent: HashMap::new(),
            slots: TextureSlotPool::new(total_slots),
            num_persistent_layers,
        }
    }

    pub fn is_persistent_layer(&self, layer: u32) -> bool {
        layer < self.num_persistent_layers
    }

    /// Insert a decoded raster and bind it to a texture slot.
    ///
    /// Re-inserting an existing key releases the old slot first. Returns
    /// `None` when no slot can be found, in which case the raster is dropped.
    pub fn insert(
        &mut self,
        key: u64,
        layer: u32,
        data: Vec<f32>,
        width: u32,
        height: u32,
    ) -> Option<Insertion> {
        let mut evicted = Vec::new();

        if self.is_persistent_layer(layer) {
            if let Some(old) = self.persistent.remove(&key) {
                self.slots.release(old.texture_slot);
            }
        } else {
            if let Some(old) = self.lru.pop(&key) {
                self.slots.release(old.texture_slot);
            }
            if self.lru.len() >= self.lru.cap().get() {
                evicted.extend(self.evict_lru());
            }
        }

        let texture_slot = match self.slots.acquire() {
            Some(slot) => slot,
            None => {
                // Persistent tiles outgrew their share of the atlas
                evicted.extend(self.evict_lru());
                match self.slots.acquire() {
                    Some(slot) => slot,
                    None => {
                        warn!(key, layer, "No free texture slot, dropping tile");
                        return None;
                    }
                }
            }
        };

        let tile = RasterTile {
            data,
            width,
            height,
            texture_slot,
        };
        if self.is_persistent_layer(layer) {
            self.persistent.insert(key, tile);
        } else {
            self.lru.put(key, tile);
        }

        Some(Insertion {
            texture_slot,
            evicted,
        })
    }

    fn evict_lru(&mut self) -> Option<(u64, u32)> {
        let (key, tile) = self.lru.pop_lru()?;
        debug!(key, slot = tile.texture_slot, "Evicting tile from GPU cache");
        self.slots.release(tile.texture_slot);
        Some((key, tile.texture_slot))
    }

    /// Look up a tile. With `peek`, LRU recency is left untouched.
    pub fn get(&mut self, key: u64, layer: u32, peek: bool) -> Option<&RasterTile> {
        if self.is_persistent_layer(layer) {
            self.persistent.get(&key)
        } else if peek {
            self.lru.peek(&key)
        } else {
            self.lru.get(&key)
        }
    }

    /// Look up a tile without touching recency.
    pub fn peek(&self, key: u64, layer: u32) -> Option<&RasterTile> {
        if self.is_persistent_layer(layer) {
            self.persistent.get(&key)
        } else {
            self.lru.peek(&key)
        }
    }

    pub fn contains(&self, key: u64, layer: u32) -> bool {
        if self.is_persistent_layer(layer) {
            self.persistent.contains_key(&key)
        } else {
            self.lru.contains(&key)
        }
    }

    /// Evict everything, returning all slots to the free-list.
    pub fn clear(&mut self) {
        while self.evict_lru().is_some() {}
        for (_, tile) in self.persistent.drain() {
            self.slots.release(tile.texture_slot);
        }
    }

    /// Evict every tile belonging to `file_id`, keeping LRU order of the rest.
    pub fn clear_file(&mut self, file_id: i32) {
        let stale: Vec<u64> = self
            .lru
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| file_id_of(*key) == file_id)
            .collect();
        for key in stale {
            if let Some(tile) = self.lru.pop(&key) {
                self.slots.release(tile.texture_slot);
            }
        }

        let slots = &mut self.slots;
        self.persistent.retain(|key, tile| {
            let keep = file_id_of(*key) != file_id;
            if !keep {
                slots.release(tile.texture_slot);
            }
            keep
        });
    }

    /// Number of tiles in the evictable LRU.
    pub fn lru_len(&self) -> usize {
        self.lru.len()
    }

    /// Number of persistent tiles.
    pub fn persistent_len(&self) -> usize {
        self.persistent.len()
    }

    pub fn lru_capacity(&self) -> usize {
        self.lru.cap().get()
    }

    pub fn num_persistent_layers(&self) -> u32 {
        self.num_persistent_layers
    }

    pub fn slots(&self) -> &TextureSlotPool {
        &self.slots
    }
}

// =============================================================================
// Tests
// =============================================================================
