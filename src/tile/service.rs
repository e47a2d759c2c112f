//! Tile request coordinator.
//!
//! The TileService owns every piece of tile state and is the only place it is
//! mutated. It:
//! - Tracks the channel/Stokes context of each open file
//! - Deduplicates tiles already requested or being decoded
//! - Serves requests from L1, then L2, then the backend
//! - Orders backend requests by distance to the focus point
//! - Discards results that arrive for a context that is no longer live
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             TileService                              │
//! │                                                                      │
//! │  request_tiles()                     handle_raster_tile_data()       │
//! │   1. context switch?  ─▶ clear L1     1. unsupported? ─▶ error!,drop │
//! │   2. skip pending / resident          2. stale?       ─▶ drop        │
//! │   3. L2 hit  ─────────────┐           3. None  ─▶ insert into L1     │
//! │   4. miss: sort by focus  │           4. other ─▶ L2 + decompress    │
//! │      ─▶ TileBackend       ▼                          │               │
//! │                  ┌──────────────────┐                │               │
//! │                  │DecompressionPool │◀───────────────┘               │
//! │                  └────────┬─────────┘                                │
//! │                           ▼ poll_decoded() / next_decoded()          │
//! │                  stale? drop : insert into L1 ─▶ tile stream         │
//! │                                                                      │
//! │   ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐   │
//! │   │CompressedTileCache│ │ RasterTileCache  │  │  TextureAtlas    │   │
//! │   │       (L2)        │ │      (L1)        │  │                  │   │
//! │   └──────────────────┘  └──────────────────┘  └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! In-flight decodes are never cancelled. A result is checked against the
//! live context of its file when it arrives and dropped if it no longer
//! matches, so a context switch can never surface a tile of the old channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backend::{AddRequiredTiles, CompressionType, RasterTileData, TileBackend, TilePayload};
use crate::config::CacheConfig;
use crate::error::{AtlasError, ConfigError};

use super::atlas::{AtlasLayout, GpuContext, TextureAtlas, TileTextureParameters};
use super::cache::{CompressedTile, CompressedTileCache, RasterTile, RasterTileCache};
use super::coordinate::{add_file_id, get_layer, TileCoordinate};
use super::decompress::{
    apply_nan_encodings, decode_raw, DecodeJob, DecodedTile, DecompressionPool, RawFloatCodec,
    TileCodec,
};
use super::tiling::Point2D;

/// Buffered notifications per subscriber before it starts lagging.
const TILE_STREAM_CAPACITY: usize = 1024;

// =============================================================================
// Context Types
// =============================================================================

/// The channel and Stokes parameter a file's tiles are valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelContext {
    pub channel: i32,
    pub stokes: i32,
}

/// Key of the pending sets: a file in one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ChannelKey {
    file_id: i32,
    channel: i32,
    stokes: i32,
}

impl ChannelKey {
    fn new(file_id: i32, channel: i32, stokes: i32) -> Self {
        Self {
            file_id,
            channel,
            stokes,
        }
    }
}

// =============================================================================
// Notifications and Stats
// =============================================================================

/// Published on the tile stream.
///
/// `tile_count` is 1 for every tile inserted into L1 and 0 when a request
/// needed nothing new from the backend. `flush` is set on the insertion that
/// leaves no tiles of that file and context outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileStreamDetails {
    pub tile_count: usize,
    pub file_id: i32,
    pub channel: i32,
    pub stokes: i32,
    pub flush: bool,
}

/// What happened to a tile handed to L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileDisposition {
    /// Resident in L1 at `texture_slot`
    Inserted {
        file_id: i32,
        encoded: u32,
        texture_slot: u32,
    },
    /// Tagged with a context that is no longer live
    Stale,
    /// The codec could not decode the payload
    Failed,
    /// No texture slot could be found
    Dropped,
}

/// Snapshot of cache occupancy and drop counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub lru_tiles: usize,
    pub lru_capacity: usize,
    pub persistent_tiles: usize,
    pub compressed_tiles: usize,
    pub free_slots: usize,
    pub total_slots: u32,
    pub num_textures: u32,
    pub remaining_tiles: usize,
    pub pending_decompressions: usize,
    pub stale_discarded: u64,
    pub unsupported_dropped: u64,
    pub decode_failures: u64,
    pub dropped_no_slot: u64,
}

#[derive(Debug, Default)]
struct Counters {
    stale_discarded: u64,
    unsupported_dropped: u64,
    decode_failures: u64,
    dropped_no_slot: u64,
}

/// Build L1 and the atlas for `config`, growing the LRU to fill the textures.
fn build_tiers(config: &CacheConfig) -> (RasterTileCache, TextureAtlas) {
    let persistent = config.persistent_capacity();
    let requested = (config.lru_capacity_gpu as u64 + persistent).min(u32::MAX as u64) as u32;
    let layout = AtlasLayout::plan(
        requested,
        config.texture_size,
        config.tile_size,
        config.max_textures,
    );

    let total_slots = layout.total_slots();
    let lru_capacity = (total_slots as u64).saturating_sub(persistent).max(1) as u32;
    if lru_capacity != config.lru_capacity_gpu {
        info!(
            "GPU tile cache capacity rounded from {} to {} ({} textures, {} slots)",
            config.lru_capacity_gpu,
            lru_capacity,
            layout.num_textures(),
            total_slots
        );
    }

    (
        RasterTileCache::new(lru_capacity as usize, total_slots, config.num_persistent_layers),
        TextureAtlas::new(layout),
    )
}

// =============================================================================
// Tile Service
// =============================================================================

/// Coordinates tile requests, caching, decoding and GPU placement.
///
/// All methods take `&mut self`: the service is meant to be owned by a single
/// task. Decoding happens on the pool's threads; results are collected with
/// [`poll_decoded`](Self::poll_decoded) or
/// [`next_decoded`](Self::next_decoded).
pub struct TileService<B: TileBackend> {
    backend: B,
    config: CacheConfig,

    contexts: HashMap<i32, ChannelContext>,
    pending_requests: HashMap<ChannelKey, HashSet<u32>>,
    pending_decompressions: HashMap<ChannelKey, HashSet<u32>>,

    compressed: CompressedTileCache,
    raster: RasterTileCache,
    atlas: TextureAtlas,

    pool: DecompressionPool,
    request_counter: u64,

    tile_stream: broadcast::Sender<TileStreamDetails>,
    counters: Counters,
}

impl<B: TileBackend> TileService<B> {
    /// Create a service that decodes payloads with [`RawFloatCodec`].
    pub fn new(backend: B, config: CacheConfig) -> Result<Self, ConfigError> {
        Self::with_codec(backend, Arc::new(RawFloatCodec), config)
    }

    /// Create a service with a custom codec for compressed payloads.
    pub fn with_codec(
        backend: B,
        codec: Arc<dyn TileCodec>,
        config: CacheConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (raster, atlas) = build_tiers(&config);
        let (tile_stream, _) = broadcast::channel(TILE_STREAM_CAPACITY);
        let pool = DecompressionPool::new(config.worker_count, codec);

        Ok(Self {
            backend,
            compressed: CompressedTileCache::new(config.lru_capacity_system),
            config,
            contexts: HashMap::new(),
            pending_requests: HashMap::new(),
            pending_decompressions: HashMap::new(),
            raster,
            atlas,
            pool,
            request_counter: 0,
            tile_stream,
            counters: Counters::default(),
        })
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Make `tiles` of a file available for the given context.
    ///
    /// A context different from the file's stored one is a switch: every L1
    /// tile is evicted, and the file's pending requests and L2 entries are
    /// dropped. The first request for a file only records its context, so
    /// tiles of other files stay resident. Tiles that are resident, already requested or being decoded
    /// are skipped. L2 hits go straight to decompression; the rest are sent
    /// to the backend nearest-first, where `focus` and tile centres
    /// `(x + 0.5, y + 0.5)` are both in tile-grid units of the requested
    /// layer.
    pub fn request_tiles(
        &mut self,
        tiles: &[TileCoordinate],
        file_id: i32,
        channel: i32,
        stokes: i32,
        focus: Point2D,
        compression_quality: i32,
    ) {
        let context = ChannelContext { channel, stokes };
        let previous = self.contexts.get(&file_id).copied();
        let channels_changed = previous != Some(context);
        if channels_changed {
            if previous.is_some() {
                debug!(file_id, channel, stokes, "Channel context switch");
                self.raster.clear();
            } else {
                debug!(file_id, channel, stokes, "First request for file");
            }
            self.clear_request_queue(Some(file_id));
            self.compressed.clear_file(file_id);
            self.contexts.insert(file_id, context);
        }

        let key = ChannelKey::new(file_id, channel, stokes);
        let mut new_requests = Vec::new();

        for tile in tiles {
            let Some(encoded) = tile.try_encode() else {
                continue;
            };
            if self.is_pending_request(&key, encoded)
                || self.is_pending_decompression(&key, encoded)
                || self.raster.contains(add_file_id(encoded, file_id), tile.layer)
            {
                continue;
            }

            if let Some(cached) = self.compressed.get(file_id, encoded).cloned() {
                self.dispatch_decompression(
                    key,
                    encoded,
                    &cached.payload,
                    cached.compression_quality,
                );
            } else {
                self.pending_requests.entry(key).or_default().insert(encoded);
                new_requests.push(*tile);
            }
        }

        sort_by_focus(&mut new_requests, focus);
        let encoded: Vec<u32> = new_requests.iter().map(TileCoordinate::encode).collect();

        if channels_changed {
            self.backend.set_channels(
                file_id,
                channel,
                stokes,
                AddRequiredTiles::zfp(file_id, compression_quality, encoded),
            );
        } else if !encoded.is_empty() {
            self.backend
                .add_required_tiles(file_id, encoded, compression_quality);
        }

        if new_requests.is_empty() {
            self.emit(TileStreamDetails {
                tile_count: 0,
                file_id,
                channel,
                stokes,
                flush: false,
            });
        }
    }

    fn is_pending_request(&self, key: &ChannelKey, encoded: u32) -> bool {
        self.pending_requests
            .get(key)
            .is_some_and(|set| set.contains(&encoded))
    }

    fn is_pending_decompression(&self, key: &ChannelKey, encoded: u32) -> bool {
        self.pending_decompressions
            .get(key)
            .is_some_and(|set| set.contains(&encoded))
    }

    /// Forget outstanding backend requests, for one file or all of them.
    pub fn clear_request_queue(&mut self, file_id: Option<i32>) {
        match file_id {
            Some(file_id) => self.pending_requests.retain(|key, _| key.file_id != file_id),
            None => self.pending_requests.clear(),
        }
    }

    // =========================================================================
    // Incoming Tiles
    // =========================================================================

    /// Accept a batch of tiles from the backend.
    pub fn handle_raster_tile_data(&mut self, message: RasterTileData) {
        let RasterTileData {
            file_id,
            channel,
            stokes,
            compression_type,
            compression_quality,
            tiles,
        } = message;

        if !compression_type.is_supported() {
            error!(
                file_id,
                compression = compression_type.code(),
                tiles = tiles.len(),
                "Unsupported tile compression type"
            );
            self.counters.unsupported_dropped += tiles.len() as u64;
            return;
        }

        if !self.is_current(file_id, channel, stokes) {
            debug!(file_id, channel, stokes, tiles = tiles.len(), "Discarding stale tiles");
            self.counters.stale_discarded += tiles.len() as u64;
            return;
        }

        let key = ChannelKey::new(file_id, channel, stokes);
        for tile in tiles {
            let coordinate = TileCoordinate::new(tile.x, tile.y, tile.layer);
            let Some(encoded) = coordinate.try_encode() else {
                warn!(file_id, ?coordinate, "Tile outside its layer");
                continue;
            };

            let was_pending = self
                .pending_requests
                .get_mut(&key)
                .is_some_and(|set| set.remove(&encoded));
            if !was_pending {
                debug!(file_id, ?coordinate, "No pending request for tile");
                continue;
            }

            match compression_type {
                CompressionType::None => {
                    self.insert_uncompressed(key, encoded, &tile);
                }
                _ => {
                    self.compressed.put(
                        file_id,
                        encoded,
                        CompressedTile {
                            payload: tile.clone(),
                            compression_quality,
                        },
                    );
                    self.dispatch_decompression(key, encoded, &tile, compression_quality);
                }
            }
        }
    }

    fn insert_uncompressed(&mut self, key: ChannelKey, encoded: u32, tile: &TilePayload) {
        let decoded = decode_raw(&tile.image_data, tile.width, tile.height).and_then(|mut data| {
            apply_nan_encodings(&mut data, &tile.nan_encodings)?;
            Ok(data)
        });

        match decoded {
            Ok(data) => {
                self.insert_raster(key, encoded, data, tile.width, tile.height);
            }
            Err(e) => {
                warn!(file_id = key.file_id, encoded, error = %e, "Invalid uncompressed tile");
                self.counters.decode_failures += 1;
            }
        }
    }

    fn dispatch_decompression(
        &mut self,
        key: ChannelKey,
        encoded: u32,
        payload: &TilePayload,
        compression_quality: i32,
    ) {
        let job = DecodeJob {
            request_id: self.request_counter,
            file_id: key.file_id,
            channel: key.channel,
            stokes: key.stokes,
            encoded,
            layer: get_layer(encoded),
            width: payload.width,
            height: payload.height,
            compression_quality,
            data: payload.image_data.clone(),
            nan_encodings: payload.nan_encodings.clone(),
        };
        self.request_counter += 1;

        match self.pool.dispatch(job) {
            Ok(()) => {
                self.pending_decompressions
                    .entry(key)
                    .or_default()
                    .insert(encoded);
            }
            Err(e) => warn!(
                file_id = key.file_id,
                encoded,
                error = %e,
                "Failed to queue tile for decoding"
            ),
        }
    }

    // =========================================================================
    // Decoded Tiles
    // =========================================================================

    /// Apply every decode result that is already available. Returns how many
    /// were processed.
    pub fn poll_decoded(&mut self) -> usize {
        let mut processed = 0;
        while let Some(decoded) = self.pool.try_recv() {
            self.process_decoded(decoded);
            processed += 1;
        }
        processed
    }

    /// Wait for the next decode result and apply it.
    ///
    /// Returns `None` only when the pool has shut down.
    pub async fn next_decoded(&mut self) -> Option<TileDisposition> {
        let decoded = self.pool.recv().await?;
        Some(self.process_decoded(decoded))
    }

    fn process_decoded(&mut self, decoded: DecodedTile) -> TileDisposition {
        let key = ChannelKey::new(decoded.file_id, decoded.channel, decoded.stokes);
        if let Some(set) = self.pending_decompressions.get_mut(&key) {
            set.remove(&decoded.encoded);
            if set.is_empty() {
                self.pending_decompressions.remove(&key);
            }
        }

        let data = match decoded.result {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    file_id = decoded.file_id,
                    encoded = decoded.encoded,
                    error = %e,
                    "Tile decode failed"
                );
                // The next request for this tile goes back to the backend
                if self.is_current(decoded.file_id, decoded.channel, decoded.stokes) {
                    self.compressed.remove(decoded.file_id, decoded.encoded);
                }
                self.counters.decode_failures += 1;
                return TileDisposition::Failed;
            }
        };

        if !self.is_current(decoded.file_id, decoded.channel, decoded.stokes) {
            debug!(
                file_id = decoded.file_id,
                channel = decoded.channel,
                encoded = decoded.encoded,
                "Discarding stale decoded tile"
            );
            self.counters.stale_discarded += 1;
            return TileDisposition::Stale;
        }

        self.insert_raster(key, decoded.encoded, data, decoded.width, decoded.height)
    }

    fn insert_raster(
        &mut self,
        key: ChannelKey,
        encoded: u32,
        data: Vec<f32>,
        width: u32,
        height: u32,
    ) -> TileDisposition {
        let cache_key = add_file_id(encoded, key.file_id);
        let Some(insertion) = self
            .raster
            .insert(cache_key, get_layer(encoded), data, width, height)
        else {
            self.counters.dropped_no_slot += 1;
            return TileDisposition::Dropped;
        };

        let flush =
            !self.is_pending_request_key(&key) && !self.pending_decompressions.contains_key(&key);
        self.emit(TileStreamDetails {
            tile_count: 1,
            file_id: key.file_id,
            channel: key.channel,
            stokes: key.stokes,
            flush,
        });

        TileDisposition::Inserted {
            file_id: key.file_id,
            encoded,
            texture_slot: insertion.texture_slot,
        }
    }

    fn is_pending_request_key(&self, key: &ChannelKey) -> bool {
        self.pending_requests
            .get(key)
            .is_some_and(|set| !set.is_empty())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    fn is_current(&self, file_id: i32, channel: i32, stokes: i32) -> bool {
        self.contexts.get(&file_id) == Some(&ChannelContext { channel, stokes })
    }

    /// The resident tile for `encoded`, or `None`. Never triggers a fetch.
    ///
    /// With `peek`, LRU recency is left untouched.
    pub fn get_tile(
        &mut self,
        encoded: u32,
        file_id: i32,
        channel: i32,
        stokes: i32,
        peek: bool,
    ) -> Option<&RasterTile> {
        if !self.is_current(file_id, channel, stokes) {
            return None;
        }
        self.raster
            .get(add_file_id(encoded, file_id), get_layer(encoded), peek)
    }

    /// Like [`get_tile`](Self::get_tile) with `peek`, through a shared borrow.
    pub fn peek_tile(
        &self,
        encoded: u32,
        file_id: i32,
        channel: i32,
        stokes: i32,
    ) -> Option<&RasterTile> {
        if !self.is_current(file_id, channel, stokes) {
            return None;
        }
        self.raster.peek(add_file_id(encoded, file_id), get_layer(encoded))
    }

    pub fn channel_context(&self, file_id: i32) -> Option<ChannelContext> {
        self.contexts.get(&file_id).copied()
    }

    /// Tiles still waiting for the backend.
    pub fn remaining_tiles(&self) -> usize {
        self.pending_requests.values().map(HashSet::len).sum()
    }

    /// Tiles handed to the pool and not yet collected.
    pub fn pending_decompression_count(&self) -> usize {
        self.pending_decompressions.values().map(HashSet::len).sum()
    }

    /// Subscribe to tile-ready notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TileStreamDetails> {
        self.tile_stream.subscribe()
    }

    fn emit(&self, details: TileStreamDetails) {
        // No subscribers is fine
        let _ = self.tile_stream.send(details);
    }

    pub fn stats(&self) -> CacheStats {
        let layout = self.atlas.layout();
        CacheStats {
            lru_tiles: self.raster.lru_len(),
            lru_capacity: self.raster.lru_capacity(),
            persistent_tiles: self.raster.persistent_len(),
            compressed_tiles: self.compressed.len(),
            free_slots: self.raster.slots().available(),
            total_slots: layout.total_slots(),
            num_textures: layout.num_textures(),
            remaining_tiles: self.remaining_tiles(),
            pending_decompressions: self.pending_decompression_count(),
            stale_discarded: self.counters.stale_discarded,
            unsupported_dropped: self.counters.unsupported_dropped,
            decode_failures: self.counters.decode_failures,
            dropped_no_slot: self.counters.dropped_no_slot,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // =========================================================================
    // Cache Lifecycle
    // =========================================================================

    /// Evict every L1 tile and, with `clear_l2`, every compressed tile.
    pub fn clear_cache(&mut self, clear_l2: bool) {
        self.raster.clear();
        if clear_l2 {
            self.compressed.clear();
        }
    }

    /// Drop everything held for a file.
    pub fn handle_file_closed(&mut self, file_id: i32) {
        self.compressed.clear_file(file_id);
        self.raster.clear_file(file_id);
        self.contexts.remove(&file_id);
        self.pending_requests.retain(|key, _| key.file_id != file_id);
        self.pending_decompressions
            .retain(|key, _| key.file_id != file_id);
    }

    /// Move a file that is not on screen to a new context without requesting
    /// any tiles.
    pub fn update_hidden_file_channels(&mut self, file_id: i32, channel: i32, stokes: i32) {
        self.compressed.clear_file(file_id);
        self.raster.clear_file(file_id);
        self.pending_requests.retain(|key, _| key.file_id != file_id);
        self.contexts
            .insert(file_id, ChannelContext { channel, stokes });
        self.backend.set_channels(
            file_id,
            channel,
            stokes,
            AddRequiredTiles::zfp(file_id, 0, Vec::new()),
        );
    }

    /// Rebuild both tiers with new capacities. Every cached tile is dropped
    /// and, if textures were allocated, the atlas is reallocated on `gpu`.
    ///
    /// Returns the effective GPU LRU capacity.
    pub fn set_cache<G: GpuContext>(
        &mut self,
        gpu: &mut G,
        lru_capacity_gpu: u32,
        lru_capacity_system: usize,
    ) -> Result<usize, ConfigError> {
        let config = CacheConfig {
            lru_capacity_gpu,
            lru_capacity_system,
            ..self.config.clone()
        };
        config.validate()?;

        let had_context = self.atlas.has_context();
        self.atlas.clear_textures(gpu);

        let (raster, atlas) = build_tiers(&config);
        self.raster = raster;
        self.atlas = atlas;
        self.compressed = CompressedTileCache::new(config.lru_capacity_system);
        self.config = config;

        if had_context {
            self.atlas.set_context(gpu);
        }
        Ok(self.raster.lru_capacity())
    }

    // =========================================================================
    // GPU
    // =========================================================================

    /// Allocate the atlas textures. Resident tiles must be uploaded again.
    pub fn set_context<G: GpuContext>(&mut self, gpu: &mut G) {
        self.atlas.set_context(gpu);
    }

    pub fn clear_textures<G: GpuContext>(&mut self, gpu: &mut G) {
        self.atlas.clear_textures(gpu);
    }

    pub fn atlas(&self) -> &TextureAtlas {
        &self.atlas
    }

    pub fn get_tile_texture_parameters(
        &self,
        tile: &RasterTile,
    ) -> Result<TileTextureParameters, AtlasError> {
        self.atlas.texture_parameters(tile.texture_slot)
    }

    /// Copy a resident tile's pixels into its slot.
    pub fn upload_tile_to_gpu<G: GpuContext>(
        &self,
        gpu: &mut G,
        tile: &RasterTile,
    ) -> Result<(), AtlasError> {
        self.atlas
            .upload(gpu, &tile.data, tile.width, tile.height, tile.texture_slot)
    }
}

impl<B: TileBackend> std::fmt::Debug for TileService<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileService")
            .field("contexts", &self.contexts)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Sort tiles nearest-first by squared distance from `focus` to each tile
/// centre. Equal distances keep their original order.
pub fn sort_by_focus(tiles: &mut [TileCoordinate], focus: Point2D) {
    let distance = |tile: &TileCoordinate| {
        let dx = tile.x as f64 + 0.5 - focus.x;
        let dy = tile.y as f64 + 0.5 - focus.y;
        dx * dx + dy * dy
    };
    tiles.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
}

// =============================================================================
// Tests
// =============================================================================
