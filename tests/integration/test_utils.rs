//! Test utilities for integration tests.
//!
//! This module provides recording implementations of the backend and GPU
//! seams, payload builders, and a small harness that wires a `TileService`
//! to a `SyntheticServer` without any background tasks.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cube_streamer::tile::{GpuContext, RawFloatCodec, TextureHandle};
use cube_streamer::{
    AddRequiredTiles, BackendRequest, CacheConfig, CompressionType, Point2D, RasterTileData,
    Size2D, SyntheticImage, SyntheticServer, TileBackend, TileCoordinate, TileDisposition,
    TilePayload, TileService,
};

// =============================================================================
// Recording Backend
// =============================================================================

/// A backend that records every request instead of sending it anywhere.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    requests: Arc<Mutex<Vec<BackendRequest>>>,
    request_count: Arc<AtomicUsize>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Remove and return everything recorded so far.
    pub fn take_requests(&self) -> Vec<BackendRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }

    /// Encoded tiles of every recorded request, in order.
    pub fn requested_tiles(&self) -> Vec<u32> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .flat_map(|request| match request {
                BackendRequest::SetChannels { required_tiles, .. } => required_tiles.tiles.clone(),
                BackendRequest::AddRequiredTiles(required) => required.tiles.clone(),
            })
            .collect()
    }

    fn record(&self, request: BackendRequest) {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
    }
}

impl TileBackend for RecordingBackend {
    fn set_channels(
        &self,
        file_id: i32,
        channel: i32,
        stokes: i32,
        required_tiles: AddRequiredTiles,
    ) {
        self.record(BackendRequest::SetChannels {
            file_id,
            channel,
            stokes,
            required_tiles,
        });
    }

    fn add_required_tiles(&self, file_id: i32, tiles: Vec<u32>, compression_quality: i32) {
        self.record(BackendRequest::AddRequiredTiles(AddRequiredTiles::zfp(
            file_id,
            compression_quality,
            tiles,
        )));
    }
}

// =============================================================================
// Recording GPU
// =============================================================================

/// A GPU context that remembers every upload.
#[derive(Default)]
pub struct RecordingGpu {
    next: u64,
    pub live: HashSet<TextureHandle>,
    /// (texture, x_offset, y_offset, first pixel)
    pub uploads: Vec<(TextureHandle, u32, u32, f32)>,
}

impl GpuContext for RecordingGpu {
    fn create_texture(&mut self, _width: u32, _height: u32) -> TextureHandle {
        self.next += 1;
        let handle = TextureHandle(self.next);
        self.live.insert(handle);
        handle
    }

    fn copy_to_texture(
        &mut self,
        texture: TextureHandle,
        data: &[f32],
        _width: u32,
        _height: u32,
        x_offset: u32,
        y_offset: u32,
    ) {
        let first = data.first().copied().unwrap_or(f32::NAN);
        self.uploads.push((texture, x_offset, y_offset, first));
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.live.remove(&texture);
    }
}

// =============================================================================
// Payload Builders
// =============================================================================

/// A raw-float payload filled with `value`.
pub fn filled_payload(tile: TileCoordinate, width: u32, height: u32, value: f32) -> TilePayload {
    TilePayload {
        x: tile.x,
        y: tile.y,
        layer: tile.layer,
        width,
        height,
        image_data: RawFloatCodec::encode(&vec![value; (width * height) as usize]),
        nan_encodings: Bytes::new(),
    }
}

/// NaN run lengths as they appear on the wire.
pub fn nan_runs(lengths: &[i32]) -> Bytes {
    let mut buf = BytesMut::new();
    for len in lengths {
        buf.put_i32_le(*len);
    }
    buf.freeze()
}

/// A single-tile message.
pub fn tile_message(
    file_id: i32,
    channel: i32,
    compression_type: CompressionType,
    payload: TilePayload,
) -> RasterTileData {
    RasterTileData {
        file_id,
        channel,
        stokes: 0,
        compression_type,
        compression_quality: 11,
        tiles: vec![payload],
    }
}

/// Every tile of one layer, column by column.
pub fn full_layer(layer: u32) -> Vec<TileCoordinate> {
    let edge = 1u32 << layer;
    (0..edge)
        .flat_map(|x| (0..edge).map(move |y| TileCoordinate::new(x, y, layer)))
        .collect()
}

pub fn small_config() -> CacheConfig {
    CacheConfig {
        lru_capacity_gpu: 12,
        lru_capacity_system: 256,
        num_persistent_layers: 2,
        worker_count: 2,
        texture_size: 1024,
        tile_size: 256,
        max_textures: 2,
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A service wired to a synthetic server through a recording backend.
pub struct Harness {
    pub service: TileService<RecordingBackend>,
    pub backend: RecordingBackend,
    pub server: SyntheticServer,
}

impl Harness {
    /// 1024 x 1024 cube with 256 px tiles (layers 0..=2) and 4 channels.
    pub fn new(config: CacheConfig) -> Self {
        let image = SyntheticImage::new(Size2D::new(1024, 1024), Size2D::new(256, 256), 4);
        let backend = RecordingBackend::new();
        Self {
            service: TileService::new(backend.clone(), config).unwrap(),
            backend,
            server: SyntheticServer::new(image),
        }
    }

    pub fn request(&mut self, tiles: &[TileCoordinate], file_id: i32, channel: i32) {
        self.service
            .request_tiles(tiles, file_id, channel, 0, Point2D::default(), 11);
    }

    /// Answer every recorded request, without delivering the replies.
    pub fn serve(&mut self) -> Vec<RasterTileData> {
        self.backend
            .take_requests()
            .into_iter()
            .flat_map(|request| self.server.handle(request))
            .collect()
    }

    /// Deliver replies to the service.
    pub fn deliver(&mut self, replies: Vec<RasterTileData>) {
        for reply in replies {
            self.service.handle_raster_tile_data(reply);
        }
    }

    /// Wait until nothing is being decoded, returning every disposition.
    pub async fn drain_decoded(&mut self) -> Vec<TileDisposition> {
        let mut dispositions = Vec::new();
        while self.service.pending_decompression_count() > 0 {
            match self.service.next_decoded().await {
                Some(disposition) => dispositions.push(disposition),
                None => break,
            }
        }
        dispositions
    }

    /// Serve, deliver and decode everything outstanding.
    pub async fn settle(&mut self) -> Vec<TileDisposition> {
        let replies = self.serve();
        self.deliver(replies);
        self.drain_decoded().await
    }
}
