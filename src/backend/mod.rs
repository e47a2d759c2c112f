//! Backend boundary.
//!
//! The tile service never talks to a socket directly. It issues requests
//! through the [`TileBackend`] trait and is handed [`RasterTileData`] messages
//! by whoever owns the connection.
//!
//! ```text
//!  ┌──────────────┐  set_channels / add_required_tiles  ┌──────────────┐
//!  │ TileService  │────────────────────────────────────▶│ TileBackend  │
//!  │              │                                     └──────┬───────┘
//!  │              │◀──── handle_raster_tile_data ───────────────┘
//!  └──────────────┘       (RasterTileData, async)
//! ```
//!
//! [`ChannelBackend`] forwards requests over a tokio channel, which is how the
//! simulator and the integration tests drive the service.

mod synthetic;

pub use synthetic::{SyntheticImage, SyntheticServer};

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

// =============================================================================
// Wire Types
// =============================================================================

/// Compression applied to a tile payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompressionType {
    /// Raw little-endian `f32` samples
    None,
    /// ZFP fixed-precision stream
    Zfp,
    /// SZ error-bounded stream
    Sz,
    /// A code this client does not know
    Unknown(i32),
}

impl CompressionType {
    /// Wire code of this compression type.
    pub fn code(self) -> i32 {
        match self {
            CompressionType::None => 0,
            CompressionType::Zfp => 1,
            CompressionType::Sz => 2,
            CompressionType::Unknown(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => CompressionType::None,
            1 => CompressionType::Zfp,
            2 => CompressionType::Sz,
            other => CompressionType::Unknown(other),
        }
    }

    /// Whether the service can turn a payload of this type into pixels.
    pub fn is_supported(self) -> bool {
        matches!(self, CompressionType::None | CompressionType::Zfp)
    }
}

/// One tile inside a [`RasterTileData`] message.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePayload {
    pub x: u32,
    pub y: u32,
    pub layer: u32,
    pub width: u32,
    pub height: u32,
    /// Compressed (or raw) pixel data
    pub image_data: Bytes,
    /// Alternating valid/NaN run lengths as little-endian `i32`
    pub nan_encodings: Bytes,
}

/// A batch of tiles for one file, channel and Stokes parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTileData {
    pub file_id: i32,
    pub channel: i32,
    pub stokes: i32,
    pub compression_type: CompressionType,
    pub compression_quality: i32,
    pub tiles: Vec<TilePayload>,
}

/// A request for a set of encoded tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequiredTiles {
    pub file_id: i32,
    pub compression_type: CompressionType,
    pub compression_quality: i32,
    /// Encoded coordinates, nearest to the focus first
    pub tiles: Vec<u32>,
}

impl AddRequiredTiles {
    /// A ZFP request for `tiles`.
    pub fn zfp(file_id: i32, compression_quality: i32, tiles: Vec<u32>) -> Self {
        Self {
            file_id,
            compression_type: CompressionType::Zfp,
            compression_quality,
            tiles,
        }
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Outbound requests from the tile service.
///
/// Both calls are fire-and-forget: tiles come back later through
/// `TileService::handle_raster_tile_data`.
pub trait TileBackend: Send + Sync {
    /// Switch a file to a new channel and request its first tiles.
    fn set_channels(
        &self,
        file_id: i32,
        channel: i32,
        stokes: i32,
        required_tiles: AddRequiredTiles,
    );

    /// Request more tiles on the file's current channel.
    fn add_required_tiles(&self, file_id: i32, tiles: Vec<u32>, compression_quality: i32);
}

impl<T: TileBackend + ?Sized> TileBackend for Arc<T> {
    fn set_channels(
        &self,
        file_id: i32,
        channel: i32,
        stokes: i32,
        required_tiles: AddRequiredTiles,
    ) {
        (**self).set_channels(file_id, channel, stokes, required_tiles)
    }

    fn add_required_tiles(&self, file_id: i32, tiles: Vec<u32>, compression_quality: i32) {
        (**self).add_required_tiles(file_id, tiles, compression_quality)
    }
}

// =============================================================================
// Channel Backend
// =============================================================================

/// A request as seen on the far side of a [`ChannelBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendRequest {
    SetChannels {
        file_id: i32,
        channel: i32,
        stokes: i32,
        required_tiles: AddRequiredTiles,
    },
    AddRequiredTiles(AddRequiredTiles),
}

/// Backend that forwards every request over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelBackend {
    tx: mpsc::UnboundedSender<BackendRequest>,
}

impl ChannelBackend {
    /// Create the backend together with the receiving end of its requests.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BackendRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, request: BackendRequest) {
        if self.tx.send(request).is_err() {
            tracing::warn!("Backend request dropped: receiver closed");
        }
    }
}

impl TileBackend for ChannelBackend {
    fn set_channels(
        &self,
        file_id: i32,
        channel: i32,
        stokes: i32,
        required_tiles: AddRequiredTiles,
    ) {
        self.send(BackendRequest::SetChannels {
            file_id,
            channel,
            stokes,
            required_tiles,
        });
    }

    fn add_required_tiles(&self, file_id: i32, tiles: Vec<u32>, compression_quality: i32) {
        self.send(BackendRequest::AddRequiredTiles(AddRequiredTiles::zfp(
            file_id,
            compression_quality,
            tiles,
        )));
    }
}
