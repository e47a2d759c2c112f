//! Tile caching and streaming layer.
//!
//! This module turns viewport changes into tile requests, caches what comes
//! back, decodes it off-thread and places decoded rasters in a GPU texture
//! atlas.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Renderer / Viewport            │
//! └──────────┬──────────────────▲───────────┘
//!            │ get_required_tiles│ tile stream, get_tile
//!            ▼                   │
//! ┌─────────────────────────────────────────┐
//! │              TileService                │
//! │  ┌────────────┐ ┌──────────┐ ┌────────┐ │
//! │  │ L2         │ │ L1       │ │ Atlas  │ │
//! │  │ compressed │ │ decoded  │ │ slots  │ │
//! │  └────────────┘ └──────────┘ └────────┘ │
//! │          │ DecompressionPool ▲          │
//! └──────────┼───────────────────┼──────────┘
//!            ▼                   │
//! ┌─────────────────────────────────────────┐
//! │              TileBackend                │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`coordinate`]: `(x, y, layer)` addressing and its integer encoding
//! - [`tiling`]: layer/mip conversion and the tiles covering a view
//! - [`atlas`]: slot arithmetic, slot free-list and the GPU seam
//! - [`cache`]: the L1 (decoded) and L2 (compressed) tiers
//! - [`decompress`]: worker pool, codec seam and NaN restoration
//! - [`TileService`]: the coordinator tying them together
//!
//! # Example
//!
//! ```
//! use cube_streamer::tile::{get_required_tiles, FrameView, Size2D};
//!
//! let view = FrameView::new(0.0, 1024.0, 0.0, 1024.0, 1);
//! let tiles = get_required_tiles(&view, Size2D::new(1024, 1024), Size2D::new(256, 256));
//!
//! assert_eq!(tiles.len(), 16);
//! assert!(tiles.iter().all(|tile| tile.layer == 2));
//! ```

pub mod atlas;
pub mod cache;
pub mod coordinate;
pub mod decompress;
mod service;
pub mod tiling;

pub use atlas::{
    AtlasLayout, GpuContext, HeadlessGpu, SlotLocation, TextureAtlas, TextureHandle,
    TextureSlotPool, TileTextureParameters, DEFAULT_TEXTURE_SIZE, DEFAULT_TILE_SIZE, MAX_TEXTURES,
};
pub use cache::{CompressedTile, CompressedTileCache, Insertion, RasterTile, RasterTileCache};
pub use coordinate::{
    add_file_id, decode, encode, file_id_of, get_layer, remove_file_id, tile_sort,
    TileCoordinate, MAX_LAYER,
};
pub use decompress::{
    apply_nan_encodings, default_worker_count, encode_nan_runs, DecodeJob, DecodedTile,
    DecompressionPool, RawFloatCodec, TileCodec,
};
pub use service::{
    sort_by_focus, CacheStats, ChannelContext, TileDisposition, TileService, TileStreamDetails,
};
pub use tiling::{
    get_required_tiles, layer_to_mip, mip_to_layer, total_layers, FrameView, Point2D, Size2D,
};
