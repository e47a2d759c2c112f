//! # Cube Streamer
//!
//! A tile cache and streaming pipeline for astronomical image cubes.
//!
//! A viewer looking at one channel of a large cube only ever needs the tiles
//! under its viewport, at the resolution it is displaying. This library
//! computes those tiles, fetches the missing ones from a backend, decodes
//! them on a small worker pool and keeps the results in a two-tier cache
//! backed by a GPU texture atlas.
//!
//! ## Features
//!
//! - **Resolution layers**: tiles addressed by `(x, y, layer)` with a compact integer encoding
//! - **Viewport planning**: the exact tile set covering a view, in time proportional to its size
//! - **Two-tier cache**: compressed payloads in system memory, decoded rasters in GPU slots
//! - **Persistent overview**: the coarsest layers are always resident as a fallback
//! - **Channel switching**: results for a channel that is no longer shown are never displayed
//!
//! ## Architecture
//!
//! - [`tile`] - Addressing, tiling math, caches, atlas, decoding and the [`TileService`]
//! - [`backend`] - The backend boundary plus channel-based and synthetic implementations
//! - [`config`] - Cache configuration and the CLI
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```rust,no_run
//! use cube_streamer::{CacheConfig, ChannelBackend, Point2D, TileCoordinate, TileService};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (backend, _requests) = ChannelBackend::new();
//!     let mut service = TileService::new(backend, CacheConfig::default()).unwrap();
//!
//!     let tiles = [TileCoordinate::new(0, 0, 0)];
//!     service.request_tiles(&tiles, 0, 0, 0, Point2D::new(0.5, 0.5), 11);
//!
//!     // Feed backend replies to service.handle_raster_tile_data(..),
//!     // then collect decoded tiles:
//!     while let Some(disposition) = service.next_decoded().await {
//!         println!("{disposition:?}");
//!     }
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod tile;

// Re-export commonly used types
pub use backend::{
    AddRequiredTiles, BackendRequest, ChannelBackend, CompressionType, RasterTileData,
    SyntheticImage, SyntheticServer, TileBackend, TilePayload,
};
pub use config::{CacheConfig, Cli, Command, PlanConfig, SimulateConfig};
pub use error::{AtlasError, ConfigError, DecodeError};
pub use tile::{
    get_required_tiles, CacheStats, FrameView, GpuContext, HeadlessGpu, Point2D, RasterTile,
    Size2D, TileCoordinate, TileDisposition, TileService, TileStreamDetails,
};
