//! Configuration for the cube streamer.
//!
//! Two layers live here:
//! - [`CacheConfig`]: the tuning knobs of the tile service itself, usable
//!   from library code with [`Default`] values.
//! - [`Cli`]: command-line arguments for the `cube-streamer` binary, parsed
//!   with clap. Every option can also be set through the environment.
//!
//! # Environment Variables
//!
//! - `CUBE_GPU_CACHE` - Decoded tiles in the GPU LRU (default: 512)
//! - `CUBE_SYSTEM_CACHE` - Compressed tiles kept per file (default: 4096)
//! - `CUBE_PERSISTENT_LAYERS` - Coarse layers never evicted (default: 3)
//! - `CUBE_WORKERS` - Decompression threads (default: min(cores, 4))
//! - `CUBE_TEXTURE_SIZE` - Atlas texture edge in pixels (default: 4096)
//! - `CUBE_TILE_SIZE` - Tile edge in pixels (default: 256)
//! - `CUBE_MAX_TEXTURES` - Upper bound on atlas textures (default: 8)
//! - `CUBE_COMPRESSION_QUALITY` - Requested ZFP precision (default: 11)

use clap::{Args, Parser, Subcommand};

use crate::error::ConfigError;
use crate::tile::atlas::{DEFAULT_TEXTURE_SIZE, DEFAULT_TILE_SIZE, MAX_TEXTURES};
use crate::tile::cache::{
    persistent_tile_count, DEFAULT_GPU_CACHE_CAPACITY, DEFAULT_PERSISTENT_LAYERS,
    DEFAULT_SYSTEM_CACHE_CAPACITY,
};
use crate::tile::coordinate::MAX_LAYER;
use crate::tile::decompress::default_worker_count;

// =============================================================================
// Default Values
// =============================================================================

/// Default ZFP precision requested from the backend.
pub const DEFAULT_COMPRESSION_QUALITY: i32 = 11;

/// Default simulated image edge in pixels.
pub const DEFAULT_IMAGE_SIZE: u32 = 8192;

/// Default simulated viewport edge in screen pixels.
pub const DEFAULT_VIEWPORT_SIZE: u32 = 1024;

// =============================================================================
// Cache Configuration
// =============================================================================

/// Sizing of the tile caches, atlas and worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Requested capacity of the GPU LRU; rounded to fill whole textures
    pub lru_capacity_gpu: u32,
    /// Capacity of each file's compressed tile cache
    pub lru_capacity_system: usize,
    /// Layers `0..n` bypass the LRU and are never evicted
    pub num_persistent_layers: u32,
    pub worker_count: usize,
    pub texture_size: u32,
    pub tile_size: u32,
    pub max_textures: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lru_capacity_gpu: DEFAULT_GPU_CACHE_CAPACITY,
            lru_capacity_system: DEFAULT_SYSTEM_CACHE_CAPACITY,
            num_persistent_layers: DEFAULT_PERSISTENT_LAYERS,
            worker_count: default_worker_count(),
            texture_size: DEFAULT_TEXTURE_SIZE,
            tile_size: DEFAULT_TILE_SIZE,
            max_textures: MAX_TEXTURES,
        }
    }
}

impl CacheConfig {
    /// Tiles held by the persistent tier when every persistent layer is full.
    pub fn persistent_capacity(&self) -> u64 {
        persistent_tile_count(self.num_persistent_layers)
    }

    /// Largest number of slots the atlas can ever hold.
    pub fn max_slots(&self) -> u64 {
        let per_row = (self.texture_size / self.tile_size.max(1)) as u64;
        per_row * per_row * self.max_textures as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("lru_capacity_gpu", self.lru_capacity_gpu as usize),
            ("lru_capacity_system", self.lru_capacity_system),
            ("worker_count", self.worker_count),
            ("texture_size", self.texture_size as usize),
            ("tile_size", self.tile_size as usize),
            ("max_textures", self.max_textures as usize),
        ];
        if let Some(&(name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { name });
        }

        if self.tile_size > self.texture_size || self.texture_size % self.tile_size != 0 {
            return Err(ConfigError::TileSizeMismatch {
                tile_size: self.tile_size,
                texture_size: self.texture_size,
            });
        }

        if self.num_persistent_layers > MAX_LAYER + 1 {
            return Err(ConfigError::TooManyPersistentLayers(
                self.num_persistent_layers,
            ));
        }

        let persistent = self.persistent_capacity();
        let total_slots = self.max_slots();
        if persistent >= total_slots {
            return Err(ConfigError::PersistentExceedsAtlas {
                persistent,
                total_slots,
            });
        }

        Ok(())
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cube Streamer - tile cache and streaming pipeline for image cubes.
#[derive(Parser, Debug, Clone)]
#[command(name = "cube-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Drive the tile service against a synthetic backend and report cache
    /// behaviour.
    Simulate(SimulateConfig),

    /// Print the tiles required to cover a view.
    Plan(PlanConfig),
}

/// Options for `cube-streamer simulate`.
#[derive(Args, Debug, Clone)]
pub struct SimulateConfig {
    // =========================================================================
    // Image
    // =========================================================================
    /// Simulated image width in pixels.
    #[arg(long, default_value_t = DEFAULT_IMAGE_SIZE, env = "CUBE_IMAGE_WIDTH")]
    pub image_width: u32,

    /// Simulated image height in pixels.
    #[arg(long, default_value_t = DEFAULT_IMAGE_SIZE, env = "CUBE_IMAGE_HEIGHT")]
    pub image_height: u32,

    /// Number of spectral channels in the cube.
    #[arg(long, default_value_t = 4, env = "CUBE_CHANNELS")]
    pub channels: i32,

    /// Viewport edge in screen pixels.
    #[arg(long, default_value_t = DEFAULT_VIEWPORT_SIZE, env = "CUBE_VIEWPORT")]
    pub viewport: u32,

    // =========================================================================
    // Cache
    // =========================================================================
    /// Decoded tiles kept in the GPU LRU.
    #[arg(long, default_value_t = DEFAULT_GPU_CACHE_CAPACITY, env = "CUBE_GPU_CACHE")]
    pub gpu_cache: u32,

    /// Compressed tiles kept per file.
    #[arg(long, default_value_t = DEFAULT_SYSTEM_CACHE_CAPACITY, env = "CUBE_SYSTEM_CACHE")]
    pub system_cache: usize,

    /// Coarse layers that are never evicted.
    #[arg(long, default_value_t = DEFAULT_PERSISTENT_LAYERS, env = "CUBE_PERSISTENT_LAYERS")]
    pub persistent_layers: u32,

    /// Decompression threads. Defaults to min(cores, 4).
    #[arg(long, env = "CUBE_WORKERS")]
    pub workers: Option<usize>,

    /// Atlas texture edge in pixels.
    #[arg(long, default_value_t = DEFAULT_TEXTURE_SIZE, env = "CUBE_TEXTURE_SIZE")]
    pub texture_size: u32,

    /// Tile edge in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "CUBE_TILE_SIZE")]
    pub tile_size: u32,

    /// Upper bound on atlas textures.
    #[arg(long, default_value_t = MAX_TEXTURES, env = "CUBE_MAX_TEXTURES")]
    pub max_textures: u32,

    /// ZFP precision requested from the backend.
    #[arg(long, default_value_t = DEFAULT_COMPRESSION_QUALITY, env = "CUBE_COMPRESSION_QUALITY")]
    pub compression_quality: i32,

    // =========================================================================
    // Output
    // =========================================================================
    /// Print final cache statistics as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl SimulateConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err("image dimensions must be greater than 0".to_string());
        }
        if self.channels <= 0 {
            return Err("channels must be greater than 0".to_string());
        }
        if self.viewport == 0 {
            return Err("viewport must be greater than 0".to_string());
        }
        self.cache_config()
            .validate()
            .map_err(|e| e.to_string())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            lru_capacity_gpu: self.gpu_cache,
            lru_capacity_system: self.system_cache,
            num_persistent_layers: self.persistent_layers,
            worker_count: self.workers.unwrap_or_else(default_worker_count),
            texture_size: self.texture_size,
            tile_size: self.tile_size,
            max_textures: self.max_textures,
        }
    }
}

/// Options for `cube-streamer plan`.
#[derive(Args, Debug, Clone)]
pub struct PlanConfig {
    /// Image width in pixels.
    #[arg(long)]
    pub image_width: u32,

    /// Image height in pixels.
    #[arg(long)]
    pub image_height: u32,

    /// Tile edge in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "CUBE_TILE_SIZE")]
    pub tile_size: u32,

    /// Left edge of the view in image pixels.
    #[arg(long, allow_hyphen_values = true)]
    pub x_min: f64,

    /// Right edge of the view in image pixels.
    #[arg(long, allow_hyphen_values = true)]
    pub x_max: f64,

    /// Bottom edge of the view in image pixels.
    #[arg(long, allow_hyphen_values = true)]
    pub y_min: f64,

    /// Top edge of the view in image pixels.
    #[arg(long, allow_hyphen_values = true)]
    pub y_max: f64,

    /// Decimation factor of the view.
    #[arg(long, default_value_t = 1)]
    pub mip: u32,
}

impl PlanConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err("image dimensions must be greater than 0".to_string());
        }
        if self.tile_size == 0 {
            return Err("tile_size must be greater than 0".to_string());
        }
        if self.mip == 0 {
            return Err("mip must be at least 1".to_string());
        }
        if !(self.x_min < self.x_max && self.y_min < self.y_max) {
            return Err("view bounds must satisfy min < max".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
