use thiserror::Error;

/// Errors produced while decoding a compressed tile payload
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is shorter than the raster it claims to hold
    #[error("Payload too short: need {required} bytes, got {actual}")]
    PayloadTooShort { required: usize, actual: usize },

    /// NaN run lengths are not a whole number of i32 values
    #[error("Malformed NaN encodings: {0} bytes is not a multiple of 4")]
    MalformedNanEncodings(usize),

    /// Tile dimensions are zero or overflow the address space
    #[error("Invalid tile dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// The worker pool shut down before the job could be handed over
    #[error("Decompression pool is closed")]
    PoolClosed,
}

/// Errors from the texture atlas and the GPU context boundary
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AtlasError {
    /// Upload attempted before `set_context` allocated the textures
    #[error("No GPU context: textures have not been allocated")]
    NoContext,

    /// Slot index beyond the atlas
    #[error("Texture slot {slot} out of range (atlas has {total} slots)")]
    SlotOutOfRange { slot: u32, total: u32 },

    /// Raster larger than a single slot
    #[error("Tile {width}x{height} does not fit a {tile_size}px slot")]
    TileTooLarge {
        width: u32,
        height: u32,
        tile_size: u32,
    },
}

/// Invalid cache or atlas configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be greater than 0")]
    Zero { name: &'static str },

    #[error("Tile size {tile_size} must divide texture size {texture_size}")]
    TileSizeMismatch { tile_size: u32, texture_size: u32 },

    #[error("Persistent layer count {0} exceeds the maximum tile layer")]
    TooManyPersistentLayers(u32),

    #[error("{persistent} persistent tiles leave no room in a {total_slots}-slot atlas")]
    PersistentExceedsAtlas { persistent: u64, total_slots: u64 },
}
