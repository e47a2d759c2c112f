//! Tile addressing.
//!
//! A tile is addressed by `(x, y, layer)`. Layer 0 is the coarsest resolution
//! and covers the whole image with a single tile; each finer layer doubles the
//! grid along both axes, so `x` and `y` are bounded by `2^layer`.
//!
//! # Encoding
//!
//! Coordinates are packed into a single `u32` so they can be used as map keys
//! and sent to the backend as a flat list:
//!
//! ```text
//!  31      30..24        23..12        11..0
//! ┌───┬──────────────┬─────────────┬─────────────┐
//! │ 0 │ layer (7 bit)│ y (12 bit)  │ x (12 bit)  │
//! └───┴──────────────┴─────────────┴─────────────┘
//! ```
//!
//! Twelve bits per axis limit the grid to 4096 tiles, which caps the layer at
//! [`MAX_LAYER`]. Decoding the layer is a single shift and mask.

use serde::Serialize;

/// Finest layer representable by the 12-bit axis fields.
pub const MAX_LAYER: u32 = 12;

const AXIS_BITS: u32 = 12;
const AXIS_MASK: u32 = (1 << AXIS_BITS) - 1;
const LAYER_SHIFT: u32 = 2 * AXIS_BITS;
const LAYER_MASK: u32 = 0x7F;

/// Offset applied to encoded coordinates to fold a file id into a cache key.
const FILE_ID_SHIFT: u32 = 32;

/// Address of a single tile at a given resolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileCoordinate {
    pub x: u32,
    pub y: u32,
    pub layer: u32,
}

impl TileCoordinate {
    pub fn new(x: u32, y: u32, layer: u32) -> Self {
        Self { x, y, layer }
    }

    /// Whether the coordinate lies inside the grid of its layer.
    pub fn is_valid(&self) -> bool {
        self.layer <= MAX_LAYER && self.x < (1 << self.layer) && self.y < (1 << self.layer)
    }

    /// Encode this coordinate. See [`encode`].
    pub fn encode(&self) -> u32 {
        encode(self.x, self.y, self.layer)
    }

    /// Encode this coordinate, returning `None` when it is outside its layer.
    pub fn try_encode(&self) -> Option<u32> {
        self.is_valid().then(|| self.encode())
    }
}

/// Pack `(x, y, layer)` into a single key.
///
/// Callers must pass a valid coordinate (`layer <= MAX_LAYER`, `x, y < 2^layer`);
/// out-of-range values are a contract violation.
#[inline]
pub fn encode(x: u32, y: u32, layer: u32) -> u32 {
    debug_assert!(
        TileCoordinate::new(x, y, layer).is_valid(),
        "tile ({x}, {y}, {layer}) outside its layer"
    );
    (layer << LAYER_SHIFT) | (y << AXIS_BITS) | x
}

/// Unpack an encoded coordinate.
#[inline]
pub fn decode(encoded: u32) -> TileCoordinate {
    TileCoordinate {
        x: encoded & AXIS_MASK,
        y: (encoded >> AXIS_BITS) & AXIS_MASK,
        layer: get_layer(encoded),
    }
}

/// Extract only the layer from an encoded coordinate.
#[inline]
pub fn get_layer(encoded: u32) -> u32 {
    (encoded >> LAYER_SHIFT) & LAYER_MASK
}

/// Combine a file id with an encoded coordinate into a per-file cache key.
#[inline]
pub fn add_file_id(encoded: u32, file_id: i32) -> u64 {
    ((file_id as u32 as u64) << FILE_ID_SHIFT) | encoded as u64
}

/// Strip the file id from a per-file cache key.
#[inline]
pub fn remove_file_id(key: u64) -> u32 {
    key as u32
}

/// Recover the file id from a per-file cache key.
#[inline]
pub fn file_id_of(key: u64) -> i32 {
    (key >> FILE_ID_SHIFT) as u32 as i32
}

/// Order tiles by layer, then x, then y.
pub fn tile_sort(a: &TileCoordinate, b: &TileCoordinate) -> std::cmp::Ordering {
    a.layer
        .cmp(&b.layer)
        .then(a.x.cmp(&b.x))
        .then(a.y.cmp(&b.y))
}
