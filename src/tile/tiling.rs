//! Viewport to tile-set geometry.
//!
//! Given a viewport in full-resolution pixel coordinates and a decimation
//! factor (`mip`), [`get_required_tiles`] computes the tiles of the matching
//! resolution layer that intersect the visible part of the image.
//!
//! # Layers and mips
//!
//! ```text
//! layer 0   ┌───────────┐   mip = 2^total_layers   (one tile covers the image)
//!           │           │
//!           └───────────┘
//! layer 1   ┌─────┬─────┐   mip = 2^(total_layers - 1)
//!           ├─────┼─────┤
//!           └─────┴─────┘
//!   ...
//! layer N   full resolution, mip = 1
//! ```
//!
//! `total_layers` is `ceil(log2(max tiles along an axis at mip 1))`.
//!
//! All functions here are pure. Invalid input yields an empty result rather
//! than an error.

use serde::{Deserialize, Serialize};

use super::coordinate::{TileCoordinate, MAX_LAYER};

// =============================================================================
// Geometry Types
// =============================================================================

/// A viewport in full-resolution image pixels at a given decimation factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameView {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    /// Decimation factor; must be at least 1
    pub mip: u32,
}

impl FrameView {
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64, mip: u32) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
            mip,
        }
    }

    /// A view is valid when all bounds are finite, it has a positive area and
    /// `mip >= 1`.
    pub fn is_valid(&self) -> bool {
        self.x_min.is_finite()
            && self.x_max.is_finite()
            && self.y_min.is_finite()
            && self.y_max.is_finite()
            && self.x_min < self.x_max
            && self.y_min < self.y_max
            && self.mip >= 1
    }
}

/// Integer extent (image or tile size) in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size2D {
    pub x: u32,
    pub y: u32,
}

impl Size2D {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub fn is_valid(&self) -> bool {
        self.x > 0 && self.y > 0
    }
}

/// A point in continuous coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

// =============================================================================
// Layer / Mip Math
// =============================================================================

#[inline]
fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        u32::BITS - (n - 1).leading_zeros()
    }
}

/// Number of layers above full resolution for this image and tile size.
///
/// Full resolution lives at `total_layers(..)`; layer 0 is the coarsest.
pub fn total_layers(image_size: Size2D, tile_size: Size2D) -> u32 {
    let tiles_x = image_size.x.div_ceil(tile_size.x);
    let tiles_y = image_size.y.div_ceil(tile_size.y);
    ceil_log2(tiles_x.max(tiles_y))
}

/// Convert a decimation factor into a resolution layer.
///
/// Mips that are not a power of two map to the next coarser layer; mips
/// coarser than layer 0 saturate at 0. Sizes must be valid.
pub fn mip_to_layer(mip: u32, image_size: Size2D, tile_size: Size2D) -> u32 {
    total_layers(image_size, tile_size).saturating_sub(ceil_log2(mip))
}

/// Convert a resolution layer into its decimation factor.
///
/// Saturates at `u32::MAX` for pyramids deeper than 31 layers.
pub fn layer_to_mip(layer: u32, image_size: Size2D, tile_size: Size2D) -> u32 {
    let shift = total_layers(image_size, tile_size).saturating_sub(layer);
    1u32.checked_shl(shift).unwrap_or(u32::MAX)
}

// =============================================================================
// Required Tiles
// =============================================================================

/// Compute the tiles needed to cover `view` of an image.
///
/// Returns an empty list when the view, image size or tile size is invalid,
/// when the pyramid has more layers than a tile key can address, or when the
/// view does not intersect `[0, image.x) × [0, image.y)`. Tiles are
/// enumerated column by column and all carry the same layer.
///
/// Runs in time proportional to the number of tiles returned.
pub fn get_required_tiles(
    view: &FrameView,
    image_size: Size2D,
    tile_size: Size2D,
) -> Vec<TileCoordinate> {
    if !view.is_valid() || !image_size.is_valid() || !tile_size.is_valid() {
        return Vec::new();
    }
    if total_layers(image_size, tile_size) > MAX_LAYER {
        return Vec::new();
    }

    let width = image_size.x as f64;
    let height = image_size.y as f64;
    if view.x_max <= 0.0 || view.x_min >= width || view.y_max <= 0.0 || view.y_min >= height {
        return Vec::new();
    }

    let x_min = view.x_min.max(0.0);
    let x_max = view.x_max.min(width);
    let y_min = view.y_min.max(0.0);
    let y_max = view.y_max.min(height);

    let layer = mip_to_layer(view.mip, image_size, tile_size);
    // Decimation of the layer actually served; equals view.mip for power-of-two mips
    let mip = layer_to_mip(layer, image_size, tile_size) as u64;

    let footprint_x = tile_size.x as u64 * mip;
    let footprint_y = tile_size.y as u64 * mip;
    let grid_x = (image_size.x as u64).div_ceil(footprint_x);
    let grid_y = (image_size.y as u64).div_ceil(footprint_y);

    let x_start = (x_min / footprint_x as f64).floor() as u64;
    let x_end = ((x_max / footprint_x as f64).ceil() as u64).min(grid_x);
    let y_start = (y_min / footprint_y as f64).floor() as u64;
    let y_end = ((y_max / footprint_y as f64).ceil() as u64).min(grid_y);

    if x_start >= x_end || y_start >= y_end {
        return Vec::new();
    }

    let mut tiles = Vec::with_capacity(((x_end - x_start) * (y_end - y_start)) as usize);
    for x in x_start..x_end {
        for y in y_start..y_end {
            tiles.push(TileCoordinate::new(x as u32, y as u32, layer));
        }
    }
    tiles
}

// =============================================================================
// Tests
// =============================================================================
