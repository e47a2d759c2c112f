//! Texture atlas allocation.
//!
//! Decoded tiles are uploaded into a small, fixed set of large GPU textures.
//! Each texture is divided into a square grid of tile-sized slots, and slots
//! are numbered consecutively across textures:
//!
//! ```text
//!   texture 0 (4096²)          texture 1 (4096²)
//! ┌────┬────┬─ ─┬────┐      ┌─────┬─────┬─ ─┬─────┐
//! │  0 │  1 │...│ 15 │      │ 256 │ 257 │...│ 271 │
//! ├────┼────┼─ ─┼────┤      ├─────┼─────┼─ ─┼─────┤
//! │ 16 │ 17 │...│ 31 │      │ 272 │ ... │   │     │
//! ├────┴────┴─ ─┴────┤      └─────┴─────┴─ ─┴─────┘
//! │       ...        │
//! └──────────────────┘
//! ```
//!
//! The slot arithmetic in [`AtlasLayout`] is pure and can be used from any
//! thread. Texture creation and uploads go through the [`GpuContext`] trait,
//! which the rendering layer implements on the thread that owns the context.

use tracing::{debug, info};

use crate::error::AtlasError;

/// Default edge length of an atlas texture in pixels.
pub const DEFAULT_TEXTURE_SIZE: u32 = 4096;

/// Default edge length of a tile slot in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Default upper bound on the number of atlas textures.
pub const MAX_TEXTURES: u32 = 8;

// =============================================================================
// Layout
// =============================================================================

/// Where a slot lives: which texture and the pixel offset inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLocation {
    pub texture_index: u32,
    pub x_offset: u32,
    pub y_offset: u32,
}

/// Geometry of the atlas: texture size, slot size and texture count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasLayout {
    texture_size: u32,
    tile_size: u32,
    num_textures: u32,
}

impl AtlasLayout {
    /// Size an atlas to hold at least `requested_slots` tiles.
    ///
    /// The texture count is the minimum that covers the request, capped at
    /// `max_textures`, and never less than one. The resulting
    /// [`total_slots`](Self::total_slots) may therefore differ from the
    /// request in either direction. `tile_size` must divide `texture_size`.
    pub fn plan(
        requested_slots: u32,
        texture_size: u32,
        tile_size: u32,
        max_textures: u32,
    ) -> Self {
        let per_edge = texture_size / tile_size;
        let per_texture = per_edge * per_edge;
        let num_textures = requested_slots
            .div_ceil(per_texture)
            .clamp(1, max_textures.max(1));
        Self {
            texture_size,
            tile_size,
            num_textures,
        }
    }

    pub fn texture_size(&self) -> u32 {
        self.texture_size
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn num_textures(&self) -> u32 {
        self.num_textures
    }

    /// Slots along one edge of a texture.
    pub fn tiles_per_row(&self) -> u32 {
        self.texture_size / self.tile_size
    }

    /// Slots in a single texture.
    pub fn tiles_per_texture(&self) -> u32 {
        self.tiles_per_row() * self.tiles_per_row()
    }

    /// Slots across all textures.
    pub fn total_slots(&self) -> u32 {
        self.tiles_per_texture() * self.num_textures
    }

    /// Map a slot index to its texture and pixel offset.
    pub fn slot_location(&self, slot: u32) -> Result<SlotLocation, AtlasError> {
        let total = self.total_slots();
        if slot >= total {
            return Err(AtlasError::SlotOutOfRange { slot, total });
        }

        let per_texture = self.tiles_per_texture();
        let per_row = self.tiles_per_row();
        let local = slot % per_texture;

        Ok(SlotLocation {
            texture_index: slot / per_texture,
            x_offset: (local % per_row) * self.tile_size,
            y_offset: (local / per_row) * self.tile_size,
        })
    }
}

// =============================================================================
// Slot Free-List
// =============================================================================

/// Free-list of texture slots.
///
/// Slots are handed out lowest index first. Each slot is either free or
/// assigned to exactly one tile; releasing a slot that is already free is a
/// no-op.
#[derive(Debug, Clone)]
pub struct TextureSlotPool {
    free: Vec<u32>,
    in_use: Vec<bool>,
}

impl TextureSlotPool {
    pub fn new(total_slots: u32) -> Self {
        Self {
            free: (0..total_slots).rev().collect(),
            in_use: vec![false; total_slots as usize],
        }
    }

    /// Take a free slot, if any remain.
    pub fn acquire(&mut self) -> Option<u32> {
        let slot = self.free.pop()?;
        self.in_use[slot as usize] = true;
        Some(slot)
    }

    /// Return a slot to the free-list.
    pub fn release(&mut self, slot: u32) {
        match self.in_use.get_mut(slot as usize) {
            Some(in_use) if *in_use => {
                *in_use = false;
                self.free.push(slot);
            }
            _ => debug!(slot, "Ignoring release of a slot that is not in use"),
        }
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.in_use.len()
    }

    /// Whether `slot` is currently free.
    pub fn is_free(&self, slot: u32) -> bool {
        matches!(self.in_use.get(slot as usize), Some(false))
    }

    /// Number of times `slot` appears in the free-list.
    pub fn free_count(&self, slot: u32) -> usize {
        self.free.iter().filter(|&&s| s == slot).count()
    }
}

// =============================================================================
// GPU Context Boundary
// =============================================================================

/// Opaque handle to a texture owned by a [`GpuContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// The rendering collaborator that owns GPU textures.
///
/// Implementations wrap a real graphics API; every call happens on the thread
/// that owns the context.
pub trait GpuContext {
    /// Allocate a single-channel float texture.
    fn create_texture(&mut self, width: u32, height: u32) -> TextureHandle;

    /// Overwrite a `width × height` block of `texture` at the given offset.
    fn copy_to_texture(
        &mut self,
        texture: TextureHandle,
        data: &[f32],
        width: u32,
        height: u32,
        x_offset: u32,
        y_offset: u32,
    );

    /// Release a texture.
    fn delete_texture(&mut self, texture: TextureHandle);
}

/// Everything a renderer needs to sample a resident tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileTextureParameters {
    pub texture: TextureHandle,
    pub texture_index: u32,
    pub x_offset: u32,
    pub y_offset: u32,
}

/// The atlas textures together with their layout.
#[derive(Debug)]
pub struct TextureAtlas {
    layout: AtlasLayout,
    textures: Vec<TextureHandle>,
}

impl TextureAtlas {
    /// Create an atlas with no textures allocated yet.
    pub fn new(layout: AtlasLayout) -> Self {
        Self {
            layout,
            textures: Vec::new(),
        }
    }

    pub fn layout(&self) -> &AtlasLayout {
        &self.layout
    }

    pub fn has_context(&self) -> bool {
        !self.textures.is_empty()
    }

    pub fn textures(&self) -> &[TextureHandle] {
        &self.textures
    }

    /// Allocate the atlas textures on `gpu`, replacing any previous set.
    pub fn set_context<G: GpuContext>(&mut self, gpu: &mut G) {
        self.clear_textures(gpu);

        let size = self.layout.texture_size();
        let texture_mb = (size as u64 * size as u64 * 4) as f64 / (1024.0 * 1024.0);
        info!(
            "Creating {} tile textures of {:.0} MB each ({:.0} MB total)",
            self.layout.num_textures(),
            texture_mb,
            texture_mb * self.layout.num_textures() as f64
        );

        self.textures = (0..self.layout.num_textures())
            .map(|_| gpu.create_texture(size, size))
            .collect();
    }

    /// Release all atlas textures.
    pub fn clear_textures<G: GpuContext>(&mut self, gpu: &mut G) {
        for texture in self.textures.drain(..) {
            gpu.delete_texture(texture);
        }
    }

    /// Resolve a slot into its texture and offset.
    pub fn texture_parameters(&self, slot: u32) -> Result<TileTextureParameters, AtlasError> {
        let location = self.layout.slot_location(slot)?;
        let texture = *self
            .textures
            .get(location.texture_index as usize)
            .ok_or(AtlasError::NoContext)?;

        Ok(TileTextureParameters {
            texture,
            texture_index: location.texture_index,
            x_offset: location.x_offset,
            y_offset: location.y_offset,
        })
    }

    /// Copy a raster into its slot. Repeating the upload only rewrites the
    /// same pixels.
    pub fn upload<G: GpuContext>(
        &self,
        gpu: &mut G,
        data: &[f32],
        width: u32,
        height: u32,
        slot: u32,
    ) -> Result<(), AtlasError> {
        let tile_size = self.layout.tile_size();
        if width > tile_size || height > tile_size {
            return Err(AtlasError::TileTooLarge {
                width,
                height,
                tile_size,
            });
        }

        let params = self.texture_parameters(slot)?;
        gpu.copy_to_texture(params.texture, data, width, height, params.x_offset, params.y_offset);
        Ok(())
    }
}

// =============================================================================
// Headless Context
// =============================================================================

/// A [`GpuContext`] without a device. Tracks live textures and counts
/// uploads; used by the simulator and in tests.
#[derive(Debug, Default)]
pub struct HeadlessGpu {
    next_handle: u64,
    live: Vec<TextureHandle>,
    pub uploads: u64,
    pub uploaded_pixels: u64,
}

impl HeadlessGpu {
    pub fn live_textures(&self) -> usize {
        self.live.len()
    }
}

impl GpuContext for HeadlessGpu {
    fn create_texture(&mut self, _width: u32, _height: u32) -> TextureHandle {
        self.next_handle += 1;
        let handle = TextureHandle(self.next_handle);
        self.live.push(handle);
        handle
    }

    fn copy_to_texture(
        &mut self,
        texture: TextureHandle,
        _data: &[f32],
        width: u32,
        height: u32,
        _x_offset: u32,
        _y_offset: u32,
    ) {
        if !self.live.contains(&texture) {
            debug!(texture = texture.0, "Upload to unknown texture ignored");
            return;
        }
        self.uploads += 1;
        self.uploaded_pixels += width as u64 * height as u64;
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.live.retain(|t| *t != texture);
    }
}

// =============================================================================
// Tests
// =============================================================================
