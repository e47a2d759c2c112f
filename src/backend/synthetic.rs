//! In-process tile server over a generated image cube.
//!
//! [`SyntheticServer`] answers [`BackendRequest`]s the way a real image
//! server would: it remembers the channel each file is on, renders every
//! requested tile by decimating the full-resolution cube, and replies with
//! one [`RasterTileData`] message per tile. Pixels on a sparse lattice are
//! blank (NaN) so the NaN side channel is exercised too.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::tile::coordinate::decode;
use crate::tile::decompress::{encode_nan_runs, RawFloatCodec};
use crate::tile::tiling::{layer_to_mip, Size2D};

use super::{BackendRequest, CompressionType, RasterTileData, TilePayload};

/// A deterministic image cube.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticImage {
    pub size: Size2D,
    pub tile_size: Size2D,
    pub num_channels: i32,
}

impl SyntheticImage {
    pub fn new(size: Size2D, tile_size: Size2D, num_channels: i32) -> Self {
        Self {
            size,
            tile_size,
            num_channels,
        }
    }

    /// Value of one full-resolution pixel.
    pub fn pixel(&self, x: u32, y: u32, channel: i32, stokes: i32) -> f32 {
        if (x as u64 + 3 * y as u64) % 251 == 0 {
            return f32::NAN;
        }
        let fx = x as f32 / self.size.x as f32;
        let fy = y as f32 / self.size.y as f32;
        (fx * 6.0 + channel as f32 * 0.5).sin() * (fy * 4.0).cos() * (1.0 + stokes as f32)
    }

    /// Render an encoded tile as `(width, height, pixels)`.
    ///
    /// Edge tiles are cropped to the image; tiles outside it yield `None`.
    pub fn render_tile(
        &self,
        encoded: u32,
        channel: i32,
        stokes: i32,
    ) -> Option<(u32, u32, Vec<f32>)> {
        let tile = decode(encoded);
        if !tile.is_valid() {
            return None;
        }

        let mip = layer_to_mip(tile.layer, self.size, self.tile_size) as u64;
        let origin_x = tile.x as u64 * self.tile_size.x as u64 * mip;
        let origin_y = tile.y as u64 * self.tile_size.y as u64 * mip;
        if origin_x >= self.size.x as u64 || origin_y >= self.size.y as u64 {
            return None;
        }

        let width = (self.size.x as u64 - origin_x)
            .div_ceil(mip)
            .min(self.tile_size.x as u64) as u32;
        let height = (self.size.y as u64 - origin_y)
            .div_ceil(mip)
            .min(self.tile_size.y as u64) as u32;

        let mut data = Vec::with_capacity(width as usize * height as usize);
        for row in 0..height as u64 {
            for col in 0..width as u64 {
                let x = (origin_x + col * mip) as u32;
                let y = (origin_y + row * mip) as u32;
                data.push(self.pixel(x, y, channel, stokes));
            }
        }
        Some((width, height, data))
    }
}

/// Answers backend requests with rendered tiles.
#[derive(Debug)]
pub struct SyntheticServer {
    image: SyntheticImage,
    compression_type: CompressionType,
    contexts: HashMap<i32, (i32, i32)>,
    tiles_served: u64,
}

impl SyntheticServer {
    /// A server replying with ZFP-tagged payloads.
    ///
    /// The payloads are raw floats, so the receiving service must decode
    /// them with [`RawFloatCodec`].
    pub fn new(image: SyntheticImage) -> Self {
        Self {
            image,
            compression_type: CompressionType::Zfp,
            contexts: HashMap::new(),
            tiles_served: 0,
        }
    }

    /// Reply with a different compression tag.
    pub fn with_compression(mut self, compression_type: CompressionType) -> Self {
        self.compression_type = compression_type;
        self
    }

    pub fn image(&self) -> &SyntheticImage {
        &self.image
    }

    pub fn tiles_served(&self) -> u64 {
        self.tiles_served
    }

    /// Handle one request, returning the replies in request order.
    pub fn handle(&mut self, request: BackendRequest) -> Vec<RasterTileData> {
        match request {
            BackendRequest::SetChannels {
                file_id,
                channel,
                stokes,
                required_tiles,
            } => {
                if channel < 0 || channel >= self.image.num_channels {
                    warn!(file_id, channel, "Requested channel outside the cube");
                    return Vec::new();
                }
                self.contexts.insert(file_id, (channel, stokes));
                self.respond(
                    file_id,
                    channel,
                    stokes,
                    required_tiles.compression_quality,
                    &required_tiles.tiles,
                )
            }
            BackendRequest::AddRequiredTiles(required) => {
                let Some(&(channel, stokes)) = self.contexts.get(&required.file_id) else {
                    warn!(file_id = required.file_id, "Tiles requested before set_channels");
                    return Vec::new();
                };
                self.respond(
                    required.file_id,
                    channel,
                    stokes,
                    required.compression_quality,
                    &required.tiles,
                )
            }
        }
    }

    fn respond(
        &mut self,
        file_id: i32,
        channel: i32,
        stokes: i32,
        compression_quality: i32,
        tiles: &[u32],
    ) -> Vec<RasterTileData> {
        let mut replies = Vec::with_capacity(tiles.len());
        for &encoded in tiles {
            let Some(payload) = self.payload(encoded, channel, stokes) else {
                debug!(file_id, encoded, "Skipping tile outside the image");
                continue;
            };
            self.tiles_served += 1;
            replies.push(RasterTileData {
                file_id,
                channel,
                stokes,
                compression_type: self.compression_type,
                compression_quality,
                tiles: vec![payload],
            });
        }
        replies
    }

    fn payload(&self, encoded: u32, channel: i32, stokes: i32) -> Option<TilePayload> {
        let (width, height, mut data) = self.image.render_tile(encoded, channel, stokes)?;
        let nan_encodings = encode_nan_runs(&data);
        for value in data.iter_mut().filter(|v| v.is_nan()) {
            *value = 0.0;
        }

        let tile = decode(encoded);
        Some(TilePayload {
            x: tile.x,
            y: tile.y,
            layer: tile.layer,
            width,
            height,
            image_data: RawFloatCodec::encode(&data),
            nan_encodings,
        })
    }
}
