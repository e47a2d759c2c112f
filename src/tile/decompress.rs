//! Off-thread tile decompression.
//!
//! Compressed payloads are handed to a fixed pool of OS threads. Jobs are
//! assigned round-robin by request id; every worker reports back over a
//! single result channel that the coordinator drains.
//!
//! ```text
//!                         request_id % N
//!  ┌─────────────┐   ┌──────────┬──────────┬──────────┐
//!  │ coordinator │──▶│ worker 0 │ worker 1 │ worker 2 │ ...
//!  └──────▲──────┘   └────┬─────┴────┬─────┴────┬─────┘
//!         │               └──────────┼──────────┘
//!         └──────── DecodedTile ─────┘
//! ```
//!
//! Workers never touch cache state. Payload bytes travel as [`Bytes`] clones,
//! so the L2 copy stays intact while a worker reads it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::DecodeError;

/// Upper bound on the default worker count.
pub const MAX_DEFAULT_WORKERS: usize = 4;

/// `min(available cores, 4)`.
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

// =============================================================================
// Codecs
// =============================================================================

/// Turns a compressed payload into a dense `width × height` raster.
pub trait TileCodec: Send + Sync {
    fn decode(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        compression_quality: i32,
    ) -> Result<Vec<f32>, DecodeError>;
}

fn pixel_count(width: u32, height: u32) -> Result<usize, DecodeError> {
    if width == 0 || height == 0 {
        return Err(DecodeError::InvalidDimensions { width, height });
    }
    (width as usize)
        .checked_mul(height as usize)
        .ok_or(DecodeError::InvalidDimensions { width, height })
}

/// Interpret `data` as little-endian `f32` samples.
pub fn decode_raw(data: &[u8], width: u32, height: u32) -> Result<Vec<f32>, DecodeError> {
    let pixels = pixel_count(width, height)?;
    let required = pixels
        .checked_mul(4)
        .ok_or(DecodeError::InvalidDimensions { width, height })?;
    if data.len() < required {
        return Err(DecodeError::PayloadTooShort {
            required,
            actual: data.len(),
        });
    }

    Ok(data[..required]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Codec for payloads that carry raw little-endian `f32` samples.
///
/// Used for uncompressed streams and by the synthetic backend in place of a
/// lossy codec; the quality parameter is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFloatCodec;

impl RawFloatCodec {
    pub fn encode(data: &[f32]) -> Bytes {
        let mut buf = BytesMut::with_capacity(data.len() * 4);
        for value in data {
            buf.put_f32_le(*value);
        }
        buf.freeze()
    }
}

impl TileCodec for RawFloatCodec {
    fn decode(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        _compression_quality: i32,
    ) -> Result<Vec<f32>, DecodeError> {
        decode_raw(data, width, height)
    }
}

// =============================================================================
// NaN Runs
// =============================================================================

/// Restore NaN pixels from run-length encodings.
///
/// `encodings` is a sequence of little-endian `i32` run lengths alternating
/// valid, NaN, valid, ... in row-major order. Runs past the end of the raster
/// are truncated and negative lengths count as empty.
pub fn apply_nan_encodings(data: &mut [f32], encodings: &[u8]) -> Result<(), DecodeError> {
    if encodings.len() % 4 != 0 {
        return Err(DecodeError::MalformedNanEncodings(encodings.len()));
    }

    let mut pos = 0usize;
    for (i, chunk) in encodings.chunks_exact(4).enumerate() {
        let run = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]).max(0) as usize;
        let end = pos.saturating_add(run).min(data.len());
        if i % 2 == 1 {
            data[pos..end].fill(f32::NAN);
        }
        pos = end;
        if pos == data.len() {
            break;
        }
    }
    Ok(())
}

/// Build run-length NaN encodings for `data`.
pub fn encode_nan_runs(data: &[f32]) -> Bytes {
    let mut buf = BytesMut::new();
    let mut in_nan = false;
    let mut run: i32 = 0;
    for value in data {
        if value.is_nan() != in_nan {
            buf.put_i32_le(run);
            in_nan = !in_nan;
            run = 0;
        }
        run += 1;
    }
    buf.put_i32_le(run);
    buf.freeze()
}

// =============================================================================
// Jobs
// =============================================================================

/// A payload waiting to be decoded, tagged with the context it was requested in.
#[derive(Debug, Clone)]
pub struct DecodeJob {
    pub request_id: u64,
    pub file_id: i32,
    pub channel: i32,
    pub stokes: i32,
    pub encoded: u32,
    pub layer: u32,
    pub width: u32,
    pub height: u32,
    pub compression_quality: i32,
    pub data: Bytes,
    pub nan_encodings: Bytes,
}

/// Outcome of a [`DecodeJob`].
#[derive(Debug, Clone)]
pub struct DecodedTile {
    pub request_id: u64,
    pub file_id: i32,
    pub channel: i32,
    pub stokes: i32,
    pub encoded: u32,
    pub layer: u32,
    pub width: u32,
    pub height: u32,
    pub result: Result<Vec<f32>, DecodeError>,
}

fn run_job(codec: &dyn TileCodec, job: DecodeJob) -> DecodedTile {
    let result = codec
        .decode(&job.data, job.width, job.height, job.compression_quality)
        .and_then(|mut raster| {
            apply_nan_encodings(&mut raster, &job.nan_encodings)?;
            Ok(raster)
        });

    DecodedTile {
        request_id: job.request_id,
        file_id: job.file_id,
        channel: job.channel,
        stokes: job.stokes,
        encoded: job.encoded,
        layer: job.layer,
        width: job.width,
        height: job.height,
        result,
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Fixed pool of decoding threads.
pub struct DecompressionPool {
    senders: Vec<mpsc::UnboundedSender<DecodeJob>>,
    handles: Vec<JoinHandle<()>>,
    results: mpsc::UnboundedReceiver<DecodedTile>,
}

impl DecompressionPool {
    /// Spawn `worker_count` threads (at least one) sharing `codec`.
    pub fn new(worker_count: usize, codec: Arc<dyn TileCodec>) -> Self {
        let worker_count = worker_count.max(1);
        let (result_tx, results) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, mut rx) = mpsc::unbounded_channel::<DecodeJob>();
            let result_tx = result_tx.clone();
            let codec = Arc::clone(&codec);

            let spawned = thread::Builder::new()
                .name(format!("tile-decoder-{index}"))
                .spawn(move || {
                    while let Some(job) = rx.blocking_recv() {
                        trace!(worker = index, request_id = job.request_id, "Decoding tile");
                        if result_tx.send(run_job(codec.as_ref(), job)).is_err() {
                            break;
                        }
                    }
                    debug!(worker = index, "Decoder thread exiting");
                });

            match spawned {
                Ok(handle) => {
                    senders.push(tx);
                    handles.push(handle);
                }
                Err(e) => warn!(worker = index, error = %e, "Failed to spawn decoder thread"),
            }
        }

        Self {
            senders,
            handles,
            results,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Hand a job to worker `request_id % worker_count`.
    pub fn dispatch(&self, job: DecodeJob) -> Result<(), DecodeError> {
        if self.senders.is_empty() {
            return Err(DecodeError::PoolClosed);
        }
        let index = (job.request_id % self.senders.len() as u64) as usize;
        self.senders[index]
            .send(job)
            .map_err(|_| DecodeError::PoolClosed)
    }

    /// Take a finished result without waiting.
    pub fn try_recv(&mut self) -> Option<DecodedTile> {
        self.results.try_recv().ok()
    }

    /// Wait for the next finished result.
    pub async fn recv(&mut self) -> Option<DecodedTile> {
        self.results.recv().await
    }
}

impl std::fmt::Debug for DecompressionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecompressionPool")
            .field("workers", &self.senders.len())
            .finish()
    }
}

impl Drop for DecompressionPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
