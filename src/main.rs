//! Cube Streamer - tile cache and streaming pipeline for image cubes.
//!
//! This binary drives the tile service against an in-process synthetic
//! backend (`simulate`) and exposes the viewport tiling math (`plan`).

use clap::Parser;
use serde::Serialize;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::{broadcast::error::TryRecvError, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cube_streamer::{
    config::{Cli, Command, PlanConfig, SimulateConfig},
    get_required_tiles,
    tile::{layer_to_mip, mip_to_layer, total_layers},
    ChannelBackend, FrameView, HeadlessGpu, Point2D, Size2D, SyntheticImage, SyntheticServer,
    TileService,
};

/// File id used for the simulated cube.
const FILE_ID: i32 = 0;

/// How long to wait for a backend reply before giving up on a step.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Simulate(config) => run_simulate(config).await,
        Command::Plan(config) => run_plan(config),
    }
}

// =============================================================================
// Simulate Command
// =============================================================================

/// One viewport state in the scripted walk.
struct Step {
    label: &'static str,
    view: FrameView,
    channel: i32,
}

async fn run_simulate(config: SimulateConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let cache_config = config.cache_config();
    let image_size = Size2D::new(config.image_width, config.image_height);
    let tile_size = Size2D::new(config.tile_size, config.tile_size);

    print_banner();
    info!("Configuration:");
    info!(
        "  Image: {}x{} px, {} channels, {} layers",
        image_size.x,
        image_size.y,
        config.channels,
        total_layers(image_size, tile_size) + 1
    );
    info!(
        "  Cache: {} GPU tiles, {} compressed tiles/file, {} persistent layers",
        cache_config.lru_capacity_gpu,
        cache_config.lru_capacity_system,
        cache_config.num_persistent_layers
    );
    info!("  Workers: {}", cache_config.worker_count);

    let (backend, mut requests) = ChannelBackend::new();
    let mut service = match TileService::new(backend, cache_config) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to create tile service: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut gpu = HeadlessGpu::default();
    service.set_context(&mut gpu);
    let mut updates = service.subscribe();

    // Backend side: answer requests as they arrive
    let image = SyntheticImage::new(image_size, tile_size, config.channels);
    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    let server_task = tokio::spawn(async move {
        let mut server = SyntheticServer::new(image);
        while let Some(request) = requests.recv().await {
            for reply in server.handle(request) {
                if reply_tx.send(reply).is_err() {
                    return server.tiles_served();
                }
            }
        }
        server.tiles_served()
    });

    info!("");
    for (index, step) in simulation_steps(image_size, config.viewport, config.channels)
        .iter()
        .enumerate()
    {
        let tiles = get_required_tiles(&step.view, image_size, tile_size);
        let focus = focus_in_tiles(&step.view, image_size, tile_size);
        service.request_tiles(
            &tiles,
            FILE_ID,
            step.channel,
            0,
            focus,
            config.compression_quality,
        );

        while service.remaining_tiles() > 0 {
            match tokio::time::timeout(REPLY_TIMEOUT, replies.recv()).await {
                Ok(Some(message)) => service.handle_raster_tile_data(message),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Timed out waiting for {} tiles",
                        service.remaining_tiles()
                    );
                    service.clear_request_queue(Some(FILE_ID));
                    break;
                }
            }
            service.poll_decoded();
        }
        while service.pending_decompression_count() > 0 {
            if service.next_decoded().await.is_none() {
                break;
            }
        }

        let mut ready = 0;
        loop {
            match updates.try_recv() {
                Ok(details) => ready += details.tile_count,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Tile stream lagged by {} notifications", skipped)
                }
                Err(_) => break,
            }
        }

        let mut uploaded = 0;
        for tile in &tiles {
            if let Some(raster) = service.peek_tile(tile.encode(), FILE_ID, step.channel, 0) {
                match service.upload_tile_to_gpu(&mut gpu, raster) {
                    Ok(()) => uploaded += 1,
                    Err(e) => warn!("Upload failed: {}", e),
                }
            }
        }

        info!(
            "Step {:>2} {:<10} channel {} mip {:>3}: {:>4} required, {:>4} new, {:>4} uploaded",
            index + 1,
            step.label,
            step.channel,
            step.view.mip,
            tiles.len(),
            ready,
            uploaded
        );
    }

    let stats = service.stats();
    drop(service);
    let served = server_task.await.unwrap_or_else(|e| {
        warn!("Server task failed: {}", e);
        0
    });

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Tiles served by backend: {}", served);
    info!("  GPU uploads: {} ({} px)", gpu.uploads, gpu.uploaded_pixels);
    info!(
        "  L1: {}/{} LRU, {} persistent; L2: {} compressed",
        stats.lru_tiles, stats.lru_capacity, stats.persistent_tiles, stats.compressed_tiles
    );
    info!(
        "  Dropped: {} stale, {} unsupported, {} failed",
        stats.stale_discarded, stats.unsupported_dropped, stats.decode_failures
    );
    info!("────────────────────────────────────────────────────────────────");

    if config.json {
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize stats: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

/// Zoom in from the whole image to full resolution, pan, step through
/// channels, then zoom back out.
fn simulation_steps(image_size: Size2D, viewport: u32, channels: i32) -> Vec<Step> {
    let coarsest = image_size
        .x
        .max(image_size.y)
        .div_ceil(viewport)
        .next_power_of_two();
    let centre = (image_size.x as f64 / 2.0, image_size.y as f64 / 2.0);
    let half = viewport as f64 / 2.0;

    let view_at = |cx: f64, cy: f64, mip: u32| {
        let extent = half * mip as f64;
        FrameView::new(cx - extent, cx + extent, cy - extent, cy + extent, mip)
    };

    let mut steps = Vec::new();
    let mut mip = coarsest;
    while mip >= 1 {
        steps.push(Step {
            label: "zoom in",
            view: view_at(centre.0, centre.1, mip),
            channel: 0,
        });
        mip /= 2;
    }

    let pans = [(1.0, 0.0), (1.0, 0.0), (0.0, 1.0), (-1.0, 0.0)];
    let (mut cx, mut cy) = centre;
    for (dx, dy) in pans {
        cx += dx * half;
        cy += dy * half;
        steps.push(Step {
            label: "pan",
            view: view_at(cx, cy, 1),
            channel: 0,
        });
    }

    let last_channel = channels.clamp(1, 3) - 1;
    for channel in 1..=last_channel {
        steps.push(Step {
            label: "channel",
            view: view_at(cx, cy, 1),
            channel,
        });
    }

    let mut mip = 2;
    while mip <= coarsest {
        steps.push(Step {
            label: "zoom out",
            view: view_at(cx, cy, mip),
            channel: last_channel,
        });
        mip *= 2;
    }

    steps
}

/// Centre of `view` in tile-grid units of the layer it maps to.
fn focus_in_tiles(view: &FrameView, image_size: Size2D, tile_size: Size2D) -> Point2D {
    let layer = mip_to_layer(view.mip, image_size, tile_size);
    let mip = layer_to_mip(layer, image_size, tile_size) as f64;
    Point2D::new(
        (view.x_min + view.x_max) / 2.0 / (tile_size.x as f64 * mip),
        (view.y_min + view.y_max) / 2.0 / (tile_size.y as f64 * mip),
    )
}

/// Print the startup banner.
fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("");
    info!("  ┌─┐┬ ┬┌┐ ┌─┐  ┌─┐┌┬┐┬─┐┌─┐┌─┐┌┬┐┌─┐┬─┐");
    info!("  │  │ │├┴┐├┤   └─┐ │ ├┬┘├┤ ├─┤│││├┤ ├┬┘");
    info!("  └─┘└─┘└─┘└─┘  └─┘ ┴ ┴└─└─┘┴ ┴┴ ┴└─┘┴└─");
    info!("                                   v{}", version);
    info!("");
}

// =============================================================================
// Plan Command
// =============================================================================

#[derive(Serialize)]
struct PlannedTile {
    x: u32,
    y: u32,
    layer: u32,
    encoded: u32,
}

#[derive(Serialize)]
struct PlanOutput {
    mip: u32,
    count: usize,
    tiles: Vec<PlannedTile>,
}

fn run_plan(config: PlanConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let view = FrameView::new(
        config.x_min,
        config.x_max,
        config.y_min,
        config.y_max,
        config.mip,
    );
    let image_size = Size2D::new(config.image_width, config.image_height);
    let tile_size = Size2D::new(config.tile_size, config.tile_size);

    let tiles: Vec<PlannedTile> = get_required_tiles(&view, image_size, tile_size)
        .into_iter()
        .map(|tile| PlannedTile {
            x: tile.x,
            y: tile.y,
            layer: tile.layer,
            encoded: tile.encode(),
        })
        .collect();

    let output = PlanOutput {
        mip: config.mip,
        count: tiles.len(),
        tiles,
    };

    match serde_json::to_string_pretty(&output) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "cube_streamer=debug"
    } else {
        "cube_streamer=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
