//! End-to-end tests for the tile service against the synthetic server.

use std::collections::HashSet;

use cube_streamer::tile::encode;
use cube_streamer::{
    BackendRequest, CacheConfig, CompressionType, Point2D, TileCoordinate, TileDisposition,
};

use super::test_utils::{
    filled_payload, full_layer, nan_runs, small_config, tile_message, Harness, RecordingGpu,
};

fn same_pixels(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
}

fn inserted(dispositions: &[TileDisposition]) -> usize {
    dispositions
        .iter()
        .filter(|d| matches!(d, TileDisposition::Inserted { .. }))
        .count()
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test]
async fn test_zoom_in_fills_all_layers() {
    let mut harness = Harness::new(small_config());
    let mut stream = harness.service.subscribe();

    for layer in 0..=2 {
        harness.request(&full_layer(layer), 0, 0);
        let dispositions = harness.settle().await;
        assert_eq!(inserted(&dispositions), 1 << (2 * layer));
    }

    for layer in 0..=2 {
        for tile in full_layer(layer) {
            let resident = harness.service.get_tile(tile.encode(), 0, 0, 0, true);
            assert!(resident.is_some(), "missing {tile:?}");
        }
    }

    let stats = harness.service.stats();
    assert_eq!(stats.persistent_tiles, 5);
    assert_eq!(stats.lru_tiles, 16);
    assert_eq!(stats.remaining_tiles, 0);
    assert_eq!(stats.pending_decompressions, 0);

    let mut total = 0;
    let mut last = None;
    while let Ok(details) = stream.try_recv() {
        total += details.tile_count;
        last = Some(details);
    }
    assert_eq!(total, 21);
    assert!(last.unwrap().flush);
}

#[tokio::test]
async fn test_decoded_pixels_match_server() {
    let mut harness = Harness::new(small_config());
    let tiles = full_layer(1);
    harness.request(&tiles, 0, 2);
    harness.settle().await;

    for tile in tiles {
        let (width, height, expected) = harness
            .server
            .image()
            .render_tile(tile.encode(), 2, 0)
            .unwrap();
        let resident = harness.service.peek_tile(tile.encode(), 0, 2, 0).unwrap();
        assert_eq!((resident.width, resident.height), (width, height));
        assert!(same_pixels(&resident.data, &expected));
    }

    // The blank lattice passes through the NaN side channel
    let origin = harness.service.peek_tile(encode(0, 0, 0), 0, 2, 0);
    assert!(origin.is_none());
    let corner = harness.service.peek_tile(encode(0, 0, 1), 0, 2, 0).unwrap();
    assert!(corner.data[0].is_nan());
}

#[tokio::test]
async fn test_uncompressed_replies_skip_decoder() {
    let mut harness = Harness::new(small_config());
    harness.server = cube_streamer::SyntheticServer::new(*harness.server.image())
        .with_compression(CompressionType::None);

    harness.request(&full_layer(1), 0, 0);
    let replies = harness.serve();
    harness.deliver(replies);

    assert_eq!(harness.service.pending_decompression_count(), 0);
    assert_eq!(harness.service.stats().persistent_tiles, 4);
    assert_eq!(harness.service.stats().compressed_tiles, 0);
}

// =============================================================================
// Requests
// =============================================================================

#[tokio::test]
async fn test_overlapping_views_request_each_tile_once() {
    let mut harness = Harness::new(small_config());
    let left: Vec<TileCoordinate> = full_layer(2).into_iter().filter(|t| t.x < 2).collect();
    let right: Vec<TileCoordinate> = full_layer(2).into_iter().filter(|t| t.x >= 1).collect();

    harness.request(&left, 0, 0);
    harness.request(&right, 0, 0);

    let requested = harness.backend.requested_tiles();
    let unique: HashSet<u32> = requested.iter().copied().collect();
    assert_eq!(requested.len(), unique.len());
    assert_eq!(unique.len(), 16);
    assert_eq!(harness.service.remaining_tiles(), 16);
}

#[tokio::test]
async fn test_requests_ordered_by_focus() {
    let mut harness = Harness::new(small_config());
    harness
        .service
        .request_tiles(&full_layer(2), 0, 0, 0, Point2D::new(3.5, 0.5), 11);

    let requested = harness.backend.requested_tiles();
    assert_eq!(requested[0], encode(3, 0, 2));
    assert_eq!(*requested.last().unwrap(), encode(0, 3, 2));
}

#[tokio::test]
async fn test_l2_serves_rerequest_after_l1_clear() {
    let mut harness = Harness::new(small_config());
    let tiles = full_layer(2);
    harness.request(&tiles, 0, 0);
    harness.settle().await;
    let requests_before = harness.backend.request_count();

    harness.service.clear_cache(false);
    harness.request(&tiles, 0, 0);
    assert_eq!(harness.backend.request_count(), requests_before);
    assert_eq!(harness.service.pending_decompression_count(), 16);

    let dispositions = harness.drain_decoded().await;
    assert_eq!(inserted(&dispositions), 16);

    harness.service.clear_cache(true);
    harness.request(&tiles, 0, 0);
    assert_eq!(harness.backend.request_count(), requests_before + 1);
}

// =============================================================================
// Channel Switching
// =============================================================================

#[tokio::test]
async fn test_context_switch_discards_in_flight_decodes() {
    let mut harness = Harness::new(small_config());
    let tiles = full_layer(2);

    harness.request(&tiles, 0, 0);
    let replies = harness.serve();
    harness.deliver(replies);
    assert_eq!(harness.service.pending_decompression_count(), 16);

    // Switch before any decode result has been collected
    harness.request(&tiles, 0, 1);
    assert_eq!(harness.service.remaining_tiles(), 16);

    let dispositions = harness.drain_decoded().await;
    assert_eq!(dispositions.len(), 16);
    assert!(dispositions.iter().all(|d| *d == TileDisposition::Stale));

    for tile in &tiles {
        assert!(harness.service.get_tile(tile.encode(), 0, 0, 0, false).is_none());
        assert!(harness.service.get_tile(tile.encode(), 0, 1, 0, false).is_none());
    }
    assert_eq!(harness.service.stats().lru_tiles, 0);
    assert_eq!(harness.service.stats().stale_discarded, 16);

    // The new channel arrives normally
    let dispositions = harness.settle().await;
    assert_eq!(inserted(&dispositions), 16);
    for tile in &tiles {
        let (_, _, expected) = harness
            .server
            .image()
            .render_tile(tile.encode(), 1, 0)
            .unwrap();
        let resident = harness.service.peek_tile(tile.encode(), 0, 1, 0).unwrap();
        assert!(same_pixels(&resident.data, &expected));
    }
}

#[tokio::test]
async fn test_replies_for_old_channel_are_dropped() {
    let mut harness = Harness::new(small_config());
    let tiles = full_layer(1);

    harness.request(&tiles, 0, 0);
    let old_replies = harness.serve();
    harness.request(&tiles, 0, 3);

    harness.deliver(old_replies);
    assert_eq!(harness.service.pending_decompression_count(), 0);
    assert_eq!(harness.service.stats().stale_discarded, 4);
    assert_eq!(harness.service.remaining_tiles(), 4);

    match harness.backend.take_requests().last() {
        Some(BackendRequest::SetChannels { channel, .. }) => assert_eq!(*channel, 3),
        other => panic!("unexpected request: {other:?}"),
    }
}

#[tokio::test]
async fn test_context_switch_clears_persistent_tiles() {
    let mut harness = Harness::new(small_config());
    harness.request(&full_layer(0), 0, 0);
    harness.settle().await;
    assert_eq!(harness.service.stats().persistent_tiles, 1);

    harness.request(&full_layer(0), 0, 1);
    assert_eq!(harness.service.stats().persistent_tiles, 0);
    assert_eq!(
        harness.service.stats().free_slots,
        harness.service.stats().total_slots as usize
    );
}

// =============================================================================
// Capacity
// =============================================================================

fn tight_config() -> CacheConfig {
    // One 2x2 texture: 1 persistent slot plus 3 LRU slots
    CacheConfig {
        lru_capacity_gpu: 3,
        lru_capacity_system: 64,
        num_persistent_layers: 1,
        worker_count: 2,
        texture_size: 512,
        tile_size: 256,
        max_textures: 2,
    }
}

#[tokio::test]
async fn test_lru_pressure_keeps_slots_unique() {
    let mut harness = Harness::new(tight_config());
    harness.request(&full_layer(0), 0, 0);
    harness.settle().await;
    harness.request(&full_layer(2), 0, 0);
    let dispositions = harness.settle().await;
    assert_eq!(inserted(&dispositions), 16);

    let stats = harness.service.stats();
    assert_eq!(stats.total_slots, 4);
    assert_eq!(stats.lru_capacity, 3);
    assert_eq!(stats.lru_tiles, 3);
    assert_eq!(stats.persistent_tiles, 1);
    assert_eq!(stats.free_slots, 0);

    let mut slots = HashSet::new();
    let coarse = harness.service.peek_tile(encode(0, 0, 0), 0, 0, 0).unwrap();
    slots.insert(coarse.texture_slot);
    for tile in full_layer(2) {
        if let Some(resident) = harness.service.peek_tile(tile.encode(), 0, 0, 0) {
            assert!(slots.insert(resident.texture_slot));
        }
    }
    assert_eq!(slots.len(), 4);
}

#[tokio::test]
async fn test_persistent_tile_survives_any_order() {
    let mut harness = Harness::new(tight_config());
    harness.request(&full_layer(2)[..8], 0, 0);
    harness.settle().await;
    harness.request(&full_layer(0), 0, 0);
    harness.settle().await;
    harness.request(&full_layer(2)[8..], 0, 0);
    harness.settle().await;

    assert!(harness.service.peek_tile(encode(0, 0, 0), 0, 0, 0).is_some());
    assert_eq!(harness.service.stats().lru_tiles, 3);
}

// =============================================================================
// Files and GPU
// =============================================================================

#[tokio::test]
async fn test_files_share_atlas_and_close_independently() {
    let mut harness = Harness::new(small_config());
    harness.request(&full_layer(1), 0, 0);
    harness.request(&full_layer(1), 1, 0);
    harness.settle().await;
    assert!(harness.service.peek_tile(encode(0, 0, 1), 1, 0, 0).is_some());

    harness.request(&full_layer(1), 0, 0);
    harness.settle().await;
    assert!(harness.service.peek_tile(encode(0, 0, 1), 0, 0, 0).is_some());
    assert!(harness.service.peek_tile(encode(0, 0, 1), 1, 0, 0).is_some());

    harness.service.handle_file_closed(1);
    assert!(harness.service.peek_tile(encode(0, 0, 1), 1, 0, 0).is_none());
    assert!(harness.service.peek_tile(encode(0, 0, 1), 0, 0, 0).is_some());
    assert_eq!(harness.service.stats().persistent_tiles, 4);
}

#[tokio::test]
async fn test_opening_second_file_keeps_first_resident() {
    let mut harness = Harness::new(small_config());
    let coarse = TileCoordinate::new(0, 0, 0);
    let fine = TileCoordinate::new(3, 3, 2);
    harness.request(&[coarse, fine], 0, 0);
    harness.settle().await;
    assert!(harness.service.peek_tile(coarse.encode(), 0, 0, 0).is_some());
    assert!(harness.service.peek_tile(fine.encode(), 0, 0, 0).is_some());

    harness.request(&[coarse], 1, 0);
    assert!(harness.service.peek_tile(coarse.encode(), 0, 0, 0).is_some());
    assert!(harness.service.peek_tile(fine.encode(), 0, 0, 0).is_some());

    harness.settle().await;
    assert!(harness.service.peek_tile(coarse.encode(), 1, 0, 0).is_some());
    assert_eq!(harness.service.stats().persistent_tiles, 2);
    assert_eq!(harness.service.stats().lru_tiles, 1);

    // A real channel change of either file still clears the screen
    harness.request(&[], 1, 2);
    assert!(harness.service.peek_tile(coarse.encode(), 0, 0, 0).is_none());
    assert_eq!(harness.service.stats().persistent_tiles, 0);
}

#[tokio::test]
async fn test_upload_targets_slot_offsets() {
    let mut harness = Harness::new(small_config());
    let mut gpu = RecordingGpu::default();
    harness.service.set_context(&mut gpu);
    assert_eq!(gpu.live.len(), harness.service.stats().num_textures as usize);

    harness.request(&full_layer(2), 0, 0);
    harness.settle().await;

    for tile in full_layer(2) {
        let resident = harness.service.peek_tile(tile.encode(), 0, 0, 0).unwrap();
        let params = harness.service.get_tile_texture_parameters(resident).unwrap();
        harness.service.upload_tile_to_gpu(&mut gpu, resident).unwrap();

        let (texture, x, y, _) = *gpu.uploads.last().unwrap();
        assert_eq!((texture, x, y), (params.texture, params.x_offset, params.y_offset));
        assert!(gpu.live.contains(&texture));
    }

    harness.service.clear_textures(&mut gpu);
    assert!(gpu.live.is_empty());
}

#[tokio::test]
async fn test_nan_encodings_on_uncompressed_payload() {
    let mut harness = Harness::new(small_config());
    let tile = TileCoordinate::new(1, 1, 2);
    harness.request(&[tile], 0, 0);

    let mut payload = filled_payload(tile, 4, 1, 2.0);
    payload.nan_encodings = nan_runs(&[1, 2, 1]);
    harness
        .service
        .handle_raster_tile_data(tile_message(0, 0, CompressionType::None, payload));

    let resident = harness.service.peek_tile(tile.encode(), 0, 0, 0).unwrap();
    assert_eq!(resident.data[0], 2.0);
    assert!(resident.data[1].is_nan() && resident.data[2].is_nan());
    assert_eq!(resident.data[3], 2.0);
}
