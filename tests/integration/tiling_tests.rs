//! Viewport tiling and coordinate encoding through the public API.

use std::time::Instant;

use cube_streamer::tile::{decode, encode, get_layer, layer_to_mip, mip_to_layer, MAX_LAYER};
use cube_streamer::{get_required_tiles, FrameView, Size2D, TileCoordinate};

const TILE: Size2D = Size2D::new(256, 256);

#[test]
fn test_layer_survives_encoding_for_every_layer() {
    for layer in 0..=MAX_LAYER {
        let edge = 1u32 << layer;
        for (x, y) in [(0, 0), (edge / 2, edge - 1), (edge - 1, edge / 3)] {
            let encoded = encode(x, y, layer);
            assert_eq!(get_layer(encoded), layer);
            assert_eq!(decode(encoded), TileCoordinate::new(x, y, layer));
        }
    }
}

#[test]
fn test_mip_layer_round_trips() {
    for (image, tile) in [
        (Size2D::new(16384, 16384), TILE),
        (Size2D::new(4096, 1024), TILE),
        (Size2D::new(1000, 3000), Size2D::new(128, 128)),
    ] {
        let top = mip_to_layer(1, image, tile);
        for layer in 0..=top {
            assert_eq!(mip_to_layer(layer_to_mip(layer, image, tile), image, tile), layer);
        }
        let mut mip = 1;
        while mip <= layer_to_mip(0, image, tile) {
            assert_eq!(layer_to_mip(mip_to_layer(mip, image, tile), image, tile), mip);
            mip *= 2;
        }
    }
}

#[test]
fn test_reference_view_yields_four_by_four_grid() {
    let view = FrameView::new(0.0, 1024.0, 0.0, 1024.0, 1);
    let tiles = get_required_tiles(&view, Size2D::new(1024, 1024), TILE);

    assert_eq!(tiles.len(), 16);
    let mut cells: Vec<(u32, u32)> = tiles
        .iter()
        .inspect(|tile| assert_eq!(tile.layer, 2))
        .map(|tile| (tile.x, tile.y))
        .collect();
    cells.sort_unstable();
    let expected: Vec<(u32, u32)> = (0..4).flat_map(|x| (0..4).map(move |y| (x, y))).collect();
    assert_eq!(cells, expected);
}

#[test]
fn test_tile_as_large_as_image() {
    let view = FrameView::new(-50.0, 300.0, 10.0, 200.0, 1);
    assert_eq!(
        get_required_tiles(&view, Size2D::new(256, 256), TILE),
        vec![TileCoordinate::new(0, 0, 0)]
    );
}

#[test]
fn test_large_image_is_fast() {
    let view = FrameView::new(0.0, 16384.0, 0.0, 16384.0, 1);
    let image = Size2D::new(16384, 16384);

    let start = Instant::now();
    let tiles = get_required_tiles(&view, image, TILE);
    let elapsed = start.elapsed();

    assert_eq!(tiles.len(), 4096);
    assert!(tiles.iter().all(|tile| tile.layer == 6));
    assert!(elapsed.as_millis() < 50, "took {elapsed:?}");
}

#[test]
fn test_invalid_inputs_yield_nothing() {
    let image = Size2D::new(1024, 1024);
    let cases = [
        FrameView::new(0.0, 100.0, 0.0, 100.0, 0),
        FrameView::new(100.0, 0.0, 0.0, 100.0, 1),
        FrameView::new(0.0, 100.0, 50.0, 50.0, 1),
        FrameView::new(f64::NAN, 100.0, 0.0, 100.0, 1),
        FrameView::new(0.0, f64::INFINITY, 0.0, 100.0, 1),
        FrameView::new(2000.0, 3000.0, 0.0, 100.0, 1),
        FrameView::new(-300.0, -10.0, 0.0, 100.0, 1),
    ];
    for view in cases {
        assert!(get_required_tiles(&view, image, TILE).is_empty(), "{view:?}");
    }

    let view = FrameView::new(0.0, 100.0, 0.0, 100.0, 1);
    assert!(get_required_tiles(&view, Size2D::new(0, 1024), TILE).is_empty());
    assert!(get_required_tiles(&view, image, Size2D::new(256, 0)).is_empty());
}

#[test]
fn test_partial_view_at_coarse_mip() {
    // mip 4 on 4096 px: layer 2, footprint 1024 px
    let image = Size2D::new(4096, 4096);
    let view = FrameView::new(1000.0, 2100.0, 0.0, 900.0, 4);
    let tiles = get_required_tiles(&view, image, TILE);

    assert!(tiles.iter().all(|tile| tile.layer == 2));
    let cells: Vec<(u32, u32)> = tiles.iter().map(|tile| (tile.x, tile.y)).collect();
    assert_eq!(cells, vec![(0, 0), (1, 0), (2, 0)]);
}
