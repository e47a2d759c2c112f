//! Cache tier behaviour through the public API.

use cube_streamer::tile::{
    add_file_id, encode, CompressedTile, CompressedTileCache, RasterTileCache,
};
use cube_streamer::TileCoordinate;

use super::test_utils::filled_payload;

fn key(x: u32, y: u32, layer: u32) -> u64 {
    add_file_id(encode(x, y, layer), 0)
}

#[test]
fn test_capacity_plus_one_evicts_least_recent() {
    let capacity = 8;
    let mut cache = RasterTileCache::new(capacity, 16, 0);
    let keys: Vec<u64> = (0..=capacity as u32).map(|x| key(x, 0, 4)).collect();

    for k in &keys[..capacity] {
        cache.insert(*k, 4, vec![0.0; 4], 2, 2).unwrap();
    }
    // Touch everything except keys[3]
    for (i, k) in keys[..capacity].iter().enumerate() {
        if i != 3 {
            assert!(cache.get(*k, 4, false).is_some());
        }
    }
    let victim_slot = cache.peek(keys[3], 4).unwrap().texture_slot;
    let free_before = cache.slots().available();

    let insertion = cache.insert(keys[capacity], 4, vec![0.0; 4], 2, 2).unwrap();

    assert_eq!(insertion.evicted, vec![(keys[3], victim_slot)]);
    assert_eq!(cache.lru_len(), capacity);
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(cache.contains(*k, 4), i != 3);
    }
    // The victim's slot went back once and was handed to the newcomer
    assert_eq!(insertion.texture_slot, victim_slot);
    assert_eq!(cache.slots().available(), free_before);

    cache.clear();
    for slot in 0..16 {
        assert_eq!(cache.slots().free_count(slot), 1);
    }
}

#[test]
fn test_persistent_layers_never_evicted() {
    let mut cache = RasterTileCache::new(2, 64, 3);
    let persistent: Vec<TileCoordinate> = (0..3)
        .flat_map(|layer| {
            let edge = 1u32 << layer;
            (0..edge).flat_map(move |x| (0..edge).map(move |y| TileCoordinate::new(x, y, layer)))
        })
        .collect();
    assert_eq!(persistent.len(), 21);

    // Interleave persistent inserts with heavy LRU churn
    for (i, tile) in persistent.iter().enumerate() {
        cache.insert(key(tile.x, tile.y, tile.layer), tile.layer, vec![1.0], 1, 1).unwrap();
        for x in 0..3 {
            cache.insert(key(x + i as u32, 0, 6), 6, vec![2.0], 1, 1).unwrap();
        }
    }

    assert_eq!(cache.persistent_len(), 21);
    assert_eq!(cache.lru_len(), 2);
    for tile in &persistent {
        assert!(cache.contains(key(tile.x, tile.y, tile.layer), tile.layer));
    }
}

#[test]
fn test_compressed_cache_is_per_file() {
    let mut cache = CompressedTileCache::new(2);
    let tiles = [
        TileCoordinate::new(0, 0, 1),
        TileCoordinate::new(1, 0, 1),
        TileCoordinate::new(0, 1, 1),
    ];
    for file_id in [0, 1] {
        for tile in &tiles {
            cache.put(
                file_id,
                tile.encode(),
                CompressedTile {
                    payload: filled_payload(*tile, 2, 2, 1.0),
                    compression_quality: 11,
                },
            );
        }
    }

    // Each file keeps its own two most recent tiles
    assert_eq!(cache.len_for(0), 2);
    assert_eq!(cache.len_for(1), 2);
    assert!(!cache.contains(0, tiles[0].encode()));
    assert!(cache.contains(1, tiles[2].encode()));

    cache.clear_file(1);
    assert_eq!(cache.len(), 2);
}
