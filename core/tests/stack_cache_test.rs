use std::sync::Arc;

use blobcache_core::StackCache;
use blobcache_core::cache::stack::DEFAULT_MAX_COUNT;

#[derive(Debug, Clone, PartialEq)]
struct Thumbnail {
    width: u32,
    pixels: Arc<[u8]>,
}

fn thumb(width: u32) -> Thumbnail {
    Thumbnail { width, pixels: vec![0; width as usize].into() }
}

#[test]
fn oldest_insertion_goes_first() {
    let cache: StackCache<Thumbnail> = StackCache::new(3);
    for (i, name) in ["one", "two", "three", "four"].into_iter().enumerate() {
        assert!(cache.cache_object(thumb(i as u32), name.to_string()));
    }

    assert!(cache.get(&"one".to_string()).is_none());
    assert_eq!(cache.get(&"four".to_string()), Some(thumb(3)));
    assert_eq!(cache.len(), 3);
}

#[test]
fn reads_do_not_protect_from_eviction() {
    let cache: StackCache<Thumbnail> = StackCache::new(2);
    cache.cache_object(thumb(1), "a".to_string());
    cache.cache_object(thumb(2), "b".to_string());
    assert!(cache.get(&"a".to_string()).is_some());
    cache.cache_object(thumb(3), "c".to_string());

    assert!(!cache.contains(&"a".to_string()));
    assert_eq!(cache.get(&"b".to_string()).map(|t| t.width), Some(2));
}

#[test]
fn limit_changes_apply_immediately() {
    let cache: StackCache<Thumbnail> = StackCache::default();
    assert_eq!(cache.max_count(), DEFAULT_MAX_COUNT);
    for i in 0..DEFAULT_MAX_COUNT as u32 + 10 {
        cache.cache_object(thumb(i), format!("k{i}"));
    }
    assert_eq!(cache.len(), DEFAULT_MAX_COUNT);
    assert!(!cache.contains(&"k9".to_string()));
    assert!(cache.contains(&"k10".to_string()));

    cache.set_max_count(1);
    assert_eq!(cache.len(), 1);
    assert!(cache.contains(&format!("k{}", DEFAULT_MAX_COUNT + 9)));

    cache.reset();
    assert!(cache.is_empty());
}
