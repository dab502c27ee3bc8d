//! # Eviction Cooperation Tests
//!
//! The shared cache consults the owning store before dropping any entry.
//! These tests pin down both halves of the policy for uncommitted pages:
//!
//! 1. Without a background writer, evictions of writable pages are
//!    cancelled; the pages stay resident with their uncommitted bytes
//! 2. With a background writer, the store hands durability to the writer
//!    and lets the eviction proceed; the bytes reach disk by the commit
//!    flush at the latest
//!
//! The caches here are sized at the minimum (one page per shard) so that
//! overfilling them forces eviction scans.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use quarrydb::config::CACHE_SHARD_COUNT;
use quarrydb::{AppendOnlyPageStore, FsBackend, PageCache, StoreOptions};
use tempfile::tempdir;

const PAGE_SIZE: usize = 4096;

// Enough pages that every shard of a minimum-size cache overflows.
const PAGE_COUNT: u64 = 4 * CACHE_SHARD_COUNT as u64;

fn tiny_cache() -> Arc<PageCache> {
    Arc::new(PageCache::new(CACHE_SHARD_COUNT).unwrap())
}

#[test]
fn uncommitted_pages_cancel_eviction_without_background_writer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.pages");
    let cache = tiny_cache();
    let store = AppendOnlyPageStore::open(
        Arc::new(FsBackend),
        Arc::clone(&cache),
        &path,
        StoreOptions::synchronous(),
    )
    .unwrap();

    let mut created = Vec::new();
    for id in 1..=PAGE_COUNT {
        let page = store.create(1).unwrap();
        store.write(1, id, &[id as u8; PAGE_SIZE], 0, 0, None).unwrap();
        created.push(page);
    }

    // Overfilling forced eviction scans, and every candidate was an
    // uncommitted writable page, so every scan was cancelled.
    assert!(cache.stats.cancelled_evictions.load(Ordering::Relaxed) > 0);
    assert_eq!(cache.stats.evictions.load(Ordering::Relaxed), 0);
    assert_eq!(cache.len(), PAGE_COUNT as usize);

    for (i, page) in created.iter().enumerate() {
        let id = i as u64 + 1;
        let retrieved = store.retrieve(id).unwrap();
        assert!(Arc::ptr_eq(page, &retrieved));
        assert!(retrieved.data().iter().all(|&b| b == id as u8));
    }
}

#[test]
fn uncommitted_pages_hand_durability_to_background_writer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.pages");
    let cache = tiny_cache();
    let store = AppendOnlyPageStore::open(
        Arc::new(FsBackend),
        Arc::clone(&cache),
        &path,
        StoreOptions::default(),
    )
    .unwrap();

    for id in 1..=PAGE_COUNT {
        store.create(1).unwrap();
        store.write(1, id, &[id as u8; PAGE_SIZE], 0, 0, None).unwrap();
    }

    // Evictions proceeded because the writer took over durability.
    assert!(cache.stats.evictions.load(Ordering::Relaxed) > 0);
    assert!(cache.len() <= CACHE_SHARD_COUNT);

    // Evicted or not, every page is still served from the new-page buffer
    // with its uncommitted bytes.
    for id in 1..=PAGE_COUNT {
        assert!(store.retrieve(id).unwrap().data().iter().all(|&b| b == id as u8));
    }

    store.commit(1).unwrap();
    store.close().unwrap();

    // After the commit flush the hand-off is durable on disk.
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), PAGE_COUNT as usize * PAGE_SIZE);
    for id in 1..=PAGE_COUNT {
        let offset = (id as usize - 1) * PAGE_SIZE;
        assert!(bytes[offset..offset + PAGE_SIZE].iter().all(|&b| b == id as u8));
    }
}

#[test]
fn committed_pages_evict_and_reload_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.pages");
    let cache = tiny_cache();
    let store = AppendOnlyPageStore::open(
        Arc::new(FsBackend),
        Arc::clone(&cache),
        &path,
        StoreOptions::default(),
    )
    .unwrap();

    for id in 1..=PAGE_COUNT {
        store.create(1).unwrap();
        store.write(1, id, &[id as u8; PAGE_SIZE], 0, 0, None).unwrap();
    }
    store.commit(1).unwrap();

    // Committed pages never cancel: the cache stays within capacity and
    // misses reload from the file.
    assert!(cache.len() <= CACHE_SHARD_COUNT);
    for id in 1..=PAGE_COUNT {
        let page = store.retrieve(id).unwrap();
        assert_eq!(page.id(), id);
        assert!(page.data().iter().all(|&b| b == id as u8));
    }
}

#[test]
fn closed_store_stops_cancelling_evictions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.pages");
    let cache = tiny_cache();
    let store = AppendOnlyPageStore::open(
        Arc::new(FsBackend),
        Arc::clone(&cache),
        &path,
        StoreOptions::synchronous(),
    )
    .unwrap();

    for _ in 0..PAGE_COUNT {
        store.create(1).unwrap();
    }
    store.commit(1).unwrap();

    // While the store is live nothing was dropped: uncommitted candidates
    // cancelled, and commit promotion replaced entries in place.
    assert_eq!(cache.stats.evictions.load(Ordering::Relaxed), 0);

    store.close().unwrap();

    // With the listener unsubscribed, a second store on another file can
    // push the first store's pages out freely.
    let other_path = dir.path().join("other.pages");
    let other = AppendOnlyPageStore::open(
        Arc::new(FsBackend),
        Arc::clone(&cache),
        &other_path,
        StoreOptions::synchronous(),
    )
    .unwrap();

    for _ in 0..PAGE_COUNT {
        other.create(1).unwrap();
    }
    other.commit(1).unwrap();

    assert!(cache.stats.evictions.load(Ordering::Relaxed) > 0);
}
