//! Concurrency integration tests: deduplicated first fetches, read-ahead,
//! mixed readers over a small buffer budget, and removals racing readers
//! and writers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blockcache_core::{BlockCache, BlockCacheConfig, MemoryStore};

const BLOCK: u64 = 4096;
const READ_LEN: u64 = 1500;

fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn config(buffers: u64) -> BlockCacheConfig {
    BlockCacheConfig::default()
        .with_block_size(BLOCK)
        .with_memory_budget(buffers * BLOCK)
        .with_workers(4)
        .with_mem_timeout(0)
}

#[test]
fn test_concurrent_first_reads_fetch_once() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("hot", 4 * BLOCK);
    store.set_latency(Some(Duration::from_millis(20)));
    let cache = BlockCache::new(config(4).with_read_ahead(false), store.clone()).unwrap();
    // Keeps the file open so every thread shares its blocks.
    let anchor = cache.open("hot").unwrap();

    thread::scope(|scope| {
        for t in 0..16u64 {
            let cache = &cache;
            scope.spawn(move || {
                let handle = cache.open("hot").unwrap();
                let mut buf = [0u8; 64];
                let offset = t * 64;
                let outcome = cache.read(&handle, offset, &mut buf).unwrap();
                assert_eq!(outcome.bytes_read, 64);
                assert!(buf.iter().enumerate().all(|(i, b)| *b == pattern(offset + i as u64)));
            });
        }
    });

    assert_eq!(store.read_count("hot", 0), 1);
    let stats = cache.stats();
    assert_eq!(stats.lookups, 16);
    assert_eq!(stats.misses, 1);
    drop(anchor);
    assert!(cache.registry().is_empty());
    cache.table().free_list().assert_all_free();
}

#[test]
fn test_sequential_scan_prefetches_ahead() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("stream", 16 * BLOCK);
    let cache = BlockCache::new(config(8).with_prefetch(3), store.clone()).unwrap();
    let handle = cache.open("stream").unwrap();

    let mut buf = vec![0u8; BLOCK as usize];
    for i in 0..16 {
        let outcome = cache.read(&handle, i * BLOCK, &mut buf).unwrap();
        assert_eq!(outcome.bytes_read, BLOCK as usize);
        assert_eq!(buf[0], pattern(i * BLOCK));
    }

    let stats = cache.stats();
    assert_eq!(stats.prefetches_scheduled, 15);
    assert_eq!(store.total_reads(), 16);
    assert_eq!(stats.consumed_removals, 16);
    assert!(handle.detector().next_read_ahead() >= 16);
}

#[test]
fn test_random_reads_do_not_prefetch() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("scattered", 64 * BLOCK);
    let cache = BlockCache::new(config(8), store.clone()).unwrap();
    let handle = cache.open("scattered").unwrap();

    let mut buf = [0u8; 16];
    for index in [40u64, 3, 57, 12, 30, 0, 61] {
        cache.read(&handle, index * BLOCK, &mut buf).unwrap();
    }
    assert_eq!(cache.stats().prefetches_scheduled, 0);
    assert_eq!(handle.detector().streak(), -3);
}

#[test]
fn test_mixed_readers_under_pressure() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("a", 32 * BLOCK);
    store.insert_pattern("b", 32 * BLOCK + 100);
    let cache = BlockCache::new(config(4), store.clone()).unwrap();

    thread::scope(|scope| {
        for t in 0..8u64 {
            let cache = &cache;
            scope.spawn(move || {
                let path = if t % 2 == 0 { "a" } else { "b" };
                let handle = cache.open(path).unwrap();
                let mut buf = vec![0u8; READ_LEN as usize];
                for i in 0..40u64 {
                    let offset = ((t * 7 + i * 13) % 32) * BLOCK + (i * 97) % (BLOCK - READ_LEN);
                    let outcome = cache.read(&handle, offset, &mut buf).unwrap();
                    assert_eq!(outcome.bytes_read, buf.len());
                    assert!(buf[..outcome.bytes_read]
                        .iter()
                        .enumerate()
                        .all(|(j, b)| *b == pattern(offset + j as u64)));
                }
            });
        }
    });

    assert!(cache.registry().is_empty());
    assert!(cache.table().is_empty());
    cache.table().free_list().assert_all_free();
    assert!(cache.stats().evictions > 0);
}

#[test]
fn test_idle_eviction_alongside_victim_scans() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("c", 16 * BLOCK);
    let cache = BlockCache::new(config(4).with_read_ahead(false), store.clone()).unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    cache.table().evict_idle(Duration::ZERO);
                }
            });
        }

        let readers: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = &cache;
                scope.spawn(move || {
                    let handle = cache.open("c").unwrap();
                    let mut buf = [0u8; 256];
                    for i in 0..200u64 {
                        let offset = ((t + i * 5) % 16) * BLOCK + (i * 31) % (BLOCK - 256);
                        let outcome = cache.read(&handle, offset, &mut buf).unwrap();
                        assert_eq!(outcome.bytes_read, buf.len());
                        assert_eq!(buf[0], pattern(offset));
                    }
                })
            })
            .collect();
        let results: Vec<_> = readers.into_iter().map(|reader| reader.join()).collect();
        stop.store(true, Ordering::Release);
        assert!(results.iter().all(Result::is_ok));
    });

    assert!(cache.registry().is_empty());
    assert!(cache.table().is_empty());
    cache.table().free_list().assert_all_free();
}

#[test]
fn test_writes_survive_concurrent_full_reads() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("w", 2 * BLOCK);
    let cache = BlockCache::new(config(4).with_read_ahead(false), store.clone()).unwrap();
    let writer = cache.open("w").unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                let handle = cache.open("w").unwrap();
                let mut buf = vec![0u8; BLOCK as usize];
                while !stop.load(Ordering::Acquire) {
                    for index in 0..2 {
                        let outcome = cache.read(&handle, index * BLOCK, &mut buf).unwrap();
                        assert_eq!(outcome.bytes_read, buf.len());
                    }
                }
            });
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            for round in 0..200u32 {
                let value = (round % 250) as u8 + 1;
                assert_eq!(writer.write(100, &[value; 16]).unwrap(), 16);
            }
        }));
        stop.store(true, Ordering::Release);
        assert!(result.is_ok());
    });

    writer.flush().unwrap();
    let object = store.object("w").unwrap();
    assert_eq!(&object[100..116], &[200u8; 16]);
    assert_eq!(object[99], pattern(99));
    assert_eq!(object[116], pattern(116));
}
