//! Read path integration tests: block addressing, end of file and the
//! flush that precedes access to staged blocks.

use std::sync::Arc;

use blockcache_common::constants::MIB;
use blockcache_core::{
    Block, BlockCache, BlockCacheConfig, BlockState, CacheError, FileHandle, MemoryStore, RemoteStore,
};

const BLOCK: u64 = 4096;

fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn cache(store: &Arc<MemoryStore>, block_size: u64, buffers: u64) -> BlockCache {
    let config = BlockCacheConfig::default()
        .with_block_size(block_size)
        .with_memory_budget(buffers * block_size)
        .with_workers(2)
        .with_read_ahead(false)
        .with_mem_timeout(0);
    BlockCache::new(config, store.clone()).unwrap()
}

#[test]
fn test_read_spanning_two_blocks() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("big", 4 * MIB);
    let cache = cache(&store, MIB, 5);
    assert_eq!(cache.config().buffer_count(), 5);

    let handle = cache.open("big").unwrap();
    let mut buf = vec![0u8; (3 * MIB / 2) as usize];
    let outcome = cache.read(&handle, MIB / 2, &mut buf).unwrap();

    assert_eq!(outcome.bytes_read, buf.len());
    assert!(!outcome.eof);
    assert!(buf
        .iter()
        .enumerate()
        .all(|(i, b)| *b == pattern(MIB / 2 + i as u64)));

    // Each block fetched once; block 1 was read in full and retired.
    assert_eq!(store.read_count("big", 0), 1);
    assert_eq!(store.read_count("big", MIB), 1);
    assert_eq!(cache.table().len(), 1);
    assert_eq!(cache.stats().consumed_removals, 1);

    let mut tail = vec![0u8; 16];
    cache.read(&handle, MIB + 8, &mut tail).unwrap();
    assert_eq!(store.read_count("big", MIB), 2);
}

#[test]
fn test_read_at_end_of_file() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("short", 3 * BLOCK / 2);
    let cache = cache(&store, BLOCK, 4);
    let handle = cache.open("short").unwrap();

    let mut buf = vec![0u8; BLOCK as usize];
    let outcome = cache.read(&handle, BLOCK, &mut buf).unwrap();
    assert_eq!(outcome.bytes_read, (BLOCK / 2) as usize);
    assert!(outcome.eof);
    assert_eq!(buf[0], pattern(BLOCK));

    let outcome = cache.read(&handle, 2 * BLOCK, &mut buf).unwrap();
    assert_eq!(outcome.bytes_read, 0);
    assert!(outcome.eof);

    let mut exact = vec![0u8; (BLOCK / 2) as usize];
    let outcome = cache.read(&handle, BLOCK, &mut exact).unwrap();
    assert_eq!(outcome.bytes_read, exact.len());
    assert!(!outcome.eof);
}

#[test]
fn test_empty_read_buffer() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("f", BLOCK);
    let cache = cache(&store, BLOCK, 2);
    let handle = cache.open("f").unwrap();

    let outcome = cache.read(&handle, 10, &mut []).unwrap();
    assert_eq!(outcome.bytes_read, 0);
    assert_eq!(store.total_reads(), 0);
}

#[test]
fn test_failed_download_surfaces_and_recovers() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("flaky", 2 * BLOCK);
    store.fail_reads_at("flaky", BLOCK);
    let cache = cache(&store, BLOCK, 4);
    let handle = cache.open("flaky").unwrap();

    let mut buf = vec![0u8; 64];
    let err = cache.read(&handle, BLOCK, &mut buf).unwrap_err();
    assert!(matches!(err, CacheError::Transfer(_)));
    assert!(handle.file().last_error().is_some());
    assert_eq!(cache.stats().download_failures, 1);

    store.heal_reads_at("flaky", BLOCK);
    let outcome = cache.read(&handle, BLOCK, &mut buf).unwrap();
    assert_eq!(outcome.bytes_read, 64);
    assert_eq!(buf[0], pattern(BLOCK));
}

/// Writes three bytes to `written` and streams `other` until the dirty
/// block is pushed out and staged.
fn stage_by_eviction(cache: &BlockCache, store: &MemoryStore) -> (FileHandle, Arc<Block>) {
    let writer = cache.open("written").unwrap();
    assert_eq!(writer.write(0, b"XYZ").unwrap(), 3);
    assert!(!writer.file().is_synced());
    let block = writer.file().block_at(0).unwrap();

    let reader = cache.open("other").unwrap();
    let mut buf = vec![0u8; 100];
    let mut index = 0;
    while cache.table().contains(&block.key()) {
        assert!(index < 8, "dirty block was never evicted");
        cache.read(&reader, index * BLOCK, &mut buf).unwrap();
        index += 1;
    }

    assert_eq!(block.state(), BlockState::Uncommitted);
    assert_eq!(store.staged_count("written"), 1);
    assert_eq!(cache.stats().uploads, 1);
    (writer, block)
}

#[test]
fn test_read_of_staged_block_flushes_first() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("written", BLOCK);
    store.insert_pattern("other", 8 * BLOCK);
    let cache = cache(&store, BLOCK, 2);
    let (writer, block) = stage_by_eviction(&cache, &store);

    let mut head = [0u8; 4];
    let outcome = cache.read(&writer, 0, &mut head).unwrap();
    assert_eq!(outcome.bytes_read, 4);
    assert_eq!(&head, &[b'X', b'Y', b'Z', pattern(3)]);

    assert_eq!(block.state(), BlockState::Committed);
    assert!(writer.file().is_synced());
    assert_eq!(store.staged_count("written"), 0);
    assert_eq!(&store.object("written").unwrap()[..3], b"XYZ");
    assert_eq!(writer.file().size_on_storage(), BLOCK);
    assert_eq!(writer.file().etag(), store.etag("written").unwrap());
}

#[test]
fn test_write_to_staged_block_flushes_first() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("written", BLOCK);
    store.insert_pattern("other", 8 * BLOCK);
    let cache = cache(&store, BLOCK, 2);
    let (writer, block) = stage_by_eviction(&cache, &store);

    assert_eq!(writer.write(1, b"ab").unwrap(), 2);
    assert_eq!(store.staged_count("written"), 0);
    assert_eq!(&store.object("written").unwrap()[..3], b"XYZ");

    let mut head = [0u8; 4];
    cache.read(&writer, 0, &mut head).unwrap();
    assert_eq!(&head, &[b'X', b'a', b'b', pattern(3)]);

    assert_eq!(writer.flush().unwrap(), 1);
    assert_eq!(block.state(), BlockState::Committed);
    assert_eq!(&store.object("written").unwrap()[..4], &[b'X', b'a', b'b', pattern(3)]);
    assert_eq!(writer.file().pending_writers(), 0);
}

#[test]
fn test_write_past_end_grows_file() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("grow", 10);
    let cache = cache(&store, BLOCK, 4);

    let handle = cache.open("grow").unwrap();
    handle.write(BLOCK + 5, b"tail").unwrap();
    assert_eq!(handle.file().size(), BLOCK + 9);
    assert_eq!(handle.file().block_at(1).unwrap().state(), BlockState::Local);

    let mut buf = [0u8; 4];
    cache.read(&handle, BLOCK + 5, &mut buf).unwrap();
    assert_eq!(&buf, b"tail");

    // Closing the last handle flushes.
    cache.close(handle);
    let object = store.object("grow").unwrap();
    assert_eq!(object.len() as u64, BLOCK + 9);
    assert_eq!(&object[(BLOCK + 5) as usize..], b"tail");
    assert_eq!(object[0], pattern(0));
}

#[test]
fn test_grown_tail_block_reads_as_zeros() {
    let store = Arc::new(MemoryStore::new());
    store.insert_pattern("grow", 10);
    let cache = cache(&store, BLOCK, 4);

    let handle = cache.open("grow").unwrap();
    handle.write(BLOCK + 5, b"tail").unwrap();
    assert_eq!(handle.file().size(), BLOCK + 9);

    // Block 0 is only 10 bytes remotely but lies wholly inside the file.
    let mut buf = vec![0xffu8; 100];
    let outcome = cache.read(&handle, 0, &mut buf).unwrap();
    assert_eq!(outcome.bytes_read, 100);
    assert!(!outcome.eof);
    assert!((0..10).all(|i| buf[i] == pattern(i as u64)));
    assert!(buf[10..].iter().all(|&b| b == 0));

    let mut buf = vec![0xffu8; 100];
    let outcome = cache.read(&handle, 20, &mut buf).unwrap();
    assert_eq!(outcome.bytes_read, 100);
    assert!(!outcome.eof);
    assert!(buf.iter().all(|&b| b == 0));
}
