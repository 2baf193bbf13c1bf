//! # blockcache-core
//!
//! The buffer engine of blockcache: a block-level read cache for a network
//! filesystem client.
//!
//! Remote files are cut into fixed-size blocks. Reads go through a block
//! directory that deduplicates concurrent first fetches and hands downloads
//! to a pool of transfer workers. Buffers come from a fixed budget and are
//! recycled with a clock sweep, or retired as soon as readers consumed a
//! whole block.
//!
//! - **Buffer**: descriptors, the free list, pins and the block directory
//! - **File**: open-file state, block lists, handles and the registry
//! - **Worker**: background downloads and uploads
//! - **Pattern**: sequential access detection for read-ahead
//! - **Monitor**: idle eviction
//! - **Remote**: the storage backend seam, with in-memory and local impls
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use blockcache_common::BlockCacheConfig;
//! use blockcache_core::{BlockCache, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! store.insert_pattern("data.bin", 200 * 1024);
//!
//! let cache = BlockCache::new(BlockCacheConfig::for_testing(), store).unwrap();
//! let handle = cache.open("data.bin").unwrap();
//!
//! let mut buf = vec![0u8; 4096];
//! let outcome = cache.read(&handle, 0, &mut buf).unwrap();
//! assert_eq!(outcome.bytes_read, 4096);
//! assert!(!outcome.eof);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod cache;
pub mod file;
pub mod monitor;
pub mod pattern;
pub mod remote;
pub mod stats;
pub mod worker;

pub use buffer::{
    BufferDescriptor, BufferPin, BufferPool, BufferStatus, BufferTableManager, FreeList, Lookup,
};
pub use cache::BlockCache;
pub use file::{Block, BlockState, File, FileHandle, FileRegistry, HandleId, ReadOutcome};
pub use monitor::IdleMonitor;
pub use pattern::{AccessPattern, PatternDetector};
pub use remote::{LocalDirStore, MemoryStore, RemoteStore};
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use worker::{TransferDirection, TransferTask, WorkerPool};

pub use blockcache_common::{BlockCacheConfig, CacheError, CacheResult};
