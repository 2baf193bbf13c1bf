//! The block cache context.
//!
//! [`BlockCache`] owns every component of one mounted cache: the directory,
//! its descriptors and workers, the open-file registry and the idle monitor.
//! Nothing is global; dropping or shutting down the cache tears it all down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blockcache_common::config::BlockCacheConfig;
use blockcache_common::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::BufferTableManager;
use crate::file::{FileHandle, FileRegistry, ReadAhead, ReadOutcome};
use crate::monitor::IdleMonitor;
use crate::remote::RemoteStore;
use crate::stats::{CacheStats, CacheStatsSnapshot};

/// A block-level read cache over a remote store.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use blockcache_common::BlockCacheConfig;
/// use blockcache_core::{BlockCache, MemoryStore};
///
/// let store = Arc::new(MemoryStore::new());
/// store.insert("hello.txt", b"hello world".to_vec());
///
/// let config = BlockCacheConfig::for_testing();
/// let cache = BlockCache::new(config, store).unwrap();
///
/// let handle = cache.open("hello.txt").unwrap();
/// let mut buf = [0u8; 5];
/// let outcome = cache.read(&handle, 6, &mut buf).unwrap();
/// assert_eq!(&buf[..outcome.bytes_read], b"world");
///
/// drop(handle);
/// cache.shutdown();
/// ```
pub struct BlockCache {
    config: BlockCacheConfig,
    store: Arc<dyn RemoteStore>,
    table: Arc<BufferTableManager>,
    registry: Arc<FileRegistry>,
    monitor: Mutex<Option<IdleMonitor>>,
    stats: Arc<CacheStats>,
    shutdown: AtomicBool,
}

impl BlockCache {
    /// Builds and starts a cache over `store`.
    pub fn new(config: BlockCacheConfig, store: Arc<dyn RemoteStore>) -> CacheResult<Self> {
        config.validate()?;

        let stats = Arc::new(CacheStats::new());
        let table = BufferTableManager::new(&config, Arc::clone(&store), Arc::clone(&stats))?;
        let registry = Arc::new(FileRegistry::new(
            Arc::clone(&table),
            ReadAhead {
                blocks: config.prefetch,
                enabled: config.read_ahead_enabled(),
            },
        ));

        let monitor = match config.idle_timeout() {
            Some(timeout) => Some(IdleMonitor::start(
                Arc::downgrade(&table),
                timeout,
                config.monitor_interval(),
            )?),
            None => None,
        };

        info!(
            block_size = config.block_size(),
            buffers = config.buffer_count(),
            prefetch = config.prefetch,
            read_ahead = config.read_ahead_enabled(),
            "block cache started"
        );

        Ok(Self {
            config,
            store,
            table,
            registry,
            monitor: Mutex::new(monitor),
            stats,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Opens `path` on the remote store.
    pub fn open(&self, path: &str) -> CacheResult<FileHandle> {
        self.check_running()?;
        let size = self.store.size(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => CacheError::NotFound {
                path: path.to_string(),
            },
            _ => CacheError::from(err),
        })?;
        let etag = self.store.etag(path).unwrap_or_else(|err| {
            debug!(path, %err, "no version tag");
            None
        });
        Ok(self.registry.open(path, size, etag))
    }

    /// Reads through `handle`.
    pub fn read(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> CacheResult<ReadOutcome> {
        self.check_running()?;
        handle.read(offset, buf)
    }

    /// Closes `handle`. The last handle of a file releases its buffers.
    pub fn close(&self, handle: FileHandle) {
        drop(handle);
    }

    /// Returns a snapshot of the cache counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BlockCacheConfig {
        &self.config
    }

    /// Returns the block directory.
    pub fn table(&self) -> &Arc<BufferTableManager> {
        &self.table
    }

    /// Returns the open-file registry.
    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    /// Stops the monitor, closes every open file, drains the workers and
    /// returns every buffer. Calling it twice is a no-op.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        if !self.registry.is_empty() {
            warn!(open_files = self.registry.len(), "shutting down with open files");
            self.registry.close_all();
        }
        self.table.shutdown();
        info!(stats = %self.stats.snapshot(), "block cache stopped");
    }

    /// Returns true once shutdown started.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn check_running(&self) -> CacheResult<()> {
        if self.is_shut_down() {
            Err(CacheError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("table", &self.table)
            .field("registry", &self.registry)
            .field("shutdown", &self.is_shut_down())
            .finish()
    }
}
