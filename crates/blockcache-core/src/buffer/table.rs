//! Buffer table manager - the block directory.
//!
//! Maps a [`BlockKey`] to the descriptor caching it. Every request for block
//! data enters here: the manager deduplicates concurrent first fetches,
//! allocates or evicts descriptors, and hands downloads to the worker pool.
//!
//! Descriptors are retired once readers consumed a full block. The cache is
//! tuned for single-pass streaming, so a second reader after full consumption
//! fetches the block again.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blockcache_common::config::BlockCacheConfig;
use blockcache_common::error::{CacheError, CacheResult};
use blockcache_common::types::BlockKey;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::descriptor::BufferDescriptor;
use super::freelist::FreeList;
use super::pin::BufferPin;
use super::pool::BufferPool;
use crate::file::{Block, BlockState, File};
use crate::remote::RemoteStore;
use crate::stats::CacheStats;
use crate::worker::{TransferResult, TransferTask, WorkerPool};

/// Number of per-block creation locks.
const CREATION_STRIPES: usize = 64;

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// The block was already resident.
    Exists,
    /// A free descriptor was bound to the block.
    Allocated,
    /// An evicted descriptor was recycled for the block.
    Victim,
    /// The block is staged remotely but not committed; nothing was allocated.
    NeedsFlush,
}

/// Condition a directory removal must meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// Remove whoever holds the descriptor.
    Forced,
    /// Remove only an unreferenced descriptor.
    Strict,
    /// Remove only a descriptor without unstaged bytes.
    Clean,
}

/// Result of [`BufferTableManager::get_or_create`].
#[derive(Debug)]
pub struct Lookup {
    /// How the lookup was satisfied.
    pub status: BufferStatus,
    /// Reference held for synchronous callers.
    pub pin: Option<BufferPin>,
}

impl Lookup {
    fn new(status: BufferStatus, pin: Option<BufferPin>) -> Self {
        Self { status, pin }
    }

    fn needs_flush() -> Self {
        Self::new(BufferStatus::NeedsFlush, None)
    }
}

/// Directory of resident blocks.
pub struct BufferTableManager {
    /// Block to descriptor mapping.
    directory: RwLock<HashMap<BlockKey, Arc<BufferDescriptor>>>,
    /// Serializes creation of the same block across the eviction window.
    creation: Vec<Mutex<()>>,
    free_list: Arc<FreeList>,
    workers: WorkerPool,
    store: Arc<dyn RemoteStore>,
    stats: Arc<CacheStats>,
    block_size: u64,
}

impl BufferTableManager {
    /// Creates the directory, its descriptors and the worker pool.
    pub fn new(
        config: &BlockCacheConfig,
        store: Arc<dyn RemoteStore>,
        stats: Arc<CacheStats>,
    ) -> CacheResult<Arc<Self>> {
        config.validate()?;

        let block_size = config.block_size();
        let count = config.buffer_count();
        let pool = Arc::new(BufferPool::new(block_size as usize, count));
        let free_list = Arc::new(FreeList::new(pool, count)?);

        let table = Arc::new_cyclic(|table| Self {
            directory: RwLock::new(HashMap::with_capacity(count)),
            creation: (0..CREATION_STRIPES).map(|_| Mutex::new(())).collect(),
            free_list,
            workers: WorkerPool::new(
                config.parallelism as usize,
                config.queue_capacity(),
                Arc::clone(&store),
                table.clone(),
                Arc::clone(&stats),
                block_size,
            ),
            store,
            stats,
            block_size,
        });
        table.workers.start()?;

        info!(
            buffers = count,
            block_size,
            workers = config.parallelism,
            "buffer table manager started"
        );
        Ok(table)
    }

    /// Returns a pinned descriptor holding `block`, creating it if needed.
    ///
    /// `bytes_interested` counts toward the eviction-by-consumption budget.
    /// With `download`, a newly bound descriptor of a committed block is
    /// filled by the worker pool; `sync` callers wait for the transfer and get
    /// the pin back, others return at once and leave the pin to the worker.
    pub fn get_or_create(
        &self,
        block: &Arc<Block>,
        bytes_interested: u64,
        download: bool,
        sync: bool,
    ) -> CacheResult<Lookup> {
        let key = block.key();
        self.stats.record_lookup();

        let resident = self.pin_resident(&key);
        if let Some(pin) = resident {
            return self.serve_resident(pin, bytes_interested, sync);
        }

        let creation = self.creation_lock(&key).lock();
        let mut directory = self.directory.write();
        if let Some(descriptor) = directory.get(&key) {
            let pin = BufferPin::acquire(Arc::clone(descriptor), Arc::clone(&self.free_list));
            drop(directory);
            drop(creation);
            return self.serve_resident(pin, bytes_interested, sync);
        }

        self.stats.record_miss();
        if block.state() == BlockState::Uncommitted {
            debug!(block = %key, "block is uncommitted, flush required");
            return Ok(Lookup::needs_flush());
        }

        let (pin, status) = loop {
            match self.free_list.allocate(Arc::clone(block)) {
                Ok(pin) => {
                    self.stats.record_allocation();
                    break (pin, BufferStatus::Allocated);
                }
                Err(CacheError::FreeListFull) => {}
                Err(err) => return Err(err),
            }

            drop(directory);
            let claimed = self.claim_victim()?;
            directory = self.directory.write();
            if let Some(pin) = claimed {
                pin.rebind(Arc::clone(block));
                break (pin, BufferStatus::Victim);
            }
        };

        let descriptor = Arc::clone(pin.descriptor());
        let consumed = descriptor.add_consumed(bytes_interested);
        let fetch = download && block.state() == BlockState::Committed;
        if fetch {
            descriptor.begin_transfer();
        } else {
            // Local blocks were never uploaded; the zeroed buffer is their content.
            descriptor.mark_valid();
        }
        directory.insert(key, Arc::clone(&descriptor));
        drop(directory);
        drop(creation);

        debug!(block = %key, buffer = %descriptor.index(), ?status, fetch, sync, "buffer bound");

        if !fetch {
            return Ok(Lookup::new(status, sync.then_some(pin)));
        }

        if !sync {
            block.file().begin_pending_read();
            self.workers
                .submit(TransferTask::download(Arc::clone(block), descriptor).with_pin(pin))?;
            return Ok(Lookup::new(status, None));
        }

        let (task, done) = TransferTask::download(Arc::clone(block), descriptor).with_completion();
        self.workers.submit(task)?;
        // The gate below reports the outcome; the signal only orders us after the worker.
        wait_for_worker(&done)?;
        pin.ensure_valid_for_read()?;
        self.retire_if_consumed(&pin, bytes_interested, consumed);
        Ok(Lookup::new(status, Some(pin)))
    }

    /// Pins the descriptor of `key` under the shared directory lock.
    fn pin_resident(&self, key: &BlockKey) -> Option<BufferPin> {
        let directory = self.directory.read();
        directory
            .get(key)
            .map(|descriptor| BufferPin::acquire(Arc::clone(descriptor), Arc::clone(&self.free_list)))
    }

    fn serve_resident(&self, pin: BufferPin, bytes: u64, sync: bool) -> CacheResult<Lookup> {
        self.stats.record_hit();
        let consumed = pin.add_consumed(bytes);
        if sync {
            pin.ensure_valid_for_read()?;
        }
        self.retire_if_consumed(&pin, bytes, consumed);
        Ok(Lookup::new(BufferStatus::Exists, sync.then_some(pin)))
    }

    /// Removes a descriptor whose readers consumed a full block.
    ///
    /// The caller's pin keeps the bytes intact until it is dropped.
    fn retire_if_consumed(&self, pin: &BufferPin, bytes: u64, consumed: u64) {
        if bytes == 0 || consumed < self.block_size || pin.is_dirty() {
            return;
        }
        let (removed, _) = self.remove_mapping(pin.descriptor(), None, Removal::Clean);
        if removed {
            self.stats.record_consumed_removal();
            debug!(buffer = %pin.index(), consumed, "retired fully consumed buffer");
        }
    }

    /// Takes a victim out of the directory, uploading its bytes if dirty.
    ///
    /// Returns `None` when the free list regained a slot during the scan.
    fn claim_victim(&self) -> CacheResult<Option<BufferPin>> {
        loop {
            let Some(victim) = self.free_list.victim() else {
                return Ok(None);
            };

            let mut directory = self.directory.write();
            let ref_count = victim.ref_count();
            if ref_count < 1 {
                error!(buffer = %victim.index(), ref_count, "victim lost its pin");
                panic!("victim buffer {} has reference count {ref_count}", victim.index());
            }
            if ref_count > 1 || !victim.is_in_directory() || !victim.try_mark_evicted() {
                drop(directory);
                warn!(buffer = %victim.index(), ref_count, "victim changed hands, retrying");
                self.stats.record_eviction_retry();
                continue;
            }

            let evicted = victim.take_block();
            if let Some(block) = &evicted {
                directory.remove(&block.key());
            }
            drop(directory);
            self.stats.record_eviction();

            if let Some(block) = evicted {
                debug!(buffer = %victim.index(), block = %block.key(), dirty = victim.is_dirty(), "evicting");
                if victim.is_dirty() {
                    if let Err(err) = self.upload_sync(&block, victim.descriptor()) {
                        error!(buffer = %victim.index(), block = %block.key(), %err, "dirty victim upload failed");
                        // Give up the directory's share so dropping the pin recycles the slot.
                        victim.release();
                        return Err(err);
                    }
                }
            }
            return Ok(Some(victim));
        }
    }

    /// Stages the bytes of `descriptor` through the worker pool and waits.
    fn upload_sync(&self, block: &Arc<Block>, descriptor: &Arc<BufferDescriptor>) -> CacheResult<()> {
        let (task, done) =
            TransferTask::upload(Arc::clone(block), Arc::clone(descriptor)).with_completion();
        self.workers.submit(task)?;
        wait_for_worker(&done)?.map_err(CacheError::from)
    }

    /// Removes `descriptor` from the directory, at most once.
    ///
    /// With `strict`, a referenced descriptor is left in place. Returns
    /// `(removed, released_to_free_list)`.
    pub fn remove_buffer_descriptor(
        &self,
        descriptor: &Arc<BufferDescriptor>,
        strict: bool,
    ) -> (bool, bool) {
        let mode = if strict { Removal::Strict } else { Removal::Forced };
        self.remove_mapping(descriptor, None, mode)
    }

    fn remove_mapping(
        &self,
        descriptor: &Arc<BufferDescriptor>,
        expected: Option<BlockKey>,
        mode: Removal,
    ) -> (bool, bool) {
        let mut directory = self.directory.write();
        let Some(key) = descriptor.key() else {
            return (false, false);
        };
        if expected.is_some_and(|expected| expected != key) {
            return (false, false);
        }
        if !directory
            .get(&key)
            .is_some_and(|mapped| Arc::ptr_eq(mapped, descriptor))
        {
            return (false, false);
        }
        // Strict removal pins the slot against the victim scan.
        let strict = mode == Removal::Strict;
        if strict && !descriptor.try_pin_unreferenced() {
            return (false, false);
        }
        let removed = match mode {
            Removal::Clean => descriptor.try_mark_evicted_if_clean(),
            Removal::Forced | Removal::Strict => descriptor.try_mark_evicted(),
        };
        if removed {
            directory.remove(&key);
            descriptor.take_block();
        }
        drop(directory);

        if strict {
            self.free_list.unpin(descriptor);
        }
        if !removed {
            return (false, false);
        }
        let released = self.free_list.unpin(descriptor);
        debug!(block = %key, buffer = %descriptor.index(), released, "removed from directory");
        (true, released)
    }

    /// Removes every resident block of `file` from the directory.
    ///
    /// Waits for the file's prefetches and in-flight transfers first.
    pub fn release_all_buffers_for_file(&self, file: &File) {
        file.wait_pending_reads();

        let mut released = 0usize;
        for block in file.blocks() {
            let key = block.key();
            while let Some(descriptor) = self.lookup(&key) {
                descriptor.wait_ready();
                if self.remove_mapping(&descriptor, Some(key), Removal::Strict).0 {
                    released += 1;
                    break;
                }
                thread::yield_now();
            }
        }
        debug!(path = file.path(), released, "released file buffers");
    }

    /// Uploads every dirty resident block of `file`.
    pub fn flush_file(&self, file: &File) -> CacheResult<usize> {
        let mut uploaded = 0;
        for block in file.blocks() {
            let Some(pin) = self.pin_resident(&block.key()) else {
                continue;
            };
            if pin.is_dirty() {
                self.upload_sync(&block, pin.descriptor())?;
                uploaded += 1;
            }
        }
        Ok(uploaded)
    }

    /// Removes unreferenced clean descriptors idle for at least `timeout`.
    pub fn evict_idle(&self, timeout: Duration) -> usize {
        let candidates: Vec<(BlockKey, Arc<BufferDescriptor>)> = self
            .directory
            .read()
            .iter()
            .filter(|(_, d)| {
                d.ref_count() == 0 && d.is_valid() && !d.is_dirty() && d.idle_for() >= timeout
            })
            .map(|(key, d)| (*key, Arc::clone(d)))
            .collect();

        let mut evicted = 0;
        for (key, descriptor) in candidates {
            if self.remove_mapping(&descriptor, Some(key), Removal::Strict).0 {
                self.stats.record_idle_eviction();
                evicted += 1;
            }
        }
        evicted
    }

    /// Returns the descriptor mapped to `key`, without pinning it.
    pub fn lookup(&self, key: &BlockKey) -> Option<Arc<BufferDescriptor>> {
        self.directory.read().get(key).cloned()
    }

    /// Returns true if `key` is resident.
    pub fn contains(&self, key: &BlockKey) -> bool {
        self.directory.read().contains_key(key)
    }

    /// Returns the number of resident blocks.
    pub fn len(&self) -> usize {
        self.directory.read().len()
    }

    /// Returns true if no block is resident.
    pub fn is_empty(&self) -> bool {
        self.directory.read().is_empty()
    }

    /// Returns the descriptor arena.
    pub fn free_list(&self) -> &Arc<FreeList> {
        &self.free_list
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Returns the shared counters.
    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Drains and stops the worker pool, then returns all buffers.
    ///
    /// Every file must be closed first; buffers still in use are kept.
    pub fn shutdown(&self) {
        self.workers.shutdown();
        let free = self.free_list.free_count();
        let capacity = self.free_list.capacity();
        if free == capacity {
            self.free_list.return_buffers();
        } else {
            error!(free, capacity, "buffers still in use at shutdown");
        }
        info!("buffer table manager stopped");
    }

    fn creation_lock(&self, key: &BlockKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.creation[(hasher.finish() as usize) % self.creation.len()]
    }
}

/// Waits for a worker to signal a task's completion.
///
/// A signal dropped unsent means the worker died with the task.
fn wait_for_worker(done: &flume::Receiver<TransferResult>) -> CacheResult<TransferResult> {
    done.recv().map_err(|_| {
        error!("transfer worker dropped a task without completing it");
        CacheError::QueueClosed
    })
}

impl std::fmt::Debug for BufferTableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferTableManager")
            .field("resident", &self.len())
            .field("free_list", &self.free_list)
            .field("block_size", &self.block_size)
            .finish()
    }
}
