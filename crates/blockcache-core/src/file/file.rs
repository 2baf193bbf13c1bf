//! Open files and their read/write paths.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use blockcache_common::error::{CacheError, CacheResult, TransferFailure};
use blockcache_common::types::{BlockIndex, FileId};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::block::{Block, BlockList, BlockState};
use super::handle::HandleId;
use crate::buffer::BufferTableManager;

/// Size sentinel of a file whose size is not known yet.
const UNKNOWN_SIZE: i64 = -1;

/// File identity shared by the file and all of its blocks.
pub struct FileMeta {
    id: FileId,
    path: String,
    /// Size in bytes, or [`UNKNOWN_SIZE`].
    size: AtomicI64,
    /// Asynchronous downloads in flight.
    pending_reads: Mutex<usize>,
    drained: Condvar,
    last_error: Mutex<Option<TransferFailure>>,
}

impl FileMeta {
    /// Creates metadata; a negative `size` means unknown.
    pub fn new(id: FileId, path: String, size: i64) -> Self {
        Self {
            id,
            path,
            size: AtomicI64::new(size.max(UNKNOWN_SIZE)),
            pending_reads: Mutex::new(0),
            drained: Condvar::new(),
            last_error: Mutex::new(None),
        }
    }

    /// Returns the file id.
    #[inline]
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Returns the remote path.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw size, `-1` if unknown.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    /// Returns the size if known.
    pub fn known_size(&self) -> Option<u64> {
        u64::try_from(self.size()).ok()
    }

    /// Raises the size to `size` unless it is already larger.
    ///
    /// Returns true if the size changed.
    pub fn raise_size(&self, size: u64) -> bool {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        self.size.fetch_max(size, Ordering::AcqRel) < size
    }

    /// Counts one asynchronous download.
    pub fn begin_pending_read(&self) {
        *self.pending_reads.lock() += 1;
    }

    /// Settles one asynchronous download.
    pub fn end_pending_read(&self) {
        let mut pending = self.pending_reads.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    /// Returns the number of asynchronous downloads in flight.
    pub fn pending_reads(&self) -> usize {
        *self.pending_reads.lock()
    }

    /// Blocks until no asynchronous download is in flight.
    pub fn wait_pending_reads(&self) {
        let mut pending = self.pending_reads.lock();
        while *pending > 0 {
            self.drained.wait(&mut pending);
        }
    }

    /// Records the latest transfer failure.
    pub fn set_last_error(&self, failure: TransferFailure) {
        *self.last_error.lock() = Some(failure);
    }

    /// Returns the latest transfer failure.
    pub fn last_error(&self) -> Option<TransferFailure> {
        self.last_error.lock().clone()
    }
}

impl std::fmt::Debug for FileMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMeta")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}

/// Result of a read. Reaching the end of the file is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes copied into the caller's buffer.
    pub bytes_read: usize,
    /// The requested range reached past the end of the file.
    pub eof: bool,
}

/// Open handles of a file.
#[derive(Default)]
struct HandleSet {
    open: HashSet<HandleId>,
    /// Set by the last close; a closed file accepts no new handles.
    closed: bool,
}

/// Writes in progress, and whether a flush holds new ones off.
#[derive(Debug, Default)]
struct Writers {
    active: usize,
    flushing: bool,
}

/// One write in progress; dropping it lets a waiting flush proceed.
struct PendingWrite<'a> {
    file: &'a File,
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        let mut writers = self.file.writers.lock();
        writers.active -= 1;
        if writers.active == 0 {
            self.file.writers_changed.notify_all();
        }
    }
}

/// Exclusive hold of a flush over the file's writers.
struct FlushGuard<'a> {
    file: &'a File,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.file.writers.lock().flushing = false;
        self.file.writers_changed.notify_all();
    }
}

/// An open file: its metadata, block list and handles.
pub struct File {
    meta: Arc<FileMeta>,
    block_size: u64,
    blocks: RwLock<BlockList>,
    handles: Mutex<HandleSet>,
    /// No local modification is waiting for upload.
    synced: AtomicBool,
    /// Size of the last committed version.
    size_on_storage: AtomicU64,
    /// Version tag of the last committed version.
    etag: Mutex<Option<String>>,
    writers: Mutex<Writers>,
    writers_changed: Condvar,
    /// The last flush committed a file of at most one block.
    single_block_persisted: AtomicBool,
}

impl File {
    /// Creates a file of `size` bytes made of committed blocks.
    pub fn new(id: FileId, path: impl Into<String>, size: Option<u64>, block_size: u64) -> Self {
        let raw_size = size.map_or(UNKNOWN_SIZE, |s| i64::try_from(s).unwrap_or(i64::MAX));
        let meta = Arc::new(FileMeta::new(id, path.into(), raw_size));
        let mut blocks = BlockList::new();
        if let Some(size) = size {
            blocks.extend_to(&meta, size.div_ceil(block_size), BlockState::Committed);
        }
        Self {
            meta,
            block_size,
            blocks: RwLock::new(blocks),
            handles: Mutex::new(HandleSet::default()),
            synced: AtomicBool::new(true),
            size_on_storage: AtomicU64::new(size.unwrap_or(0)),
            etag: Mutex::new(None),
            writers: Mutex::new(Writers::default()),
            writers_changed: Condvar::new(),
            single_block_persisted: AtomicBool::new(false),
        }
    }

    /// Returns the file id.
    pub fn id(&self) -> FileId {
        self.meta.id()
    }

    /// Returns the remote path.
    pub fn path(&self) -> &str {
        self.meta.path()
    }

    /// Returns the shared metadata.
    pub fn meta(&self) -> &Arc<FileMeta> {
        &self.meta
    }

    /// Returns the size in bytes, 0 if unknown.
    pub fn size(&self) -> u64 {
        self.meta.known_size().unwrap_or(0)
    }

    /// Returns the block size.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Grows the file to `size` bytes; never shrinks it.
    ///
    /// Blocks covering the new range are appended as committed.
    pub fn update_size(&self, size: u64) -> bool {
        let mut blocks = self.blocks.write();
        if !self.meta.raise_size(size) {
            return false;
        }
        blocks.extend_to(&self.meta, size.div_ceil(self.block_size), BlockState::Committed);
        debug!(path = self.path(), size, blocks = blocks.len(), "file grew");
        true
    }

    /// Appends a local block. The size grows only as bytes are written.
    pub fn append_local_block(&self) -> Arc<Block> {
        self.blocks.write().push(&self.meta, BlockState::Local)
    }

    /// Appends local blocks until block `index` exists and returns it.
    fn local_block_at(&self, index: BlockIndex) -> Option<Arc<Block>> {
        if let Some(block) = self.block(index) {
            return Some(block);
        }
        let mut blocks = self.blocks.write();
        blocks.extend_to(&self.meta, index.as_u64() + 1, BlockState::Local);
        blocks.get(index).cloned()
    }

    /// Returns block `index`.
    pub fn block(&self, index: BlockIndex) -> Option<Arc<Block>> {
        self.blocks.read().get(index).cloned()
    }

    /// Returns block number `index`.
    pub fn block_at(&self, index: u64) -> Option<Arc<Block>> {
        self.block(BlockIndex::new(index))
    }

    /// Returns the number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// Returns a snapshot of the block list.
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.blocks.read().iter().cloned().collect()
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Registers a handle. Fails once the last handle was closed.
    pub(crate) fn add_handle(&self, handle: HandleId) -> bool {
        let mut handles = self.handles.lock();
        if handles.closed {
            return false;
        }
        handles.open.insert(handle);
        true
    }

    /// Unregisters a handle and returns true if it was the last one.
    pub(crate) fn remove_handle(&self, handle: HandleId) -> bool {
        let mut handles = self.handles.lock();
        if !handles.open.remove(&handle) || !handles.open.is_empty() {
            return false;
        }
        handles.closed = true;
        true
    }

    /// Returns the number of open handles.
    pub fn handle_count(&self) -> usize {
        self.handles.lock().open.len()
    }

    /// Returns true once the last handle was closed.
    pub fn is_closed(&self) -> bool {
        self.handles.lock().closed
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Returns the number of asynchronous downloads in flight.
    pub fn num_pending_reads(&self) -> usize {
        self.meta.pending_reads()
    }

    /// Blocks until no asynchronous download is in flight.
    pub fn wait_pending_reads(&self) {
        self.meta.wait_pending_reads();
    }

    /// Returns the latest transfer failure.
    pub fn last_error(&self) -> Option<TransferFailure> {
        self.meta.last_error()
    }

    /// Returns true if no local change awaits upload.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Returns the size of the last committed version.
    pub fn size_on_storage(&self) -> u64 {
        self.size_on_storage.load(Ordering::Acquire)
    }

    /// Returns the version tag of the last committed version.
    pub fn etag(&self) -> Option<String> {
        self.etag.lock().clone()
    }

    /// Records the version tag the remote store reported.
    pub fn set_etag(&self, etag: Option<String>) {
        *self.etag.lock() = etag;
    }

    /// Returns true if the last flush committed a file of at most one block.
    pub fn is_single_block_persisted(&self) -> bool {
        self.single_block_persisted.load(Ordering::Acquire)
    }

    /// Returns the number of writes in progress.
    pub fn pending_writers(&self) -> usize {
        self.writers.lock().active
    }

    /// Registers a write, waiting out a flush in progress.
    fn begin_write(&self) -> PendingWrite<'_> {
        let mut writers = self.writers.lock();
        while writers.flushing {
            self.writers_changed.wait(&mut writers);
        }
        writers.active += 1;
        PendingWrite { file: self }
    }

    /// Holds off new writes and waits for those in progress.
    fn hold_writers(&self) -> FlushGuard<'_> {
        let mut writers = self.writers.lock();
        while writers.flushing {
            self.writers_changed.wait(&mut writers);
        }
        writers.flushing = true;
        while writers.active > 0 {
            self.writers_changed.wait(&mut writers);
        }
        FlushGuard { file: self }
    }

    // =========================================================================
    // Data path
    // =========================================================================

    /// Reads up to `buf.len()` bytes at `offset`.
    ///
    /// Each block is fetched synchronously through `table` and released as
    /// soon as its bytes are copied.
    pub fn read(
        &self,
        table: &BufferTableManager,
        offset: u64,
        buf: &mut [u8],
    ) -> CacheResult<ReadOutcome> {
        let size = self.size();
        let requested_end = offset.saturating_add(buf.len() as u64);
        if offset >= size {
            return Ok(ReadOutcome {
                bytes_read: 0,
                eof: true,
            });
        }

        let end = requested_end.min(size);
        let mut pos = offset;
        let mut filled = 0usize;
        let mut short = false;

        while pos < end {
            let index = BlockIndex::containing(pos, self.block_size);
            let block = self
                .block(index)
                .ok_or_else(|| CacheError::block_not_found(self.path(), index.as_u64()))?;
            let in_block = pos - index.start_offset(self.block_size);
            let want = (self.block_size - in_block).min(end - pos) as usize;

            let lookup = table.get_or_create(&block, want as u64, true, true)?;
            let Some(pin) = lookup.pin else {
                debug!(path = self.path(), block = index.as_u64(), "block is staged, flushing before read");
                self.flush(table)?;
                continue;
            };
            let copied = pin.read_at(in_block as usize, &mut buf[filled..filled + want]);
            drop(pin);

            filled += copied;
            pos += copied as u64;
            if copied < want {
                short = true;
                break;
            }
        }

        Ok(ReadOutcome {
            bytes_read: filled,
            eof: short || requested_end > size,
        })
    }

    /// Writes `data` at `offset` into cached buffers, growing the file with
    /// local blocks as needed. The bytes stay dirty until flushed.
    pub fn write(&self, table: &BufferTableManager, offset: u64, data: &[u8]) -> CacheResult<usize> {
        let mut written = 0usize;
        let mut pos = offset;

        while written < data.len() {
            let pending = self.begin_write();
            let index = BlockIndex::containing(pos, self.block_size);
            let block = self
                .local_block_at(index)
                .ok_or_else(|| CacheError::block_not_found(self.path(), index.as_u64()))?;
            let in_block = (pos - index.start_offset(self.block_size)) as usize;

            // Writes do not count toward consumption; dirty bytes must not be retired.
            let lookup = table.get_or_create(&block, 0, true, true)?;
            let Some(pin) = lookup.pin else {
                debug!(path = self.path(), block = index.as_u64(), "block is staged, flushing before write");
                // A flush waits for every pending write, this one included.
                drop(pending);
                self.flush(table)?;
                continue;
            };
            let count = pin.write_at(in_block, &data[written..]);
            self.synced.store(false, Ordering::Release);
            if pin.is_evicted() {
                debug!(path = self.path(), block = index.as_u64(), "buffer retired under write, retrying");
                continue;
            }
            drop(pin);
            drop(pending);

            written += count;
            pos += count as u64;
            self.meta.raise_size(pos);
        }
        Ok(written)
    }

    /// Uploads dirty buffers and commits every staged block.
    ///
    /// New writes wait until the flush is over, and the flush waits for the
    /// writes already in progress. Returns the number of blocks committed.
    pub fn flush(&self, table: &BufferTableManager) -> CacheResult<usize> {
        let _held = self.hold_writers();
        table.flush_file(self)?;

        let blocks = self.blocks();
        let staged: Vec<&Arc<Block>> = blocks
            .iter()
            .filter(|block| block.state() == BlockState::Uncommitted)
            .collect();
        if !staged.is_empty() {
            let ids: Vec<String> = staged.iter().map(|block| block.id()).collect();
            table.store().commit_blocks(self.path(), &ids)?;
            for block in &staged {
                block.set_state(BlockState::Committed);
            }
            info!(path = self.path(), blocks = staged.len(), "committed staged blocks");

            match table.store().etag(self.path()) {
                Ok(etag) => self.set_etag(etag),
                Err(err) => warn!(path = self.path(), %err, "no version tag after commit"),
            }
        }
        self.size_on_storage.store(self.size(), Ordering::Release);
        self.single_block_persisted
            .store(blocks.len() <= 1, Ordering::Release);
        self.synced.store(true, Ordering::Release);
        Ok(staged.len())
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("meta", &self.meta)
            .field("blocks", &self.block_count())
            .field("handles", &self.handle_count())
            .field("synced", &self.is_synced())
            .field("size_on_storage", &self.size_on_storage())
            .field("etag", &self.etag())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::test_util::{small_config, TEST_BLOCK_SIZE};
    use crate::remote::{MemoryStore, RemoteStore};
    use crate::stats::CacheStats;

    fn file(size: Option<u64>) -> File {
        File::new(FileId::new(1), "f", size, 64)
    }

    #[test]
    fn test_blocks_cover_size() {
        assert_eq!(file(Some(0)).block_count(), 0);
        assert_eq!(file(Some(64)).block_count(), 1);
        assert_eq!(file(Some(65)).block_count(), 2);
        assert_eq!(file(None).block_count(), 0);
        assert_eq!(file(None).meta().size(), -1);
    }

    #[test]
    fn test_update_size_takes_max() {
        let f = file(Some(100));
        assert!(f.update_size(300));
        assert_eq!(f.block_count(), 5);
        assert!(!f.update_size(200));
        assert_eq!(f.size(), 300);
        assert_eq!(f.block_count(), 5);
        assert_eq!(f.block_at(4).unwrap().state(), BlockState::Committed);
    }

    #[test]
    fn test_concurrent_update_size() {
        let f = Arc::new(file(Some(0)));
        let threads: Vec<_> = (1..=8u64)
            .map(|i| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || f.update_size(i * 100))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(f.size(), 800);
        assert_eq!(f.block_count(), 13);
    }

    #[test]
    fn test_handle_lifecycle() {
        let f = file(Some(10));
        assert!(f.add_handle(HandleId::new(1)));
        assert!(f.add_handle(HandleId::new(2)));
        assert!(!f.remove_handle(HandleId::new(1)));
        assert!(f.remove_handle(HandleId::new(2)));
        assert!(f.is_closed());
        assert!(!f.remove_handle(HandleId::new(2)));
        assert!(!f.add_handle(HandleId::new(3)));
    }

    #[test]
    fn test_append_local_block() {
        let f = file(Some(10));
        let block = f.append_local_block();
        assert_eq!(block.index(), BlockIndex::new(1));
        assert_eq!(block.state(), BlockState::Local);
        assert_eq!(f.size(), 10);
    }

    #[test]
    fn test_pending_reads_drain() {
        let f = Arc::new(file(Some(10)));
        f.meta().begin_pending_read();
        assert_eq!(f.num_pending_reads(), 1);

        let waiter = {
            let f = Arc::clone(&f);
            std::thread::spawn(move || f.wait_pending_reads())
        };
        f.meta().end_pending_read();
        waiter.join().unwrap();
        assert_eq!(f.num_pending_reads(), 0);
    }

    fn table_over(store: &Arc<MemoryStore>) -> Arc<BufferTableManager> {
        BufferTableManager::new(&small_config(4), store.clone(), Arc::new(CacheStats::new())).unwrap()
    }

    #[test]
    fn test_flush_waits_for_pending_writes() {
        let store = Arc::new(MemoryStore::new());
        store.insert_pattern("w", TEST_BLOCK_SIZE);
        let table = table_over(&store);
        let f = Arc::new(File::new(FileId::new(1), "w", Some(TEST_BLOCK_SIZE), TEST_BLOCK_SIZE));
        f.write(&table, 0, b"abc").unwrap();

        let pending = f.begin_write();
        assert_eq!(f.pending_writers(), 1);
        let flusher = {
            let f = Arc::clone(&f);
            let table = Arc::clone(&table);
            std::thread::spawn(move || f.flush(&table))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!flusher.is_finished());
        assert_eq!(store.object("w").unwrap()[0], 0);

        drop(pending);
        assert_eq!(flusher.join().unwrap().unwrap(), 1);
        assert_eq!(&store.object("w").unwrap()[..3], b"abc");
        assert_eq!(f.pending_writers(), 0);
    }

    #[test]
    fn test_flush_records_committed_version() {
        let store = Arc::new(MemoryStore::new());
        store.insert_pattern("v", 10);
        let table = table_over(&store);
        let f = File::new(FileId::new(1), "v", Some(10), TEST_BLOCK_SIZE);
        assert_eq!(f.size_on_storage(), 10);
        assert_eq!(f.etag(), None);

        f.write(&table, 10, b"more").unwrap();
        assert_eq!(f.size(), 14);
        assert_eq!(f.size_on_storage(), 10);

        assert_eq!(f.flush(&table).unwrap(), 1);
        assert_eq!(f.size_on_storage(), 14);
        assert_eq!(f.etag(), store.etag("v").unwrap());
        assert!(f.etag().is_some());
        assert!(f.is_single_block_persisted());

        f.write(&table, TEST_BLOCK_SIZE, b"x").unwrap();
        f.flush(&table).unwrap();
        assert!(!f.is_single_block_persisted());
        assert_eq!(f.size_on_storage(), TEST_BLOCK_SIZE + 1);
    }
}
