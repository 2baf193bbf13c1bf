//! Buffer descriptor - the per-slot state of one cached block.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blockcache_common::error::{CacheError, CacheResult, TransferFailure};
use blockcache_common::types::{BlockKey, BufferIndex};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::error;

use crate::file::Block;

/// Metadata and bytes of one buffer slot.
///
/// Reference counting follows one rule: the directory's hold on a mapped
/// descriptor is the implicit baseline `0`, every [`BufferPin`] adds one, and
/// removal from the directory subtracts one. A count of `-1` therefore means
/// "out of the directory and unreferenced", which is the only state in which
/// the slot may go back to the free list.
///
/// The content lock is split in two: a gate that stays closed while a
/// transfer fills the buffer, and an `RwLock` over the bytes themselves.
/// Readers wait for the gate before taking the shared byte lock, so they
/// never observe a half-filled buffer.
///
/// [`BufferPin`]: super::BufferPin
pub struct BufferDescriptor {
    /// Slot index in the descriptor arena.
    index: BufferIndex,
    /// Canonical buffer length.
    capacity: usize,
    /// Block held by this slot; `Some` exactly while the slot is in the directory.
    block: Mutex<Option<Arc<Block>>>,
    /// Active holders, see the type docs.
    ref_count: AtomicI32,
    /// Bytes delivered to readers since the slot was bound.
    bytes_consumed: AtomicU64,
    /// Second-chance laps granted by the victim scan.
    grace: AtomicU32,
    /// One-shot removal guard.
    evicted: AtomicBool,
    /// Buffer holds bytes not yet staged remotely.
    dirty: AtomicBool,
    /// Buffer holds the block's data.
    valid: AtomicBool,
    /// True while a transfer owns the buffer.
    in_flight: Mutex<bool>,
    /// Signalled when `in_flight` drops to false.
    ready: Condvar,
    /// Block bytes.
    data: RwLock<Vec<u8>>,
    /// Failure of the last transfer.
    last_error: Mutex<Option<TransferFailure>>,
    /// Reference point for `last_access`.
    epoch: Instant,
    /// Milliseconds since `epoch` of the last pin.
    last_access: AtomicU64,
}

impl BufferDescriptor {
    /// Creates an unbound descriptor owning `buffer`.
    pub fn new(index: BufferIndex, buffer: Vec<u8>) -> Self {
        Self {
            index,
            capacity: buffer.len(),
            block: Mutex::new(None),
            ref_count: AtomicI32::new(0),
            bytes_consumed: AtomicU64::new(0),
            grace: AtomicU32::new(0),
            evicted: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            in_flight: Mutex::new(false),
            ready: Condvar::new(),
            data: RwLock::new(buffer),
            last_error: Mutex::new(None),
            epoch: Instant::now(),
            last_access: AtomicU64::new(0),
        }
    }

    /// Returns the slot index.
    #[inline]
    pub fn index(&self) -> BufferIndex {
        self.index
    }

    /// Returns the canonical buffer length.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the block held by this slot.
    pub fn block(&self) -> Option<Arc<Block>> {
        self.block.lock().clone()
    }

    /// Returns the directory key of the held block.
    pub fn key(&self) -> Option<BlockKey> {
        self.block.lock().as_ref().map(|block| block.key())
    }

    /// Returns true while the slot is mapped in the directory.
    pub fn is_in_directory(&self) -> bool {
        self.block.lock().is_some()
    }

    /// Binds a free slot to `block` on behalf of its creator, pinning it once.
    pub(crate) fn bind(&self, block: Arc<Block>) {
        let mut slot = self.block.lock();
        assert!(
            slot.is_none(),
            "buffer {} bound while still holding a block",
            self.index
        );
        *slot = Some(block);
        self.ref_count.store(1, Ordering::Release);
        self.touch();
    }

    /// Detaches the block. Called once, when leaving the directory.
    pub(crate) fn take_block(&self) -> Option<Arc<Block>> {
        self.block.lock().take()
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// Returns the current reference count.
    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Adds one holder.
    pub(crate) fn acquire(&self) -> i32 {
        self.touch();
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Pins an unreferenced slot for eviction. Fails if anyone holds it.
    pub(crate) fn try_pin_unreferenced(&self) -> bool {
        self.ref_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drops one holder.
    ///
    /// Returns true when the count reaches `-1`; the caller must then hand the
    /// slot to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the count would fall below `-1`.
    pub(crate) fn release(&self) -> bool {
        let count = self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if count < -1 {
            error!(buffer = %self.index, ref_count = count, "reference count underflow");
            panic!("buffer {} reference count fell to {count}", self.index);
        }
        count == -1
    }

    // =========================================================================
    // Usage accounting
    // =========================================================================

    /// Adds `bytes` to the consumed total and returns the new total.
    pub(crate) fn add_consumed(&self, bytes: u64) -> u64 {
        self.bytes_consumed.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    /// Returns the bytes delivered since the slot was bound.
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed.load(Ordering::Acquire)
    }

    /// Returns true once readers have consumed a full block.
    pub fn is_fully_consumed(&self) -> bool {
        self.bytes_consumed() >= self.capacity as u64
    }

    /// Returns the number of grace laps granted.
    pub fn grace_count(&self) -> u32 {
        self.grace.load(Ordering::Acquire)
    }

    pub(crate) fn grant_grace(&self) {
        self.grace.fetch_add(1, Ordering::AcqRel);
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_access.store(elapsed, Ordering::Release);
    }

    /// Returns how long the slot has gone without a new holder.
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed();
        let last = Duration::from_millis(self.last_access.load(Ordering::Acquire));
        now.saturating_sub(last)
    }

    // =========================================================================
    // Flags
    // =========================================================================

    /// Claims the right to remove the slot from the directory.
    pub(crate) fn try_mark_evicted(&self) -> bool {
        self.evicted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims removal like [`try_mark_evicted`](Self::try_mark_evicted), but
    /// only while the buffer holds no unstaged bytes.
    ///
    /// Runs under the byte lock: a concurrent [`write_at`](Self::write_at)
    /// either dirties the buffer first and keeps the slot, or finds the slot
    /// evicted once it returns.
    pub(crate) fn try_mark_evicted_if_clean(&self) -> bool {
        let _data = self.data.read();
        !self.is_dirty() && self.try_mark_evicted()
    }

    /// Returns true once the slot was removed from the directory.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Returns true if the buffer holds unstaged bytes.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Returns true if the buffer holds the block's data.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn mark_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    /// Returns the failure of the last transfer.
    pub fn last_error(&self) -> Option<TransferFailure> {
        self.last_error.lock().clone()
    }

    pub(crate) fn set_error(&self, failure: TransferFailure) {
        *self.last_error.lock() = Some(failure);
    }

    // =========================================================================
    // Content gate
    // =========================================================================

    /// Closes the gate for a transfer.
    pub(crate) fn begin_transfer(&self) {
        let mut in_flight = self.in_flight.lock();
        assert!(!*in_flight, "buffer {} already has a transfer in flight", self.index);
        *in_flight = true;
    }

    /// Opens the gate and wakes every waiter.
    ///
    /// # Panics
    ///
    /// Panics if no transfer was in flight.
    pub(crate) fn finish_transfer(&self) {
        let mut in_flight = self.in_flight.lock();
        assert!(*in_flight, "buffer {} finished a transfer twice", self.index);
        *in_flight = false;
        self.ready.notify_all();
    }

    /// Returns true while a transfer owns the buffer.
    pub fn is_in_flight(&self) -> bool {
        *self.in_flight.lock()
    }

    /// Blocks until no transfer owns the buffer.
    pub fn wait_ready(&self) {
        let mut in_flight = self.in_flight.lock();
        while *in_flight {
            self.ready.wait(&mut in_flight);
        }
    }

    /// Blocks until the pending download completes and reports its outcome.
    ///
    /// # Panics
    ///
    /// Panics if the buffer ends up neither valid nor failed.
    pub fn ensure_valid_for_read(&self) -> CacheResult<()> {
        self.wait_ready();
        if self.is_valid() {
            return Ok(());
        }
        if let Some(failure) = self.last_error() {
            return Err(CacheError::Transfer(failure));
        }
        error!(buffer = %self.index, "buffer neither valid nor failed after transfer");
        panic!("buffer {} is neither valid nor failed", self.index);
    }

    // =========================================================================
    // Data
    // =========================================================================

    /// Locks the bytes for reading.
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Locks the bytes for writing.
    pub(crate) fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    /// Copies bytes starting at `offset` into `dst`, returning the count.
    ///
    /// Fewer bytes than requested are copied when the buffer was filled by a
    /// short read.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let data = self.data.read();
        if offset >= data.len() {
            return 0;
        }
        let count = dst.len().min(data.len() - offset);
        dst[..count].copy_from_slice(&data[offset..offset + count]);
        count
    }

    /// Copies `src` into the buffer at `offset` and marks it dirty.
    pub(crate) fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let mut data = self.data.write();
        if offset >= self.capacity {
            return 0;
        }
        let count = src.len().min(self.capacity - offset);
        if data.len() < offset + count {
            data.resize(offset + count, 0);
        }
        data[offset..offset + count].copy_from_slice(&src[..count]);
        self.dirty.store(true, Ordering::Release);
        count
    }

    /// Returns the slot to its pristine state and zeroes the buffer.
    ///
    /// Only valid while nobody references the slot.
    pub(crate) fn reset(&self) {
        *self.block.lock() = None;
        self.ref_count.store(0, Ordering::Release);
        self.clear();
    }

    /// Recycles an evicted slot for `block` without releasing its only pin.
    ///
    /// # Panics
    ///
    /// Panics unless the caller holds the only reference and the slot has
    /// already left the directory.
    pub(crate) fn rebind(&self, block: Arc<Block>) {
        let ref_count = self.ref_count();
        if ref_count != 1 {
            error!(buffer = %self.index, ref_count, "rebinding a shared buffer");
            panic!("buffer {} rebound with reference count {ref_count}", self.index);
        }
        self.clear();
        let mut slot = self.block.lock();
        assert!(slot.is_none(), "buffer {} rebound while in the directory", self.index);
        *slot = Some(block);
        drop(slot);
        self.touch();
    }

    fn clear(&self) {
        self.bytes_consumed.store(0, Ordering::Release);
        self.grace.store(0, Ordering::Release);
        self.evicted.store(false, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.valid.store(false, Ordering::Release);
        *self.in_flight.lock() = false;
        *self.last_error.lock() = None;

        let mut data = self.data.write();
        data.resize(self.capacity, 0);
        data.fill(0);
    }

    /// Takes the buffer out of the slot.
    pub(crate) fn take_buffer(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.write())
    }
}

impl std::fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("index", &self.index)
            .field("key", &self.key())
            .field("ref_count", &self.ref_count())
            .field("bytes_consumed", &self.bytes_consumed())
            .field("valid", &self.is_valid())
            .field("dirty", &self.is_dirty())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}
