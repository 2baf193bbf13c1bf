//! Free list and clock victim selection.
//!
//! Descriptors live in a fixed arena and are addressed by [`BufferIndex`].
//! Free slots are threaded into a singly linked chain by index; a separate
//! clock hand sweeps the whole arena when the chain is empty.
//!
//! Victim selection is second chance: an unreferenced slot is taken if it
//! already got one grace lap or if readers consumed all of it, otherwise it
//! gets a grace lap and the hand moves on. The scan has no upper bound. It
//! relies on the number of pinned slots staying below the arena size, which
//! holds as long as concurrent operations are fewer than the slots.

use std::sync::Arc;
use std::thread;

use blockcache_common::error::{CacheError, CacheResult};
use blockcache_common::types::BufferIndex;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::descriptor::BufferDescriptor;
use super::pin::BufferPin;
use super::pool::BufferPool;
use crate::file::Block;

/// Chain and clock state, guarded by one mutex.
struct FreeListState {
    /// Head of the free chain.
    first: Option<usize>,
    /// Tail of the free chain.
    last: Option<usize>,
    /// Free-chain links.
    next: Vec<Option<usize>>,
    /// Whether each slot is on the chain.
    on_list: Vec<bool>,
    /// Length of the chain.
    free: usize,
    /// Clock hand of the victim scan.
    hand: usize,
}

/// Arena of buffer descriptors with a free chain and a clock hand.
pub struct FreeList {
    descriptors: Vec<Arc<BufferDescriptor>>,
    state: Mutex<FreeListState>,
    pool: Arc<BufferPool>,
}

impl FreeList {
    /// Creates `count` descriptors, each owning one buffer from `pool`.
    pub fn new(pool: Arc<BufferPool>, count: usize) -> CacheResult<Self> {
        if count == 0 {
            return Err(CacheError::config("free list needs at least one buffer"));
        }

        let mut descriptors = Vec::with_capacity(count);
        for i in 0..count {
            let buffer = pool.acquire()?;
            descriptors.push(Arc::new(BufferDescriptor::new(BufferIndex::new(i), buffer)));
        }

        let next = (0..count)
            .map(|i| (i + 1 < count).then_some(i + 1))
            .collect();

        info!(count, block_size = pool.block_size(), "free list created");

        Ok(Self {
            descriptors,
            state: Mutex::new(FreeListState {
                first: Some(0),
                last: Some(count - 1),
                next,
                on_list: vec![true; count],
                free: count,
                hand: 0,
            }),
            pool,
        })
    }

    /// Pops the head of the free chain and binds it to `block`.
    ///
    /// The returned pin is the creator's reference.
    pub fn allocate(self: &Arc<Self>, block: Arc<Block>) -> CacheResult<BufferPin> {
        let mut state = self.state.lock();
        let Some(index) = state.first else {
            return Err(CacheError::FreeListFull);
        };

        state.first = state.next[index].take();
        if state.first.is_none() {
            state.last = None;
        }
        state.on_list[index] = false;
        state.free -= 1;

        let descriptor = Arc::clone(&self.descriptors[index]);
        descriptor.bind(block);
        drop(state);

        debug!(buffer = index, "allocated from free list");
        Ok(BufferPin::adopt(descriptor, Arc::clone(self)))
    }

    /// Resets `descriptor` and appends it to the tail of the free chain.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already free or still mapped in the directory.
    pub fn release(&self, descriptor: &BufferDescriptor) {
        let index = descriptor.index().index();
        if descriptor.is_in_directory() {
            error!(buffer = index, "releasing a buffer still in the directory");
            panic!("buffer {index} released while still in the directory");
        }

        // Zeroed before taking the chain lock.
        descriptor.reset();

        let mut state = self.state.lock();
        if state.on_list[index] {
            error!(buffer = index, "buffer released to the free list twice");
            panic!("buffer {index} is already on the free list");
        }
        match state.last {
            Some(last) => state.next[last] = Some(index),
            None => state.first = Some(index),
        }
        state.last = Some(index);
        state.on_list[index] = true;
        state.free += 1;
        drop(state);

        debug!(buffer = index, "released to free list");
    }

    /// Drops one reference on `descriptor`, recycling it at the sentinel.
    ///
    /// Returns true if the slot went back to the free list.
    pub(crate) fn unpin(&self, descriptor: &BufferDescriptor) -> bool {
        if descriptor.release() {
            self.release(descriptor);
            true
        } else {
            false
        }
    }

    /// Finds an eviction victim with the clock algorithm and pins it.
    ///
    /// Returns `None` if the free chain became non-empty during the scan, in
    /// which case the caller should allocate instead.
    pub fn victim(self: &Arc<Self>) -> Option<BufferPin> {
        let len = self.descriptors.len();
        let mut scanned = 0usize;

        loop {
            {
                let mut state = self.state.lock();
                if state.first.is_some() {
                    return None;
                }

                let index = state.hand;
                state.hand = (state.hand + 1) % len;
                let descriptor = &self.descriptors[index];

                if descriptor.ref_count() == 0 && descriptor.is_in_directory() {
                    if descriptor.grace_count() > 0 || descriptor.is_fully_consumed() {
                        if descriptor.try_pin_unreferenced() {
                            debug!(buffer = index, "victim selected");
                            return Some(BufferPin::adopt(
                                Arc::clone(descriptor),
                                Arc::clone(self),
                            ));
                        }
                    } else {
                        descriptor.grant_grace();
                    }
                }
            }

            scanned += 1;
            if scanned % len == 0 {
                thread::yield_now();
            }
        }
    }

    /// Returns the descriptor in slot `index`.
    pub fn descriptor(&self, index: BufferIndex) -> &Arc<BufferDescriptor> {
        &self.descriptors[index.index()]
    }

    /// Iterates over every descriptor in the arena.
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<BufferDescriptor>> {
        self.descriptors.iter()
    }

    /// Returns the number of descriptors.
    pub fn capacity(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns the length of the free chain.
    pub fn free_count(&self) -> usize {
        self.state.lock().free
    }

    /// Returns the block size of the underlying buffers.
    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Checks that every descriptor is back on the free chain.
    ///
    /// # Panics
    ///
    /// Panics listing the slots that are still in use.
    pub fn assert_all_free(&self) {
        let state = self.state.lock();
        if state.free == self.descriptors.len() {
            return;
        }
        let busy: Vec<usize> = state
            .on_list
            .iter()
            .enumerate()
            .filter_map(|(i, &free)| (!free).then_some(i))
            .collect();
        error!(?busy, "free list is not full");
        panic!(
            "free list holds {} of {} buffers, busy: {busy:?}",
            state.free,
            self.descriptors.len()
        );
    }

    /// Gives every buffer back to the pool. The arena is unusable afterwards.
    pub(crate) fn return_buffers(&self) {
        for descriptor in &self.descriptors {
            let buffer = descriptor.take_buffer();
            if !buffer.is_empty() {
                self.pool.release(buffer);
            }
        }
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList")
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .finish()
    }
}
