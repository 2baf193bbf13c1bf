//! Raw block memory.
//!
//! The pool owns every byte buffer the cache uses. Buffers are allocated on
//! first demand up to the configured capacity and recycled afterwards, never
//! freed while the pool lives.

use std::sync::atomic::{AtomicUsize, Ordering};

use blockcache_common::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Fixed-capacity set of block-sized byte buffers.
pub struct BufferPool {
    /// Canonical length of every buffer.
    block_size: usize,
    /// Maximum number of buffers issued at once.
    capacity: usize,
    /// Returned buffers waiting for reuse.
    idle: Mutex<Vec<Vec<u8>>>,
    /// Buffers currently handed out.
    issued: AtomicUsize,
    /// High-water mark of `issued`.
    peak: AtomicUsize,
}

impl BufferPool {
    /// Creates a pool of `capacity` buffers of `block_size` bytes each.
    pub fn new(block_size: usize, capacity: usize) -> Self {
        debug!(block_size, capacity, "creating buffer pool");
        Self {
            block_size,
            capacity,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            issued: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Hands out a buffer of exactly `block_size` bytes.
    ///
    /// Returns [`CacheError::BuffersExhausted`] instead of blocking once the
    /// capacity is reached.
    pub fn acquire(&self) -> CacheResult<Vec<u8>> {
        let mut idle = self.idle.lock();
        let issued = self.issued.load(Ordering::Acquire);
        if issued >= self.capacity {
            warn!(issued, capacity = self.capacity, "buffer pool exhausted");
            return Err(CacheError::BuffersExhausted {
                issued,
                capacity: self.capacity,
            });
        }

        let buffer = idle
            .pop()
            .unwrap_or_else(|| vec![0u8; self.block_size]);
        let issued = self.issued.fetch_add(1, Ordering::AcqRel) + 1;
        drop(idle);

        let previous_peak = self.peak.fetch_max(issued, Ordering::AcqRel);
        if issued > previous_peak {
            debug!(
                issued,
                capacity = self.capacity,
                "buffer pool reached a new peak"
            );
        }
        Ok(buffer)
    }

    /// Returns a buffer to the pool.
    ///
    /// The buffer is brought back to the canonical length. Its contents are
    /// left as they are; descriptors zero their buffer when they are reset.
    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.resize(self.block_size, 0);
        let mut idle = self.idle.lock();
        idle.push(buffer);
        let previous = self.issued.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "buffer released to a pool with nothing issued");
    }

    /// Returns the canonical buffer length.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the maximum number of buffers issued at once.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of buffers currently handed out.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::Acquire)
    }

    /// Returns the highest number of buffers ever handed out at once.
    pub fn peak_issued(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Returns how many more buffers can be acquired.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.issued())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("issued", &self.issued())
            .field("peak", &self.peak_issued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    /// Counts warnings and errors.
    struct WarningCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarningCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let level = *event.metadata().level();
            if level == Level::WARN || level == Level::ERROR {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = BufferPool::new(4096, 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.len(), 4096);
        assert_eq!(b.len(), 4096);
        assert_eq!(pool.available(), 0);

        let err = pool.acquire().unwrap_err();
        assert!(matches!(
            err,
            CacheError::BuffersExhausted {
                issued: 2,
                capacity: 2
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_release_restores_length() {
        let pool = BufferPool::new(1024, 1);

        let mut buffer = pool.acquire().unwrap();
        buffer.truncate(100);
        pool.release(buffer);

        let buffer = pool.acquire().unwrap();
        assert_eq!(buffer.len(), 1024);
    }

    #[test]
    fn test_peak_tracking() {
        let pool = BufferPool::new(64, 4);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);
        let _d = pool.acquire().unwrap();

        assert_eq!(pool.issued(), 2);
        assert_eq!(pool.peak_issued(), 3);
        pool.release(c);
        assert_eq!(pool.issued(), 1);
    }

    #[test]
    fn test_filling_to_capacity_is_quiet() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarningCounter(Arc::clone(&warnings)));

        tracing::subscriber::with_default(subscriber, || {
            let pool = BufferPool::new(64, 16);
            let buffers: Vec<_> = (0..16).map(|_| pool.acquire().unwrap()).collect();
            assert_eq!(pool.peak_issued(), 16);
            assert_eq!(warnings.load(Ordering::Relaxed), 0);

            assert!(pool.acquire().is_err());
            drop(buffers);
        });
        assert_eq!(warnings.load(Ordering::Relaxed), 1);
    }
}
