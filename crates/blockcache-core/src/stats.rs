//! Cache statistics for monitoring and debugging.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every component of one block cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Directory lookups.
    lookups: AtomicU64,
    /// Lookups served by a resident descriptor.
    hits: AtomicU64,
    /// Lookups that had to bind a descriptor.
    misses: AtomicU64,
    /// Descriptors taken from the free list.
    allocations: AtomicU64,
    /// Descriptors reclaimed through victim selection.
    evictions: AtomicU64,
    /// Victims abandoned because someone else touched them.
    eviction_retries: AtomicU64,
    /// Descriptors removed after being fully consumed.
    consumed_removals: AtomicU64,
    /// Completed downloads.
    downloads: AtomicU64,
    /// Failed downloads.
    download_failures: AtomicU64,
    /// Completed uploads.
    uploads: AtomicU64,
    /// Read-ahead fetches scheduled.
    prefetches_scheduled: AtomicU64,
    /// Read-ahead fetches skipped because the block was resident.
    prefetches_skipped: AtomicU64,
    /// Descriptors reclaimed by the idle monitor.
    idle_evictions: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident, $doc:literal) => {
        #[doc = concat!("Records ", $doc, ".")]
        #[inline]
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[doc = concat!("Returns the number of ", $doc, ".")]
        #[inline]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl CacheStats {
    /// Creates new statistics.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_lookup, lookups, lookups, "directory lookups");
    counter!(record_hit, hits, hits, "directory hits");
    counter!(record_miss, misses, misses, "directory misses");
    counter!(record_allocation, allocations, allocations, "free-list allocations");
    counter!(record_eviction, evictions, evictions, "victim evictions");
    counter!(record_eviction_retry, eviction_retries, eviction_retries, "abandoned victims");
    counter!(record_consumed_removal, consumed_removals, consumed_removals, "removals after full consumption");
    counter!(record_download, downloads, downloads, "completed downloads");
    counter!(record_download_failure, download_failures, download_failures, "failed downloads");
    counter!(record_upload, uploads, uploads, "completed uploads");
    counter!(record_prefetch_scheduled, prefetches_scheduled, prefetches_scheduled, "scheduled read-ahead fetches");
    counter!(record_prefetch_skipped, prefetches_skipped, prefetches_skipped, "skipped read-ahead fetches");
    counter!(record_idle_eviction, idle_evictions, idle_evictions, "idle evictions");

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            lookups: self.lookups(),
            hits: self.hits(),
            misses: self.misses(),
            allocations: self.allocations(),
            evictions: self.evictions(),
            eviction_retries: self.eviction_retries(),
            consumed_removals: self.consumed_removals(),
            downloads: self.downloads(),
            download_failures: self.download_failures(),
            uploads: self.uploads(),
            prefetches_scheduled: self.prefetches_scheduled(),
            prefetches_skipped: self.prefetches_skipped(),
            idle_evictions: self.idle_evictions(),
        }
    }
}

/// Immutable copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CacheStatsSnapshot {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub allocations: u64,
    pub evictions: u64,
    pub eviction_retries: u64,
    pub consumed_removals: u64,
    pub downloads: u64,
    pub download_failures: u64,
    pub uploads: u64,
    pub prefetches_scheduled: u64,
    pub prefetches_skipped: u64,
    pub idle_evictions: u64,
}

impl CacheStatsSnapshot {
    /// Returns the hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

impl fmt::Display for CacheStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ lookups: {}, hits: {}, hit_ratio: {:.2}%, downloads: {}, failures: {}, evictions: {}, consumed: {}, prefetched: {}, idle: {} }}",
            self.lookups,
            self.hits,
            self.hit_ratio() * 100.0,
            self.downloads,
            self.download_failures,
            self.evictions,
            self.consumed_removals,
            self.prefetches_scheduled,
            self.idle_evictions
        )
    }
}
