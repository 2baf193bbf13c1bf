//! System-wide constants for blockcache.

// =============================================================================
// Size Constants
// =============================================================================

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Default block size in MiB (16 MiB).
///
/// Large blocks amortize the per-request latency of the object store.
pub const DEFAULT_BLOCK_SIZE_MB: u64 = 16;

/// Default memory budget for cached blocks in MiB.
pub const DEFAULT_MEM_SIZE_MB: u64 = 4192;

/// Length in bytes of the random part of a staged block id.
pub const BLOCK_ID_LENGTH: usize = 16;

// =============================================================================
// Read-ahead Constants
// =============================================================================

/// Default number of blocks to prefetch once a handle reads sequentially.
pub const DEFAULT_PREFETCH_BLOCKS: u32 = 5;

/// Distance, in blocks, within which consecutive reads count as sequential.
pub const SEQUENTIAL_WINDOW_BLOCKS: u64 = 2;

/// Saturation bound of the pattern detector streak.
pub const STREAK_LIMIT: i32 = 3;

// =============================================================================
// Worker Constants
// =============================================================================

/// Default number of transfer workers.
pub const DEFAULT_WORKERS: u32 = 128;

/// Task queue slots per worker when no explicit depth is configured.
pub const QUEUE_SLOTS_PER_WORKER: usize = 2;

// =============================================================================
// Monitor Constants
// =============================================================================

/// Default idle timeout before an unreferenced buffer is reclaimed (seconds).
pub const DEFAULT_MEM_TIMEOUT_SECS: u64 = 120;

/// Default tick of the idle eviction monitor (milliseconds).
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 1000;
