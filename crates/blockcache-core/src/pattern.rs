//! Access pattern detection for read-ahead.
//!
//! Each handle classifies its stream of read offsets with a saturating
//! streak counter. Reads landing within a small window of the previous one
//! push the streak up, others push it down, and a step against the current
//! direction first drops the streak to zero so the detector unlearns fast.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use blockcache_common::constants::{SEQUENTIAL_WINDOW_BLOCKS, STREAK_LIMIT};

/// Classification of a handle's recent reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    /// Reads follow each other; prefetch ahead.
    Sequential,
    /// Reads jump around; do not prefetch.
    Random,
    /// Not enough evidence either way.
    Unknown,
}

/// Per-handle streak tracker.
#[derive(Debug)]
pub struct PatternDetector {
    block_size: u64,
    prev_offset: AtomicU64,
    /// In `[-STREAK_LIMIT, STREAK_LIMIT]`, starting optimistic.
    streak: AtomicI32,
    /// First block index not yet scheduled for read-ahead.
    next_read_ahead: AtomicU64,
}

impl PatternDetector {
    /// Creates a detector that assumes sequential access until shown otherwise.
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            prev_offset: AtomicU64::new(0),
            streak: AtomicI32::new(STREAK_LIMIT),
            next_read_ahead: AtomicU64::new(0),
        }
    }

    /// Records a read at `offset` and classifies the stream so far.
    pub fn classify(&self, offset: u64) -> AccessPattern {
        let prev = self.prev_offset.swap(offset, Ordering::AcqRel);
        let sequential = offset.abs_diff(prev) <= SEQUENTIAL_WINDOW_BLOCKS * self.block_size;

        let streak = match self
            .streak
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(step(s, sequential)))
        {
            Ok(previous) | Err(previous) => step(previous, sequential),
        };

        if streak >= STREAK_LIMIT {
            AccessPattern::Sequential
        } else if streak <= -STREAK_LIMIT {
            AccessPattern::Random
        } else {
            AccessPattern::Unknown
        }
    }

    /// Returns the current streak.
    pub fn streak(&self) -> i32 {
        self.streak.load(Ordering::Acquire)
    }

    /// Returns the first block index not yet scheduled for read-ahead.
    pub fn next_read_ahead(&self) -> u64 {
        self.next_read_ahead.load(Ordering::Acquire)
    }

    /// Records that read-ahead scheduled everything before `index`.
    pub fn set_next_read_ahead(&self, index: u64) {
        self.next_read_ahead.fetch_max(index, Ordering::AcqRel);
    }
}

fn step(streak: i32, sequential: bool) -> i32 {
    let delta = if sequential { 1 } else { -1 };
    let base = if streak.signum() == -delta { 0 } else { streak };
    (base + delta).clamp(-STREAK_LIMIT, STREAK_LIMIT)
}
