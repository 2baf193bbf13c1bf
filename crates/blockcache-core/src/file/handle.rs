//! Open file handles and read-ahead.

use std::fmt;
use std::sync::Arc;

use blockcache_common::error::CacheResult;
use blockcache_common::types::BlockIndex;
use tracing::{debug, warn};

use super::file::{File, ReadOutcome};
use super::registry::FileRegistry;
use crate::buffer::{BufferStatus, BufferTableManager};
use crate::pattern::{AccessPattern, PatternDetector};

/// Identifier of one open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// Creates a handle id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Read-ahead settings applied to every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAhead {
    /// Blocks to prefetch past the current one.
    pub blocks: u32,
    /// Master switch.
    pub enabled: bool,
}

/// An open file handle.
///
/// Closing happens on drop; the last handle of a file releases its buffers.
pub struct FileHandle {
    id: HandleId,
    file: Arc<File>,
    table: Arc<BufferTableManager>,
    registry: Arc<FileRegistry>,
    detector: PatternDetector,
    read_ahead: ReadAhead,
}

impl FileHandle {
    pub(crate) fn new(
        id: HandleId,
        file: Arc<File>,
        table: Arc<BufferTableManager>,
        registry: Arc<FileRegistry>,
        read_ahead: ReadAhead,
    ) -> Self {
        let detector = PatternDetector::new(file.block_size());
        Self {
            id,
            file,
            table,
            registry,
            detector,
            read_ahead,
        }
    }

    /// Returns the handle id.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Returns the open file.
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Returns the handle's pattern detector.
    pub fn detector(&self) -> &PatternDetector {
        &self.detector
    }

    /// Reads up to `buf.len()` bytes at `offset`, prefetching ahead of
    /// sequential streams.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> CacheResult<ReadOutcome> {
        let pattern = if self.read_ahead.enabled && self.read_ahead.blocks > 0 {
            self.detector.classify(offset)
        } else {
            AccessPattern::Unknown
        };

        let outcome = self.file.read(&self.table, offset, buf)?;

        if pattern == AccessPattern::Sequential && !outcome.eof {
            self.schedule_read_ahead(offset);
        }
        Ok(outcome)
    }

    /// Writes `data` at `offset`. The bytes stay dirty until flushed.
    pub fn write(&self, offset: u64, data: &[u8]) -> CacheResult<usize> {
        self.file.write(&self.table, offset, data)
    }

    /// Uploads dirty bytes and commits them.
    pub fn flush(&self) -> CacheResult<usize> {
        self.file.flush(&self.table)
    }

    /// Issues asynchronous fetches for the blocks following `offset`.
    fn schedule_read_ahead(&self, offset: u64) {
        let block_size = self.file.block_size();
        let current = BlockIndex::containing(offset, block_size).as_u64();
        let window_end = current + 1 + u64::from(self.read_ahead.blocks);
        let mut next = self.detector.next_read_ahead().max(current + 1);
        let stats = self.table.stats();

        while next < window_end {
            let Some(block) = self.file.block_at(next) else {
                break;
            };
            match self.table.get_or_create(&block, 0, true, false) {
                Ok(lookup) if lookup.status == BufferStatus::Exists => stats.record_prefetch_skipped(),
                Ok(lookup) if lookup.status == BufferStatus::NeedsFlush => {}
                Ok(_) => stats.record_prefetch_scheduled(),
                Err(err) => {
                    warn!(path = self.file.path(), block = next, %err, "read-ahead stopped");
                    break;
                }
            }
            next += 1;
        }

        debug!(handle = %self.id, from = current + 1, to = next, "read-ahead scheduled");
        self.detector.set_next_read_ahead(next);
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.registry.close(self.id, &self.file);
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("path", &self.file.path())
            .field("read_ahead", &self.read_ahead)
            .finish()
    }
}
