//! Core identifier types for blockcache.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing a block index from being used where a buffer slot is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// File identifier - distinguishes every `File` opened during a mount.
///
/// Identifiers are never reused, so a block key of a closed file can never
/// alias a block of a file opened later under the same path.
///
/// # Example
///
/// ```rust
/// use blockcache_common::types::FileId;
///
/// let file = FileId::new(42);
/// assert_eq!(file.as_u64(), 42);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FileId(u64);

impl FileId {
    /// Creates a new `FileId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a block within its file.
///
/// Block `i` covers the byte range `[i * block_size, (i + 1) * block_size)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockIndex(u64);

impl BlockIndex {
    /// Creates a new `BlockIndex`.
    #[inline]
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the index of the block containing `offset`.
    #[inline]
    #[must_use]
    pub const fn containing(offset: u64, block_size: u64) -> Self {
        Self(offset / block_size)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the index as a `usize` for block list addressing.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns the following block index.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the first byte offset covered by this block.
    #[inline]
    #[must_use]
    pub const fn start_offset(self, block_size: u64) -> u64 {
        self.0 * block_size
    }
}

impl fmt::Debug for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockIndex({})", self.0)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockIndex {
    #[inline]
    fn from(index: u64) -> Self {
        Self::new(index)
    }
}

/// Buffer slot identifier - index into the descriptor arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferIndex(pub usize);

impl BufferIndex {
    /// Creates a new buffer index.
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for BufferIndex {
    fn from(index: usize) -> Self {
        Self::new(index)
    }
}

/// Identity of one cached block: the directory key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    /// File the block belongs to.
    pub file: FileId,
    /// Position of the block inside the file.
    pub index: BlockIndex,
}

impl BlockKey {
    /// Creates a new block key.
    #[inline]
    #[must_use]
    pub const fn new(file: FileId, index: BlockIndex) -> Self {
        Self { file, index }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_index_containing() {
        let block_size = 1024 * 1024;
        assert_eq!(BlockIndex::containing(0, block_size), BlockIndex::new(0));
        assert_eq!(BlockIndex::containing(block_size - 1, block_size), BlockIndex::new(0));
        assert_eq!(BlockIndex::containing(block_size, block_size), BlockIndex::new(1));
        assert_eq!(BlockIndex::new(3).start_offset(block_size), 3 * block_size);
    }

    #[test]
    fn test_block_index_next() {
        assert_eq!(BlockIndex::new(9).next(), BlockIndex::new(10));
        assert_eq!(BlockIndex::new(u64::MAX).next(), BlockIndex::new(u64::MAX));
    }

    #[test]
    fn test_block_key_identity() {
        let a = BlockKey::new(FileId::new(1), BlockIndex::new(2));
        let b = BlockKey::new(FileId::new(1), BlockIndex::new(2));
        let c = BlockKey::new(FileId::new(2), BlockIndex::new(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "1:2");
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", FileId::new(5)), "FileId(5)");
        assert_eq!(format!("{:?}", BlockIndex::new(5)), "BlockIndex(5)");
    }
}
