//! Remote object store contract.
//!
//! The cache never talks to a concrete backend; it reads byte ranges from,
//! and stages blocks into, whatever implements [`RemoteStore`].

mod local;
mod memory;

pub use local::LocalDirStore;
pub use memory::MemoryStore;

use std::io;

/// Backing store of cached files.
///
/// Implementations must be safe to call from many worker threads at once.
pub trait RemoteStore: Send + Sync {
    /// Returns the size of the object at `path`.
    fn size(&self, path: &str) -> io::Result<u64>;

    /// Fills `buf` with bytes of `path` starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at the end of
    /// the object.
    fn read_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Stages `data` as the block at `offset` of `path` under `id`.
    ///
    /// Staged blocks are invisible to readers until committed.
    fn stage_block(&self, path: &str, offset: u64, id: &str, data: &[u8]) -> io::Result<()>;

    /// Makes the staged blocks `ids` of `path` visible.
    fn commit_blocks(&self, path: &str, ids: &[String]) -> io::Result<()>;

    /// Returns an opaque version tag of the object at `path`.
    ///
    /// The tag changes whenever the object's contents change. Stores that
    /// track no versions return `None`.
    fn etag(&self, path: &str) -> io::Result<Option<String>> {
        let _ = path;
        Ok(None)
    }
}
