//! File addressing layer.
//!
//! Maps a file and byte offset to a block, and a block to its directory key.
//! Files are shared by all handles opened on the same path and torn down when
//! the last handle closes.

mod block;
#[allow(clippy::module_inception)]
mod file;
mod handle;
mod registry;

pub use block::{Block, BlockList, BlockState};
pub use file::{File, FileMeta, ReadOutcome};
pub use handle::{FileHandle, HandleId, ReadAhead};
pub use registry::FileRegistry;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use blockcache_common::config::BlockCacheConfig;
    use blockcache_common::types::{BlockIndex, FileId};

    use super::{Block, BlockState, File, FileMeta};

    /// Block size used by unit tests.
    pub(crate) const TEST_BLOCK_SIZE: u64 = 4096;

    /// Small configuration with `buffers` descriptors and no idle monitor.
    pub(crate) fn small_config(buffers: usize) -> BlockCacheConfig {
        BlockCacheConfig::default()
            .with_block_size(TEST_BLOCK_SIZE)
            .with_memory_budget(buffers as u64 * TEST_BLOCK_SIZE)
            .with_workers(2)
            .with_mem_timeout(0)
    }

    /// Committed block `index` of a large test file.
    pub(crate) fn committed_block(index: u64) -> Arc<Block> {
        let meta = Arc::new(FileMeta::new(FileId::new(1), "test".to_string(), i64::MAX));
        Arc::new(Block::new(meta, BlockIndex::new(index), BlockState::Committed))
    }

    /// A file of `size` bytes at `path`.
    pub(crate) fn open_file(path: &str, size: u64, block_size: u64) -> Arc<File> {
        Arc::new(File::new(FileId::new(1), path, Some(size), block_size))
    }
}
