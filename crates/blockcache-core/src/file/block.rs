//! Blocks and block lists.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use blockcache_common::types::{BlockIndex, BlockKey};
use parking_lot::Mutex;

use super::FileMeta;

/// Where the authoritative copy of a block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// Exists only client-side; never uploaded.
    Local = 0,
    /// Staged remotely under an id but not committed.
    Uncommitted = 1,
    /// Durably committed in the remote object.
    Committed = 2,
}

impl BlockState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Local,
            1 => Self::Uncommitted,
            _ => Self::Committed,
        }
    }
}

/// One fixed-size region of a file.
pub struct Block {
    file: Arc<FileMeta>,
    index: BlockIndex,
    /// Id under which the block was last staged.
    id: Mutex<String>,
    state: AtomicU8,
}

impl Block {
    /// Creates block `index` of `file`.
    pub fn new(file: Arc<FileMeta>, index: BlockIndex, state: BlockState) -> Self {
        Self {
            file,
            index,
            id: Mutex::new(String::new()),
            state: AtomicU8::new(state as u8),
        }
    }

    /// Returns the directory key of this block.
    #[inline]
    pub fn key(&self) -> BlockKey {
        BlockKey::new(self.file.id(), self.index)
    }

    /// Returns the block's position in its file.
    #[inline]
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    /// Returns the owning file's metadata.
    #[inline]
    pub fn file(&self) -> &Arc<FileMeta> {
        &self.file
    }

    /// Returns the owning file's path.
    pub fn path(&self) -> &str {
        self.file.path()
    }

    /// Returns the staged id, empty if the block was never uploaded.
    pub fn id(&self) -> String {
        self.id.lock().clone()
    }

    pub(crate) fn set_id(&self, id: String) {
        *self.id.lock() = id;
    }

    /// Returns the block state.
    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sets the block state.
    pub fn set_state(&self, state: BlockState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns the first byte offset of the block.
    pub fn start_offset(&self, block_size: u64) -> u64 {
        self.index.start_offset(block_size)
    }

    /// Returns how many bytes of the block lie inside the file.
    ///
    /// A file of unknown size is assumed to cover the whole block.
    pub fn transfer_len(&self, block_size: u64) -> usize {
        let len = match self.file.known_size() {
            Some(size) => size.saturating_sub(self.start_offset(block_size)).min(block_size),
            None => block_size,
        };
        usize::try_from(len).unwrap_or(usize::MAX)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("key", &self.key())
            .field("state", &self.state())
            .finish()
    }
}

/// Ordered blocks of one file.
#[derive(Debug, Default)]
pub struct BlockList {
    blocks: Vec<Arc<Block>>,
}

impl BlockList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns block `index`.
    pub fn get(&self, index: BlockIndex) -> Option<&Arc<Block>> {
        self.blocks.get(index.as_usize())
    }

    /// Appends blocks in `state` until the list holds `count` blocks.
    pub fn extend_to(&mut self, file: &Arc<FileMeta>, count: u64, state: BlockState) {
        for index in self.blocks.len() as u64..count {
            self.blocks
                .push(Arc::new(Block::new(Arc::clone(file), BlockIndex::new(index), state)));
        }
    }

    /// Appends one block in `state` and returns it.
    pub fn push(&mut self, file: &Arc<FileMeta>, state: BlockState) -> Arc<Block> {
        let block = Arc::new(Block::new(
            Arc::clone(file),
            BlockIndex::new(self.blocks.len() as u64),
            state,
        ));
        self.blocks.push(Arc::clone(&block));
        block
    }

    /// Returns the number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterates over the blocks in order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Block>> {
        self.blocks.iter()
    }
}
