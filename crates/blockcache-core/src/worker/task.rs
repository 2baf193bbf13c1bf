//! Transfer tasks.

use std::sync::Arc;

use blockcache_common::error::TransferFailure;

use crate::buffer::{BufferDescriptor, BufferPin};
use crate::file::Block;

/// Outcome reported on a task's completion signal.
pub type TransferResult = Result<(), TransferFailure>;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Fill the buffer from the remote store.
    Download,
    /// Stage the buffer's bytes in the remote store.
    Upload,
}

/// One unit of work for the worker pool.
///
/// Synchronous tasks carry a completion sender the submitter waits on.
/// Asynchronous downloads carry the creator's pin instead; the worker drops
/// it once the transfer is over.
pub struct TransferTask {
    pub(crate) block: Arc<Block>,
    pub(crate) descriptor: Arc<BufferDescriptor>,
    pub(crate) direction: TransferDirection,
    pub(crate) pin: Option<BufferPin>,
    pub(crate) done: Option<flume::Sender<TransferResult>>,
}

impl TransferTask {
    /// Creates a download of `block` into `descriptor`.
    pub fn download(block: Arc<Block>, descriptor: Arc<BufferDescriptor>) -> Self {
        Self::new(block, descriptor, TransferDirection::Download)
    }

    /// Creates an upload of `descriptor`'s bytes for `block`.
    pub fn upload(block: Arc<Block>, descriptor: Arc<BufferDescriptor>) -> Self {
        Self::new(block, descriptor, TransferDirection::Upload)
    }

    fn new(block: Arc<Block>, descriptor: Arc<BufferDescriptor>, direction: TransferDirection) -> Self {
        Self {
            block,
            descriptor,
            direction,
            pin: None,
            done: None,
        }
    }

    /// Hands the creator's pin to the worker.
    #[must_use]
    pub fn with_pin(mut self, pin: BufferPin) -> Self {
        self.pin = Some(pin);
        self
    }

    /// Attaches a completion signal and returns its receiving end.
    #[must_use]
    pub fn with_completion(mut self) -> (Self, flume::Receiver<TransferResult>) {
        let (tx, rx) = flume::bounded(1);
        self.done = Some(tx);
        (self, rx)
    }

    /// Returns the direction.
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Returns true if a submitter waits for this task.
    pub fn is_sync(&self) -> bool {
        self.done.is_some()
    }

    /// Returns the block being transferred.
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }
}

impl std::fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTask")
            .field("block", &self.block.key())
            .field("buffer", &self.descriptor.index())
            .field("direction", &self.direction)
            .field("sync", &self.is_sync())
            .finish()
    }
}
