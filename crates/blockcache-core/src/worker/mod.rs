//! Background transfer workers.
//!
//! A fixed set of threads drains a bounded queue of [`TransferTask`]s. A
//! download fills a pinned buffer from the remote store and opens its content
//! gate exactly once, whatever the outcome. An upload stages a dirty buffer
//! under a fresh block id.

mod task;

pub use task::{TransferDirection, TransferResult, TransferTask};

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use blockcache_common::constants::BLOCK_ID_LENGTH;
use blockcache_common::error::{CacheError, CacheResult, TransferFailure};
use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, error, info};

use crate::buffer::BufferTableManager;
use crate::file::BlockState;
use crate::remote::RemoteStore;
use crate::stats::CacheStats;

/// State shared by every worker thread.
struct TransferContext {
    store: Arc<dyn RemoteStore>,
    table: Weak<BufferTableManager>,
    stats: Arc<CacheStats>,
    block_size: u64,
}

impl TransferContext {
    fn run(&self, task: TransferTask) {
        let result = match task.direction {
            TransferDirection::Download => self.download(&task),
            TransferDirection::Upload => self.upload(&task),
        };
        self.complete(task, result);
    }

    fn download(&self, task: &TransferTask) -> TransferResult {
        let block = &task.block;
        let descriptor = &task.descriptor;
        let offset = block.start_offset(self.block_size);
        let len = block.transfer_len(self.block_size).min(descriptor.capacity());

        let outcome = {
            let mut data = descriptor.data_mut();
            data.resize(descriptor.capacity(), 0);
            let outcome = self.store.read_range(block.path(), offset, &mut data[..len]);
            if let Ok(read) = &outcome {
                // Bytes past the remote end but inside the file size read as zeros.
                let read = (*read).min(len);
                data[read..len].fill(0);
                data.truncate(len);
            }
            outcome
        };

        match outcome {
            Ok(read) => {
                descriptor.mark_valid();
                self.stats.record_download();
                debug!(block = %block.key(), buffer = %descriptor.index(), read, "downloaded");
                Ok(())
            }
            Err(err) => {
                let failure = TransferFailure::download(block.path(), block.index().as_u64(), err);
                self.fail_download(task, failure.clone());
                Err(failure)
            }
        }
    }

    /// Poisons the descriptor of a failed download and drops it from the directory.
    fn fail_download(&self, task: &TransferTask, failure: TransferFailure) {
        error!(block = %task.block.key(), buffer = %task.descriptor.index(), %failure, "download failed");
        self.stats.record_download_failure();
        task.descriptor.set_error(failure.clone());
        task.block.file().set_last_error(failure);
        if let Some(table) = self.table.upgrade() {
            table.remove_buffer_descriptor(&task.descriptor, false);
        }
    }

    fn upload(&self, task: &TransferTask) -> TransferResult {
        let block = &task.block;
        let descriptor = &task.descriptor;
        let id = generate_block_id();
        let offset = block.start_offset(self.block_size);

        let outcome = {
            let data = descriptor.data();
            let len = block.transfer_len(self.block_size).min(data.len());
            let outcome = self.store.stage_block(block.path(), offset, &id, &data[..len]);
            // Still under the byte lock: no write lands between staging and clearing dirty.
            if outcome.is_ok() {
                block.set_id(id);
                block.set_state(BlockState::Uncommitted);
                descriptor.clear_dirty();
            }
            outcome
        };

        match outcome {
            Ok(()) => {
                self.stats.record_upload();
                debug!(block = %block.key(), buffer = %descriptor.index(), "staged");
                Ok(())
            }
            Err(err) => {
                let failure = TransferFailure::upload(block.path(), block.index().as_u64(), err);
                error!(block = %block.key(), buffer = %descriptor.index(), %failure, "upload failed");
                descriptor.set_error(failure.clone());
                block.file().set_last_error(failure.clone());
                Err(failure)
            }
        }
    }

    /// Opens the gate, drops the async pin and signals the submitter.
    fn complete(&self, task: TransferTask, result: TransferResult) {
        let TransferTask {
            block,
            descriptor,
            direction,
            pin,
            done,
        } = task;

        if direction == TransferDirection::Download {
            descriptor.finish_transfer();
        }
        if let Some(pin) = pin {
            drop(pin);
            block.file().end_pending_read();
        }
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }

    /// Fails a task that never reached a worker.
    fn abandon(&self, task: TransferTask) {
        let reason = "transfer queue closed";
        let index = task.block.index().as_u64();
        let result = match task.direction {
            TransferDirection::Download => {
                let failure = TransferFailure::download(task.block.path(), index, reason);
                self.fail_download(&task, failure.clone());
                Err(failure)
            }
            TransferDirection::Upload => {
                Err(TransferFailure::upload(task.block.path(), index, reason))
            }
        };
        self.complete(task, result);
    }
}

/// Fixed-size pool of transfer threads.
pub struct WorkerPool {
    workers: usize,
    sender: Mutex<Option<flume::Sender<TransferTask>>>,
    receiver: flume::Receiver<TransferTask>,
    context: Arc<TransferContext>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool of `workers` threads over a queue of `queue_depth` tasks.
    ///
    /// No thread runs until [`start`](Self::start) is called.
    pub fn new(
        workers: usize,
        queue_depth: usize,
        store: Arc<dyn RemoteStore>,
        table: Weak<BufferTableManager>,
        stats: Arc<CacheStats>,
        block_size: u64,
    ) -> Self {
        let (sender, receiver) = flume::bounded(queue_depth.max(1));
        Self {
            workers: workers.max(1),
            sender: Mutex::new(Some(sender)),
            receiver,
            context: Arc::new(TransferContext {
                store,
                table,
                stats,
                block_size,
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker threads.
    pub fn start(&self) -> CacheResult<()> {
        let mut handles = self.handles.lock();
        for id in handles.len()..self.workers {
            let receiver = self.receiver.clone();
            let context = Arc::clone(&self.context);
            let handle = thread::Builder::new()
                .name(format!("blockcache-worker-{id}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        context.run(task);
                    }
                    debug!(worker = id, "worker exiting");
                })?;
            handles.push(handle);
        }
        info!(workers = self.workers, "worker pool started");
        Ok(())
    }

    /// Queues a task, blocking while the queue is full.
    ///
    /// A task that cannot be queued is failed on the spot, so its gate,
    /// pin and completion signal are settled either way.
    pub fn submit(&self, task: TransferTask) -> CacheResult<()> {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            self.context.abandon(task);
            return Err(CacheError::QueueClosed);
        };
        if let Err(flume::SendError(task)) = sender.send(task) {
            self.context.abandon(task);
            return Err(CacheError::QueueClosed);
        }
        Ok(())
    }

    /// Returns the number of queued tasks.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Returns the number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Closes the queue, lets the workers drain it and joins them.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        drop(sender);

        let current = thread::current().id();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("transfer worker panicked");
            }
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Generates the id under which an uploaded block is staged.
fn generate_block_id() -> String {
    let mut raw = [0u8; BLOCK_ID_LENGTH];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, FreeList};
    use crate::file::test_util::open_file;
    use crate::remote::MemoryStore;

    /// Holds every staging call until released.
    struct GatedStore {
        inner: MemoryStore,
        entered: flume::Sender<()>,
        release: flume::Receiver<()>,
    }

    impl RemoteStore for GatedStore {
        fn size(&self, path: &str) -> std::io::Result<u64> {
            self.inner.size(path)
        }

        fn read_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read_range(path, offset, buf)
        }

        fn stage_block(&self, path: &str, offset: u64, id: &str, data: &[u8]) -> std::io::Result<()> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            self.inner.stage_block(path, offset, id, data)
        }

        fn commit_blocks(&self, path: &str, ids: &[String]) -> std::io::Result<()> {
            self.inner.commit_blocks(path, ids)
        }
    }

    fn pool_with(store: Arc<MemoryStore>) -> WorkerPool {
        let pool = WorkerPool::new(2, 4, store, Weak::new(), Arc::new(CacheStats::new()), 64);
        pool.start().unwrap();
        pool
    }

    fn free_list() -> Arc<FreeList> {
        Arc::new(FreeList::new(Arc::new(BufferPool::new(64, 2)), 2).unwrap())
    }

    #[test]
    fn test_block_id_shape() {
        let id = generate_block_id();
        assert_eq!(id.len(), BLOCK_ID_LENGTH * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_block_id());
    }

    #[test]
    fn test_sync_download() {
        let store = Arc::new(MemoryStore::new());
        store.insert("f", (0..100u8).collect());
        let workers = pool_with(store);
        let file = open_file("f", 100, 64);
        let list = free_list();

        let block = file.block_at(1).unwrap();
        let pin = list.allocate(Arc::clone(&block)).unwrap();
        pin.begin_transfer();
        let (task, done) = TransferTask::download(block, Arc::clone(pin.descriptor())).with_completion();
        workers.submit(task).unwrap();

        assert_eq!(done.recv().unwrap(), Ok(()));
        assert!(pin.ensure_valid_for_read().is_ok());
        // The last block is short: bytes 64..100.
        assert_eq!(pin.data().len(), 36);
        assert_eq!(pin.data()[0], 64);
    }

    #[test]
    fn test_short_remote_read_is_zero_filled() {
        let store = Arc::new(MemoryStore::new());
        store.insert("f", vec![9u8; 70]);
        let workers = pool_with(store);
        // The file grew locally past the remote object.
        let file = open_file("f", 128, 64);
        let list = free_list();

        let block = file.block_at(1).unwrap();
        let pin = list.allocate(Arc::clone(&block)).unwrap();
        pin.begin_transfer();
        let (task, done) = TransferTask::download(block, Arc::clone(pin.descriptor())).with_completion();
        workers.submit(task).unwrap();

        assert_eq!(done.recv().unwrap(), Ok(()));
        let data = pin.data();
        assert_eq!(data.len(), 64);
        assert!(data[..6].iter().all(|&b| b == 9));
        assert!(data[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_async_download_releases_pin() {
        let store = Arc::new(MemoryStore::new());
        store.insert("f", vec![7u8; 64]);
        let workers = pool_with(store);
        let file = open_file("f", 64, 64);
        let list = free_list();

        let block = file.block_at(0).unwrap();
        let pin = list.allocate(Arc::clone(&block)).unwrap();
        let descriptor = Arc::clone(pin.descriptor());
        descriptor.begin_transfer();
        file.meta().begin_pending_read();
        workers
            .submit(TransferTask::download(block, Arc::clone(&descriptor)).with_pin(pin))
            .unwrap();

        file.wait_pending_reads();
        assert!(descriptor.is_valid());
        assert_eq!(descriptor.ref_count(), 0);
    }

    #[test]
    fn test_upload_stages_block() {
        let store = Arc::new(MemoryStore::new());
        let workers = pool_with(Arc::clone(&store));
        let file = open_file("f", 64, 64);
        let list = free_list();

        let block = file.block_at(0).unwrap();
        let pin = list.allocate(Arc::clone(&block)).unwrap();
        pin.write_at(0, &[3u8; 64]);
        let (task, done) =
            TransferTask::upload(Arc::clone(&block), Arc::clone(pin.descriptor())).with_completion();
        workers.submit(task).unwrap();

        assert_eq!(done.recv().unwrap(), Ok(()));
        assert!(!pin.is_dirty());
        assert_eq!(block.state(), BlockState::Uncommitted);
        assert_eq!(store.staged_count("f"), 1);
        assert_eq!(block.id().len(), BLOCK_ID_LENGTH * 2);
    }

    #[test]
    fn test_write_during_upload_stays_dirty() {
        let (entered_tx, entered) = flume::bounded(1);
        let (release, release_rx) = flume::bounded(1);
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            entered: entered_tx,
            release: release_rx,
        });
        let workers = WorkerPool::new(1, 4, store, Weak::new(), Arc::new(CacheStats::new()), 64);
        workers.start().unwrap();
        let file = open_file("f", 64, 64);
        let list = free_list();

        let block = file.block_at(0).unwrap();
        let pin = list.allocate(Arc::clone(&block)).unwrap();
        pin.write_at(0, &[1u8; 64]);
        let (task, done) =
            TransferTask::upload(Arc::clone(&block), Arc::clone(pin.descriptor())).with_completion();
        workers.submit(task).unwrap();
        entered.recv().unwrap();

        let descriptor = Arc::clone(pin.descriptor());
        let writer = thread::spawn(move || descriptor.write_at(0, &[2u8; 4]));
        release.send(()).unwrap();
        assert_eq!(writer.join().unwrap(), 4);
        assert_eq!(done.recv().unwrap(), Ok(()));

        // The second write came after staging and still awaits upload.
        assert!(pin.is_dirty());
        assert_eq!(pin.data()[0], 2);
        assert_eq!(block.state(), BlockState::Uncommitted);
    }

    #[test]
    fn test_upload_failure_recorded() {
        let store = Arc::new(MemoryStore::new());
        store.fail_uploads(true);
        let workers = pool_with(Arc::clone(&store));
        let file = open_file("f", 64, 64);
        let list = free_list();

        let block = file.block_at(0).unwrap();
        let pin = list.allocate(Arc::clone(&block)).unwrap();
        pin.write_at(0, &[1u8; 8]);
        let (task, done) =
            TransferTask::upload(Arc::clone(&block), Arc::clone(pin.descriptor())).with_completion();
        workers.submit(task).unwrap();

        let failure = done.recv().unwrap().unwrap_err();
        assert!(failure.upload);
        assert!(pin.is_dirty());
        assert_eq!(file.last_error(), Some(failure));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let workers = pool_with(store);
        workers.shutdown();

        let file = open_file("f", 64, 64);
        let list = free_list();
        let block = file.block_at(0).unwrap();
        let pin = list.allocate(Arc::clone(&block)).unwrap();
        pin.begin_transfer();
        let (task, done) = TransferTask::download(block, Arc::clone(pin.descriptor())).with_completion();

        assert!(matches!(workers.submit(task), Err(CacheError::QueueClosed)));
        assert!(done.recv().unwrap().is_err());
        assert!(pin.ensure_valid_for_read().is_err());
    }
}
