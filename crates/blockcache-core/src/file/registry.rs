//! Directory of open files.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blockcache_common::types::FileId;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::file::File;
use super::handle::{FileHandle, HandleId, ReadAhead};
use crate::buffer::BufferTableManager;

/// Open files by path, reference counted by their handles.
pub struct FileRegistry {
    files: DashMap<String, Arc<File>>,
    table: Arc<BufferTableManager>,
    read_ahead: ReadAhead,
    next_file: AtomicU64,
    next_handle: AtomicU64,
}

impl FileRegistry {
    /// Creates an empty registry over `table`.
    pub fn new(table: Arc<BufferTableManager>, read_ahead: ReadAhead) -> Self {
        Self {
            files: DashMap::new(),
            table,
            read_ahead,
            next_file: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Opens `path`, whose remote size is `size` and version tag `etag`.
    ///
    /// The first open creates the file; later opens join it and grow it if
    /// the remote object grew.
    pub fn open(self: &Arc<Self>, path: &str, size: u64, etag: Option<String>) -> FileHandle {
        let handle = HandleId::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        loop {
            let file = self
                .files
                .entry(path.to_string())
                .or_insert_with(|| {
                    let id = FileId::new(self.next_file.fetch_add(1, Ordering::Relaxed));
                    info!(path, %id, size, ?etag, "file opened");
                    let file = File::new(id, path, Some(size), self.table.block_size());
                    file.set_etag(etag.clone());
                    Arc::new(file)
                })
                .clone();

            // Losing a race with the last close leaves a closed file behind; retry.
            if !file.add_handle(handle) {
                self.files.remove_if(path, |_, existing| Arc::ptr_eq(existing, &file));
                continue;
            }
            file.update_size(size);
            debug!(path, %handle, "handle opened");
            return FileHandle::new(
                handle,
                file,
                Arc::clone(&self.table),
                Arc::clone(self),
                self.read_ahead,
            );
        }
    }

    /// Closes `handle`; the last close unregisters the file, flushes it and
    /// releases its buffers.
    pub(crate) fn close(&self, handle: HandleId, file: &Arc<File>) {
        if !file.remove_handle(handle) {
            debug!(path = file.path(), %handle, "handle closed");
            return;
        }

        self.files
            .remove_if(file.path(), |_, existing| Arc::ptr_eq(existing, file));
        self.teardown(file);
    }

    /// Tears down every open file as if its last handle closed.
    ///
    /// Handles still alive afterwards see no resident blocks. Returns the
    /// number of files closed.
    pub fn close_all(&self) -> usize {
        let files: Vec<Arc<File>> = self
            .files
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for file in &files {
            self.files.remove_if(file.path(), |_, existing| Arc::ptr_eq(existing, file));
            self.teardown(file);
        }
        files.len()
    }

    /// Flushes `file` if needed and releases all of its buffers.
    fn teardown(&self, file: &File) {
        if !file.is_synced() {
            if let Err(err) = file.flush(&self.table) {
                warn!(path = file.path(), %err, "flush on close failed");
            }
        }
        self.table.release_all_buffers_for_file(file);
        info!(path = file.path(), "file closed");
    }

    /// Returns the open file at `path`.
    pub fn get(&self, path: &str) -> Option<Arc<File>> {
        self.files.get(path).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the number of open files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if no file is open.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegistry")
            .field("open_files", &self.len())
            .finish()
    }
}
