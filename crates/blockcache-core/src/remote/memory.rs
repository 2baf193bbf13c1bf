//! In-memory store with read accounting and fault injection.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::RemoteStore;

/// A block staged but not yet committed.
struct StagedBlock {
    path: String,
    offset: u64,
    data: Vec<u8>,
}

/// Objects held in memory.
///
/// Counts every range read so callers can observe how often a block was
/// fetched, and can be told to fail reads or uploads.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    /// Bumped on every change of an object.
    versions: Mutex<HashMap<String, u64>>,
    staged: Mutex<HashMap<String, StagedBlock>>,
    reads: Mutex<HashMap<(String, u64), u64>>,
    total_reads: AtomicU64,
    failing_reads: Mutex<HashSet<(String, u64)>>,
    fail_uploads: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` at `path`, replacing any previous object.
    pub fn insert(&self, path: impl Into<String>, data: Vec<u8>) {
        let path = path.into();
        self.bump_version(&path);
        self.objects.write().insert(path, data);
    }

    fn bump_version(&self, path: &str) {
        *self.versions.lock().entry(path.to_string()).or_default() += 1;
    }

    /// Stores an object of `size` bytes whose byte at offset `i` is `i % 251`.
    pub fn insert_pattern(&self, path: impl Into<String>, size: u64) {
        let data = (0..size).map(|i| (i % 251) as u8).collect();
        self.insert(path, data);
    }

    /// Returns a copy of the object at `path`.
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().get(path).cloned()
    }

    /// Makes reads of `path` at `offset` fail.
    pub fn fail_reads_at(&self, path: impl Into<String>, offset: u64) {
        self.failing_reads.lock().insert((path.into(), offset));
    }

    /// Lets reads of `path` at `offset` succeed again.
    pub fn heal_reads_at(&self, path: &str, offset: u64) {
        self.failing_reads.lock().remove(&(path.to_string(), offset));
    }

    /// Makes every upload fail while `fail` is set.
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::Release);
    }

    /// Delays every read by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Returns how many reads of `path` started at `offset`.
    pub fn read_count(&self, path: &str, offset: u64) -> u64 {
        self.reads
            .lock()
            .get(&(path.to_string(), offset))
            .copied()
            .unwrap_or(0)
    }

    /// Returns the number of reads served.
    pub fn total_reads(&self) -> u64 {
        self.total_reads.load(Ordering::Acquire)
    }

    /// Returns the number of staged, uncommitted blocks of `path`.
    pub fn staged_count(&self, path: &str) -> usize {
        self.staged
            .lock()
            .values()
            .filter(|staged| staged.path == path)
            .count()
    }
}

impl RemoteStore for MemoryStore {
    fn size(&self, path: &str) -> io::Result<u64> {
        self.objects
            .read()
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn read_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            thread::sleep(latency);
        }

        let key = (path.to_string(), offset);
        *self.reads.lock().entry(key.clone()).or_insert(0) += 1;
        self.total_reads.fetch_add(1, Ordering::AcqRel);

        if self.failing_reads.lock().contains(&key) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("injected read failure at {path}:{offset}"),
            ));
        }

        let objects = self.objects.read();
        let data = objects
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn stage_block(&self, path: &str, offset: u64, id: &str, data: &[u8]) -> io::Result<()> {
        if self.fail_uploads.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("injected upload failure for {path}"),
            ));
        }
        self.staged.lock().insert(
            id.to_string(),
            StagedBlock {
                path: path.to_string(),
                offset,
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn commit_blocks(&self, path: &str, ids: &[String]) -> io::Result<()> {
        let mut staged = self.staged.lock();
        let mut objects = self.objects.write();
        let object = objects.entry(path.to_string()).or_default();

        for id in ids {
            let block = staged.remove(id).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("block {id} is not staged"))
            })?;
            let start = block.offset as usize;
            let end = start + block.data.len();
            if object.len() < end {
                object.resize(end, 0);
            }
            object[start..end].copy_from_slice(&block.data);
        }
        drop(objects);
        drop(staged);
        self.bump_version(path);
        Ok(())
    }

    fn etag(&self, path: &str) -> io::Result<Option<String>> {
        if !self.objects.read().contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()));
        }
        let version = self.versions.lock().get(path).copied().unwrap_or(0);
        Ok(Some(format!("\"{version:x}\"")))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("objects", &self.objects.read().len())
            .field("total_reads", &self.total_reads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_range_counts() {
        let store = MemoryStore::new();
        store.insert("a", (0..10u8).collect());

        let mut buf = [0u8; 4];
        assert_eq!(store.read_range("a", 8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[8, 9]);
        assert_eq!(store.read_range("a", 20, &mut buf).unwrap(), 0);
        assert_eq!(store.read_count("a", 8), 1);
        assert_eq!(store.total_reads(), 2);
    }

    #[test]
    fn test_missing_object() {
        let store = MemoryStore::new();
        let err = store.size("nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_injected_failure() {
        let store = MemoryStore::new();
        store.insert_pattern("a", 16);
        store.fail_reads_at("a", 0);

        let mut buf = [0u8; 16];
        assert!(store.read_range("a", 0, &mut buf).is_err());
        store.heal_reads_at("a", 0);
        assert_eq!(store.read_range("a", 0, &mut buf).unwrap(), 16);
    }

    #[test]
    fn test_stage_and_commit() {
        let store = MemoryStore::new();
        store.insert("a", vec![0u8; 4]);
        store.stage_block("a", 2, "x", &[1, 2, 3, 4]).unwrap();
        assert_eq!(store.staged_count("a"), 1);
        assert_eq!(store.object("a").unwrap(), vec![0, 0, 0, 0]);

        store.commit_blocks("a", &["x".to_string()]).unwrap();
        assert_eq!(store.object("a").unwrap(), vec![0, 0, 1, 2, 3, 4]);
        assert_eq!(store.staged_count("a"), 0);
        assert!(store.commit_blocks("a", &["x".to_string()]).is_err());
    }

    #[test]
    fn test_etag_changes_on_commit() {
        let store = MemoryStore::new();
        assert!(store.etag("a").is_err());
        store.insert("a", vec![0u8; 4]);
        let before = store.etag("a").unwrap().unwrap();
        assert_eq!(store.etag("a").unwrap().unwrap(), before);

        store.stage_block("a", 0, "x", &[9]).unwrap();
        store.commit_blocks("a", &["x".to_string()]).unwrap();
        assert_ne!(store.etag("a").unwrap().unwrap(), before);
    }
}
