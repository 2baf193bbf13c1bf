//! Store backed by a local directory.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use tracing::debug;

use super::RemoteStore;

/// Serves the files under a root directory as remote objects.
///
/// Staged blocks are kept in memory and written into the file on commit.
pub struct LocalDirStore {
    root: PathBuf,
    staged: Mutex<HashMap<String, (String, u64, Vec<u8>)>>,
}

impl LocalDirStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self {
            root,
            staged: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves an object path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || path.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid object path {path:?}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl RemoteStore for LocalDirStore {
    fn size(&self, path: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.resolve(path)?)?.len())
    }

    fn read_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = fs::File::open(self.resolve(path)?)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    fn stage_block(&self, path: &str, offset: u64, id: &str, data: &[u8]) -> io::Result<()> {
        self.resolve(path)?;
        self.staged
            .lock()
            .insert(id.to_string(), (path.to_string(), offset, data.to_vec()));
        Ok(())
    }

    fn etag(&self, path: &str) -> io::Result<Option<String>> {
        let metadata = fs::metadata(self.resolve(path)?)?;
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Ok(Some(format!("\"{:x}-{modified:x}\"", metadata.len())))
    }

    fn commit_blocks(&self, path: &str, ids: &[String]) -> io::Result<()> {
        let target = self.resolve(path)?;
        let mut file = OpenOptions::new().write(true).create(true).open(&target)?;
        let mut staged = self.staged.lock();

        for id in ids {
            let (staged_path, offset, data) = staged.remove(id).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("block {id} is not staged"))
            })?;
            if staged_path != path {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("block {id} belongs to {staged_path}"),
                ));
            }
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)?;
        }
        file.sync_data()?;
        debug!(path, blocks = ids.len(), "committed blocks");
        Ok(())
    }
}

impl std::fmt::Debug for LocalDirStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDirStore")
            .field("root", &self.root)
            .finish()
    }
}
