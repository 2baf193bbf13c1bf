//! Cache error types.

use std::fmt;
use std::io;

use thiserror::Error;

/// Failure of one remote transfer, recorded on the buffer that hosted it.
///
/// A failed download poisons its descriptor: every waiter attached to that
/// descriptor observes the same failure, so the value must be clonable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    /// Path of the remote object.
    pub path: String,
    /// Block index the transfer was serving.
    pub block: u64,
    /// True for an upload, false for a download.
    pub upload: bool,
    /// Error message reported by the store.
    pub reason: String,
}

impl TransferFailure {
    /// Creates a download failure.
    pub fn download(path: impl Into<String>, block: u64, reason: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            block,
            upload: false,
            reason: reason.to_string(),
        }
    }

    /// Creates an upload failure.
    pub fn upload(path: impl Into<String>, block: u64, reason: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            block,
            upload: true,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.upload { "upload" } else { "download" };
        write!(
            f,
            "{direction} of block {} of {} failed: {}",
            self.block, self.path, self.reason
        )
    }
}

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum CacheError {
    /// Every descriptor is mapped to a block; eviction is required.
    #[error("all buffers are in use, free list is full")]
    FreeListFull,

    /// The buffer pool handed out its full capacity.
    #[error("buffers exhausted: {issued} of {capacity} issued")]
    BuffersExhausted { issued: usize, capacity: usize },

    /// A remote transfer failed.
    #[error("{0}")]
    Transfer(TransferFailure),

    /// The block index lies beyond the file's block list.
    #[error("block {block} not found in {path}")]
    BlockNotFound { path: String, block: u64 },

    /// The file was closed while an operation was in flight.
    #[error("file {path} is closed")]
    FileClosed { path: String },

    /// The remote object does not exist.
    #[error("remote object {path} not found")]
    NotFound { path: String },

    /// The transfer queue no longer accepts work.
    #[error("transfer queue is closed")]
    QueueClosed,

    /// The cache is shutting down.
    #[error("block cache is shutting down")]
    ShuttingDown,

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Configuration file could not be parsed.
    #[error("configuration parse error: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// Configuration could not be rendered.
    #[error("configuration render error: {source}")]
    ConfigRender {
        #[from]
        source: toml::ser::Error,
    },

    /// I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl CacheError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a block-not-found error.
    pub fn block_not_found(path: impl Into<String>, block: u64) -> Self {
        Self::BlockNotFound {
            path: path.into(),
            block,
        }
    }

    /// Returns the transfer failure carried by this error, if any.
    pub fn transfer_failure(&self) -> Option<&TransferFailure> {
        match self {
            Self::Transfer(failure) => Some(failure),
            _ => None,
        }
    }

    /// Returns true if this is a transient error that can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FreeListFull | Self::BuffersExhausted { .. })
    }

    /// Returns true if the error means the cache can no longer serve requests.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::QueueClosed)
    }
}

impl From<TransferFailure> for CacheError {
    fn from(failure: TransferFailure) -> Self {
        Self::Transfer(failure)
    }
}
