//! Error handling for blockcache.
//!
//! This module provides the unified error type and result alias used
//! across the cache engine.

mod cache;

pub use cache::{CacheError, TransferFailure};

/// Result type alias for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
