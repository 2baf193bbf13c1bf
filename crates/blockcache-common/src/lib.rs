//! # blockcache-common
//!
//! Common types, errors, and configuration for blockcache.
//!
//! This crate provides the foundational types shared by the buffer engine
//! and its front ends:
//!
//! - **Types**: Typed identifiers (`FileId`, `BlockIndex`, `BufferIndex`, `BlockKey`)
//! - **Errors**: Unified error handling with `CacheError`
//! - **Config**: The `BlockCacheConfig` consumed by the engine
//! - **Constants**: Sizes and defaults
//!
//! ## Example
//!
//! ```rust
//! use blockcache_common::config::BlockCacheConfig;
//! use blockcache_common::types::{BlockIndex, BlockKey, FileId};
//!
//! let config = BlockCacheConfig::default()
//!     .with_block_size(1024 * 1024)
//!     .with_memory_budget(5 * 1024 * 1024);
//! assert_eq!(config.buffer_count(), 5);
//!
//! let key = BlockKey::new(FileId::new(7), BlockIndex::new(3));
//! assert_eq!(key.index.as_u64(), 3);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::BlockCacheConfig;
pub use constants::*;
pub use error::{CacheError, CacheResult, TransferFailure};
pub use types::{BlockIndex, BlockKey, BufferIndex, FileId};
