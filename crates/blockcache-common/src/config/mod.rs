//! Configuration for blockcache.
//!
//! This module provides the configuration consumed by the buffer engine.
//! Parsing stays here; wiring the values into components is the engine's job.

mod cache;

pub use cache::BlockCacheConfig;
