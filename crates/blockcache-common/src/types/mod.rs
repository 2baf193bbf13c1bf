//! Core types for blockcache.

mod ids;

pub use ids::{BlockIndex, BlockKey, BufferIndex, FileId};
