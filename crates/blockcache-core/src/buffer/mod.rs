//! Buffer management engine.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    BufferTableManager                        │
//! │            HashMap<BlockKey, Arc<BufferDescriptor>>          │
//! └──────────────┬───────────────────────────────┬───────────────┘
//!                │ allocate / victim             │ download
//!                ▼                               ▼
//! ┌──────────────────────────────┐   ┌───────────────────────────┐
//! │           FreeList           │   │        WorkerPool         │
//! │  arena of descriptors        │   │  bounded task queue       │
//! │  free chain + clock hand     │   │  fixed worker threads     │
//! └──────────────┬───────────────┘   └───────────────────────────┘
//!                │ one buffer per slot
//!                ▼
//! ┌──────────────────────────────┐
//! │          BufferPool          │
//! └──────────────────────────────┘
//! ```
//!
//! A [`BufferPin`] is a counted reference to a descriptor. Dropping the last
//! pin of a descriptor that already left the directory recycles it.

mod descriptor;
mod freelist;
mod pin;
mod pool;
mod table;

pub use descriptor::BufferDescriptor;
pub use freelist::FreeList;
pub use pin::BufferPin;
pub use pool::BufferPool;
pub use table::{BufferStatus, BufferTableManager, Lookup};
