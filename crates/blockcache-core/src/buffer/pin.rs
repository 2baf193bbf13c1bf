//! RAII holds on buffer descriptors.

use std::ops::Deref;
use std::sync::Arc;

use super::descriptor::BufferDescriptor;
use super::freelist::FreeList;

/// One counted reference to a buffer descriptor.
///
/// Dropping the pin releases the reference; if that was the last one and the
/// slot already left the directory, the slot goes back to the free list.
pub struct BufferPin {
    descriptor: Arc<BufferDescriptor>,
    free_list: Arc<FreeList>,
}

impl BufferPin {
    /// Takes ownership of a reference already counted on `descriptor`.
    pub(crate) fn adopt(descriptor: Arc<BufferDescriptor>, free_list: Arc<FreeList>) -> Self {
        Self {
            descriptor,
            free_list,
        }
    }

    /// Counts a new reference on `descriptor`.
    pub(crate) fn acquire(descriptor: Arc<BufferDescriptor>, free_list: Arc<FreeList>) -> Self {
        descriptor.acquire();
        Self::adopt(descriptor, free_list)
    }

    /// Returns the pinned descriptor.
    #[inline]
    pub fn descriptor(&self) -> &Arc<BufferDescriptor> {
        &self.descriptor
    }
}

impl Deref for BufferPin {
    type Target = BufferDescriptor;

    fn deref(&self) -> &Self::Target {
        &self.descriptor
    }
}

impl Drop for BufferPin {
    fn drop(&mut self) {
        self.free_list.unpin(&self.descriptor);
    }
}

impl std::fmt::Debug for BufferPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BufferPin").field(&self.descriptor).finish()
    }
}
