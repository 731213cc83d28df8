//! Buffer pool for reusing buffers across connectors.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, LazyLock};

use crossbeam_queue::ArrayQueue;

use crate::buffer_set::BufferSet;

const POOL_CAPACITY: usize = 128;

/// Buffers larger than this are not kept around after a connector is dropped.
const MAX_RETAINED_CAPACITY: usize = 1 << 20;

/// Global buffer pool for reusing buffers across connectors.
pub static GLOBAL_BUFFER_POOL: LazyLock<Arc<BufferPool>> =
    LazyLock::new(|| Arc::new(BufferPool::default()));

/// A pooled `BufferSet` that returns itself to the pool on drop.
pub struct PooledBufferSet {
    pool: Arc<BufferPool>,
    inner: ManuallyDrop<BufferSet>,
}

impl Deref for PooledBufferSet {
    type Target = BufferSet;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBufferSet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for PooledBufferSet {
    fn drop(&mut self) {
        // SAFETY: inner is never accessed after this
        let buffer_set = unsafe { ManuallyDrop::take(&mut self.inner) };
        self.pool.return_buffer_set(buffer_set);
    }
}

/// Lock-free pool of `BufferSet` instances.
#[derive(Debug)]
pub struct BufferPool {
    buffer_sets: ArrayQueue<BufferSet>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer_sets: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Get a buffer set from the pool, or create a new one if empty.
    pub fn get_buffer_set(self: &Arc<Self>) -> PooledBufferSet {
        let buffer_set = self.buffer_sets.pop().unwrap_or_default();
        PooledBufferSet {
            pool: Arc::clone(self),
            inner: ManuallyDrop::new(buffer_set),
        }
    }

    /// Return a buffer set to the pool.
    fn return_buffer_set(&self, mut buffer_set: BufferSet) {
        if buffer_set.write_buffer.capacity() > MAX_RETAINED_CAPACITY
            || buffer_set.copy_buffer.capacity() > MAX_RETAINED_CAPACITY
        {
            return;
        }
        buffer_set.clear();
        // Ignore if pool is full
        let _ = self.buffer_sets.push(buffer_set);
    }

    /// Number of idle buffer sets.
    pub fn len(&self) -> usize {
        self.buffer_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_sets.is_empty()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOL_CAPACITY)
    }
}
