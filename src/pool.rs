use std::sync::Mutex;

use bytes::BytesMut;

use crate::util::lock_unpoisoned;

const DEFAULT_MAX_BUFFERS: usize = 64;
const DEFAULT_MAX_RETAINED_CAPACITY: usize = 1024 * 1024;
const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reusable byte buffers for response copies and decode scratch space.
///
/// Released buffers are cleared. The pool keeps at most `max_buffers` of them and drops
/// any buffer whose capacity grew beyond `max_retained_capacity`.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    max_buffers: usize,
    max_retained_capacity: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_BUFFERS, DEFAULT_MAX_RETAINED_CAPACITY)
    }

    pub fn with_limits(max_buffers: usize, max_retained_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_buffers,
            max_retained_capacity,
        }
    }

    pub fn acquire(&self) -> BytesMut {
        lock_unpoisoned(&self.buffers)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY))
    }

    pub fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() > self.max_retained_capacity {
            return;
        }
        buffer.clear();
        let mut buffers = lock_unpoisoned(&self.buffers);
        if buffers.len() < self.max_buffers {
            buffers.push(buffer);
        }
    }

    /// Number of idle buffers currently held by the pool.
    pub fn available(&self) -> usize {
        lock_unpoisoned(&self.buffers).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::BufferPool;

    #[test]
    fn released_buffers_are_cleared_and_reused() {
        let pool = BufferPool::new();
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(b"stale response bytes");
        let capacity = buffer.capacity();
        pool.release(buffer);
        assert_eq!(pool.available(), 1);

        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), capacity);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_retention_is_bounded() {
        let pool = BufferPool::with_limits(2, 64);
        let buffers = (0..4).map(|_| pool.acquire()).collect::<Vec<_>>();
        for buffer in buffers {
            pool.release(buffer);
        }
        assert_eq!(pool.available(), 0, "default buffers exceed retention capacity");

        let pool = BufferPool::with_limits(2, 1024 * 1024);
        let buffers = (0..4).map(|_| pool.acquire()).collect::<Vec<_>>();
        for buffer in buffers {
            pool.release(buffer);
        }
        assert_eq!(pool.available(), 2);
    }
}
