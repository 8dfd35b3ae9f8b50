use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::frame::{FrameBuffer, NativeBuffer};

/// Pool of fixed-size native buffers owned by a pipeline.
///
/// # Behavior
/// - Pre-allocates `capacity` slots on creation
/// - A buffer handed out by `try_acquire()` returns its storage to the pool
///   once its last owning handle is released
/// - Never allocates past `capacity` outstanding buffers; exhaustion is
///   reported so the pipeline can observe starvation
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    slots: Mutex<PoolSlots>,
    buffer_size: usize,
    capacity: usize,
}

struct PoolSlots {
    free: Vec<BytesMut>,
    outstanding: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        let free = (0..capacity).map(|_| BytesMut::zeroed(buffer_size)).collect();

        Self {
            shared: Arc::new(PoolShared {
                slots: Mutex::new(PoolSlots {
                    free,
                    outstanding: 0,
                }),
                buffer_size,
                capacity,
            }),
        }
    }

    /// Take an owned buffer from the pool, `None` if every slot is in use.
    pub fn try_acquire(&self) -> Option<FrameBuffer> {
        let data = {
            let mut slots = self.shared.slots.lock();
            if slots.outstanding >= self.shared.capacity {
                return None;
            }
            slots.outstanding += 1;
            slots
                .free
                .pop()
                .unwrap_or_else(|| BytesMut::zeroed(self.shared.buffer_size))
        };

        let pool: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let native = NativeBuffer::with_recycler(
            data,
            Box::new(move |mut data| {
                if let Some(pool) = pool.upgrade() {
                    pool.put(&mut data);
                }
            }),
        );
        Some(FrameBuffer::owned(native))
    }

    /// Number of buffers currently handed out
    pub fn outstanding(&self) -> usize {
        self.shared.slots.lock().outstanding
    }

    /// Number of buffers that can still be acquired
    pub fn available(&self) -> usize {
        self.shared.capacity - self.outstanding()
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }
}

impl PoolShared {
    #[inline]
    fn put(&self, data: &mut BytesMut) {
        let mut slots = self.slots.lock();
        slots.outstanding = slots.outstanding.saturating_sub(1);
        // Only keep storage if the free list isn't too large (prevent unbounded growth)
        if slots.free.len() < self.capacity * 2 {
            data.resize(self.buffer_size, 0);
            slots.free.push(std::mem::take(data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = BufferPool::new(16, 2);

        let a = pool.try_acquire();
        let b = pool.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_returns_slot() {
        let pool = BufferPool::new(16, 1);

        let mut buffer = pool.try_acquire().unwrap();
        assert_eq!(buffer.size().unwrap(), 16);
        assert!(pool.try_acquire().is_none());

        buffer.release();
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_borrowed_view_does_not_hold_slot() {
        let pool = BufferPool::new(8, 1);

        let owner = pool.try_acquire().unwrap();
        let view = FrameBuffer::borrowed(&owner.native().unwrap());
        drop(owner);

        assert_eq!(pool.outstanding(), 0);
        assert!(view.native().is_err());
    }
}
