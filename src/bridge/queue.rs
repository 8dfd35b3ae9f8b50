//! Fixed-capacity hand-off queue between the egress thread and the consumer
//!
//! Classic bounded-buffer signalling: `push` signals `filled`, `pop`
//! signals `space_available`. Blocking pushes re-check their predicate
//! every poll interval so that drain mode is observed even when nobody
//! signals it explicitly.
//!
//! The queue is meant for exactly one producer and one consumer. The
//! internal mutex keeps it memory safe with more, but ordering and
//! capacity guarantees are only given for the single-producer,
//! single-consumer case.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default interval at which blocked producers re-check drain mode
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded single-producer/single-consumer queue with drain mode
pub struct BoundedFrameQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    filled: Condvar,
    space_available: Condvar,
    draining: AtomicBool,
    poll_interval: Duration,
}

impl<T> BoundedFrameQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self::with_poll_interval(capacity, DEFAULT_POLL_INTERVAL)
    }

    /// Create a queue with a custom blocking-push poll interval
    pub fn with_poll_interval(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            filled: Condvar::new(),
            space_available: Condvar::new(),
            draining: AtomicBool::new(false),
            poll_interval,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop every queued item
    pub fn clear(&self) {
        self.items.lock().clear();
        self.space_available.notify_all();
    }

    /// Enable or disable drain mode
    ///
    /// While enabled, blocking pushes give up and hand their item back.
    pub fn set_drain_mode(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
        if draining {
            // Lock briefly to synchronize with producers about to wait
            let _guard = self.items.lock();
            self.space_available.notify_all();
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Insert without waiting, handing the item back if the queue is full
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.filled.notify_one();
        Ok(())
    }

    /// Wait for a free slot and insert
    ///
    /// Hands the item back without inserting if drain mode is enabled,
    /// either before the call or while waiting.
    pub fn push_blocking(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items.lock();
            while items.len() >= self.capacity && !self.is_draining() {
                self.space_available
                    .wait_for(&mut items, self.poll_interval);
            }
            if self.is_draining() {
                return Err(item);
            }
            items.push_back(item);
        }
        self.filled.notify_one();
        Ok(())
    }

    /// Block until an item is available and take it
    pub fn pop(&self) -> T {
        let mut guard = self.lock();
        loop {
            guard.wait_filled();
            if let Some(item) = guard.pop_front() {
                return item;
            }
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.lock();
        guard.wait_filled_for(timeout);
        guard.pop_front()
    }

    /// Take the queue lock
    ///
    /// Lets callers combine waiting on the filled condition with their own
    /// predicates before popping.
    pub fn lock(&self) -> QueueGuard<'_, T> {
        QueueGuard {
            queue: self,
            items: self.items.lock(),
        }
    }
}

/// Externally-held lock on a [`BoundedFrameQueue`]
pub struct QueueGuard<'a, T> {
    queue: &'a BoundedFrameQueue<T>,
    items: MutexGuard<'a, VecDeque<T>>,
}

impl<T> QueueGuard<'_, T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Take the front item without waiting
    pub fn pop_front(&mut self) -> Option<T> {
        let item = self.items.pop_front();
        if item.is_some() {
            self.queue.space_available.notify_one();
        }
        item
    }

    /// Release the lock until a push signals the filled condition
    ///
    /// Returns immediately if the queue is not empty.
    pub fn wait_filled(&mut self) {
        while self.items.is_empty() {
            self.queue.filled.wait(&mut self.items);
        }
    }

    /// Like [`wait_filled`](Self::wait_filled) with a deadline
    ///
    /// Returns `false` if the queue is still empty after `timeout`.
    pub fn wait_filled_for(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.items.is_empty() {
            if self
                .queue
                .filled
                .wait_until(&mut self.items, deadline)
                .timed_out()
            {
                return !self.items.is_empty();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedFrameQueue::new(3);
        for i in 0..3 {
            assert!(queue.try_push(i).is_ok());
        }
        assert_eq!(queue.pop(), 0);
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.pop(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_try_push_full_returns_item() {
        let queue = BoundedFrameQueue::new(1);
        assert!(queue.try_push("a").is_ok());
        assert_eq!(queue.try_push("b"), Err("b"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_blocking_push_waits_for_pop() {
        let queue = Arc::new(BoundedFrameQueue::new(1));
        queue.try_push(1).unwrap();

        let producer_queue = queue.clone();
        let producer = thread::spawn(move || producer_queue.push_blocking(2));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), 1);

        assert!(producer.join().unwrap().is_ok());
        assert_eq!(queue.pop(), 2);
    }

    #[test]
    fn test_drain_mode_aborts_blocked_push() {
        let poll = Duration::from_millis(100);
        let queue = Arc::new(BoundedFrameQueue::with_poll_interval(1, poll));
        queue.try_push(0).unwrap();

        let producer_queue = queue.clone();
        let producer = thread::spawn(move || {
            let result = producer_queue.push_blocking(1);
            (result, Instant::now())
        });

        thread::sleep(Duration::from_millis(30));
        let drained_at = Instant::now();
        queue.set_drain_mode(true);

        let (result, returned_at) = producer.join().unwrap();
        assert_eq!(result, Err(1));
        assert!(returned_at.duration_since(drained_at) <= poll);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_mode_rejects_future_blocking_push() {
        let queue = BoundedFrameQueue::new(2);
        queue.set_drain_mode(true);
        assert_eq!(queue.push_blocking(5), Err(5));

        queue.set_drain_mode(false);
        assert!(queue.push_blocking(5).is_ok());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(BoundedFrameQueue::new(2));
        let consumer_queue = queue.clone();
        let consumer = thread::spawn(move || consumer_queue.pop());

        thread::sleep(Duration::from_millis(30));
        queue.try_push(7).unwrap();
        assert_eq!(consumer.join().unwrap(), 7);
    }

    #[test]
    fn test_pop_timeout_on_empty_queue() {
        let queue = BoundedFrameQueue::<u8>::new(1);
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn test_external_lock_wait() {
        let queue = Arc::new(BoundedFrameQueue::new(2));
        let producer_queue = queue.clone();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer_queue.try_push(3).unwrap();
        });

        let mut guard = queue.lock();
        assert!(guard.wait_filled_for(Duration::from_secs(2)));
        assert_eq!(guard.len(), 1);
        assert_eq!(guard.pop_front(), Some(3));
        assert!(guard.is_empty());
        drop(guard);

        producer.join().unwrap();
    }
}
