//! # Request Queue
//!
//! Thread-safe FIFO used on the receiver between the read loop (producer)
//! and the back-channel request thread (consumer), and for handing
//! application-bound product events out of batched notifiers.
//!
//! The consumer discipline is peek-then-remove: the request thread peeks
//! the head, attempts the TCP send, and only removes the entry once the
//! send succeeded, so a transient back-channel failure never loses a
//! retransmission request.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::error::{Result, TransportError};

struct Inner<T> {
    items: VecDeque<T>,
    cancelled: bool,
}

/// Cancellable mutex+condvar FIFO.
pub struct RequestQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestQueue<T> {
    pub fn new() -> Self {
        RequestQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                cancelled: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append an entry. Fails with `Cancelled` after [`cancel`](Self::cancel).
    pub fn add(&self, item: T) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.cancelled {
            return Err(TransportError::Cancelled);
        }
        inner.items.push_back(item);
        self.available.notify_one();
        Ok(())
    }

    /// Remove and return the head without blocking.
    pub fn remove_no_wait(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.pop_front()
    }

    /// Drop every queued entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.clear();
    }

    /// Number of queued entries.
    pub fn count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.len()
    }

    /// Wake every waiter and fail all future blocking operations.
    /// Already-enqueued entries stay retrievable through the non-blocking
    /// operations.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cancelled = true;
        self.available.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cancelled
    }
}

impl<T: Clone> RequestQueue<T> {
    /// Return a copy of the head entry, blocking until one exists or the
    /// queue is cancelled.
    pub fn peek_wait(&self) -> Result<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if inner.cancelled {
                return Err(TransportError::Cancelled);
            }
            if let Some(head) = inner.items.front() {
                return Ok(head.clone());
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Return a copy of the head entry without blocking.
    pub fn peek_no_wait(&self) -> Option<T> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.front().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn fifo_order() {
        let q = RequestQueue::new();
        for i in 0..5 {
            q.add(i).unwrap();
        }
        assert_eq!(q.count(), 5);
        for i in 0..5 {
            assert_eq!(q.peek_no_wait(), Some(i));
            assert_eq!(q.remove_no_wait(), Some(i));
        }
        assert_eq!(q.remove_no_wait(), None);
    }

    #[test]
    fn peek_does_not_remove() {
        let q = RequestQueue::new();
        q.add(7u32).unwrap();
        assert_eq!(q.peek_wait().unwrap(), 7);
        assert_eq!(q.peek_wait().unwrap(), 7);
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn peek_wait_blocks_until_add() {
        let q = Arc::new(RequestQueue::new());
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                q.add(42u32).unwrap();
            })
        };
        let start = Instant::now();
        assert_eq!(q.peek_wait().unwrap(), 42);
        assert!(start.elapsed() >= Duration::from_millis(40));
        producer.join().unwrap();
    }

    #[test]
    fn cancel_wakes_blocked_waiter() {
        let q: Arc<RequestQueue<u32>> = Arc::new(RequestQueue::new());
        let waiter = {
            let q = q.clone();
            std::thread::spawn(move || q.peek_wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        q.cancel();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(TransportError::Cancelled)
        ));
    }

    #[test]
    fn cancelled_queue_rejects_add_but_drains() {
        let q = RequestQueue::new();
        q.add(1u32).unwrap();
        q.cancel();
        assert!(matches!(q.add(2), Err(TransportError::Cancelled)));
        assert!(matches!(q.peek_wait(), Err(TransportError::Cancelled)));
        // Existing entries remain reachable via the non-blocking ops.
        assert_eq!(q.peek_no_wait(), Some(1));
        assert_eq!(q.remove_no_wait(), Some(1));
        assert_eq!(q.remove_no_wait(), None);
    }

    #[test]
    fn clear_empties_queue() {
        let q = RequestQueue::new();
        q.add(1u32).unwrap();
        q.add(2).unwrap();
        q.clear();
        assert_eq!(q.count(), 0);
        assert!(!q.is_cancelled());
    }
}
