//! A bounded, single-consumer async queue with an explicit drop-oldest
//! overflow policy.
//!
//! `tokio::sync::mpsc` only gives you drop-current behavior on a full bounded
//! channel (a failed `try_send` simply discards the item you were trying to
//! push). The camera ingest path needs the opposite: a full queue must evict
//! its oldest entry to make room for the newest NAL unit, because stalling
//! the camera's stdout pipe is worse than losing an old frame. This type is
//! the non-blocking-producer primitive that makes that policy explicit,
//! rather than reimplementing it ad hoc at each call site.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Notify;

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

/// Producer handle. Cloneable; pushes never block.
pub struct DropOldestSender<T> {
    inner: Arc<Inner<T>>,
}

/// Single-consumer handle.
pub struct DropOldestReceiver<T> {
    inner: Arc<Inner<T>>,
}

pub fn channel<T>(capacity: usize) -> (DropOldestSender<T>, DropOldestReceiver<T>) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        capacity,
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
        closed: std::sync::atomic::AtomicBool::new(false),
    });
    (
        DropOldestSender { inner: inner.clone() },
        DropOldestReceiver { inner },
    )
}

impl<T> Clone for DropOldestSender<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DropOldestSender<T> {
    /// Pushes a value. If the queue is at capacity, the oldest queued value
    /// is dropped to make room. Returns `true` if a drop occurred.
    pub fn push(&self, value: T) -> bool {
        let mut dropped = false;
        {
            let mut q = self.inner.queue.lock().unwrap();
            if q.len() >= self.inner.capacity {
                q.pop_front();
                dropped = true;
            }
            q.push_back(value);
        }
        if dropped {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.notify.notify_one();
        dropped
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }
}

impl<T> DropOldestReceiver<T> {
    /// Waits for and returns the next value, or `None` once the sender side
    /// has been closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(v) = self.inner.queue.lock().unwrap().pop_front() {
                return Some(v);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_and_recv_in_order() {
        let (tx, mut rx) = channel::<u32>(4);
        tx.push(1);
        tx.push(2);
        tx.push(3);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_not_newest() {
        let (tx, mut rx) = channel::<u32>(2);
        tx.push(1);
        tx.push(2);
        let dropped = tx.push(3); // queue full, should drop `1`
        assert!(dropped);
        assert_eq!(tx.dropped_count(), 1);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn close_drains_then_ends_stream() {
        let (tx, mut rx) = channel::<u32>(4);
        tx.push(1);
        tx.close();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }
}
