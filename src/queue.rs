// =============================================================================
// Bounded Queues — backpressure-first plumbing between pipeline stages
// =============================================================================
//
// Both pipeline queues are bounded: a full InQueue turns into an HTTP 503 at
// the ingress rather than unbounded memory growth. `try_reserve` hands out a
// slot BEFORE the caller persists anything, so a backpressured submission
// leaves no trace in the store.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Duration;

/// The queue is at capacity; the item was not enqueued.
#[derive(Debug)]
pub struct QueueFull;

/// A bounded MPMC-style queue: many producers via the cloned handle, many
/// consumers sharing the receiver behind an async mutex. FIFO.
pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            depth: self.depth.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Reserve a slot without enqueueing yet. Fails immediately when full.
    pub fn try_reserve(&self) -> Result<QueueSlot<T>, QueueFull> {
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(QueueSlot {
                permit,
                depth: self.depth.clone(),
            }),
            Err(_) => Err(QueueFull),
        }
    }

    /// Enqueue immediately or fail when full.
    pub fn try_push(&self, item: T) -> Result<(), QueueFull> {
        let slot = self.try_reserve()?;
        slot.send(item);
        Ok(())
    }

    /// Enqueue, waiting up to `timeout` for space.
    pub async fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueFull> {
        match self.tx.send_timeout(item, timeout).await {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => Err(QueueFull),
        }
    }

    /// Take the next item, waiting while the queue is empty. Returns `None`
    /// only when the queue is closed.
    pub async fn pop(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        let item = rx.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }
}

/// A reserved queue slot; consuming it enqueues without ever blocking.
pub struct QueueSlot<T> {
    permit: mpsc::OwnedPermit<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> QueueSlot<T> {
    pub fn send(self, item: T) {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.permit.send(item);
    }
}

// =============================================================================
// Tests
// =============================================================================
