use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// What `push` does when a bounded queue is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Discard the incoming item and return immediately.
    DropNewest,
    /// Wait until a consumer makes room (or the queue is closed).
    Block,
}

/// Mutex-guarded FIFO with a single wake signal, shared by the control loop,
/// the work queue worker and the playback path.
///
/// Every mutation notifies all waiters; waiters re-check their own condition.
pub struct SignalQueue<T> {
    inner: Mutex<Inner<T>>,
    changed: Condvar,
    capacity: Option<usize>,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> SignalQueue<T> {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            changed: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Appends `item`. Returns false when the item was not enqueued, either
    /// because the queue is full under `DropNewest` or because it was closed.
    pub fn push(&self, item: T, overflow: Overflow) -> bool {
        let mut inner = self.inner.lock();
        if let Some(capacity) = self.capacity {
            match overflow {
                Overflow::DropNewest => {
                    if inner.items.len() >= capacity {
                        return false;
                    }
                }
                Overflow::Block => {
                    while inner.items.len() >= capacity && !inner.closed {
                        self.changed.wait(&mut inner);
                    }
                }
            }
        }
        if inner.closed {
            return false;
        }
        inner.items.push_back(item);
        self.changed.notify_all();
        true
    }

    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        if item.is_some() {
            self.changed.notify_all();
        }
        item
    }

    /// Waits up to `timeout` for an item to become available.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() && !inner.closed {
            let _ = self.changed.wait_for(&mut inner, timeout);
        }
        let item = inner.items.pop_front();
        if item.is_some() {
            self.changed.notify_all();
        }
        item
    }

    /// Swaps out everything currently queued without waiting.
    pub fn take_all(&self) -> VecDeque<T> {
        let mut inner = self.inner.lock();
        let items = std::mem::take(&mut inner.items);
        if !items.is_empty() {
            self.changed.notify_all();
        }
        items
    }

    /// Blocks until at least one item is queued, then swaps out the whole
    /// batch. Returns `None` once the queue is closed and drained.
    pub fn wait_take_all(&self) -> Option<VecDeque<T>> {
        let mut inner = self.inner.lock();
        while inner.items.is_empty() {
            if inner.closed {
                return None;
            }
            self.changed.wait(&mut inner);
        }
        let items = std::mem::take(&mut inner.items);
        self.changed.notify_all();
        Some(items)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn wait_until_empty(&self) {
        let mut inner = self.inner.lock();
        while !inner.items.is_empty() && !inner.closed {
            self.changed.wait(&mut inner);
        }
    }

    /// Wakes every waiter; later pushes are refused, queued items can still be taken.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
