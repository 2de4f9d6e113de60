//! Bounded priority queue feeding the worker pool.
//!
//! Ordering is priority-descending with FIFO sequence numbers breaking ties,
//! so equal-priority events dispatch in enqueue order. `push` never blocks:
//! a full queue is an error the publisher turns into a `false` return.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::protocol::Event;

#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

struct QueuedEvent {
    priority: i32,
    seq: u64,
    event: Event,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<QueuedEvent>,
    next_seq: u64,
    closed: bool,
}

pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueues without blocking. Overflow is drop-newest.
    pub fn push(&self, event: Event, priority: i32) -> Result<(), PushError> {
        let mut inner = self.inner.lock().expect("event queue lock poisoned");
        if inner.closed {
            return Err(PushError::Closed);
        }
        if inner.heap.len() >= self.capacity {
            return Err(PushError::Full);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedEvent {
            priority,
            seq,
            event,
        });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Pops the highest-priority event, waiting up to `wait`.
    ///
    /// Returns `None` on timeout or once the queue is closed and drained.
    pub async fn pop(&self, wait: Duration) -> Option<Event> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut inner = self.inner.lock().expect("event queue lock poisoned");
                if let Some(queued) = inner.heap.pop() {
                    return Some(queued.event);
                }
                if inner.closed {
                    return None;
                }
            }
            if timeout_at(deadline, self.notify.notified()).await.is_err() {
                return None;
            }
        }
    }

    /// Non-blocking pop, used when draining.
    pub fn try_pop(&self) -> Option<Event> {
        let mut inner = self.inner.lock().expect("event queue lock poisoned");
        inner.heap.pop().map(|queued| queued.event)
    }

    /// Marks the queue closed and wakes every waiter.
    pub fn close(&self) {
        self.inner.lock().expect("event queue lock poisoned").closed = true;
        self.notify.notify_waiters();
    }

    /// Reopens a closed queue (start after stop).
    pub fn reopen(&self) {
        self.inner.lock().expect("event queue lock poisoned").closed = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue lock poisoned").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
