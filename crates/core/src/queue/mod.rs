//! Fixed-capacity hand-off between the audio producer and the analysis
//! consumer.
//!
//! Pushing never blocks: when the queue is full the oldest block is evicted
//! and counted as an overrun. Popping blocks until a block arrives or the
//! queue is closed.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::SampleBlock;

/// Successful push result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// The oldest queued item was discarded to make room.
    EvictedOldest,
}

/// Returned by [`BoundedFrameQueue::push`] once the queue no longer accepts
/// items. Carries the rejected item back to the caller.
#[derive(PartialEq, Eq)]
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("push on a closed queue")
    }
}

/// Outcome of [`BoundedFrameQueue::pop_timeout`].
#[derive(Debug, PartialEq)]
pub enum Popped<T> {
    Item(T),
    TimedOut,
    Closed,
}

/// Counters describing the queue's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub overruns: u64,
    pub discarded_on_close: u64,
    pub len: usize,
    pub high_water: usize,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    /// No further pushes; queued items are still delivered.
    finished: bool,
    /// No further pushes or pops.
    closed: bool,
    stats: QueueStats,
}

/// Bounded multi-producer queue with a drop-oldest overflow policy.
pub struct BoundedFrameQueue<T = SampleBlock> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> BoundedFrameQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                finished: false,
                closed: false,
                stats: QueueStats::default(),
            }),
            ready: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts `item`, evicting the oldest queued item when full.
    pub fn push(&self, item: T) -> Result<Pushed, QueueClosed<T>> {
        let (outcome, overruns) = {
            let mut inner = self.lock();
            if inner.closed || inner.finished {
                return Err(QueueClosed(item));
            }

            let outcome = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.stats.overruns += 1;
                Pushed::EvictedOldest
            } else {
                Pushed::Queued
            };

            inner.items.push_back(item);
            inner.stats.pushed += 1;
            inner.stats.high_water = inner.stats.high_water.max(inner.items.len());
            (outcome, inner.stats.overruns)
        };

        self.ready.notify_one();

        if outcome == Pushed::EvictedOldest && (overruns == 1 || overruns % 100 == 0) {
            tracing::warn!(overruns, "consumer fell behind, dropped oldest block");
        }
        Ok(outcome)
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// closed, or finished and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                inner.stats.popped += 1;
                return Some(item);
            }
            if inner.finished {
                return None;
            }
            inner = self
                .ready
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Popped<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return Popped::Closed;
            }
            if let Some(item) = inner.items.pop_front() {
                inner.stats.popped += 1;
                return Popped::Item(item);
            }
            if inner.finished {
                return Popped::Closed;
            }

            let now = Instant::now();
            if now >= deadline {
                return Popped::TimedOut;
            }
            inner = self
                .ready
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Shuts the queue down. Blocked and future pops return immediately and
    /// anything still queued is discarded. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if !inner.closed {
                let discarded = inner.items.len() as u64;
                inner.items.clear();
                inner.stats.discarded_on_close += discarded;
                inner.closed = true;
            }
        }
        self.ready.notify_all();
    }

    /// Marks the end of the stream. Queued items are still delivered, after
    /// which pops report the queue as closed. Idempotent.
    pub fn finish(&self) {
        self.lock().finished = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overruns(&self) -> u64 {
        self.lock().stats.overruns
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            len: inner.items.len(),
            ..inner.stats
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for BoundedFrameQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedFrameQueue")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
