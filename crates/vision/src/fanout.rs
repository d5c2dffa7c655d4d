//! Single-slot, latest-wins mailbox between one producer and one consumer.
//!
//! Publishing never blocks: a frame that has not been consumed yet is
//! replaced by the newer one. Consumers therefore never see a backlog, only
//! the most recent item produced before they asked.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// Counters describing how a buffer was used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub published: u64,
    pub dropped: u64,
    pub consumed: u64,
}

/// Outcome of a bounded wait on a [`FanoutBuffer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
    Item(T),
    Closed,
    TimedOut,
}

struct Slot<T> {
    pending: Option<T>,
    closed: bool,
    stats: FanoutStats,
}

pub struct FanoutBuffer<T> {
    label: &'static str,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> FanoutBuffer<T> {
    /// `label` names the buffer in metrics (`display`, `analysis`).
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            slot: Mutex::new(Slot {
                pending: None,
                closed: false,
                stats: FanoutStats::default(),
            }),
            ready: Condvar::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // A panic while holding the lock cannot leave the slot half-written.
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offer a new item, replacing any unconsumed one.
    ///
    /// Returns `false` when the buffer is closed; the item is dropped silently.
    pub fn publish(&self, item: T) -> bool {
        let mut slot = self.lock();
        if slot.closed {
            return false;
        }
        if slot.pending.replace(item).is_some() {
            slot.stats.dropped += 1;
            metrics::counter!("vision_frames_dropped_total", "buffer" => self.label).increment(1);
        }
        slot.stats.published += 1;
        drop(slot);
        metrics::counter!("vision_frames_published_total", "buffer" => self.label).increment(1);
        self.ready.notify_one();
        true
    }

    /// Block until an item is available. `None` signals end-of-stream.
    pub fn consume(&self) -> Option<T> {
        let mut slot = self.lock();
        loop {
            if slot.closed {
                return None;
            }
            if let Some(item) = slot.pending.take() {
                slot.stats.consumed += 1;
                return Some(item);
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`consume`](Self::consume) but gives up after `timeout`.
    pub fn consume_timeout(&self, timeout: Duration) -> Received<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if slot.closed {
                return Received::Closed;
            }
            if let Some(item) = slot.pending.take() {
                slot.stats.consumed += 1;
                return Received::Item(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return Received::TimedOut;
            }
            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Take the pending item without waiting.
    pub fn try_consume(&self) -> Option<T> {
        let mut slot = self.lock();
        if slot.closed {
            return None;
        }
        let item = slot.pending.take();
        if item.is_some() {
            slot.stats.consumed += 1;
        }
        item
    }

    /// Discard the pending item, if any, without closing.
    pub fn clear(&self) {
        let mut slot = self.lock();
        if slot.pending.take().is_some() {
            slot.stats.dropped += 1;
        }
    }

    /// Close the buffer and wake the consumer. Idempotent.
    pub fn close(&self) {
        let mut slot = self.lock();
        if slot.closed {
            return;
        }
        slot.closed = true;
        slot.pending = None;
        drop(slot);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> FanoutStats {
        self.lock().stats
    }
}
