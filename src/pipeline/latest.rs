//! Single-slot, overwrite-on-full hand-off between pipeline stages

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;

/// Holds at most one pending item; the newest `put` always wins.
///
/// Neither side ever blocks: a slow consumer simply misses intermediate
/// values, which keeps memory bounded and the producer on its own cadence.
pub struct LatestValueChannel<T> {
    slot: ArrayQueue<T>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    written: AtomicUsize,
    read: AtomicUsize,
    overwritten: AtomicUsize,
}

impl<T> LatestValueChannel<T> {
    pub fn new() -> Self {
        Self {
            slot: ArrayQueue::new(1),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: store `item`, discarding any unread value.
    pub fn put(&self, item: T) {
        if self.slot.force_push(item).is_some() {
            self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.written.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: take the pending item, if any.
    pub fn try_get(&self) -> Option<T> {
        let item = self.slot.pop()?;
        self.stats.read.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_empty()
    }

    /// (written, read, overwritten)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.written.load(Ordering::Relaxed),
            self.stats.read.load(Ordering::Relaxed),
            self.stats.overwritten.load(Ordering::Relaxed),
        )
    }
}

impl<T: Send + 'static> LatestValueChannel<T> {
    /// Non-blocking accessor closure over the consumer side.
    pub fn reader(self: &Arc<Self>) -> Arc<dyn Fn() -> Option<T> + Send + Sync> {
        let channel = Arc::clone(self);
        Arc::new(move || channel.try_get())
    }

    /// Non-blocking sink closure over the producer side.
    pub fn writer(self: &Arc<Self>) -> Arc<dyn Fn(T) + Send + Sync> {
        let channel = Arc::clone(self);
        Arc::new(move |item| channel.put(item))
    }
}

impl<T> Default for LatestValueChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}
