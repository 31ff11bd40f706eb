// Fixed-width array of atomic counters
//
// Counters are addressed by index; each component defines its own index
// constants. Out-of-range indexes are ignored rather than panicking so a
// stale index cannot take down a worker.

use std::sync::atomic::{AtomicI64, Ordering};

pub struct Stats {
    slots: Vec<AtomicI64>,
}

impl Stats {
    pub fn new(n: usize) -> Self {
        let mut slots = Vec::with_capacity(n);
        slots.resize_with(n, || AtomicI64::new(0));
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, i: usize) -> i64 {
        match self.slots.get(i) {
            Some(v) => v.load(Ordering::Relaxed),
            None => 0,
        }
    }

    pub fn set(&self, i: usize, v: i64) {
        if let Some(slot) = self.slots.get(i) {
            slot.store(v, Ordering::Relaxed);
        }
    }

    pub fn add(&self, i: usize, delta: i64) -> i64 {
        match self.slots.get(i) {
            Some(slot) => slot.fetch_add(delta, Ordering::Relaxed) + delta,
            None => 0,
        }
    }

    /// Snapshot of every counter.
    pub fn snapshot(&self) -> Vec<i64> {
        self.slots
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect()
    }
}

impl Clone for Stats {
    fn clone(&self) -> Self {
        let slots = self
            .snapshot()
            .into_iter()
            .map(AtomicI64::new)
            .collect();
        Self { slots }
    }
}
