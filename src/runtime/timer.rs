// Timer bookkeeping for the scheduler heap.

use super::runner::Runner;
use std::cmp::Ordering;
use std::sync::Arc;

/// A registered timer. `repeat` is negative for infinite repetition, zero
/// for one-shot, positive for a finite number of remaining firings.
pub struct TimerNode {
    pub expire_at: i64,
    pub interval: i32,
    pub repeat: i32,
    pub id: u32,
    pub runner: Arc<dyn Runner>,
}

/// Heap entry ordered by ascending absolute expire time. The heap is
/// lazily pruned: an entry whose `(id, expire_at)` no longer matches the
/// live timer map is stale and skipped on pop.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeapEntry {
    pub expire_at: i64,
    pub id: u32,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so that std's max-heap pops the earliest deadline first.
        other
            .expire_at
            .cmp(&self.expire_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn heap_pops_earliest_first() {
        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry { expire_at: 30, id: 1 });
        heap.push(HeapEntry { expire_at: 10, id: 2 });
        heap.push(HeapEntry { expire_at: 20, id: 3 });
        let order: Vec<u32> = std::iter::from_fn(|| heap.pop()).map(|e| e.id).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn ties_break_by_id() {
        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry { expire_at: 10, id: 7 });
        heap.push(HeapEntry { expire_at: 10, id: 3 });
        assert_eq!(heap.pop().unwrap().id, 3);
    }
}
