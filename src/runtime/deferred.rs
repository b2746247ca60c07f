//! Deferred release with bounded work per safe point.
//!
//! Decrements are queued per object and coalesced: deferring an object that
//! is already queued bumps its pending count instead of adding an entry.

use super::heap::{Heap, ObjId};
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct DeferredQueue {
    order: VecDeque<ObjId>,
    pending: HashMap<ObjId, usize>,
    batch_size: usize,
    /// Distinct objects ever queued
    total_deferred: usize,
}

impl DeferredQueue {
    pub fn new(batch_size: usize) -> Self {
        DeferredQueue {
            order: VecDeque::new(),
            pending: HashMap::new(),
            batch_size: batch_size.max(1),
            total_deferred: 0,
        }
    }

    pub fn deferred_release(&mut self, obj: ObjId) {
        match self.pending.get_mut(&obj) {
            Some(count) => *count += 1,
            None => {
                self.pending.insert(obj, 1);
                self.order.push_back(obj);
                self.total_deferred += 1;
            }
        }
    }

    /// Queued entries
    pub fn pending_count(&self) -> usize {
        self.order.len()
    }

    /// Decrements still to apply across all entries
    pub fn pending_decrements(&self) -> usize {
        self.pending.values().sum()
    }

    pub fn total_deferred(&self) -> usize {
        self.total_deferred
    }

    /// Apply at most `batch_size` decrements, oldest entry first. Returns
    /// the number applied.
    pub fn safe_point(&mut self, heap: &mut Heap) -> usize {
        let mut applied = 0;
        while applied < self.batch_size {
            let Some(&obj) = self.order.front() else {
                break;
            };
            heap.dec_ref(obj);
            applied += 1;
            let remaining = self.pending.get_mut(&obj).map(|count| {
                *count -= 1;
                *count
            });
            if remaining.unwrap_or(0) == 0 {
                self.pending.remove(&obj);
                self.order.pop_front();
            }
        }
        tracing::trace!(applied, left = self.order.len(), "deferred safe point");
        applied
    }

    /// Drain the queue completely; only done at shutdown.
    pub fn flush_deferred(&mut self, heap: &mut Heap) -> usize {
        let mut applied = 0;
        while !self.order.is_empty() {
            applied += self.safe_point(heap);
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalescing_preserves_decrements() {
        let mut heap = Heap::new(0);
        let a = heap.mk_int(1);
        heap.inc_ref(a);
        heap.inc_ref(a);
        let b = heap.mk_int(2);
        let mut queue = DeferredQueue::new(32);
        for obj in [a, a, b, a] {
            queue.deferred_release(obj);
        }
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.pending_decrements(), 4);
        assert_eq!(queue.total_deferred(), 2);

        let total = queue.total_deferred();
        assert_eq!(queue.flush_deferred(&mut heap), 4);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.total_deferred(), total);
        assert!(!heap.is_live(a) && !heap.is_live(b));
    }

    #[test]
    fn test_repeated_defers_are_idempotent_in_total() {
        let mut heap = Heap::new(0);
        let a = heap.mk_int(1);
        let mut queue = DeferredQueue::new(4);
        queue.deferred_release(a);
        let once = queue.total_deferred();
        queue.deferred_release(a);
        queue.deferred_release(a);
        assert_eq!(queue.total_deferred(), once);
    }

    #[test]
    fn test_safe_point_work_is_bounded() {
        let mut heap = Heap::new(0);
        let mut queue = DeferredQueue::new(3);
        let objs: Vec<ObjId> = (0..10).map(|i| heap.mk_int(i)).collect();
        for &obj in &objs {
            queue.deferred_release(obj);
        }
        assert_eq!(queue.safe_point(&mut heap), 3);
        assert_eq!(queue.pending_count(), 7);
        assert_eq!(heap.live_count(), 7);
        assert_eq!(queue.flush_deferred(&mut heap), 7);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_cascade_at_zero() {
        let mut heap = Heap::new(0);
        let head = heap.mk_int(1);
        let pair = heap.mk_pair(Some(head), None);
        let mut queue = DeferredQueue::new(1);
        queue.deferred_release(pair);
        assert_eq!(queue.safe_point(&mut heap), 1);
        assert!(!heap.is_live(pair));
        assert!(!heap.is_live(head));
    }
}
