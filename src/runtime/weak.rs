//! Weak references used for back-edge fields. A weak reference never keeps
//! its target alive and reads as absent once the target is released.

use super::heap::{Heap, ObjId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakId(usize);

#[derive(Debug, Clone, PartialEq)]
struct WeakRef {
    target: ObjId,
    alive: bool,
}

#[derive(Debug, Default)]
pub struct WeakTable {
    refs: Vec<Option<WeakRef>>,
}

impl WeakTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mk_weak_ref(&mut self, target: ObjId) -> WeakId {
        self.refs.push(Some(WeakRef { target, alive: true }));
        WeakId(self.refs.len() - 1)
    }

    pub fn deref_weak(&self, weak: WeakId) -> Option<ObjId> {
        self.refs
            .get(weak.0)
            .and_then(Option::as_ref)
            .filter(|r| r.alive)
            .map(|r| r.target)
    }

    pub fn invalidate_weak(&mut self, weak: WeakId) {
        if let Some(Some(r)) = self.refs.get_mut(weak.0) {
            r.alive = false;
        }
    }

    /// Invalidate every reference pointing at `target`
    pub fn invalidate_target(&mut self, target: ObjId) -> usize {
        let mut count = 0;
        for r in self.refs.iter_mut().flatten() {
            if r.target == target && r.alive {
                r.alive = false;
                count += 1;
            }
        }
        count
    }

    /// Strong release of `obj` that also invalidates weak references to
    /// every cell it frees.
    pub fn release_strong(&mut self, heap: &mut Heap, obj: ObjId) -> usize {
        let released = heap.dec_ref(obj);
        for &cell in &released {
            self.invalidate_target(cell);
        }
        released.len()
    }

    pub fn live_count(&self) -> usize {
        self.refs.iter().flatten().filter(|r| r.alive).count()
    }

    /// Drop invalidated entries at shutdown. Returns how many were removed.
    pub fn cleanup_weak_refs(&mut self) -> usize {
        let mut removed = 0;
        for slot in &mut self.refs {
            if slot.as_ref().is_some_and(|r| !r.alive) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }
}
