//! Cell heap with a stack pool, a pending-free list and Perceus reuse.
//!
//! Cells are addressed by index. Slots `0..pool_size` form the stack pool:
//! cells there are bump-allocated and every release routine skips them.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(usize);

impl ObjId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjKind {
    Int(i64),
    Pair(Option<ObjId>, Option<ObjId>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Obj {
    pub rc: u32,
    /// Component id once frozen, -1 otherwise
    pub scc_id: i64,
    pub mark: bool,
    pub kind: ObjKind,
}

impl Obj {
    fn new(kind: ObjKind) -> Self {
        Obj {
            rc: 1,
            scc_id: -1,
            mark: false,
            kind,
        }
    }

    pub fn is_pair(&self) -> bool {
        matches!(self.kind, ObjKind::Pair(..))
    }

    pub fn children(&self) -> impl Iterator<Item = ObjId> + '_ {
        let (a, b) = match self.kind {
            ObjKind::Pair(a, b) => (a, b),
            ObjKind::Int(_) => (None, None),
        };
        a.into_iter().chain(b)
    }
}

#[derive(Debug, Default)]
pub struct Heap {
    cells: Vec<Option<Obj>>,
    pool_size: usize,
    pool_top: usize,
    recycled: Vec<usize>,
    /// Pending frees, drained last-in first-out
    freelist: Vec<ObjId>,
    freed: usize,
}

impl Heap {
    pub fn new(pool_size: usize) -> Self {
        Heap {
            cells: vec![None; pool_size],
            pool_size,
            ..Heap::default()
        }
    }

    fn alloc(&mut self, obj: Obj) -> ObjId {
        match self.recycled.pop() {
            Some(slot) => {
                self.cells[slot] = Some(obj);
                ObjId(slot)
            }
            None => {
                self.cells.push(Some(obj));
                ObjId(self.cells.len() - 1)
            }
        }
    }

    pub fn mk_int(&mut self, value: i64) -> ObjId {
        self.alloc(Obj::new(ObjKind::Int(value)))
    }

    /// Takes over the caller's references to `head` and `tail`
    pub fn mk_pair(&mut self, head: Option<ObjId>, tail: Option<ObjId>) -> ObjId {
        self.alloc(Obj::new(ObjKind::Pair(head, tail)))
    }

    /// Allocate from the stack pool, or from the heap once the pool is full
    pub fn mk_int_stack(&mut self, value: i64) -> ObjId {
        if self.pool_top < self.pool_size {
            let slot = self.pool_top;
            self.pool_top += 1;
            self.cells[slot] = Some(Obj::new(ObjKind::Int(value)));
            return ObjId(slot);
        }
        tracing::trace!("stack pool exhausted, allocating on the heap");
        self.mk_int(value)
    }

    /// Membership test for the stack pool region
    pub fn in_stack_pool(&self, id: ObjId) -> bool {
        id.0 < self.pool_size
    }

    pub fn pool_used(&self) -> usize {
        self.pool_top
    }

    pub fn get(&self, id: ObjId) -> Option<&Obj> {
        self.cells.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut Obj> {
        self.cells.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn is_live(&self, id: ObjId) -> bool {
        self.get(id).is_some()
    }

    pub fn rc(&self, id: ObjId) -> Option<u32> {
        self.get(id).map(|obj| obj.rc)
    }

    pub fn int_value(&self, id: ObjId) -> Option<i64> {
        match self.get(id)?.kind {
            ObjKind::Int(value) => Some(value),
            ObjKind::Pair(..) => None,
        }
    }

    pub fn children(&self, id: ObjId) -> Vec<ObjId> {
        self.get(id).map(|obj| obj.children().collect()).unwrap_or_default()
    }

    /// Integer payloads along a list spine
    pub fn list_ints(&self, list: Option<ObjId>) -> Vec<i64> {
        let mut out = Vec::new();
        let mut cursor = list;
        while let Some(id) = cursor {
            match self.get(id).map(|obj| &obj.kind) {
                Some(ObjKind::Pair(head, tail)) => {
                    if let Some(value) = head.and_then(|h| self.int_value(h)) {
                        out.push(value);
                    }
                    cursor = *tail;
                }
                _ => break,
            }
        }
        out
    }

    /// Replace the tail of a pair, taking over the reference to `tail` and
    /// releasing the old one.
    pub fn set_cdr(&mut self, pair: ObjId, tail: Option<ObjId>) {
        let old = match self.get_mut(pair).map(|obj| &mut obj.kind) {
            Some(ObjKind::Pair(_, slot)) => std::mem::replace(slot, tail),
            _ => return,
        };
        if let Some(old) = old {
            self.dec_ref(old);
        }
    }

    pub fn set_scc_id(&mut self, id: ObjId, scc_id: i64) {
        if let Some(obj) = self.get_mut(id) {
            obj.scc_id = scc_id;
        }
    }

    /// Drop a cell without looking at its children. Stack cells are skipped.
    pub(crate) fn release(&mut self, id: ObjId) -> bool {
        if self.in_stack_pool(id) || !self.is_live(id) {
            return false;
        }
        self.cells[id.0] = None;
        self.recycled.push(id.0);
        self.freed += 1;
        true
    }

    pub fn inc_ref(&mut self, id: ObjId) {
        if self.in_stack_pool(id) {
            return;
        }
        if let Some(obj) = self.get_mut(id) {
            obj.rc += 1;
        }
    }

    /// Decrement; at zero, decrement the children and free the cell.
    /// Returns the cells released.
    pub fn dec_ref(&mut self, id: ObjId) -> Vec<ObjId> {
        let mut released = Vec::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if self.in_stack_pool(current) {
                continue;
            }
            let Some(obj) = self.get_mut(current) else {
                continue;
            };
            obj.rc = obj.rc.saturating_sub(1);
            if obj.rc > 0 {
                continue;
            }
            pending.extend(obj.children());
            if self.release(current) {
                released.push(current);
            }
        }
        released
    }

    /// Free a tree-shaped structure without consulting reference counts.
    pub fn free_tree(&mut self, id: ObjId) -> Vec<ObjId> {
        let mut released = Vec::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let Some(obj) = self.get(current) else {
                continue;
            };
            pending.extend(obj.children());
            if self.release(current) {
                released.push(current);
            }
        }
        released
    }

    /// Free a cell known to hold the only reference; children may be shared.
    pub fn free_unique(&mut self, id: ObjId) -> Vec<ObjId> {
        let children = self.children(id);
        let mut released = Vec::new();
        if self.release(id) {
            released.push(id);
        }
        for child in children {
            released.extend(self.dec_ref(child));
        }
        released
    }

    pub fn defer_free(&mut self, id: ObjId) {
        self.freelist.push(id);
    }

    pub fn freelist_len(&self) -> usize {
        self.freelist.len()
    }

    /// Release every pending free, most recent first
    pub fn flush_freelist(&mut self) -> usize {
        let mut count = 0;
        while let Some(id) = self.freelist.pop() {
            self.dec_ref(id);
            count += 1;
        }
        count
    }

    /// The cell of `old` when it is uniquely owned, ready to be overwritten;
    /// otherwise `old` loses one reference and the caller allocates.
    pub fn try_reuse(&mut self, old: ObjId) -> Option<ObjId> {
        let unique = !self.in_stack_pool(old) && self.rc(old) == Some(1);
        if !unique {
            self.dec_ref(old);
            return None;
        }
        for child in self.children(old) {
            self.dec_ref(child);
        }
        Some(old)
    }

    pub fn reuse_as_int(&mut self, slot: Option<ObjId>, value: i64) -> ObjId {
        self.reuse_or_alloc(slot, ObjKind::Int(value))
    }

    pub fn reuse_as_pair(&mut self, slot: Option<ObjId>, head: Option<ObjId>, tail: Option<ObjId>) -> ObjId {
        self.reuse_or_alloc(slot, ObjKind::Pair(head, tail))
    }

    fn reuse_or_alloc(&mut self, slot: Option<ObjId>, kind: ObjKind) -> ObjId {
        if let Some(id) = slot
            && let Some(cell) = self.cells.get_mut(id.0)
        {
            *cell = Some(Obj::new(kind));
            return id;
        }
        self.alloc(Obj::new(kind))
    }

    /// Live cells, stack pool included
    pub fn live_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn freed_count(&self) -> usize {
        self.freed
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    /// (1 2 ... n) built from the back
    fn list(heap: &mut Heap, values: &[i64]) -> Option<ObjId> {
        values.iter().rev().fold(None, |tail, &v| {
            let head = heap.mk_int(v);
            Some(heap.mk_pair(Some(head), tail))
        })
    }

    #[test]
    fn test_constructors_and_list_walk() {
        let mut heap = Heap::new(0);
        let l = list(&mut heap, &[1, 2, 3]);
        assert_eq!(heap.list_ints(l), vec![1, 2, 3]);
        assert_eq!(heap.live_count(), 6);
        assert!(heap.get(l.unwrap()).unwrap().is_pair());
    }

    #[test]
    fn test_free_tree_releases_everything() {
        let mut heap = Heap::new(0);
        let l = list(&mut heap, &[1, 2, 3]).unwrap();
        assert_eq!(heap.free_tree(l).len(), 6);
        assert_eq!(heap.live_count(), 0);
        // dead cells are ignored
        assert!(heap.free_tree(l).is_empty());
    }

    #[test]
    fn test_dec_ref_respects_sharing() {
        let mut heap = Heap::new(0);
        let shared = heap.mk_int(7);
        heap.inc_ref(shared);
        let dag = heap.mk_pair(Some(shared), Some(shared));
        assert_eq!(heap.rc(shared), Some(2));
        let released = heap.dec_ref(dag);
        assert_eq!(released.len(), 2);
        assert!(!heap.is_live(shared));
    }

    #[test]
    fn test_stack_pool_cells_survive_release() {
        let mut heap = Heap::new(2);
        let a = heap.mk_int_stack(1);
        let b = heap.mk_int_stack(2);
        let c = heap.mk_int_stack(3);
        assert!(heap.in_stack_pool(a) && heap.in_stack_pool(b));
        assert!(!heap.in_stack_pool(c));
        assert_eq!(heap.pool_used(), 2);
        assert!(heap.dec_ref(a).is_empty());
        assert!(heap.free_tree(b).is_empty());
        assert!(heap.is_live(a) && heap.is_live(b));
        assert_eq!(heap.dec_ref(c), vec![c]);
    }

    #[test]
    fn test_freelist_drains_lifo() {
        let mut heap = Heap::new(0);
        let a = heap.mk_int(1);
        let b = heap.mk_int(2);
        heap.defer_free(a);
        heap.defer_free(b);
        assert_eq!(heap.freelist_len(), 2);
        assert_eq!(heap.flush_freelist(), 2);
        assert!(!heap.is_live(a) && !heap.is_live(b));
        // b's slot is recycled before a's
        assert_eq!(heap.mk_int(3), a);
    }

    #[test]
    fn test_reuse_unique_cell() {
        let mut heap = Heap::new(0);
        let old = list(&mut heap, &[1]).unwrap();
        let slot = heap.try_reuse(old);
        assert_eq!(slot, Some(old));
        let head = heap.mk_int(9);
        let fresh = heap.reuse_as_pair(slot, Some(head), None);
        assert_eq!(fresh, old);
        assert_eq!(heap.list_ints(Some(fresh)), vec![9]);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_reuse_falls_back_when_shared() {
        let mut heap = Heap::new(0);
        let old = heap.mk_int(1);
        heap.inc_ref(old);
        assert_eq!(heap.try_reuse(old), None);
        assert_eq!(heap.rc(old), Some(1));
        let fresh = heap.reuse_as_int(None, 5);
        assert_ne!(fresh, old);
        assert_eq!(heap.int_value(fresh), Some(5));
    }

    #[test]
    fn test_free_unique_keeps_shared_children() {
        let mut heap = Heap::new(0);
        let child = heap.mk_int(1);
        heap.inc_ref(child);
        let parent = heap.mk_pair(Some(child), None);
        assert_eq!(heap.free_unique(parent), vec![parent]);
        assert_eq!(heap.rc(child), Some(1));
    }
}
