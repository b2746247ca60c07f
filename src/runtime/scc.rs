//! Frozen cyclic structures released one strongly connected component at a
//! time.

use super::heap::{Heap, ObjId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct SccGroup {
    pub id: usize,
    pub members: Vec<ObjId>,
    /// References from outside the component
    pub rc: u32,
}

/// Strongly connected components of the graph reachable from `root`, in
/// the order Tarjan's algorithm completes them (sinks first).
pub fn compute_sccs(heap: &Heap, root: ObjId) -> Vec<Vec<ObjId>> {
    let mut index_of: HashMap<ObjId, usize> = HashMap::new();
    let mut low: HashMap<ObjId, usize> = HashMap::new();
    let mut on_stack: HashSet<ObjId> = HashSet::new();
    let mut stack: Vec<ObjId> = Vec::new();
    let mut components = Vec::new();
    let mut next_index = 0;

    if !heap.is_live(root) {
        return components;
    }
    // (node, children, next child position)
    let mut work: Vec<(ObjId, Vec<ObjId>, usize)> = Vec::new();
    index_of.insert(root, next_index);
    low.insert(root, next_index);
    next_index += 1;
    stack.push(root);
    on_stack.insert(root);
    work.push((root, heap.children(root), 0));

    while let Some(top) = work.last_mut() {
        let node = top.0;
        if let Some(&child) = top.1.get(top.2) {
            top.2 += 1;
            if !heap.is_live(child) {
                continue;
            }
            if let Some(&child_index) = index_of.get(&child) {
                if on_stack.contains(&child) {
                    let node_low = low.get(&node).copied().unwrap_or(child_index);
                    low.insert(node, node_low.min(child_index));
                }
                continue;
            }
            index_of.insert(child, next_index);
            low.insert(child, next_index);
            next_index += 1;
            stack.push(child);
            on_stack.insert(child);
            work.push((child, heap.children(child), 0));
            continue;
        }

        work.pop();
        let node_low = low.get(&node).copied().unwrap_or(0);
        if let Some(parent) = work.last() {
            let parent_low = low.get(&parent.0).copied().unwrap_or(node_low);
            low.insert(parent.0, parent_low.min(node_low));
        }
        if index_of.get(&node) == Some(&node_low) {
            let mut component = Vec::new();
            while let Some(member) = stack.pop() {
                on_stack.remove(&member);
                component.push(member);
                if member == node {
                    break;
                }
            }
            components.push(component);
        }
    }
    components
}

#[derive(Debug, Default)]
pub struct SccRegistry {
    groups: Vec<Option<SccGroup>>,
}

impl SccRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition everything reachable from `root` into components, tag each
    /// cell with its component id and return the root's component.
    pub fn freeze_cyclic(&mut self, heap: &mut Heap, root: ObjId) -> Option<usize> {
        let components = compute_sccs(heap, root);
        let base = self.groups.len();
        let mut component_of: HashMap<ObjId, usize> = HashMap::new();
        for (offset, members) in components.iter().enumerate() {
            for &member in members {
                component_of.insert(member, base + offset);
                heap.set_scc_id(member, (base + offset) as i64);
            }
        }
        let mut external = vec![0u32; components.len()];
        for (offset, members) in components.iter().enumerate() {
            for &member in members {
                for child in heap.children(member) {
                    if let Some(&target) = component_of.get(&child)
                        && target != base + offset
                    {
                        external[target - base] += 1;
                    }
                }
            }
        }
        let root_component = component_of.get(&root).copied();
        for (offset, members) in components.into_iter().enumerate() {
            let id = base + offset;
            let rc = external[offset] + u32::from(root_component == Some(id));
            tracing::trace!(id, size = members.len(), rc, "frozen component");
            self.groups.push(Some(SccGroup { id, members, rc }));
        }
        root_component
    }

    pub fn group(&self, id: usize) -> Option<&SccGroup> {
        self.groups.get(id).and_then(Option::as_ref)
    }

    pub fn live_groups(&self) -> usize {
        self.groups.iter().flatten().count()
    }

    pub fn inc_scc_ref(&mut self, id: usize) {
        if let Some(group) = self.groups.get_mut(id).and_then(Option::as_mut) {
            group.rc += 1;
        }
    }

    /// Drop one external reference; at zero free every member and cascade
    /// into the components they point at. Returns the cells released.
    pub fn release_scc(&mut self, heap: &mut Heap, id: usize) -> usize {
        let mut released = 0;
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let Some(group) = self.groups.get_mut(current).and_then(Option::as_mut) else {
                continue;
            };
            group.rc = group.rc.saturating_sub(1);
            if group.rc > 0 {
                continue;
            }
            let Some(group) = self.groups.get_mut(current).and_then(Option::take) else {
                continue;
            };
            let mut outgoing = Vec::new();
            for &member in &group.members {
                for child in heap.children(member) {
                    let target = heap.get(child).map(|obj| obj.scc_id);
                    match target {
                        Some(scc) if scc >= 0 && scc as usize != current => outgoing.push(Err(scc as usize)),
                        Some(scc) if scc < 0 => outgoing.push(Ok(child)),
                        _ => {}
                    }
                }
            }
            for &member in &group.members {
                if heap.release(member) {
                    released += 1;
                }
            }
            for edge in outgoing {
                match edge {
                    Err(scc) => pending.push(scc),
                    Ok(child) => released += heap.dec_ref(child).len(),
                }
            }
        }
        released
    }
}
