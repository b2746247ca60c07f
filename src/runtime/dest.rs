//! Destination-passing style: the caller picks where a result lives and
//! the callee writes into it.

use super::heap::{Heap, ObjId};
use crate::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Dest {
    pub cell: Option<ObjId>,
    pub on_stack: bool,
}

impl Dest {
    pub fn heap() -> Self {
        Dest::default()
    }

    pub fn stack() -> Self {
        Dest {
            cell: None,
            on_stack: true,
        }
    }
}

pub fn write_int(heap: &mut Heap, dest: &mut Dest, value: i64) -> ObjId {
    let id = if dest.on_stack {
        heap.mk_int_stack(value)
    } else {
        heap.mk_int(value)
    };
    dest.cell = Some(id);
    id
}

pub fn write_pair(heap: &mut Heap, dest: &mut Dest, head: Option<ObjId>, tail: Option<ObjId>) -> ObjId {
    let id = heap.mk_pair(head, tail);
    dest.cell = Some(id);
    id
}

/// Write `f` of each list element into the matching destination.
pub fn map_dps(heap: &mut Heap, list: Option<ObjId>, f: impl Fn(i64) -> i64, dests: &mut [Dest]) -> Result<usize, Error> {
    let values = heap.list_ints(list);
    if dests.len() < values.len() {
        return Err(Error::OutOfMemory(format!(
            "map_dps: {} destinations for {} elements",
            dests.len(),
            values.len()
        )));
    }
    for (value, dest) in values.iter().zip(dests.iter_mut()) {
        write_int(heap, dest, f(*value));
    }
    Ok(values.len())
}

/// Fold the list into a single integer written to `dest`.
pub fn fold_dps(
    heap: &mut Heap,
    list: Option<ObjId>,
    init: i64,
    f: impl Fn(i64, i64) -> i64,
    dest: &mut Dest,
) -> ObjId {
    let total = heap.list_ints(list).into_iter().fold(init, f);
    write_int(heap, dest, total)
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn list(heap: &mut Heap, values: &[i64]) -> Option<ObjId> {
        values.iter().rev().fold(None, |tail, &v| {
            let head = heap.mk_int(v);
            Some(heap.mk_pair(Some(head), tail))
        })
    }

    #[test]
    fn test_map_into_stack_destinations() {
        let mut heap = Heap::new(8);
        let l = list(&mut heap, &[1, 2, 3]);
        let mut dests = [Dest::stack(); 3];
        assert_eq!(map_dps(&mut heap, l, |x| x * 10, &mut dests).unwrap(), 3);
        let written: Vec<i64> = dests
            .iter()
            .map(|d| heap.int_value(d.cell.unwrap()).unwrap())
            .collect();
        assert_eq!(written, vec![10, 20, 30]);
        assert!(dests.iter().all(|d| heap.in_stack_pool(d.cell.unwrap())));
    }

    #[test]
    fn test_map_rejects_short_destination_array() {
        let mut heap = Heap::new(0);
        let l = list(&mut heap, &[1, 2]);
        let mut dests = [Dest::heap()];
        assert!(matches!(
            map_dps(&mut heap, l, |x| x, &mut dests),
            Err(Error::OutOfMemory(_))
        ));
    }

    #[test]
    fn test_fold_and_pair() {
        let mut heap = Heap::new(0);
        let l = list(&mut heap, &[1, 2, 3, 4]);
        let mut dest = Dest::heap();
        let sum = fold_dps(&mut heap, l, 0, |acc, x| acc + x, &mut dest);
        assert_eq!(heap.int_value(sum), Some(10));
        assert_eq!(dest.cell, Some(sum));

        let mut pair_dest = Dest::heap();
        let p = write_pair(&mut heap, &mut pair_dest, Some(sum), None);
        assert_eq!(heap.list_ints(Some(p)), vec![10]);
    }
}
