//! Compile-time arena.
//!
//! Interns identifier text for the lifetime of a session and keeps release
//! callbacks for resources owned outside it. Callbacks run once, in reverse
//! registration order, when the arena is dropped.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

type ReleaseFn = Box<dyn FnOnce()>;

#[derive(Default)]
pub struct Arena {
    symbols: RefCell<HashSet<Rc<str>>>,
    externals: RefCell<Vec<(String, ReleaseFn)>>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared copy of `text`, inserting it on first use.
    pub fn intern(&self, text: &str) -> Rc<str> {
        let mut symbols = self.symbols.borrow_mut();
        if let Some(existing) = symbols.get(text) {
            return Rc::clone(existing);
        }
        let interned: Rc<str> = Rc::from(text);
        symbols.insert(Rc::clone(&interned));
        interned
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.borrow().len()
    }

    /// Register a release callback for a resource the arena does not own.
    pub fn register_external(&self, label: impl Into<String>, release: impl FnOnce() + 'static) {
        self.externals
            .borrow_mut()
            .push((label.into(), Box::new(release)));
    }

    pub fn external_count(&self) -> usize {
        self.externals.borrow().len()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let externals = std::mem::take(self.externals.get_mut());
        for (label, release) in externals.into_iter().rev() {
            tracing::trace!(%label, "releasing external resource");
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_shares_storage() {
        let arena = Arena::new();
        let a = arena.intern("x_1");
        let b = arena.intern("x_1");
        let c = arena.intern("y");
        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(arena.symbol_count(), 2);
    }

    #[test]
    fn test_externals_released_lifo() {
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let arena = Arena::new();
            for name in ["first", "second", "third"] {
                let order = Rc::clone(&order);
                arena.register_external(name, move || order.borrow_mut().push(name));
            }
            assert_eq!(arena.external_count(), 3);
            assert!(order.borrow().is_empty());
        }
        assert_eq!(*order.borrow(), vec!["third", "second", "first"]);
    }
}
