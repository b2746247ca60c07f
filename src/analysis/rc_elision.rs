//! Reference-count elision.
//!
//! Tracks which bindings are fresh unique allocations, which merely alias
//! another binding, and which refer to storage owned outside the block.
//! Within an alias group exactly one member (the owner) performs the
//! release; the others skip both increment and decrement. A `car`/`cdr`
//! projection borrows from its parent, which is released only after the
//! projection's last use.

use super::liveness::Liveness;
use super::shape::{FreeStrategy, Shape, alias_roots, alias_source, projection_source, shape_free_strategy};
use super::{LetForm, form_items};
use crate::ast::Value;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RcInfo {
    /// Provably the only reference to a fresh allocation
    pub unique: bool,
    /// Owned by someone outside this block
    pub borrowed: bool,
    /// Root binding this one re-exposes
    pub alias_of: Option<Rc<str>>,
    pub aliases: Vec<Rc<str>>,
    /// Binding whose structure this one projects into
    pub projection_of: Option<Rc<str>>,
    pub projections: Vec<Rc<str>>,
    /// Last statement using the binding
    pub last_use: Option<usize>,
    /// Declared by the analyzed block
    pub declared: bool,
}

#[derive(Debug, Default)]
pub struct RcContext {
    infos: HashMap<Rc<str>, RcInfo>,
    /// Declared bindings in source order
    order: Vec<Rc<str>>,
}

fn is_scalar_primitive(name: &str) -> bool {
    matches!(
        name,
        "+" | "-" | "*" | "/" | "%" | "<" | ">" | "<=" | ">=" | "=" | "not" | "null?" | "pair?" | "eq?"
    )
}

/// Whether evaluating `expr` yields a newly allocated object
fn allocates_fresh(expr: &Value) -> bool {
    match expr {
        Value::Int(_) | Value::Nil => true,
        Value::Cell(_) => match expr.head_symbol() {
            Some("quote" | "cons" | "list") => true,
            Some("lift") => expr.cdr().and_then(Value::car).is_some_and(allocates_fresh),
            Some(name) => is_scalar_primitive(name),
            None => false,
        },
        _ => false,
    }
}

impl RcContext {
    pub fn analyze(form: &LetForm, liveness: &Liveness) -> RcContext {
        let mut ctx = RcContext::default();
        for binding in &form.bindings {
            let name = &binding.name;
            let mut info = RcInfo {
                declared: true,
                last_use: liveness.last_statement(name),
                ..RcInfo::default()
            };
            let alias = alias_source(&binding.expr).filter(|orig| orig != name);
            let projected = projection_source(&binding.expr).filter(|parent| parent != name);
            match (alias, projected) {
                (Some(original), _) => {
                    let root = ctx.attach_alias(name, &original);
                    info.alias_of = Some(root);
                }
                (None, Some(parent)) => {
                    info.projection_of = Some(ctx.attach_projection(name, &parent));
                }
                (None, None) if allocates_fresh(&binding.expr) => {
                    // every variable embedded in the new object must be owned here
                    info.unique = alias_roots(&binding.expr)
                        .iter()
                        .all(|root| ctx.infos.get(root).is_some_and(|i| i.declared));
                }
                (None, None) => {}
            }
            if let Some(existing) = ctx.infos.get_mut(name) {
                // already seen as the target of an earlier alias
                info.aliases = std::mem::take(&mut existing.aliases);
                info.projections = std::mem::take(&mut existing.projections);
                info.unique = false;
            }
            ctx.infos.insert(name.clone(), info);
            ctx.order.push(name.clone());
        }
        for statement in 0..=form.body_statement() {
            ctx.propagate_assignments(form.statement(statement));
        }
        ctx
    }

    /// Record `alias` as another name for the root of `original`, returning
    /// the root. Roots not declared here are borrowed.
    fn attach_alias(&mut self, alias: &Rc<str>, original: &Rc<str>) -> Rc<str> {
        let root = self.root_of(original);
        let root_info = self.infos.entry(root.clone()).or_insert_with(|| RcInfo {
            borrowed: true,
            ..RcInfo::default()
        });
        root_info.unique = false;
        if !root_info.aliases.contains(alias) {
            root_info.aliases.push(alias.clone());
        }
        root
    }

    /// Record `projection` as borrowing from the binding that owns `parent`,
    /// returning that binding. Projections of projections borrow from the
    /// first parent.
    fn attach_projection(&mut self, projection: &Rc<str>, parent: &Rc<str>) -> Rc<str> {
        let root = self.root_of(parent);
        let owner = self
            .infos
            .get(&root)
            .and_then(|i| i.projection_of.clone())
            .unwrap_or(root);
        let owner_info = self.infos.entry(owner.clone()).or_insert_with(|| RcInfo {
            borrowed: true,
            ..RcInfo::default()
        });
        if !owner_info.projections.contains(projection) {
            owner_info.projections.push(projection.clone());
        }
        owner
    }

    /// `(set! x y)` with `y` an alias source makes `x` share `y`'s root
    fn propagate_assignments(&mut self, expr: &Value) {
        let mut pending = vec![expr.clone()];
        while let Some(current) = pending.pop() {
            let Some(items) = form_items(&current) else {
                continue;
            };
            match (items.first().and_then(Value::as_symbol), items.as_slice()) {
                (Some("quote"), _) => continue,
                (Some("set!"), [_, Value::Sym(target), value]) => {
                    if let Some(source) = alias_source(value).filter(|s| s != target) {
                        let root = self.attach_alias(target, &source);
                        if root != *target {
                            let info = self.infos.entry(target.clone()).or_default();
                            info.alias_of = Some(root);
                            info.unique = false;
                        }
                    } else if let Some(info) = self.infos.get_mut(target) {
                        info.unique = false;
                    }
                }
                _ => {}
            }
            pending.extend(items);
        }
    }

    pub fn info(&self, name: &str) -> Option<&RcInfo> {
        self.infos.get(name)
    }

    /// Follow alias links to the binding that owns the storage
    pub fn root_of(&self, name: &Rc<str>) -> Rc<str> {
        let mut current = name.clone();
        let mut steps = 0;
        while let Some(next) = self.infos.get(&current).and_then(|i| i.alias_of.clone()) {
            if next == current || steps > self.infos.len() {
                break;
            }
            current = next;
            steps += 1;
        }
        current
    }

    /// The member of `name`'s alias group that performs the release: the
    /// declared member used last, the root on ties.
    pub fn owner(&self, name: &str) -> Option<Rc<str>> {
        let root = self.root_of(&Rc::from(name));
        let root_info = self.infos.get(&root)?;
        if !root_info.declared {
            return None;
        }
        let mut best = (root.clone(), self.release_point(&root));
        for alias in &root_info.aliases {
            if let Some(info) = self.infos.get(alias)
                && info.declared
            {
                let point = self.release_point(alias);
                if point > best.1 {
                    best = (alias.clone(), point);
                }
            }
        }
        Some(best.0)
    }

    /// Last statement after which `name`'s storage is still needed: its own
    /// last use or that of any projection borrowing from it.
    pub fn release_point(&self, name: &str) -> Option<usize> {
        let info = self.infos.get(name)?;
        info.projections
            .iter()
            .filter_map(|p| self.infos.get(p).and_then(|i| i.last_use))
            .chain(info.last_use)
            .max()
    }

    /// The binding `name` borrows from through `car`/`cdr`
    pub fn projection_of(&self, name: &str) -> Option<&Rc<str>> {
        self.infos.get(name).and_then(|i| i.projection_of.as_ref())
    }

    pub fn projections(&self, name: &str) -> &[Rc<str>] {
        self.infos.get(name).map_or(&[], |i| i.projections.as_slice())
    }

    /// Other bindings read `name`'s storage through an alias or projection
    pub fn has_dependents(&self, name: &str) -> bool {
        self.infos
            .get(name)
            .is_some_and(|i| !i.aliases.is_empty() || !i.projections.is_empty())
    }

    pub fn is_unique(&self, name: &str) -> bool {
        self.infos.get(name).is_some_and(|i| i.unique)
    }

    pub fn is_borrowed(&self, name: &str) -> bool {
        self.infos.get(name).is_some_and(|i| i.borrowed)
    }

    /// The original's reference already covers `name`
    pub fn elide_inc(&self, name: &str) -> bool {
        self.infos
            .get(name)
            .is_some_and(|i| i.borrowed || i.alias_of.is_some() || i.projection_of.is_some())
    }

    /// Another holder performs the decrement for `name`
    pub fn elide_dec(&self, name: &str) -> bool {
        let Some(info) = self.infos.get(name) else {
            return false;
        };
        if info.borrowed || info.projection_of.is_some() {
            return true;
        }
        match self.owner(name) {
            Some(owner) => &*owner != name,
            None => true,
        }
    }

    /// Release routine for `name`; `None` when it must not be released here.
    pub fn free_function(&self, name: &str, shape: Shape) -> Option<FreeStrategy> {
        if self.is_borrowed(name) || self.projection_of(name).is_some() {
            return None;
        }
        if self.is_unique(name) && shape == Shape::Dag {
            return Some(FreeStrategy::FreeUnique);
        }
        Some(shape_free_strategy(shape))
    }

    /// Declared bindings in source order
    pub fn declared(&self) -> impl Iterator<Item = &Rc<str>> {
        self.order.iter()
    }
}
