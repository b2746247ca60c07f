//! Shape inference on the lattice `Unknown < Tree < Dag < Cyclic`.
//!
//! Bindings are re-analyzed until no shape changes; every update is a join,
//! so each variable climbs at most three steps and the fixpoint terminates.
//! The inferred shape picks the release routine the emitter uses.

use super::{LetForm, LetKind, form_items};
use crate::Error;
use crate::ast::Value;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Shape {
    #[default]
    Unknown,
    Tree,
    Dag,
    Cyclic,
}

impl Shape {
    pub fn join(self, other: Shape) -> Shape {
        self.max(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Shape::Unknown => "unknown",
            Shape::Tree => "tree",
            Shape::Dag => "dag",
            Shape::Cyclic => "cyclic",
        }
    }
}

/// Release routines of the generated runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeStrategy {
    FreeTree,
    DecRef,
    DeferredRelease,
    FreeUnique,
    ReleaseScc,
}

impl FreeStrategy {
    pub fn c_name(self) -> &'static str {
        match self {
            FreeStrategy::FreeTree => "free_tree",
            FreeStrategy::DecRef => "dec_ref",
            FreeStrategy::DeferredRelease => "deferred_release",
            FreeStrategy::FreeUnique => "free_unique",
            FreeStrategy::ReleaseScc => "release_scc",
        }
    }
}

/// Unknown shapes fall back to reference counting, which is safe under
/// sharing and never recurses into a cycle.
pub fn shape_free_strategy(shape: Shape) -> FreeStrategy {
    match shape {
        Shape::Tree => FreeStrategy::FreeTree,
        Shape::Dag | Shape::Unknown => FreeStrategy::DecRef,
        Shape::Cyclic => FreeStrategy::DeferredRelease,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShapeInfo {
    pub shape: Shape,
    pub alias_group: Option<u32>,
}

/// Primitives whose result is a fresh integer sharing nothing with their operands
fn returns_scalar(name: &str) -> bool {
    matches!(
        name,
        "+" | "-" | "*" | "/" | "%" | "<" | ">" | "<=" | ">=" | "=" | "not" | "null?" | "pair?" | "eq?"
    )
}

#[derive(Debug, Clone)]
pub struct ShapeContext {
    infos: HashMap<Rc<str>, ShapeInfo>,
    next_group: u32,
    changed: bool,
    iterations: usize,
    depth_limit: usize,
    skipped: usize,
}

impl ShapeContext {
    pub fn new(depth_limit: usize) -> Self {
        ShapeContext {
            infos: HashMap::new(),
            next_group: 0,
            changed: false,
            iterations: 0,
            depth_limit,
            skipped: 0,
        }
    }

    /// Start from shapes already inferred for enclosing bindings
    pub fn with_known(known: &HashMap<Rc<str>, Shape>, depth_limit: usize) -> Self {
        let mut ctx = ShapeContext::new(depth_limit);
        for (name, &shape) in known {
            ctx.infos.insert(name.clone(), ShapeInfo { shape, alias_group: None });
        }
        ctx
    }

    pub fn shape_of(&self, name: &str) -> Shape {
        self.infos.get(name).map_or(Shape::Unknown, |info| info.shape)
    }

    pub fn info(&self, name: &str) -> Option<ShapeInfo> {
        self.infos.get(name).copied()
    }

    /// Passes of the last fixpoint that changed at least one shape
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Join `shape` into the recorded shape of `name`
    fn update(&mut self, name: &Rc<str>, shape: Shape) {
        match self.infos.get_mut(name) {
            Some(info) => {
                let joined = info.shape.join(shape);
                if joined != info.shape {
                    info.shape = joined;
                    self.changed = true;
                }
            }
            None => {
                self.infos.insert(name.clone(), ShapeInfo { shape, alias_group: None });
                self.changed = true;
            }
        }
    }

    fn group_of(&mut self, name: &Rc<str>) -> u32 {
        if let Some(group) = self.infos.get(name).and_then(|info| info.alias_group) {
            return group;
        }
        let group = self.next_group;
        self.next_group += 1;
        self.infos.entry(name.clone()).or_default().alias_group = Some(group);
        group
    }

    /// Put `alias` in the same alias group as `original`, merging groups if
    /// both already have one.
    fn merge_alias(&mut self, alias: &Rc<str>, original: &Rc<str>) {
        let target = self.group_of(original);
        let previous = self.infos.get(alias).and_then(|info| info.alias_group);
        match previous {
            Some(old) if old != target => {
                for info in self.infos.values_mut() {
                    if info.alias_group == Some(old) {
                        info.alias_group = Some(target);
                    }
                }
            }
            Some(_) => {}
            None => self.infos.entry(alias.clone()).or_default().alias_group = Some(target),
        }
    }

    /// Run the fixpoint over a `let` and return the body's shape.
    pub fn analyze_let(&mut self, form: &LetForm) -> Shape {
        let cap = 3 * form.bindings.len().max(1) + 1;
        self.iterations = 0;
        let mut body_shape = Shape::Unknown;
        for pass in 0..cap {
            self.changed = false;
            body_shape = self.analyze_let_pass(form, 1);
            tracing::trace!(pass, changed = self.changed, "shape fixpoint pass");
            if !self.changed {
                return body_shape;
            }
            self.iterations += 1;
        }
        tracing::warn!(cap, "shape fixpoint hit its iteration cap");
        body_shape
    }

    fn analyze_let_pass(&mut self, form: &LetForm, depth: usize) -> Shape {
        if form.kind == LetKind::LetRec {
            for name in form.names() {
                self.update(name, Shape::Cyclic);
            }
        }
        for binding in &form.bindings {
            let shape = self.analyze_expr(&binding.expr, depth + 1);
            self.update(&binding.name, shape);
            if let Some((original, _)) = structure_source(&binding.expr)
                && original != binding.name
            {
                self.merge_alias(&binding.name, &original);
            }
        }
        self.analyze_expr(&form.body, depth + 1)
    }

    /// Shape of the value `expr` produces.
    pub fn analyze_expr(&mut self, expr: &Value, depth: usize) -> Shape {
        if depth > self.depth_limit {
            self.skipped += 1;
            tracing::warn!(
                error = %Error::PipelineSkip(format!("shape analysis at depth {depth}")),
                "assuming unknown shape"
            );
            return Shape::Unknown;
        }
        match expr {
            Value::Int(_) | Value::Nil => return Shape::Tree,
            Value::Sym(name) => return self.shape_of(name),
            Value::Code(_) | Value::Prim(_) | Value::Closure(_) | Value::MEnv(_) => return Shape::Unknown,
            Value::Cell(_) => {}
        }
        let Some(items) = form_items(expr) else {
            return Shape::Unknown;
        };
        let next = depth + 1;
        match (items.first().and_then(Value::as_symbol), items.as_slice()) {
            (Some("quote" | "lambda" | "deftype" | "set-meta!"), _) => Shape::Tree,
            (Some("menv"), _) => Shape::Unknown,
            (Some("lift" | "EM" | "run" | "freeze"), [_, operand]) => self.analyze_expr(operand, next),
            (Some("scan"), [.., operand]) => self.analyze_expr(operand, next),
            (Some("if"), [_, condition, branches @ ..]) => {
                self.analyze_expr(condition, next);
                let mut shape = if branches.len() < 2 { Shape::Tree } else { Shape::Unknown };
                for branch in branches {
                    shape = shape.join(self.analyze_expr(branch, next));
                }
                shape
            }
            (Some("set!"), [_, target, value]) => {
                self.analyze_expr(value, next);
                if let Value::Sym(name) = target {
                    self.update(name, Shape::Cyclic);
                }
                Shape::Cyclic
            }
            (Some(kw @ ("let" | "letrec")), [_, rest @ ..]) => {
                let kind = if kw == "let" { LetKind::Let } else { LetKind::LetRec };
                match LetForm::from_parts(kind, rest) {
                    Ok(inner) => self.analyze_nested(&inner, next),
                    Err(_) => Shape::Unknown,
                }
            }
            (Some("cons" | "list"), [_, args @ ..]) => self.analyze_construction(args, next),
            (Some("car" | "cdr"), [_, operand]) => self.analyze_expr(operand, next),
            (Some(name), [_, args @ ..]) if returns_scalar(name) => {
                for arg in args {
                    self.analyze_expr(arg, next);
                }
                Shape::Tree
            }
            (_, [_, args @ ..]) => {
                let shape = args
                    .iter()
                    .fold(Shape::Unknown, |acc, arg| acc.join(self.analyze_expr(arg, next)));
                if shape == Shape::Unknown { Shape::Dag } else { shape }
            }
            (_, []) => Shape::Unknown,
        }
    }

    /// A nested `let` binds names only for its own extent; the outer
    /// entries for those names are restored afterwards.
    fn analyze_nested(&mut self, inner: &LetForm, depth: usize) -> Shape {
        let saved: Vec<(Rc<str>, Option<ShapeInfo>)> = inner
            .names()
            .map(|name| (name.clone(), self.infos.remove(name)))
            .collect();
        let changed = self.changed;
        let shape = self.analyze_let_pass(inner, depth);
        self.changed = changed;
        for (name, info) in saved {
            match info {
                Some(info) => self.infos.insert(name, info),
                None => self.infos.remove(&name),
            };
        }
        shape
    }

    fn analyze_construction(&mut self, args: &[Value], depth: usize) -> Shape {
        let shapes: Vec<Shape> = args.iter().map(|arg| self.analyze_expr(arg, depth)).collect();
        let joined = shapes.iter().copied().fold(Shape::Unknown, Shape::join);
        let all_tree = shapes.iter().all(|&s| s == Shape::Tree);
        let aliasing = args
            .iter()
            .enumerate()
            .any(|(i, a)| args[i + 1..].iter().any(|b| self.may_alias(a, b)));
        match (all_tree, aliasing) {
            (true, false) => Shape::Tree,
            (true, true) => Shape::Dag,
            _ if joined == Shape::Tree => Shape::Dag,
            _ => joined,
        }
    }

    /// Whether two expressions may evaluate to overlapping structure: they
    /// mention a common variable, or variables of a common alias group.
    /// Scalar literals never alias.
    pub fn may_alias(&self, a: &Value, b: &Value) -> bool {
        let left = alias_roots(a);
        let right = alias_roots(b);
        left.iter().any(|l| {
            right.iter().any(|r| {
                l == r || {
                    let gl = self.infos.get(l).and_then(|i| i.alias_group);
                    gl.is_some() && gl == self.infos.get(r).and_then(|i| i.alias_group)
                }
            })
        })
    }
}

/// The variable whose structure `expr` re-exposes without allocating, and
/// whether it does so through a `car`/`cdr` projection.
fn structure_source(expr: &Value) -> Option<(Rc<str>, bool)> {
    let mut current = expr;
    let mut projected = false;
    loop {
        if let Value::Sym(name) = current {
            return Some((name.clone(), projected));
        }
        match current.head_symbol() {
            Some("car" | "cdr") => projected = true,
            Some("lift") => {}
            _ => return None,
        }
        current = current.cdr()?.car()?;
    }
}

/// The variable a binding is another name for: a bare symbol, possibly lifted
pub(crate) fn alias_source(expr: &Value) -> Option<Rc<str>> {
    structure_source(expr).and_then(|(name, projected)| (!projected).then_some(name))
}

/// The variable a `car`/`cdr` projection reads from. The projection borrows
/// part of that variable's structure and owns nothing.
pub(crate) fn projection_source(expr: &Value) -> Option<Rc<str>> {
    structure_source(expr).and_then(|(name, projected)| projected.then_some(name))
}

/// Variables whose structure the value of `expr` may contain
pub(crate) fn alias_roots(expr: &Value) -> Vec<Rc<str>> {
    let mut roots = Vec::new();
    let mut pending = vec![expr];
    while let Some(current) = pending.pop() {
        if let Value::Sym(name) = current {
            if !roots.contains(name) {
                roots.push(name.clone());
            }
            continue;
        }
        let Some(items) = form_items(current) else {
            continue;
        };
        match (items.first().and_then(Value::as_symbol), items.as_slice()) {
            (Some("quote" | "lambda" | "deftype" | "menv" | "set-meta!"), _) => {}
            (Some(name), _) if returns_scalar(name) => {}
            (Some("if"), [_, _, branches @ ..]) => push_refs(&mut pending, current, 2, branches.len()),
            (Some("let" | "letrec"), [_, _, _]) => push_refs(&mut pending, current, 2, 1),
            (Some("set!"), [_, _, _]) => push_refs(&mut pending, current, 1, 2),
            (_, [_, rest @ ..]) => push_refs(&mut pending, current, 1, rest.len()),
            (_, []) => {}
        }
    }
    roots
}

/// Queue `count` list elements of `form` starting at position `skip`
fn push_refs<'a>(pending: &mut Vec<&'a Value>, form: &'a Value, skip: usize, count: usize) {
    pending.extend(form.iter().skip(skip).take(count));
}
