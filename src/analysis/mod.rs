//! Static memory-management analyses run over every compiled `let`.
//!
//! The suite is driven per block by [`analyze_let`]:
//!
//! 1. [`escape`] classifies each binding (none / arg / global) and records
//!    use counts and closure capture
//! 2. [`shape`] infers tree / dag / cyclic shapes through a monotone fixpoint
//! 3. [`liveness`] builds a statement-tagged CFG and finds free points
//! 4. [`rc_elision`] tracks uniqueness, borrows and alias owners
//! 5. [`reuse`] pairs early frees with later allocations of equal size
//!
//! Each analyzer owns its context; the emitter consumes the bundle and drops it.

pub mod escape;
pub mod liveness;
pub mod rc_elision;
pub mod reuse;
pub mod shape;

use crate::Error;
use crate::ast::Value;
use crate::evaluator::is_special_form;
use crate::session::CompileOptions;
use escape::{EscapeClass, EscapeContext};
use liveness::Liveness;
use rc_elision::RcContext;
use reuse::ReuseContext;
use shape::{Shape, ShapeContext};
use std::collections::HashMap;
use std::rc::Rc;

/// Nesting depth past which the syntactic helpers stop descending
const WALK_DEPTH_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetKind {
    Let,
    LetRec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: Rc<str>,
    pub expr: Value,
}

/// A destructured `let` / `letrec`. Statements are numbered with bindings
/// first (`0..n`) and the body last (`n`).
#[derive(Debug, Clone, PartialEq)]
pub struct LetForm {
    pub kind: LetKind,
    pub bindings: Vec<Binding>,
    pub body: Value,
}

impl LetForm {
    pub fn parse(expr: &Value) -> Result<LetForm, Error> {
        let kind = match expr.head_symbol() {
            Some("let") => LetKind::Let,
            Some("letrec") => LetKind::LetRec,
            _ => return Err(Error::TypeMismatch(format!("expected a let form, got {expr}"))),
        };
        let args = expr
            .cdr()
            .and_then(Value::list_items)
            .ok_or_else(|| Error::EvalError(format!("Malformed expression: {expr}")))?;
        LetForm::from_parts(kind, &args)
    }

    /// Build from the arguments following the keyword: `((name expr) ...) body`
    pub fn from_parts(kind: LetKind, args: &[Value]) -> Result<LetForm, Error> {
        let keyword = match kind {
            LetKind::Let => "let",
            LetKind::LetRec => "letrec",
        };
        let [binding_list, body] = args else {
            return Err(Error::arity_error_with_expr(2, args.len(), keyword.to_owned()));
        };
        let entries = binding_list
            .list_items()
            .ok_or_else(|| Error::TypeMismatch(format!("{keyword} bindings must be a list")))?;
        let mut bindings = Vec::with_capacity(entries.len());
        for entry in &entries {
            match entry.list_items().as_deref() {
                Some([Value::Sym(name), expr]) => {
                    if bindings.iter().any(|b: &Binding| b.name == *name) {
                        return Err(Error::EvalError(format!(
                            "Duplicate binding name in {keyword}: {name}"
                        )));
                    }
                    bindings.push(Binding {
                        name: name.clone(),
                        expr: expr.clone(),
                    });
                }
                _ => {
                    return Err(Error::TypeMismatch(format!(
                        "{keyword} binding must be (name expr), got {entry}"
                    )));
                }
            }
        }
        Ok(LetForm {
            kind,
            bindings,
            body: body.clone(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.bindings.iter().map(|b| &b.name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.bindings.iter().position(|b| &*b.name == name)
    }

    /// Index of the body statement
    pub fn body_statement(&self) -> usize {
        self.bindings.len()
    }

    pub fn statement(&self, index: usize) -> &Value {
        self.bindings.get(index).map_or(&self.body, |b| &b.expr)
    }

    /// Binding names visible inside statement `index`
    pub fn visible_in(&self, index: usize) -> &[Binding] {
        match self.kind {
            LetKind::LetRec => &self.bindings,
            LetKind::Let => &self.bindings[..index.min(self.bindings.len())],
        }
    }
}

/// Arguments of a form, or `None` for atoms and improper lists
pub(crate) fn form_items(expr: &Value) -> Option<Vec<Value>> {
    match expr {
        Value::Cell(_) => expr.list_items(),
        _ => None,
    }
}

/// Variables referenced by `expr` that no binder inside it introduces, in
/// first-occurrence order. Quoted data and type declarations contribute nothing.
pub fn free_variables(expr: &Value) -> Vec<Rc<str>> {
    let mut out = Vec::new();
    let mut bound = Vec::new();
    collect_free(expr, &mut bound, &mut out, 0);
    out
}

fn push_unique(out: &mut Vec<Rc<str>>, name: &Rc<str>) {
    if !out.contains(name) {
        out.push(name.clone());
    }
}

fn collect_free(expr: &Value, bound: &mut Vec<Rc<str>>, out: &mut Vec<Rc<str>>, depth: usize) {
    if depth > WALK_DEPTH_LIMIT {
        return;
    }
    if let Value::Sym(name) = expr {
        if !bound.contains(name) {
            push_unique(out, name);
        }
        return;
    }
    let Some(items) = form_items(expr) else {
        return;
    };
    let head = items.first().and_then(Value::as_symbol);
    match (head, items.as_slice()) {
        (Some("quote" | "deftype" | "menv"), _) => {}
        (Some("lambda"), [_, params, body]) => {
            let params: Vec<Rc<str>> = params
                .iter()
                .filter_map(|p| match p {
                    Value::Sym(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            let mark = bound.len();
            bound.extend(params);
            collect_free(body, bound, out, depth + 1);
            bound.truncate(mark);
        }
        (Some(keyword @ ("let" | "letrec")), [_, bindings, body]) => {
            let Ok(form) = LetForm::from_parts(
                if keyword == "let" { LetKind::Let } else { LetKind::LetRec },
                &[bindings.clone(), body.clone()],
            ) else {
                return;
            };
            let mark = bound.len();
            if form.kind == LetKind::LetRec {
                bound.extend(form.names().cloned());
            }
            for binding in &form.bindings {
                collect_free(&binding.expr, bound, out, depth + 1);
                if form.kind == LetKind::Let {
                    bound.push(binding.name.clone());
                }
            }
            collect_free(&form.body, bound, out, depth + 1);
            bound.truncate(mark);
        }
        (Some("set-meta!"), [_, _, handler]) => collect_free(handler, bound, out, depth + 1),
        (Some("scan"), [_, Value::Sym(_), operand]) => collect_free(operand, bound, out, depth + 1),
        (Some(name), [_, rest @ ..]) if is_special_form(name) => {
            for item in rest {
                collect_free(item, bound, out, depth + 1);
            }
        }
        _ => {
            for item in &items {
                collect_free(item, bound, out, depth + 1);
            }
        }
    }
}

/// Every non-quoted symbol under `expr`, ignoring binders. Used as the
/// conservative fallback when an analyzer skips a node.
pub(crate) fn symbols_in(expr: &Value) -> Vec<Rc<str>> {
    let mut out = Vec::new();
    let mut pending = vec![expr];
    while let Some(current) = pending.pop() {
        match current {
            Value::Sym(name) => push_unique(&mut out, name),
            Value::Cell(_) if current.head_symbol() == Some("quote") => {}
            Value::Cell(_) => {
                let mut cursor = current;
                while let Value::Cell(cell) = cursor {
                    pending.push(cell.head());
                    cursor = cell.tail();
                }
            }
            _ => {}
        }
    }
    out
}

/// Whether `expr` contains `(set! name ...)` anywhere outside quoted data.
pub(crate) fn mutates(expr: &Value, name: &str) -> bool {
    let mut pending = vec![expr];
    while let Some(current) = pending.pop() {
        if !matches!(current, Value::Cell(_)) || current.head_symbol() == Some("quote") {
            continue;
        }
        if current.head_symbol() == Some("set!")
            && current.cdr().and_then(Value::car).and_then(Value::as_symbol) == Some(name)
        {
            return true;
        }
        let mut cursor = current;
        while let Value::Cell(cell) = cursor {
            pending.push(cell.head());
            cursor = cell.tail();
        }
    }
    false
}

/// Results of the whole suite for one `let`
pub struct LetAnalysis {
    pub escape: EscapeContext,
    pub shapes: ShapeContext,
    pub liveness: Liveness,
    pub rc: RcContext,
    pub reuse: ReuseContext,
    pub body_shape: Shape,
    body_statement: usize,
    names: Vec<Rc<str>>,
    enable_nll: bool,
}

impl LetAnalysis {
    pub fn shape(&self, name: &str) -> Shape {
        self.shapes.shape_of(name)
    }

    pub fn binding_shapes(&self) -> Vec<(Rc<str>, Shape)> {
        self.names
            .iter()
            .map(|name| (name.clone(), self.shape(name)))
            .collect()
    }

    /// Non-escaping and not captured: may live in the stack pool
    pub fn is_stack_candidate(&self, name: &str) -> bool {
        self.escape
            .usage(name)
            .is_some_and(|u| u.escape == EscapeClass::None && !u.captured)
    }

    /// Statement after which `name` can be released early, when that is
    /// before the body. Projections borrowing from `name` keep it alive.
    pub fn early_free_statement(&self, name: &str) -> Option<usize> {
        if !self.enable_nll {
            return None;
        }
        let usage = self.escape.usage(name)?;
        if usage.use_count == 0 || self.holds_past_block(name) || self.rc.elide_dec(name) {
            return None;
        }
        if self.rc.projections(name).iter().any(|p| self.holds_past_block(p)) {
            return None;
        }
        self.rc
            .release_point(name)
            .filter(|&stmt| stmt < self.body_statement)
    }

    /// Captured, stored in a pair or escaping globally
    fn holds_past_block(&self, name: &str) -> bool {
        self.escape
            .usage(name)
            .is_some_and(|u| u.captured || u.stored || u.escape == EscapeClass::Global)
    }

    /// A projection of `name` is captured by a closure
    pub fn projection_captured(&self, name: &str) -> bool {
        self.rc
            .projections(name)
            .iter()
            .any(|p| self.escape.usage(p).is_some_and(|u| u.captured))
    }
}

/// Run escape, shape, liveness, RC-elision and reuse analysis over `form`.
/// `known` carries shapes of enclosing compiled bindings.
pub fn analyze_let(form: &LetForm, known: &HashMap<Rc<str>, Shape>, options: &CompileOptions) -> LetAnalysis {
    let mut escape = EscapeContext::new(options.analysis_depth_limit);
    escape.analyze_let(form);

    let mut shapes = ShapeContext::with_known(known, options.analysis_depth_limit);
    let body_shape = shapes.analyze_let(form);

    let liveness = Liveness::analyze(form, options.liveness_iteration_cap, options.analysis_depth_limit);
    let rc = RcContext::analyze(form, &liveness);

    let mut analysis = LetAnalysis {
        escape,
        shapes,
        liveness,
        rc,
        reuse: ReuseContext::new(),
        body_shape,
        body_statement: form.body_statement(),
        names: form.names().cloned().collect(),
        enable_nll: options.enable_nll,
    };

    if options.enable_reuse {
        let reuse = ReuseContext::analyze(form, &analysis.liveness, |name| {
            analysis.early_free_statement(name)
        });
        analysis.reuse = reuse;
    }

    for name in &analysis.names {
        tracing::debug!(
            binding = %name,
            shape = analysis.shape(name).as_str(),
            escape = analysis.escape.usage(name).map_or("?", |u| u.escape.as_str()),
            last_statement = ?analysis.liveness.last_statement(name),
            "binding analysis"
        );
    }
    analysis
}
