//! Escape analysis over one `let`.
//!
//! Each binding receives an [`EscapeClass`] on the lattice
//! `None < Arg < Global`; a reference always joins its current class with
//! the class inherited from the enclosing position. Use counts, the depth
//! of the last use and closure capture are collected in the same context.

use super::{LetForm, LetKind, form_items, symbols_in};
use crate::Error;
use crate::ast::Value;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum EscapeClass {
    /// Stays inside the block
    #[default]
    None,
    /// Passed to a callee or handed back to the enclosing expression
    Arg,
    /// Reachable from a closure, a recursive binding or a mutated place
    Global,
}

impl EscapeClass {
    pub fn join(self, other: EscapeClass) -> EscapeClass {
        self.max(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EscapeClass::None => "none",
            EscapeClass::Arg => "arg",
            EscapeClass::Global => "global",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarUsage {
    pub name: Rc<str>,
    pub use_count: usize,
    pub last_use_depth: usize,
    pub escape: EscapeClass,
    /// Referenced from inside a lambda body
    pub captured: bool,
    /// Placed directly into a constructed pair
    pub stored: bool,
}

impl VarUsage {
    fn new(name: Rc<str>) -> Self {
        VarUsage {
            name,
            use_count: 0,
            last_use_depth: 0,
            escape: EscapeClass::None,
            captured: false,
            stored: false,
        }
    }
}

pub struct EscapeContext {
    vars: Vec<VarUsage>,
    index: HashMap<Rc<str>, usize>,
    /// Names currently rebound by an inner binder
    shadowed: Vec<Rc<str>>,
    depth_limit: usize,
    skipped: usize,
}

impl EscapeContext {
    pub fn new(depth_limit: usize) -> Self {
        EscapeContext {
            vars: Vec::new(),
            index: HashMap::new(),
            shadowed: Vec::new(),
            depth_limit,
            skipped: 0,
        }
    }

    pub fn track(&mut self, name: Rc<str>) {
        if !self.index.contains_key(&name) {
            self.index.insert(name.clone(), self.vars.len());
            self.vars.push(VarUsage::new(name));
        }
    }

    pub fn usage(&self, name: &str) -> Option<&VarUsage> {
        self.index.get(name).map(|&i| &self.vars[i])
    }

    pub fn usages(&self) -> &[VarUsage] {
        &self.vars
    }

    /// Nodes left unvisited because of the depth limit
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn visible_mut(&mut self, name: &str) -> Option<&mut VarUsage> {
        if self.shadowed.iter().any(|s| &**s == name) {
            return None;
        }
        let i = *self.index.get(name)?;
        Some(&mut self.vars[i])
    }

    fn with_shadowed<R>(
        &mut self,
        names: impl IntoIterator<Item = Rc<str>>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let mark = self.shadowed.len();
        self.shadowed.extend(names);
        let result = f(self);
        self.shadowed.truncate(mark);
        result
    }

    /// Conservative treatment of a node past the depth limit: every symbol
    /// under it escapes globally and counts as a captured use.
    fn skip(&mut self, expr: &Value, depth: usize) {
        self.skipped += 1;
        tracing::warn!(
            error = %Error::PipelineSkip(format!("escape analysis at depth {depth}")),
            "treating subtree conservatively"
        );
        for name in symbols_in(expr) {
            if let Some(usage) = self.visible_mut(&name) {
                usage.escape = EscapeClass::Global;
                usage.captured = true;
                usage.use_count += 1;
                usage.last_use_depth = depth;
            }
        }
    }

    /// Analyze a whole `let`: tracks its names, counts uses and classifies
    /// escapes. The block result is handed to the enclosing expression, so
    /// the body starts from [`EscapeClass::Arg`].
    pub fn analyze_let(&mut self, form: &LetForm) {
        for name in form.names() {
            self.track(name.clone());
        }
        let names: Vec<Rc<str>> = form.names().cloned().collect();
        for (i, binding) in form.bindings.iter().enumerate() {
            let hidden = match form.kind {
                LetKind::Let => names[i..].to_vec(),
                LetKind::LetRec => Vec::new(),
            };
            self.with_shadowed(hidden, |ctx| ctx.analyze_expr(&binding.expr, 1, false));
        }
        self.analyze_expr(&form.body, 1, false);

        let body_class = EscapeClass::Arg;
        let returned = returned_names(&form.body);
        for (i, binding) in form.bindings.iter().enumerate() {
            let class = match form.kind {
                LetKind::LetRec => EscapeClass::Global,
                LetKind::Let if returned.contains(&binding.name) => body_class,
                LetKind::Let => EscapeClass::None,
            };
            let hidden = match form.kind {
                LetKind::Let => names[i..].to_vec(),
                LetKind::LetRec => Vec::new(),
            };
            self.with_shadowed(hidden, |ctx| ctx.analyze_escape(&binding.expr, class, 1));
        }
        self.analyze_escape(&form.body, body_class, 1);
    }

    /// Count uses of every visible tracked variable under `expr`.
    pub fn analyze_expr(&mut self, expr: &Value, depth: usize, in_lambda: bool) {
        if depth > self.depth_limit {
            self.skip(expr, depth);
            return;
        }
        if let Value::Sym(name) = expr {
            if let Some(usage) = self.visible_mut(name) {
                usage.use_count += 1;
                usage.last_use_depth = depth;
                usage.captured |= in_lambda;
            }
            return;
        }
        let Some(items) = form_items(expr) else {
            return;
        };
        match (items.first().and_then(Value::as_symbol), items.as_slice()) {
            (Some("quote" | "deftype" | "menv"), _) => {}
            (Some("lambda"), [_, params, body]) => {
                let params = param_names(params);
                self.with_shadowed(params, |ctx| ctx.analyze_expr(body, depth + 1, true));
            }
            (Some(kw @ ("let" | "letrec")), [_, rest @ ..]) => match nested_let(kw, rest) {
                Some(inner) => self.walk_nested_let(&inner, |ctx, e, _| {
                    ctx.analyze_expr(e, depth + 1, in_lambda);
                }),
                None => self.analyze_all(&items[1..], depth, in_lambda),
            },
            (Some("set-meta!"), [_, _, handler]) => self.analyze_expr(handler, depth + 1, in_lambda),
            (Some("scan"), [_, Value::Sym(_), operand]) => self.analyze_expr(operand, depth + 1, in_lambda),
            _ => self.analyze_all(&items, depth, in_lambda),
        }
    }

    fn analyze_all(&mut self, items: &[Value], depth: usize, in_lambda: bool) {
        for item in items {
            self.analyze_expr(item, depth + 1, in_lambda);
        }
    }

    /// Visit a nested `let` with its binders shadowing tracked names. The
    /// callback receives each statement and whether it is the body.
    fn walk_nested_let(&mut self, inner: &LetForm, mut visit: impl FnMut(&mut Self, &Value, Option<usize>)) {
        let names: Vec<Rc<str>> = inner.names().cloned().collect();
        match inner.kind {
            LetKind::LetRec => self.with_shadowed(names, |ctx| {
                for (i, binding) in inner.bindings.iter().enumerate() {
                    visit(ctx, &binding.expr, Some(i));
                }
                visit(ctx, &inner.body, None);
            }),
            LetKind::Let => {
                let mark = self.shadowed.len();
                for (i, binding) in inner.bindings.iter().enumerate() {
                    visit(self, &binding.expr, Some(i));
                    self.shadowed.push(binding.name.clone());
                }
                visit(self, &inner.body, None);
                self.shadowed.truncate(mark);
            }
        }
    }

    /// Join `inherited` into every visible variable referenced under `expr`.
    pub fn analyze_escape(&mut self, expr: &Value, inherited: EscapeClass, depth: usize) {
        if depth > self.depth_limit {
            self.skip(expr, depth);
            return;
        }
        if let Value::Sym(name) = expr {
            if let Some(usage) = self.visible_mut(name) {
                usage.escape = usage.escape.join(inherited);
            }
            return;
        }
        let Some(items) = form_items(expr) else {
            return;
        };
        let next = depth + 1;
        match (items.first().and_then(Value::as_symbol), items.as_slice()) {
            (Some("quote" | "deftype" | "menv"), _) => {}
            (Some("lambda"), [_, params, body]) => {
                let params = param_names(params);
                self.with_shadowed(params, |ctx| ctx.analyze_escape(body, EscapeClass::Global, next));
            }
            (Some(kw @ ("let" | "letrec")), [_, rest @ ..]) => match nested_let(kw, rest) {
                Some(inner) => {
                    let returned = returned_names(&inner.body);
                    let binding_class = |i: usize| match inner.kind {
                        LetKind::LetRec => EscapeClass::Global,
                        LetKind::Let if returned.contains(&inner.bindings[i].name) => inherited,
                        LetKind::Let => EscapeClass::None,
                    };
                    self.walk_nested_let(&inner, |ctx, e, statement| {
                        let class = statement.map_or(inherited, binding_class);
                        ctx.analyze_escape(e, class, next);
                    });
                }
                None => {
                    for item in &items[1..] {
                        self.analyze_escape(item, EscapeClass::Global, next);
                    }
                }
            },
            (Some("if"), [_, condition, branches @ ..]) => {
                self.analyze_escape(condition, EscapeClass::None, next);
                for branch in branches {
                    self.analyze_escape(branch, inherited, next);
                }
            }
            (Some("set!"), [_, target, value]) => {
                self.analyze_escape(target, EscapeClass::Global, next);
                self.analyze_escape(value, EscapeClass::Global, next);
            }
            (Some("set-meta!"), [_, _, handler]) => {
                self.analyze_escape(handler, EscapeClass::Global, next);
            }
            (Some("scan"), [_, operand] | [_, Value::Sym(_), operand]) => {
                self.analyze_escape(operand, inherited.join(EscapeClass::Arg), next);
            }
            (Some("lift" | "freeze" | "run" | "EM"), [_, operand]) => {
                self.analyze_escape(operand, inherited, next);
            }
            (_, [head, args @ ..]) => {
                let constructs = matches!(head.as_symbol(), Some("cons" | "list"));
                self.analyze_escape(head, EscapeClass::None, next);
                for arg in args {
                    if constructs && let Value::Sym(name) = arg
                        && let Some(usage) = self.visible_mut(name)
                    {
                        usage.stored = true;
                    }
                    self.analyze_escape(arg, inherited.join(EscapeClass::Arg), next);
                }
            }
            (_, []) => {}
        }
    }
}

fn param_names(params: &Value) -> Vec<Rc<str>> {
    params
        .iter()
        .filter_map(|p| match p {
            Value::Sym(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

fn nested_let(keyword: &str, rest: &[Value]) -> Option<LetForm> {
    let kind = if keyword == "let" { LetKind::Let } else { LetKind::LetRec };
    LetForm::from_parts(kind, rest).ok()
}

/// Names the expression may return as its own result, without wrapping
/// them in a new allocation.
pub(crate) fn returned_names(expr: &Value) -> Vec<Rc<str>> {
    let mut out = Vec::new();
    let mut pending = vec![expr.clone()];
    while let Some(current) = pending.pop() {
        if let Value::Sym(name) = &current {
            if !out.contains(name) {
                out.push(name.clone());
            }
            continue;
        }
        let Some(items) = form_items(&current) else {
            continue;
        };
        match (items.first().and_then(Value::as_symbol), items.as_slice()) {
            (Some("if"), [_, _, branches @ ..]) => pending.extend(branches.iter().cloned()),
            (Some("lift" | "freeze" | "run"), [_, operand]) => pending.push(operand.clone()),
            (Some("let" | "letrec"), [_, _, body]) => pending.push(body.clone()),
            _ => {}
        }
    }
    out
}
