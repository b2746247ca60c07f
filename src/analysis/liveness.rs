//! Liveness over a statement-tagged control-flow graph.
//!
//! Every binding expression and the body of a `let` become CFG nodes; `if`
//! splits into a condition node and one subgraph per branch. A definition
//! node follows each binding. Backward dataflow computes
//!
//! ```text
//! live_out(n) = union of live_in(s) for s in succ(n)
//! live_in(n)  = uses(n) + (live_out(n) - defs(n))
//! ```
//!
//! A variable live into `n` but dead on some edge out of it has a free point
//! at `n`. When `n` is the condition of an `if`, the point is conditional and
//! records the branches the variable is dead on; the emitter releases it on
//! entry to those branches behind a per-variable flag.

use super::{LetForm, LetKind, form_items, free_variables, mutates, symbols_in};
use crate::Error;
use crate::ast::Value;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Evaluates (part of) a statement
    Expr,
    /// Condition of an `if`
    Branch,
    /// Binding of a name after its value statement
    Def,
    Exit,
}

#[derive(Debug, Clone)]
pub struct CfgNode {
    pub kind: NodeKind,
    /// Statement the node belongs to: bindings `0..n`, body `n`
    pub statement: usize,
    pub uses: Vec<Rc<str>>,
    pub defs: Vec<Rc<str>>,
    pub succs: SmallVec<[usize; 2]>,
    pub preds: SmallVec<[usize; 2]>,
    /// Identity of the `if` form a branch node splits
    pub site: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreePoint {
    pub var: Rc<str>,
    pub node: usize,
    pub statement: usize,
    /// Dead on some outgoing edges only
    pub conditional: bool,
    /// Positions in `succs` the variable is dead on: 0 then, 1 else
    pub dead_on: SmallVec<[usize; 2]>,
}

#[derive(Debug, Default)]
pub struct Liveness {
    nodes: Vec<CfgNode>,
    live_in: Vec<HashSet<Rc<str>>>,
    live_out: Vec<HashSet<Rc<str>>>,
    free_points: Vec<FreePoint>,
    freezable: Vec<(Rc<str>, usize)>,
    iterations: usize,
    converged: bool,
}

struct Builder<'a> {
    nodes: Vec<CfgNode>,
    form: &'a LetForm,
    depth_limit: usize,
}

impl Builder<'_> {
    fn add(&mut self, kind: NodeKind, statement: usize, uses: Vec<Rc<str>>, defs: Vec<Rc<str>>) -> usize {
        self.nodes.push(CfgNode {
            kind,
            statement,
            uses,
            defs,
            succs: SmallVec::new(),
            preds: SmallVec::new(),
            site: None,
        });
        self.nodes.len() - 1
    }

    fn link(&mut self, from: usize, to: usize) {
        if !self.nodes[from].succs.contains(&to) {
            self.nodes[from].succs.push(to);
            self.nodes[to].preds.push(from);
        }
    }

    fn visible_uses(&self, names: Vec<Rc<str>>, statement: usize) -> Vec<Rc<str>> {
        let visible = self.form.visible_in(statement);
        names
            .into_iter()
            .filter(|name| visible.iter().any(|b| b.name == *name))
            .collect()
    }

    /// Build the subgraph for `expr`, returning its entry and exit nodes.
    fn build(&mut self, expr: &Value, statement: usize, depth: usize) -> (usize, SmallVec<[usize; 2]>) {
        if depth > self.depth_limit {
            tracing::warn!(
                error = %Error::PipelineSkip(format!("liveness at depth {depth}")),
                "using every symbol of the subtree"
            );
            let uses = self.visible_uses(symbols_in(expr), statement);
            let node = self.add(NodeKind::Expr, statement, uses, Vec::new());
            return (node, SmallVec::from_slice(&[node]));
        }
        if expr.head_symbol() == Some("if")
            && let Some(items) = form_items(expr)
            && let [_, condition, then_branch, rest @ ..] = items.as_slice()
            && rest.len() <= 1
        {
            let uses = self.visible_uses(free_variables(condition), statement);
            let branch = self.add(NodeKind::Branch, statement, uses, Vec::new());
            self.nodes[branch].site = expr.cell_id();
            let mut exits = SmallVec::new();
            let (then_entry, then_exits) = self.build(then_branch, statement, depth + 1);
            self.link(branch, then_entry);
            exits.extend(then_exits);
            match rest.first() {
                Some(else_branch) => {
                    let (else_entry, else_exits) = self.build(else_branch, statement, depth + 1);
                    self.link(branch, else_entry);
                    exits.extend(else_exits);
                }
                None => exits.push(branch),
            }
            return (branch, exits);
        }
        let uses = self.visible_uses(free_variables(expr), statement);
        let node = self.add(NodeKind::Expr, statement, uses, Vec::new());
        (node, SmallVec::from_slice(&[node]))
    }
}

impl Liveness {
    /// Build the CFG for `form` and solve liveness, stopping after
    /// `iteration_cap` rounds with the current approximation.
    pub fn analyze(form: &LetForm, iteration_cap: usize, depth_limit: usize) -> Liveness {
        let mut builder = Builder {
            nodes: Vec::new(),
            form,
            depth_limit,
        };
        let mut pending_exits: SmallVec<[usize; 2]> = SmallVec::new();
        for statement in 0..=form.body_statement() {
            let (entry, exits) = builder.build(form.statement(statement), statement, 1);
            for exit in pending_exits.drain(..) {
                builder.link(exit, entry);
            }
            pending_exits = exits;
            if let Some(binding) = form.bindings.get(statement) {
                let def = builder.add(NodeKind::Def, statement, Vec::new(), vec![binding.name.clone()]);
                for exit in pending_exits.drain(..) {
                    builder.link(exit, def);
                }
                pending_exits.push(def);
            }
        }
        let exit = builder.add(NodeKind::Exit, form.body_statement(), Vec::new(), Vec::new());
        for node in pending_exits {
            builder.link(node, exit);
        }

        let mut liveness = Liveness {
            live_in: vec![HashSet::new(); builder.nodes.len()],
            live_out: vec![HashSet::new(); builder.nodes.len()],
            nodes: builder.nodes,
            ..Liveness::default()
        };
        liveness.solve(iteration_cap);
        liveness.collect_free_points();
        liveness.collect_freeze_points(form);
        liveness
    }

    fn solve(&mut self, iteration_cap: usize) {
        while self.iterations < iteration_cap {
            self.iterations += 1;
            let mut changed = false;
            for n in (0..self.nodes.len()).rev() {
                let out: HashSet<Rc<str>> = self.nodes[n]
                    .succs
                    .iter()
                    .flat_map(|&s| self.live_in[s].iter().cloned())
                    .collect();
                let node = &self.nodes[n];
                let mut live: HashSet<Rc<str>> = out
                    .iter()
                    .filter(|name| !node.defs.contains(*name))
                    .cloned()
                    .collect();
                live.extend(node.uses.iter().cloned());
                if live != self.live_in[n] || out != self.live_out[n] {
                    self.live_in[n] = live;
                    self.live_out[n] = out;
                    changed = true;
                }
            }
            tracing::trace!(iteration = self.iterations, changed, "liveness round");
            if !changed {
                self.converged = true;
                return;
            }
        }
        tracing::warn!(cap = iteration_cap, "liveness iteration cap reached, keeping approximation");
    }

    fn collect_free_points(&mut self) {
        for (n, node) in self.nodes.iter().enumerate() {
            let mut vars: Vec<&Rc<str>> = self.live_in[n].iter().collect();
            vars.sort();
            for var in vars {
                let dead_on: SmallVec<[usize; 2]> = node
                    .succs
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !self.live_in[**s].contains(var))
                    .map(|(position, _)| position)
                    .collect();
                if !dead_on.is_empty() {
                    self.free_points.push(FreePoint {
                        var: var.clone(),
                        node: n,
                        statement: node.statement,
                        conditional: dead_on.len() < node.succs.len(),
                        dead_on,
                    });
                }
            }
        }
    }

    /// A binding can be frozen right after its declaration when no later
    /// statement assigns it.
    fn collect_freeze_points(&mut self, form: &LetForm) {
        for (i, binding) in form.bindings.iter().enumerate() {
            let later = match form.kind {
                LetKind::Let => i + 1,
                LetKind::LetRec => 0,
            };
            let mutated = (later..=form.body_statement()).any(|s| mutates(form.statement(s), &binding.name));
            if !mutated {
                self.freezable.push((binding.name.clone(), i));
            }
        }
    }

    pub fn nodes(&self) -> &[CfgNode] {
        &self.nodes
    }

    pub fn live_in(&self, node: usize) -> Option<&HashSet<Rc<str>>> {
        self.live_in.get(node)
    }

    pub fn live_out(&self, node: usize) -> Option<&HashSet<Rc<str>>> {
        self.live_out.get(node)
    }

    pub fn free_points(&self) -> &[FreePoint] {
        &self.free_points
    }

    pub fn free_points_for<'a>(&'a self, var: &'a str) -> impl Iterator<Item = &'a FreePoint> + 'a {
        self.free_points.iter().filter(move |p| &*p.var == var)
    }

    /// `(if site, branch)` pairs in `statement` on whose entry `var` dies
    /// while staying live on the other branch
    pub fn branch_deaths(&self, var: &str, statement: usize) -> Vec<(usize, usize)> {
        self.free_points_for(var)
            .filter(|p| p.conditional && p.statement == statement)
            .filter_map(|p| {
                let node = &self.nodes[p.node];
                let site = node.site.filter(|_| node.kind == NodeKind::Branch)?;
                Some(p.dead_on.iter().map(move |&branch| (site, branch)))
            })
            .flatten()
            .collect()
    }

    /// Last statement in which `var` is still live, if it is ever used
    pub fn last_statement(&self, var: &str) -> Option<usize> {
        self.free_points_for(var).map(|p| p.statement).max()
    }

    pub fn freeze_points(&self) -> &[(Rc<str>, usize)] {
        &self.freezable
    }

    pub fn is_freezable(&self, var: &str) -> bool {
        self.freezable.iter().any(|(name, _)| &**name == var)
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }
}
