//! Meta-environments: one level of the reflective tower.
//!
//! An [`MEnv`] pairs a binding [`Environment`] with a lazily created parent
//! level and a [`HandlerTable`] covering literals, variables, application,
//! `let` and `if`. `set-meta!` swaps a slot for a closure written in the
//! language itself; such closures receive the form as data and run one level
//! up the tower.

use super::{Environment, apply_value, create_global_env};
use crate::Error;
use crate::analysis::shape::Shape;
use crate::ast::Value;
use crate::codegen::BranchRelease;
use crate::session::Session;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Signature of a built-in handler: the whole form, the current level, depth
pub type NativeHandler = fn(&Value, &Rc<MEnv>, usize) -> Result<Value, Error>;

/// The closed set of evaluator operations that can be redefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerSlot {
    Lit,
    Var,
    App,
    Let,
    If,
}

impl HandlerSlot {
    pub fn from_name(name: &str) -> Option<HandlerSlot> {
        match name {
            "lit" => Some(HandlerSlot::Lit),
            "var" => Some(HandlerSlot::Var),
            "app" => Some(HandlerSlot::App),
            "let" => Some(HandlerSlot::Let),
            "if" => Some(HandlerSlot::If),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub enum Handler {
    Native(NativeHandler),
    /// A procedure value installed with `set-meta!`
    Reflected(Value),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Native(_) => write!(f, "Native(<fn>)"),
            Handler::Reflected(v) => write!(f, "Reflected({v})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerTable {
    pub lit: Handler,
    pub var: Handler,
    pub app: Handler,
    pub let_form: Handler,
    pub if_form: Handler,
}

impl Default for HandlerTable {
    fn default() -> Self {
        HandlerTable {
            lit: Handler::Native(super::default_lit),
            var: Handler::Native(super::default_var),
            app: Handler::Native(super::default_app),
            let_form: Handler::Native(super::default_let),
            if_form: Handler::Native(super::default_if),
        }
    }
}

impl HandlerTable {
    pub fn get(&self, slot: HandlerSlot) -> &Handler {
        match slot {
            HandlerSlot::Lit => &self.lit,
            HandlerSlot::Var => &self.var,
            HandlerSlot::App => &self.app,
            HandlerSlot::Let => &self.let_form,
            HandlerSlot::If => &self.if_form,
        }
    }

    pub fn set(&mut self, slot: HandlerSlot, handler: Handler) {
        let target = match slot {
            HandlerSlot::Lit => &mut self.lit,
            HandlerSlot::Var => &mut self.var,
            HandlerSlot::App => &mut self.app,
            HandlerSlot::Let => &mut self.let_form,
            HandlerSlot::If => &mut self.if_form,
        };
        *target = handler;
    }

    /// Restore the built-in handler for one slot
    pub fn reset(&mut self, slot: HandlerSlot) {
        let defaults = HandlerTable::default();
        self.set(slot, defaults.get(slot).clone());
    }
}

pub struct MEnv {
    env: RefCell<Environment>,
    parent: RefCell<Option<Rc<MEnv>>>,
    handlers: RefCell<HandlerTable>,
    session: Rc<Session>,
    /// `lift` produces code only while staging; `run` switches it off.
    staging: Cell<bool>,
    /// Shapes inferred for enclosing compiled bindings, visible to nested lets
    known_shapes: RefCell<HashMap<Rc<str>, Shape>>,
    /// Releases staged `if` forms of the current compiled body perform
    branch_releases: RefCell<Vec<BranchRelease>>,
}

impl MEnv {
    /// Level-0 meta-environment over the primitive bindings
    pub fn root(session: Rc<Session>) -> Rc<MEnv> {
        Rc::new(MEnv {
            env: RefCell::new(create_global_env()),
            parent: RefCell::new(None),
            handlers: RefCell::new(HandlerTable::default()),
            session,
            staging: Cell::new(true),
            known_shapes: RefCell::new(HashMap::new()),
            branch_releases: RefCell::new(Vec::new()),
        })
    }

    /// A new MEnv at the same tower level: inherits handlers, parent and
    /// staging mode, with its own binding environment.
    pub fn child(self: &Rc<Self>, env: Environment) -> Rc<MEnv> {
        Rc::new(MEnv {
            env: RefCell::new(env),
            parent: RefCell::new(self.parent.borrow().clone()),
            handlers: RefCell::new(self.handlers.borrow().clone()),
            session: Rc::clone(&self.session),
            staging: Cell::new(self.staging.get()),
            known_shapes: RefCell::new(self.known_shapes.borrow().clone()),
            branch_releases: RefCell::new(Vec::new()),
        })
    }

    /// The level above this one, created on first use with the primitive
    /// bindings and default handlers.
    pub fn parent_or_create(&self) -> Rc<MEnv> {
        let mut parent = self.parent.borrow_mut();
        if let Some(existing) = parent.as_ref() {
            return Rc::clone(existing);
        }
        tracing::debug!("creating parent meta-environment");
        let created = MEnv::root(Rc::clone(&self.session));
        *parent = Some(Rc::clone(&created));
        created
    }

    pub fn has_parent(&self) -> bool {
        self.parent.borrow().is_some()
    }

    pub fn env(&self) -> Environment {
        self.env.borrow().clone()
    }

    pub fn set_env(&self, env: Environment) {
        *self.env.borrow_mut() = env;
    }

    /// Bind a name in this level's environment (used by `set-meta!` on primitives)
    pub fn define(&self, name: Rc<str>, value: Value) {
        let extended = self.env.borrow().extend(name, value);
        self.set_env(extended);
    }

    pub fn handler(&self, slot: HandlerSlot) -> Handler {
        self.handlers.borrow().get(slot).clone()
    }

    pub fn set_handler(&self, slot: HandlerSlot, handler: Handler) {
        self.handlers.borrow_mut().set(slot, handler);
    }

    pub fn reset_handler(&self, slot: HandlerSlot) {
        self.handlers.borrow_mut().reset(slot);
    }

    pub fn session(&self) -> &Rc<Session> {
        &self.session
    }

    pub fn is_staging(&self) -> bool {
        self.staging.get()
    }

    pub fn set_staging(&self, staging: bool) {
        self.staging.set(staging);
    }

    pub fn known_shapes(&self) -> HashMap<Rc<str>, Shape> {
        self.known_shapes.borrow().clone()
    }

    pub fn record_shapes(&self, shapes: impl IntoIterator<Item = (Rc<str>, Shape)>) {
        self.known_shapes.borrow_mut().extend(shapes);
    }

    pub fn set_branch_releases(&self, releases: Vec<BranchRelease>) {
        *self.branch_releases.borrow_mut() = releases;
    }

    /// Release code for entering `branch` of the `if` form identified by `site`
    pub fn branch_releases(&self, site: usize, branch: usize) -> Vec<String> {
        self.branch_releases
            .borrow()
            .iter()
            .filter(|r| r.site == site && r.branch == branch)
            .map(|r| r.code.clone())
            .collect()
    }

    /// Run the handler installed for `slot` on `expr`.
    pub fn dispatch(self: &Rc<Self>, slot: HandlerSlot, expr: &Value, depth: usize) -> Result<Value, Error> {
        match self.handler(slot) {
            Handler::Native(f) => f(expr, self, depth),
            Handler::Reflected(procedure) => {
                let meta = self.parent_or_create();
                apply_value(&procedure, vec![expr.clone()], &meta, depth + 1)
            }
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{sym, val};
    use crate::session::{CompileOptions, Session};

    fn root() -> Rc<MEnv> {
        MEnv::root(Rc::new(Session::new(CompileOptions::default())))
    }

    #[test]
    fn test_slot_names() {
        let cases = vec![
            ("lit", Some(HandlerSlot::Lit)),
            ("var", Some(HandlerSlot::Var)),
            ("app", Some(HandlerSlot::App)),
            ("let", Some(HandlerSlot::Let)),
            ("if", Some(HandlerSlot::If)),
            ("+", None),
        ];
        for (name, expected) in cases {
            assert_eq!(HandlerSlot::from_name(name), expected, "slot {name}");
        }
    }

    #[test]
    fn test_parent_is_lazy_and_shared() {
        let menv = root();
        assert!(!menv.has_parent());
        let p1 = menv.parent_or_create();
        let p2 = menv.parent_or_create();
        assert!(Rc::ptr_eq(&p1, &p2));
        let child = menv.child(menv.env());
        assert!(Rc::ptr_eq(&child.parent_or_create(), &p1));
    }

    #[test]
    fn test_child_inherits_handlers_and_bindings_stay_local() {
        let menv = root();
        menv.set_handler(HandlerSlot::Lit, Handler::Reflected(val(0)));
        let child = menv.child(menv.env().extend("x".into(), val(1)));
        assert!(matches!(child.handler(HandlerSlot::Lit), Handler::Reflected(_)));
        assert_eq!(child.env().lookup("x"), Some(val(1)));
        assert_eq!(menv.env().lookup("x"), None);

        child.reset_handler(HandlerSlot::Lit);
        assert!(matches!(child.handler(HandlerSlot::Lit), Handler::Native(_)));
        assert!(matches!(menv.handler(HandlerSlot::Lit), Handler::Reflected(_)));
    }

    #[test]
    fn test_define_shadows() {
        let menv = root();
        menv.define("car".into(), sym("replaced"));
        assert_eq!(menv.env().lookup("car"), Some(sym("replaced")));
        assert!(menv.parent_or_create().env().lookup("car").is_some_and(|v| v != sym("replaced")));
    }
}
