//! Stage-polymorphic evaluator.
//!
//! Evaluation dispatches on the shape of an expression. Literals, variables,
//! applications, `let` and `if` go through the current [`MEnv`]'s handler
//! table; the remaining special forms are fixed. Whenever a `let` binding
//! evaluates to a code fragment the block is compiled instead of interpreted.

pub mod menv;

use crate::ast::{Closure, Value};
use crate::builtinops::get_builtin_ops;
use crate::codegen::{self, can_lift, lift_value};
use crate::analysis::{self, LetForm, LetKind};
use crate::{Error, MAX_EVAL_DEPTH};
use menv::{Handler, HandlerSlot, MEnv};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::LazyLock;

/// Binding environment: an immutable chain of frames. Extension prepends and
/// shares the tail; only `letrec` and `set!` write through an existing frame.
#[derive(Clone, Default)]
pub struct Environment(Option<Rc<Frame>>);

struct Frame {
    name: Rc<str>,
    value: RefCell<Value>,
    next: Environment,
}

impl Environment {
    pub fn new() -> Self {
        Environment(None)
    }

    pub fn extend(&self, name: Rc<str>, value: Value) -> Environment {
        Environment(Some(Rc::new(Frame {
            name,
            value: RefCell::new(value),
            next: self.clone(),
        })))
    }

    fn find(&self, name: &str) -> Option<&Frame> {
        let mut cur = self.0.as_deref();
        while let Some(frame) = cur {
            if &*frame.name == name {
                return Some(frame);
            }
            cur = frame.next.0.as_deref();
        }
        None
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.find(name).map(|frame| frame.value.borrow().clone())
    }

    /// Overwrite the innermost binding of `name`; false when unbound.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        match self.find(name) {
            Some(frame) => {
                *frame.value.borrow_mut() = value;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        let mut cur = self.0.as_deref();
        while let Some(frame) = cur {
            names.push(frame.name.clone());
            cur = frame.next.0.as_deref();
        }
        write!(f, "Environment{names:?}")
    }
}

/// Environment holding every primitive under its source name
pub fn create_global_env() -> Environment {
    get_builtin_ops()
        .iter()
        .fold(Environment::new(), |env, op| env.extend(Rc::from(op.id), Value::Prim(op)))
}

/// Evaluate an expression at the given tower level
pub fn eval(expr: &Value, menv: &Rc<MEnv>) -> Result<Value, Error> {
    eval_with_depth_tracking(expr, menv, 0)
}

/// Compile a `let` or `letrec` form even when none of its bindings is staged.
pub fn compile_let_form(expr: &Value, menv: &Rc<MEnv>) -> Result<Value, Error> {
    let form = LetForm::parse(expr)?;
    match form.kind {
        LetKind::Let => evaluate_let(&form, menv, 0, CompileMode::Force),
        LetKind::LetRec => evaluate_letrec(&form, menv, 0, CompileMode::Force),
    }
}

pub(crate) fn eval_with_depth_tracking(
    expr: &Value,
    menv: &Rc<MEnv>,
    depth: usize,
) -> Result<Value, Error> {
    if depth >= MAX_EVAL_DEPTH {
        return Err(Error::EvalError(format!(
            "Evaluation depth limit exceeded (max: {MAX_EVAL_DEPTH})"
        )));
    }
    match expr {
        Value::Int(_) | Value::Nil => menv.dispatch(HandlerSlot::Lit, expr, depth),
        Value::Sym(_) => menv.dispatch(HandlerSlot::Var, expr, depth),
        Value::Cell(_) => eval_form(expr, menv, depth).map_err(|err| add_context(err, expr)),
        // Code fragments, procedures and reified levels evaluate to themselves
        Value::Code(_) | Value::Prim(_) | Value::Closure(_) | Value::MEnv(_) => Ok(expr.clone()),
    }
}

fn add_context(error: Error, expr: &Value) -> Error {
    let context = format!("while evaluating: {expr}");
    match error {
        Error::EvalError(msg) if !msg.contains("\n  Context:") => {
            Error::EvalError(format!("{msg}\n  Context: {context}"))
        }
        Error::TypeMismatch(msg) if !msg.contains("\n  Context:") => {
            Error::TypeMismatch(format!("{msg}\n  Context: {context}"))
        }
        other => other,
    }
}

type SpecialForm = fn(&[Value], &Rc<MEnv>, usize) -> Result<Value, Error>;

static SPECIAL_FORMS: LazyLock<HashMap<&'static str, SpecialForm>> = LazyLock::new(|| {
    let forms: [(&'static str, SpecialForm); 12] = [
        ("quote", eval_quote),
        ("lift", eval_lift),
        ("lambda", eval_lambda),
        ("EM", eval_em),
        ("set-meta!", eval_set_meta),
        ("scan", eval_scan),
        ("letrec", eval_letrec),
        ("set!", eval_set),
        ("run", eval_run),
        ("deftype", eval_deftype),
        ("freeze", eval_freeze),
        ("menv", eval_menv),
    ];
    forms.into_iter().collect()
});

/// Names with evaluation rules of their own (including the handler-backed ones)
pub(crate) fn is_special_form(name: &str) -> bool {
    matches!(name, "let" | "if") || SPECIAL_FORMS.contains_key(name)
}

fn form_args(expr: &Value) -> Result<Vec<Value>, Error> {
    expr.cdr()
        .and_then(Value::list_items)
        .ok_or_else(|| Error::EvalError(format!("Malformed expression: {expr}")))
}

fn eval_form(expr: &Value, menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    if let Some(name) = expr.head_symbol() {
        match name {
            "let" => return menv.dispatch(HandlerSlot::Let, expr, depth),
            "if" => return menv.dispatch(HandlerSlot::If, expr, depth),
            _ => {
                if let Some(special_form) = SPECIAL_FORMS.get(name) {
                    let args = form_args(expr)?;
                    return special_form(&args, menv, depth);
                }
            }
        }
    }
    menv.dispatch(HandlerSlot::App, expr, depth)
}

//
// Default handlers
//

pub(crate) fn default_lit(expr: &Value, _menv: &Rc<MEnv>, _depth: usize) -> Result<Value, Error> {
    Ok(expr.clone())
}

pub(crate) fn default_var(expr: &Value, menv: &Rc<MEnv>, _depth: usize) -> Result<Value, Error> {
    let name = expr
        .as_symbol()
        .ok_or_else(|| Error::TypeMismatch(format!("variable handler given non-symbol {expr}")))?;
    menv.env()
        .lookup(name)
        .ok_or_else(|| Error::UnboundSymbol(name.to_owned()))
}

pub(crate) fn default_app(expr: &Value, menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let items = expr
        .list_items()
        .ok_or_else(|| Error::EvalError(format!("Cannot apply improper list: {expr}")))?;
    let [func_expr, arg_exprs @ ..] = items.as_slice() else {
        return Err(Error::EvalError("Cannot evaluate empty list".to_owned()));
    };
    let func = eval_with_depth_tracking(func_expr, menv, depth + 1)?;
    let args = arg_exprs
        .iter()
        .map(|arg| eval_with_depth_tracking(arg, menv, depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    apply_value(&func, args, menv, depth)
}

/// Apply a procedure value to already evaluated arguments.
pub(crate) fn apply_value(
    func: &Value,
    args: Vec<Value>,
    menv: &Rc<MEnv>,
    depth: usize,
) -> Result<Value, Error> {
    match func {
        Value::Prim(op) => op.apply(&args),
        Value::Closure(closure) => apply_closure(closure, args, menv, depth),
        _ => Err(Error::TypeMismatch(format!("Cannot apply non-function: {func}"))),
    }
}

fn apply_closure(
    closure: &Closure,
    args: Vec<Value>,
    menv: &Rc<MEnv>,
    depth: usize,
) -> Result<Value, Error> {
    if closure.params.len() != args.len() {
        tracing::warn!(
            expected = closure.params.len(),
            got = args.len(),
            "argument count mismatch, binding the shorter list"
        );
    }
    let env = closure
        .params
        .iter()
        .zip(args)
        .fold(closure.env.clone(), |env, (param, arg)| env.extend(param.clone(), arg));
    let body_level = menv.child(env);
    eval_with_depth_tracking(&closure.body, &body_level, depth + 1).map_err(|err| match err {
        Error::EvalError(msg) => Error::EvalError(format!("{msg}\n  In lambda: {}", closure.body)),
        other => other,
    })
}

pub(crate) fn default_if(expr: &Value, menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let args = form_args(expr)?;
    let (cond_expr, then_expr, else_expr) = match args.as_slice() {
        [c, t, e] => (c, t, Some(e)),
        [c, t] => (c, t, None),
        _ => return Err(Error::arity_error_with_expr(3, args.len(), expr.to_string())),
    };
    let condition = eval_with_depth_tracking(cond_expr, menv, depth + 1)?;
    let eval_else = |menv: &Rc<MEnv>| match else_expr {
        Some(e) => eval_with_depth_tracking(e, menv, depth + 1),
        None => Ok(Value::Nil),
    };
    if let Value::Code(cond_code) = &condition {
        let then_code = lift_value(&eval_with_depth_tracking(then_expr, menv, depth + 1)?)?;
        let else_code = lift_value(&eval_else(menv)?)?;
        let then_code = with_branch_releases(then_code, expr, menv, 0);
        let else_code = with_branch_releases(else_code, expr, menv, 1);
        return Ok(Value::code(format!(
            "(is_true({cond_code}) ? {then_code} : {else_code})"
        )));
    }
    if condition.is_truthy() {
        eval_with_depth_tracking(then_expr, menv, depth + 1)
    } else {
        eval_else(menv)
    }
}

/// Prefix a staged branch with the releases of bindings that die on entering it
fn with_branch_releases(code: String, expr: &Value, menv: &MEnv, branch: usize) -> String {
    let releases = expr
        .cell_id()
        .map(|site| menv.branch_releases(site, branch))
        .unwrap_or_default();
    if releases.is_empty() {
        return code;
    }
    format!("({}, {code})", releases.join(", "))
}

pub(crate) fn default_let(expr: &Value, menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let form = LetForm::parse(expr)?;
    evaluate_let(&form, menv, depth, CompileMode::Auto)
}

//
// let / letrec
//

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompileMode {
    /// Compile only when some binding evaluates to code
    Auto,
    Force,
}

/// Whether a binding value gets a declaration in compiled output. Procedures
/// and symbols stay compile-time values and are applied or inlined instead.
fn is_materialized(value: &Value) -> bool {
    match value {
        Value::Int(_) | Value::Nil | Value::Code(_) => true,
        Value::Cell(_) => can_lift(value),
        _ => false,
    }
}

fn code_ref(name: &str, menv: &MEnv) -> Value {
    Value::Code(menv.session().arena.intern(&codegen::mangle(name)))
}

/// Bindings are evaluated in order, each seeing the ones before it. Once one
/// of them is staged, every materialized binding is referenced by name.
fn evaluate_let(form: &LetForm, menv: &Rc<MEnv>, depth: usize, mode: CompileMode) -> Result<Value, Error> {
    let scope = menv.child(menv.env());
    let mut staged = mode == CompileMode::Force;
    let mut values: Vec<Value> = Vec::with_capacity(form.bindings.len());

    for binding in &form.bindings {
        let value = eval_with_depth_tracking(&binding.expr, &scope, depth + 1)?;
        if value.is_code() && !staged {
            staged = true;
            for (earlier, earlier_value) in form.bindings.iter().zip(&values) {
                if is_materialized(earlier_value) {
                    scope.define(earlier.name.clone(), code_ref(&earlier.name, &scope));
                }
            }
        }
        let bound = if staged && is_materialized(&value) {
            code_ref(&binding.name, &scope)
        } else {
            value.clone()
        };
        scope.define(binding.name.clone(), bound);
        values.push(value);
    }

    if !staged {
        return eval_with_depth_tracking(&form.body, &scope, depth + 1);
    }
    compile_block(form, &values, &scope, depth)
}

fn evaluate_letrec(form: &LetForm, menv: &Rc<MEnv>, depth: usize, mode: CompileMode) -> Result<Value, Error> {
    if mode == CompileMode::Auto {
        let env = form
            .bindings
            .iter()
            .fold(menv.env(), |env, b| env.extend(b.name.clone(), Value::Nil));
        let scope = menv.child(env.clone());
        let values = form
            .bindings
            .iter()
            .map(|b| eval_with_depth_tracking(&b.expr, &scope, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        if !values.iter().any(Value::is_code) {
            for (binding, value) in form.bindings.iter().zip(values) {
                env.assign(&binding.name, value);
            }
            return eval_with_depth_tracking(&form.body, &scope, depth + 1);
        }
        tracing::debug!("letrec binding staged, recompiling with named references");
    }

    let env = form
        .bindings
        .iter()
        .fold(menv.env(), |env, b| env.extend(b.name.clone(), code_ref(&b.name, menv)));
    let scope = menv.child(env);
    let values = form
        .bindings
        .iter()
        .map(|b| eval_with_depth_tracking(&b.expr, &scope, depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    compile_block(form, &values, &scope, depth)
}

/// Run the analysis suite over the form, evaluate the body with every
/// binding referenced by name, and emit the block.
fn compile_block(form: &LetForm, values: &[Value], scope: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let session = Rc::clone(scope.session());
    let analysis = analysis::analyze_let(form, &scope.known_shapes(), &session.options);
    scope.record_shapes(analysis.binding_shapes());
    let block = codegen::LetBlock::plan(form, values, &analysis, &session.options)?;
    scope.set_branch_releases(block.branch_releases());
    let body = eval_with_depth_tracking(&form.body, scope, depth + 1)?;
    let code = block.emit(&body)?;
    tracing::debug!(bindings = form.bindings.len(), "compiled let block");
    Ok(Value::code(code))
}

//
// Special forms
//

fn expect_args<'a, const N: usize>(args: &'a [Value], form: &str) -> Result<&'a [Value; N], Error> {
    args.try_into()
        .map_err(|_| Error::arity_error_with_expr(N, args.len(), form.to_owned()))
}

pub(crate) fn eval_quote(args: &[Value], _menv: &Rc<MEnv>, _depth: usize) -> Result<Value, Error> {
    let [datum] = expect_args::<1>(args, "quote")?;
    Ok(datum.clone())
}

pub(crate) fn eval_lift(args: &[Value], menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let [operand] = expect_args::<1>(args, "lift")?;
    let value = eval_with_depth_tracking(operand, menv, depth + 1)?;
    if !menv.is_staging() || value.is_code() {
        return Ok(value);
    }
    lift_value(&value).map(Value::code)
}

pub(crate) fn eval_lambda(args: &[Value], menv: &Rc<MEnv>, _depth: usize) -> Result<Value, Error> {
    let [param_list, body] = expect_args::<2>(args, "lambda")?;
    let param_items = param_list
        .list_items()
        .ok_or_else(|| Error::TypeMismatch("Lambda parameters must be a list".to_owned()))?;
    let mut params: Vec<Rc<str>> = Vec::with_capacity(param_items.len());
    for param in &param_items {
        let Value::Sym(name) = param else {
            return Err(Error::TypeMismatch("Lambda parameters must be symbols".to_owned()));
        };
        if params.contains(name) {
            return Err(Error::EvalError(format!("Duplicate parameter name: {name}")));
        }
        params.push(name.clone());
    }
    Ok(Value::Closure(Rc::new(Closure {
        params,
        body: body.clone(),
        env: menv.env(),
    })))
}

/// Evaluate one level up the tower
pub(crate) fn eval_em(args: &[Value], menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let [operand] = expect_args::<1>(args, "EM")?;
    let parent = menv.parent_or_create();
    eval_with_depth_tracking(operand, &parent, depth + 1)
}

pub(crate) fn eval_set_meta(args: &[Value], menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let [target, handler_expr] = expect_args::<2>(args, "set-meta!")?;
    let Value::Sym(name) = target else {
        return Err(Error::TypeMismatch(format!("set-meta! expects a slot or name, got {target}")));
    };

    if let Some(slot) = HandlerSlot::from_name(name) {
        if handler_expr.as_symbol() == Some("default") {
            menv.reset_handler(slot);
            tracing::debug!(slot = %name, "restored default handler");
            return Ok(target.clone());
        }
        let procedure = eval_with_depth_tracking(handler_expr, menv, depth + 1)?;
        if !matches!(procedure, Value::Closure(_) | Value::Prim(_)) {
            return Err(Error::TypeMismatch(format!(
                "set-meta! handler must be a procedure, got {procedure}"
            )));
        }
        menv.set_handler(slot, Handler::Reflected(procedure));
        tracing::debug!(slot = %name, "installed reflected handler");
        return Ok(target.clone());
    }

    let value = eval_with_depth_tracking(handler_expr, menv, depth + 1)?;
    menv.define(name.clone(), value);
    Ok(target.clone())
}

pub(crate) fn eval_scan(args: &[Value], menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let (scanner, operand) = match args {
        [Value::Sym(type_name), operand] => {
            if !menv.session().types.borrow().contains(type_name) {
                return Err(Error::EvalError(format!("scan: unknown type {type_name}")));
            }
            (format!("scan_{}", codegen::mangle(type_name)), operand)
        }
        [operand] => ("scan_obj".to_owned(), operand),
        _ => return Err(Error::arity_error_with_expr(2, args.len(), "scan".to_owned())),
    };
    let value = eval_with_depth_tracking(operand, menv, depth + 1)?;
    Ok(Value::code(format!("{scanner}({})", lift_value(&value)?)))
}

pub(crate) fn eval_letrec(args: &[Value], menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let form = LetForm::from_parts(LetKind::LetRec, args)?;
    evaluate_letrec(&form, menv, depth, CompileMode::Auto)
}

pub(crate) fn eval_set(args: &[Value], menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let [target, value_expr] = expect_args::<2>(args, "set!")?;
    let Value::Sym(name) = target else {
        return Err(Error::TypeMismatch(format!("set! target must be a symbol, got {target}")));
    };
    let value = eval_with_depth_tracking(value_expr, menv, depth + 1)?;
    let env = menv.env();
    let current = env
        .lookup(name)
        .ok_or_else(|| Error::UnboundSymbol(name.to_string()))?;
    if let Value::Code(place) = &current {
        return Ok(Value::code(format!("({place} = {})", lift_value(&value)?)));
    }
    if value.is_code() {
        return Ok(Value::code(format!("({} = {value})", codegen::mangle(name))));
    }
    env.assign(name, value.clone());
    Ok(value)
}

/// Re-interpret the operand with staging switched off
pub(crate) fn eval_run(args: &[Value], menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let [operand] = expect_args::<1>(args, "run")?;
    let unstaged = menv.child(menv.env());
    unstaged.set_staging(false);
    eval_with_depth_tracking(operand, &unstaged, depth + 1)
}

pub(crate) fn eval_deftype(args: &[Value], menv: &Rc<MEnv>, _depth: usize) -> Result<Value, Error> {
    let [Value::Sym(type_name), field_specs @ ..] = args else {
        return Err(Error::TypeMismatch("deftype expects a type name".to_owned()));
    };
    let fields = field_specs
        .iter()
        .map(crate::types::FieldSpec::parse)
        .collect::<Result<Vec<_>, _>>()?;
    menv.session()
        .types
        .borrow_mut()
        .register(type_name, fields)?;
    Ok(args[0].clone())
}

pub(crate) fn eval_freeze(args: &[Value], menv: &Rc<MEnv>, depth: usize) -> Result<Value, Error> {
    let [operand] = expect_args::<1>(args, "freeze")?;
    let value = eval_with_depth_tracking(operand, menv, depth + 1)?;
    match &value {
        Value::Code(code) => Ok(Value::code(format!("freeze_cyclic({code})"))),
        _ => Ok(value),
    }
}

/// Reify the current level
pub(crate) fn eval_menv(args: &[Value], menv: &Rc<MEnv>, _depth: usize) -> Result<Value, Error> {
    expect_args::<0>(args, "menv")?;
    Ok(Value::MEnv(Rc::clone(menv)))
}
