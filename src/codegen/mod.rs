//! C emission.
//!
//! Staged values are lowered to expressions over the runtime constructors,
//! compiled `let` blocks become GNU statement expressions that declare each
//! binding, compute the body into `_res` and release bindings according to
//! the analysis results, and [`emit_program`] wraps a compiled expression
//! into a complete translation unit.
//!
//! ```text
//! ({
//!   Obj* x = mk_int(10); /* x: shape tree, escape arg */
//!   Obj* _res = add(x, mk_int(5));
//!   free_tree(x); /* x: tree, free_tree */
//!   _res;
//! })
//! ```

mod runtime;
pub mod scanners;

use crate::Error;
use crate::analysis::escape::EscapeClass;
use crate::analysis::shape::{FreeStrategy, Shape};
use crate::analysis::{LetAnalysis, LetForm, LetKind, free_variables};
use crate::ast::Value;
use crate::builtinops::find_op;
use crate::session::CompileOptions;
use crate::types::TypeRegistry;
use runtime::{HELPERS_C, RUNTIME_SECTIONS, RUNTIME_SYMBOLS};
use std::collections::HashMap;
use std::fmt::Write;
use std::rc::Rc;

/// Name of the block result inside every compiled `let`
pub const RESULT_VAR: &str = "_res";

const C_KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else", "enum",
    "extern", "float", "for", "goto", "if", "inline", "int", "long", "register", "restrict",
    "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef", "union",
    "unsigned", "void", "volatile", "while",
];

/// C identifier for a source symbol. Punctuation is spelled out and names
/// that would collide with keywords or runtime symbols get a `v_` prefix.
pub fn mangle(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            c if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
            '-' => out.push('_'),
            '?' => out.push_str("_p"),
            '!' => out.push_str("_b"),
            '*' => out.push_str("_star"),
            '+' => out.push_str("_plus"),
            '<' => out.push_str("_lt"),
            '>' => out.push_str("_gt"),
            '=' => out.push_str("_eq"),
            '/' => out.push_str("_slash"),
            '%' => out.push_str("_pct"),
            '.' => out.push_str("_dot"),
            _ => out.push('_'),
        }
    }
    let reserved = out.is_empty()
        || out.starts_with(|c: char| c.is_ascii_digit())
        || out == RESULT_VAR
        || C_KEYWORDS.contains(&out.as_str())
        || RUNTIME_SYMBOLS.contains(&out.as_str());
    if reserved {
        out.insert_str(0, "v_");
    }
    out
}

/// Whether [`lift_value`] can render `value`
pub fn can_lift(value: &Value) -> bool {
    let mut pending = vec![value];
    while let Some(current) = pending.pop() {
        match current {
            Value::Int(_) | Value::Nil | Value::Code(_) | Value::Closure(_) => {}
            Value::Cell(cell) => {
                pending.push(cell.head());
                pending.push(cell.tail());
            }
            Value::Sym(_) | Value::Prim(_) | Value::MEnv(_) => return false,
        }
    }
    true
}

enum LiftStep<'a> {
    Visit(&'a Value),
    Text(&'static str),
}

/// Target expression constructing `value`. Code fragments are used as is.
pub fn lift_value(value: &Value) -> Result<String, Error> {
    let mut out = String::new();
    let mut work = vec![LiftStep::Visit(value)];
    while let Some(step) = work.pop() {
        let current = match step {
            LiftStep::Text(text) => {
                out.push_str(text);
                continue;
            }
            LiftStep::Visit(current) => current,
        };
        match current {
            Value::Cell(cell) => {
                out.push_str("mk_pair(");
                work.push(LiftStep::Text(")"));
                work.push(LiftStep::Visit(cell.tail()));
                work.push(LiftStep::Text(", "));
                work.push(LiftStep::Visit(cell.head()));
            }
            Value::Int(n) => {
                let _ = write!(out, "mk_int({n})");
            }
            Value::Nil => out.push_str("NULL"),
            Value::Code(code) => out.push_str(code),
            Value::Closure(closure) => {
                let captured: Vec<String> = free_variables(&closure.body)
                    .into_iter()
                    .filter(|name| !closure.params.contains(name) && find_op(name).is_none())
                    .map(|name| name.to_string())
                    .collect();
                let params: Vec<&str> = closure.params.iter().map(|p| &**p).collect();
                let _ = write!(
                    out,
                    "NULL /* closure({}) captures {} */",
                    params.join(" "),
                    if captured.is_empty() { "nothing".to_owned() } else { captured.join(" ") }
                );
            }
            Value::Sym(_) | Value::Prim(_) | Value::MEnv(_) => {
                return Err(Error::TypeMismatch(format!(
                    "cannot lift {} {current} into code",
                    current.type_name()
                )));
            }
        }
    }
    Ok(out)
}

/// How a binding's storage is given back
#[derive(Debug, Clone, PartialEq)]
enum Release {
    /// Captured by a closure, lives past the block
    Captured,
    /// Another member of the alias group releases it
    Elided(Option<Rc<str>>),
    /// Owned outside the block
    Borrowed,
    /// Part of this binding's structure, released with it
    Projected(Rc<str>),
    /// Cell handed to a later allocation
    Donated(Rc<str>),
    Unused(FreeStrategy),
    /// Released right after statement `after`
    Early { after: usize, strategy: FreeStrategy },
    End(FreeStrategy),
    /// Released through its frozen component
    Frozen,
}

struct BindingPlan {
    name: Rc<str>,
    c_name: String,
    /// `None` when the value stays a compile-time value
    init: Option<String>,
    shape: Shape,
    escape: EscapeClass,
    stack: bool,
    reuses: Option<Rc<str>>,
    release: Release,
    /// `(if site, branch)` entries on which the binding dies early
    branch_deaths: Vec<(usize, usize)>,
}

impl BindingPlan {
    /// Set once the binding was released on a branch
    fn flag(&self) -> String {
        format!("{}_freed", self.c_name)
    }

    fn declaration_comment(&self) -> String {
        let mut comment = format!(
            "/* {}: shape {}, escape {}",
            self.name,
            self.shape.as_str(),
            self.escape.as_str()
        );
        if self.stack {
            comment.push_str(", stack candidate");
        }
        if let Some(donor) = &self.reuses {
            let _ = write!(comment, ", reuses {donor}");
        }
        comment.push_str(" */");
        comment
    }

    fn free_call(&self, strategy: FreeStrategy) -> String {
        format!("{}({})", strategy.c_name(), self.c_name)
    }

    fn free_line(&self, strategy: FreeStrategy, note: &str) -> String {
        format!("{}; /* {note} */", self.free_call(strategy))
    }

    /// Statement emitted after the result is computed, if any
    fn closing_line(&self) -> Option<String> {
        let name = &self.name;
        match &self.release {
            Release::End(strategy) if !self.branch_deaths.is_empty() => Some(format!(
                "if (!{}) {}; /* {name}: {}, {} unless released on a branch */",
                self.flag(),
                self.free_call(*strategy),
                self.shape.as_str(),
                strategy.c_name()
            )),
            Release::End(strategy) => Some(self.free_line(
                *strategy,
                &format!("{name}: {}, {}", self.shape.as_str(), strategy.c_name()),
            )),
            Release::Frozen => Some(format!(
                "release_scc({}->scc_id); /* {name}: cyclic, frozen */",
                self.c_name
            )),
            Release::Captured => Some(format!("/* {name}: captured by closure, no free */")),
            Release::Elided(Some(owner)) => Some(format!("/* {name}: released by {owner} */")),
            Release::Elided(None) | Release::Borrowed => Some(format!("/* {name}: borrowed, no free */")),
            Release::Projected(parent) => Some(format!("/* {name}: borrows from {parent}, no free */")),
            Release::Donated(to) => Some(format!("/* {name}: cell reused by {to} */")),
            Release::Unused(_) | Release::Early { .. } => None,
        }
    }
}

/// `mk_int(..)` / `mk_pair(..)` rewritten to reuse `donor`'s cell
fn reuse_constructor(init: &str, donor: &str) -> Option<String> {
    let (ctor, args) = if let Some(args) = init.strip_prefix("mk_pair(") {
        ("reuse_as_pair", args)
    } else if let Some(args) = init.strip_prefix("mk_int(") {
        ("reuse_as_int", args)
    } else {
        return None;
    };
    Some(format!("{ctor}(try_reuse({donor}, sizeof(Obj)), {args}"))
}

fn plan_release(name: &Rc<str>, shape: Shape, analysis: &LetAnalysis, options: &CompileOptions) -> Release {
    let usage = analysis.escape.usage(name);
    if usage.is_some_and(|u| u.captured) || analysis.projection_captured(name) {
        return Release::Captured;
    }
    if let Some(parent) = analysis.rc.projection_of(name) {
        return Release::Projected(parent.clone());
    }
    if analysis.rc.elide_dec(name) {
        return Release::Elided(analysis.rc.owner(name).filter(|owner| owner != name));
    }
    let Some(strategy) = analysis.rc.free_function(name, shape) else {
        return Release::Borrowed;
    };
    if usage.is_some_and(|u| u.use_count == 0) {
        return Release::Unused(strategy);
    }
    if options.freeze_cyclic && shape == Shape::Cyclic && analysis.liveness.is_freezable(name) {
        return Release::Frozen;
    }
    match analysis.early_free_statement(name) {
        Some(after) => Release::Early { after, strategy },
        None => Release::End(strategy),
    }
}

fn plan_bindings(
    form: &LetForm,
    values: &[Value],
    analysis: &LetAnalysis,
    options: &CompileOptions,
) -> Result<Vec<BindingPlan>, Error> {
    let mut plans = Vec::with_capacity(form.bindings.len());
    for (binding, value) in form.bindings.iter().zip(values) {
        let materialized = match value {
            Value::Int(_) | Value::Nil | Value::Code(_) => true,
            Value::Cell(_) => can_lift(value),
            _ => false,
        };
        let init = if materialized { Some(lift_value(value)?) } else { None };
        let shape = analysis.shape(&binding.name);
        let escape = analysis
            .escape
            .usage(&binding.name)
            .map_or(EscapeClass::Global, |u| u.escape);
        let release = match init {
            Some(_) => plan_release(&binding.name, shape, analysis, options),
            None => Release::Borrowed,
        };
        plans.push(BindingPlan {
            name: binding.name.clone(),
            c_name: mangle(&binding.name),
            init,
            shape,
            escape,
            stack: analysis.is_stack_candidate(&binding.name),
            reuses: None,
            release,
            branch_deaths: Vec::new(),
        });
    }

    if options.enable_reuse {
        let index: HashMap<Rc<str>, usize> = plans
            .iter()
            .enumerate()
            .map(|(i, plan)| (plan.name.clone(), i))
            .collect();
        for pair in analysis.reuse.pairs() {
            let (Some(&donor), Some(&alloc)) = (index.get(&pair.freed), index.get(&pair.alloc)) else {
                continue;
            };
            if !matches!(plans[donor].release, Release::Early { .. }) {
                continue;
            }
            let donor_c = plans[donor].c_name.clone();
            let rewritten = plans[alloc]
                .init
                .as_deref()
                .and_then(|init| reuse_constructor(init, &donor_c));
            if let Some(rewritten) = rewritten {
                tracing::debug!(freed = %pair.freed, alloc = %pair.alloc, "reusing cell");
                plans[alloc].init = Some(rewritten);
                plans[alloc].reuses = Some(pair.freed.clone());
                plans[donor].release = Release::Donated(pair.alloc.clone());
            }
        }
    }

    if options.enable_stack_alloc {
        for plan in plans.iter_mut().filter(|p| p.stack && p.reuses.is_none()) {
            if let Some(args) = plan.init.as_deref().and_then(|i| i.strip_prefix("mk_int(")) {
                plan.init = Some(format!("mk_int_stack({args}"));
            }
        }
    }

    // released inside the body's branches when no alias or projection
    // still reads the storage there
    for plan in plans.iter_mut() {
        if matches!(plan.release, Release::End(_)) && !analysis.rc.has_dependents(&plan.name) {
            plan.branch_deaths = analysis.liveness.branch_deaths(&plan.name, form.body_statement());
        }
    }

    for plan in &plans {
        tracing::debug!(
            binding = %plan.name,
            shape = plan.shape.as_str(),
            release = ?plan.release,
            branch_releases = plan.branch_deaths.len(),
            "release plan"
        );
    }
    Ok(plans)
}

/// Frees and freezes that follow statement `index`
fn after_statement(plans: &[BindingPlan], index: usize, lines: &mut Vec<String>) {
    if let Some(plan) = plans.get(index) {
        if plan.release == Release::Frozen {
            lines.push(format!("freeze_cyclic({});", plan.c_name));
        }
        if let Release::Unused(strategy) = plan.release {
            lines.push(plan.free_line(strategy, "ASAP: unused"));
        }
    }
    for plan in plans {
        if let Release::Early { after, strategy } = plan.release
            && after == index
        {
            let dead_after = plans.get(after).map_or("", |p| &*p.name);
            lines.push(plan.free_line(strategy, &format!("{}: dead after {dead_after}", plan.name)));
        }
    }
}

/// A release performed on entry to one branch of a staged `if`
#[derive(Debug, Clone, PartialEq)]
pub struct BranchRelease {
    /// [`Value::cell_id`] of the `if` form
    pub site: usize,
    /// 0 then, 1 else
    pub branch: usize,
    /// C expression releasing the binding and setting its flag
    pub code: String,
}

/// Release decisions for one compiled `let`, fixed before its body is staged
/// so branches of the body can carry their own releases.
pub struct LetBlock {
    kind: LetKind,
    plans: Vec<BindingPlan>,
}

impl LetBlock {
    /// `values` are the evaluated binding values in order
    pub fn plan(
        form: &LetForm,
        values: &[Value],
        analysis: &LetAnalysis,
        options: &CompileOptions,
    ) -> Result<LetBlock, Error> {
        Ok(LetBlock {
            kind: form.kind,
            plans: plan_bindings(form, values, analysis, options)?,
        })
    }

    pub fn branch_releases(&self) -> Vec<BranchRelease> {
        let mut releases = Vec::new();
        for plan in &self.plans {
            let Release::End(strategy) = plan.release else {
                continue;
            };
            for &(site, branch) in &plan.branch_deaths {
                releases.push(BranchRelease {
                    site,
                    branch,
                    code: format!("{}, {} = 1", plan.free_call(strategy), plan.flag()),
                });
            }
        }
        releases
    }

    /// Compose the block around the staged `body`
    pub fn emit(&self, body: &Value) -> Result<String, Error> {
        let plans = &self.plans;
        let body_code = lift_value(body)?;
        let mut lines: Vec<String> = Vec::new();

        match self.kind {
            LetKind::Let => {
                for (i, plan) in plans.iter().enumerate() {
                    if let Some(init) = &plan.init {
                        lines.push(format!("Obj* {} = {init}; {}", plan.c_name, plan.declaration_comment()));
                        push_flag(plan, &mut lines);
                    }
                    after_statement(plans, i, &mut lines);
                }
            }
            LetKind::LetRec => {
                for plan in plans.iter().filter(|p| p.init.is_some()) {
                    lines.push(format!("Obj* {} = NULL; {}", plan.c_name, plan.declaration_comment()));
                    push_flag(plan, &mut lines);
                }
                for plan in plans {
                    if let Some(init) = &plan.init {
                        lines.push(format!("{} = {init};", plan.c_name));
                    }
                }
                // cycles are only complete once every binding is assigned
                for i in 0..plans.len() {
                    after_statement(plans, i, &mut lines);
                }
            }
        }

        lines.push(format!("Obj* {RESULT_VAR} = {body_code};"));
        lines.extend(plans.iter().rev().filter(|p| p.init.is_some()).filter_map(BindingPlan::closing_line));
        lines.push(format!("{RESULT_VAR};"));

        let mut block = String::from("({\n");
        for line in lines {
            let _ = writeln!(block, "  {}", line.replace('\n', "\n  "));
        }
        block.push_str("})");
        Ok(block)
    }
}

fn push_flag(plan: &BindingPlan, lines: &mut Vec<String>) {
    if !plan.branch_deaths.is_empty() {
        lines.push(format!("int {} = 0;", plan.flag()));
    }
}

/// Compose the compiled block for `form`. `values` are the evaluated binding
/// values in order and `body` the staged body.
pub fn emit_let_block(
    form: &LetForm,
    values: &[Value],
    body: &Value,
    analysis: &LetAnalysis,
    options: &CompileOptions,
) -> Result<String, Error> {
    LetBlock::plan(form, values, analysis, options)?.emit(body)
}

/// A complete C program evaluating `result_code` and printing the result.
pub fn emit_program(result_code: &str, registry: &TypeRegistry, options: &CompileOptions) -> String {
    let mut out = String::new();
    out.push_str("/* Generated by asapc: ASAP memory management, no tracing collector */\n");
    if options.emit_runtime {
        let _ = writeln!(out, "#define STACK_POOL_SIZE {}", options.stack_pool_size);
        let _ = writeln!(out, "#define DEFERRED_BATCH_SIZE {}", options.deferred_batch_size);
        for (section, text) in RUNTIME_SECTIONS {
            tracing::trace!(section, "emitting runtime section");
            out.push_str(text);
        }
    } else {
        out.push_str("#include \"asap_runtime.h\"\n");
    }
    out.push_str(&scanners::emit_type_definitions(registry));
    if options.emit_runtime {
        out.push_str(HELPERS_C);
    }
    let _ = write!(
        out,
        "\nint main(void) {{\n    Obj* result = {};\n    print_obj(result);\n    printf(\"\\n\");\n    flush_freelist();\n    flush_deferred();\n    cleanup_weak_refs();\n    return 0;\n}}\n",
        result_code.replace('\n', "\n    ")
    );
    out
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::analysis::analyze_let;
    use crate::sexpr::parse_sexpr;

    #[test]
    fn test_mangle() {
        let cases = vec![
            ("x", "x"),
            ("my-var", "my_var"),
            ("null?", "null_p"),
            ("set-car!", "set_car_b"),
            ("1st", "v_1st"),
            ("int", "v_int"),
            ("car", "v_car"),
            ("_res", "v__res"),
            ("a->b", "a__gtb"),
        ];
        for (i, (name, expected)) in cases.into_iter().enumerate() {
            assert_eq!(mangle(name), expected, "case #{}", i + 1);
        }
    }

    #[test]
    fn test_lift_value() {
        let cases = vec![
            ("5", Some("mk_int(5)")),
            ("()", Some("NULL")),
            ("(1 2)", Some("mk_pair(mk_int(1), mk_pair(mk_int(2), NULL))")),
            ("(1 . 2)", Some("mk_pair(mk_int(1), mk_int(2))")),
            ("((1) 2)", Some("mk_pair(mk_pair(mk_int(1), NULL), mk_pair(mk_int(2), NULL))")),
            ("a", None),
            ("(1 a)", None),
        ];
        for (i, (source, expected)) in cases.into_iter().enumerate() {
            let value = parse_sexpr(source).unwrap();
            assert_eq!(can_lift(&value), expected.is_some(), "case #{}", i + 1);
            match expected {
                Some(code) => assert_eq!(lift_value(&value).unwrap(), code, "case #{}", i + 1),
                None => assert!(lift_value(&value).is_err(), "case #{}", i + 1),
            }
        }
        assert_eq!(lift_value(&Value::code("x")).unwrap(), "x");
    }

    #[test]
    fn test_lift_long_list_without_recursion() {
        let items: Vec<Value> = (0..50_000).map(Value::Int).collect();
        let code = lift_value(&Value::from_items(items)).unwrap();
        assert!(code.starts_with("mk_pair(mk_int(0), mk_pair(mk_int(1), "));
    }

    /// Stage an expression the way a fully staged evaluation would,
    /// rendering unknown operators as plain calls.
    fn stage(expr: &Value) -> Value {
        match expr {
            Value::Sym(name) => Value::code(mangle(name)),
            Value::Cell(_) if expr.head_symbol() == Some("quote") => {
                Value::code(lift_value(expr.cdr().and_then(Value::car).unwrap()).unwrap())
            }
            Value::Cell(_) => {
                let items = expr.list_items().unwrap();
                let args: Vec<Value> = items[1..].iter().map(stage).collect();
                let head = items[0].as_symbol().unwrap();
                match crate::builtinops::find_op(head) {
                    Some(op) => op.apply(&args).unwrap(),
                    None => {
                        let rendered: Vec<String> = args.iter().map(Value::to_string).collect();
                        Value::code(format!("{}({})", mangle(head), rendered.join(", ")))
                    }
                }
            }
            other => Value::code(lift_value(other).unwrap()),
        }
    }

    fn emit(source: &str, options: &CompileOptions) -> String {
        let form = LetForm::parse(&parse_sexpr(source).unwrap()).unwrap();
        let values: Vec<Value> = form.bindings.iter().map(|b| stage(&b.expr)).collect();
        let body = stage(&form.body);
        let analysis = analyze_let(&form, &HashMap::new(), options);
        emit_let_block(&form, &values, &body, &analysis, options).unwrap()
    }

    fn assert_fragments(code: &str, present: &[&str], absent: &[&str]) {
        for fragment in present {
            assert!(code.contains(fragment), "missing '{fragment}' in:\n{code}");
        }
        for fragment in absent {
            assert!(!code.contains(fragment), "unexpected '{fragment}' in:\n{code}");
        }
    }

    #[test]
    fn test_block_layout_and_reverse_frees() {
        let code = emit("(let ((a '(1)) (b '(2))) (cons a b))", &CompileOptions::default());
        assert!(code.starts_with("({\n"));
        assert!(code.ends_with("  _res;\n})"));
        let free_b = code.find("free_tree(b);").unwrap();
        let free_a = code.find("free_tree(a);").unwrap();
        let result = code.find("Obj* _res = ").unwrap();
        assert!(result < free_b && free_b < free_a, "{code}");
    }

    #[test]
    fn test_unused_binding_freed_after_declaration() {
        let code = emit("(let ((u '(1)) (x 2)) x)", &CompileOptions::default());
        assert_fragments(&code, &["Obj* u = mk_pair(mk_int(1), NULL);", "free_tree(u); /* ASAP: unused */"], &[]);
        let decl = code.find("Obj* u = ").unwrap();
        let free = code.find("free_tree(u);").unwrap();
        let next = code.find("Obj* x = ").unwrap();
        assert!(decl < free && free < next);
    }

    #[test]
    fn test_stack_candidate_uses_pool() {
        // n only decides a branch, so it never escapes
        let source = "(let ((n 5) (m (if n 1 2))) m)";
        let code = emit(source, &CompileOptions::default());
        assert_fragments(&code, &["Obj* n = mk_int_stack(5);", "stack candidate"], &[]);
        let options = CompileOptions {
            enable_stack_alloc: false,
            ..CompileOptions::default()
        };
        let code = emit(source, &options);
        assert_fragments(&code, &["Obj* n = mk_int(5);", "stack candidate"], &["mk_int_stack"]);
        // passed to a primitive: escape arg, heap allocated
        let code = emit("(let ((n 5) (m (+ n 1))) m)", &CompileOptions::default());
        assert_fragments(&code, &["Obj* n = mk_int(5);"], &["mk_int_stack"]);
    }

    #[test]
    fn test_captured_binding_keeps_storage() {
        let code = emit("(let ((x '(3)) (g (lambda (y) x))) g)", &CompileOptions::default());
        assert_fragments(&code, &["Obj* x = ", "/* x: captured by closure, no free */"], &["free_tree(x)", "dec_ref(x)"]);
    }

    #[test]
    fn test_early_free_and_reuse() {
        let source = "(let ((a (cons 1 2)) (b (car a)) (c (+ b 1)) (d (cons 3 4))) (cons c d))";
        let options = CompileOptions {
            enable_reuse: false,
            ..CompileOptions::default()
        };
        // b borrows a's car; a owns the pair and outlives b
        let code = emit(source, &options);
        assert_fragments(
            &code,
            &["Obj* b = car(a);", "free_tree(a); /* a: dead after c */", "/* b: borrows from a, no free */"],
            &["try_reuse", "released by", "free_tree(b)", "dec_ref(b)"],
        );
        let use_b = code.find("Obj* c = ").unwrap();
        let free_a = code.find("free_tree(a);").unwrap();
        assert!(use_b < free_a, "{code}");

        let code = emit(source, &CompileOptions::default());
        assert_fragments(
            &code,
            &["Obj* d = reuse_as_pair(try_reuse(a, sizeof(Obj)), mk_int(3), mk_int(4));"],
            &["free_tree(b)"],
        );

        let code = emit("(let ((a (cons 1 2)) (c (+ (car a) 1)) (d (cons 3 4))) (cons c d))", &CompileOptions::default());
        assert_fragments(
            &code,
            &[
                "Obj* d = reuse_as_pair(try_reuse(a, sizeof(Obj)), mk_int(3), mk_int(4));",
                "/* a: cell reused by d */",
            ],
            &["free_tree(a)", "free_unique(a)"],
        );
    }

    #[test]
    fn test_conditional_release_is_guarded() {
        let options = CompileOptions::default();
        let form = LetForm::parse(&parse_sexpr("(let ((a '(1 2))) (if c (car a) 0))").unwrap()).unwrap();
        let values: Vec<Value> = form.bindings.iter().map(|b| stage(&b.expr)).collect();
        let analysis = analyze_let(&form, &HashMap::new(), &options);
        let block = LetBlock::plan(&form, &values, &analysis, &options).unwrap();
        assert_eq!(
            block.branch_releases(),
            vec![BranchRelease {
                site: form.body.cell_id().unwrap(),
                branch: 1,
                code: "free_tree(a), a_freed = 1".to_owned(),
            }]
        );
        let code = block.emit(&stage(&form.body)).unwrap();
        assert_fragments(
            &code,
            &["int a_freed = 0;", "if (!a_freed) free_tree(a); /* a: tree, free_tree unless released on a branch */"],
            &[],
        );
        let flag = code.find("int a_freed").unwrap();
        let result = code.find("Obj* _res").unwrap();
        assert!(flag < result, "{code}");

        // a projection still reads a on the branch: released after the body only
        let source = "(let ((a '(1 2)) (b (car a))) (if c b 0))";
        let form = LetForm::parse(&parse_sexpr(source).unwrap()).unwrap();
        let values: Vec<Value> = form.bindings.iter().map(|b| stage(&b.expr)).collect();
        let analysis = analyze_let(&form, &HashMap::new(), &options);
        let block = LetBlock::plan(&form, &values, &analysis, &options).unwrap();
        assert!(block.branch_releases().is_empty());
        assert_fragments(&block.emit(&stage(&form.body)).unwrap(), &["free_tree(a);"], &["a_freed"]);
    }

    /// Every allocating binding is released once on each path, captured by
    /// a closure, or released by the owner of its alias group.
    fn assert_balanced_releases(code: &str) {
        let lines: Vec<&str> = code.lines().map(str::trim).collect();
        let releases_of = |name: &str| {
            let calls = ["free_tree", "dec_ref", "free_unique", "deferred_release", "release_scc"].map(|f| format!("{f}({name});"));
            let scc = format!("release_scc({name}->scc_id);");
            let guarded = format!("if (!{name}_freed) ");
            let reused = format!("try_reuse({name}, ");
            lines
                .iter()
                .filter(|l| {
                    calls.iter().any(|c| l.starts_with(c.as_str()))
                        || l.starts_with(&scc)
                        || l.starts_with(&guarded)
                        || l.contains(&reused)
                })
                .count()
        };
        let declared: Vec<&str> = lines
            .iter()
            .filter_map(|l| l.strip_prefix("Obj* ")?.split_once(" = ").map(|(name, _)| name))
            .filter(|name| *name != RESULT_VAR)
            .collect();
        for name in declared {
            let assigned = [format!("Obj* {name} = "), format!("{name} = ")];
            let allocating = lines.iter().any(|l| {
                assigned.iter().any(|a| l.starts_with(a.as_str())) && (l.contains("mk_") || l.contains("reuse_as_"))
            });
            if !allocating {
                continue;
            }
            if code.contains(&format!("{name}_freed = 1")) {
                assert!(code.contains(&format!("if (!{name}_freed) ")), "{name} has no guarded release:\n{code}");
            }
            let released_by = format!("/* {name}: released by ");
            let owner = lines
                .iter()
                .find_map(|l| l.strip_prefix(released_by.as_str())?.strip_suffix(" */"));
            if lines.iter().any(|l| l.starts_with(&format!("/* {name}: captured by closure"))) {
                assert_eq!(releases_of(name), 0, "captured {name} released in:\n{code}");
            } else if let Some(owner) = owner {
                assert_eq!(releases_of(name), 0, "alias {name} released in:\n{code}");
                assert_eq!(releases_of(owner), 1, "owner {owner} of {name} in:\n{code}");
            } else {
                assert_eq!(releases_of(name), 1, "{name} in:\n{code}");
            }
        }
    }

    #[test]
    fn test_every_allocation_released_once() {
        let sources = [
            "(let ((a '(1)) (b '(2))) (cons a b))",
            "(let ((u '(1)) (x 2)) x)",
            "(let ((n 5) (m (if n 1 2))) m)",
            "(let ((x '(3)) (g (lambda (y) x))) g)",
            "(let ((a (cons 1 2)) (b (car a)) (c (+ b 1)) (d (cons 3 4))) (cons c d))",
            "(let ((a (cons 1 2)) (c (+ (car a) 1)) (d (cons 3 4))) (cons c d))",
            "(let ((a (cons (cons 1 2) 3)) (b (car a)) (c (cdr b))) (+ c 1))",
            "(let ((x '(1 2)) (y x)) (car y))",
            "(let ((a '(1 2))) (if c (car a) 0))",
            "(let ((a 1) (b 2)) (if c a b))",
            "(letrec ((r (cons 1 r))) r)",
        ];
        let variants = [
            CompileOptions::default(),
            CompileOptions {
                enable_reuse: false,
                ..CompileOptions::default()
            },
            CompileOptions {
                enable_nll: false,
                ..CompileOptions::default()
            },
            CompileOptions {
                freeze_cyclic: true,
                ..CompileOptions::default()
            },
        ];
        for options in &variants {
            for source in sources {
                assert_balanced_releases(&emit(source, options));
            }
        }
    }

    #[test]
    fn test_nll_disabled_frees_at_end() {
        let options = CompileOptions {
            enable_nll: false,
            enable_reuse: false,
            ..CompileOptions::default()
        };
        let code = emit("(let ((a (cons 1 2)) (c (+ (car a) 1))) c)", &options);
        let result = code.find("Obj* _res").unwrap();
        let free_a = code.find("free_tree(a);").unwrap();
        assert!(free_a > result, "{code}");
    }

    #[test]
    fn test_letrec_declares_before_assigning() {
        let code = emit("(letrec ((r (cons 1 r))) r)", &CompileOptions::default());
        assert_fragments(
            &code,
            &["Obj* r = NULL;", "r = mk_pair(mk_int(1), r);", "deferred_release(r); /* r: cyclic, deferred_release */"],
            &[],
        );
        let options = CompileOptions {
            freeze_cyclic: true,
            ..CompileOptions::default()
        };
        let code = emit("(letrec ((r (cons 1 r))) r)", &options);
        assert_fragments(&code, &["freeze_cyclic(r);", "release_scc(r->scc_id);"], &["deferred_release(r)"]);
    }

    #[test]
    fn test_unknown_shape_never_freed_as_tree() {
        let code = emit("(let ((x (menv))) x)", &CompileOptions::default());
        assert_fragments(&code, &["dec_ref(x);"], &["free_tree(x)"]);
    }

    #[test]
    fn test_program_layout() {
        let mut registry = TypeRegistry::new();
        let fields = ["(value int)", "(next Node)", "(prev Node)"]
            .iter()
            .map(|s| crate::types::FieldSpec::parse(&parse_sexpr(s).unwrap()).unwrap())
            .collect();
        registry.register(&Rc::from("Node"), fields).unwrap();
        let program = emit_program("mk_int(1)", &registry, &CompileOptions::default());
        let order = [
            "/* Generated by asapc",
            "#define STACK_POOL_SIZE 256",
            "#define DEFERRED_BATCH_SIZE 32",
            "typedef struct Obj",
            "static void free_tree(",
            "static WeakRef* mk_weak_ref(",
            "static Obj* try_reuse(",
            "static Obj* freeze_cyclic(",
            "static void deferred_release(",
            "static Obj* write_int(",
            "WeakRef* prev;",
            "static Obj* add(",
            "int main(void)",
            "Obj* result = mk_int(1);",
            "flush_freelist();",
            "flush_deferred();",
            "cleanup_weak_refs();",
        ];
        let mut last = 0;
        for fragment in order {
            let at = program[last..]
                .find(fragment)
                .map(|i| i + last)
                .unwrap_or_else(|| panic!("'{fragment}' missing or out of order"));
            last = at;
        }

        let bare = emit_program(
            "mk_int(1)",
            &TypeRegistry::new(),
            &CompileOptions {
                emit_runtime: false,
                ..CompileOptions::default()
            },
        );
        assert!(bare.contains("#include \"asap_runtime.h\""));
        assert!(!bare.contains("static void free_tree("));
    }

    fn registry_of(sources: &[&str]) -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        for source in sources {
            let items = parse_sexpr(source).unwrap().list_items().unwrap();
            let name: Rc<str> = Rc::from(items[0].as_symbol().unwrap());
            let fields = items[1..]
                .iter()
                .map(crate::types::FieldSpec::parse)
                .collect::<Result<Vec<_>, _>>()
                .unwrap();
            registry.register(&name, fields).unwrap();
        }
        registry
    }

    /// Every `static` function is declared or defined before its first call
    fn assert_declared_before_use(program: &str) {
        let mut declared: HashMap<&str, usize> = HashMap::new();
        let mut offset = 0;
        for line in program.split_inclusive('\n') {
            if let Some(rest) = line.strip_prefix("static ")
                && let Some(open) = rest.find('(')
                && let Some(name) = rest[..open].rsplit([' ', '*']).next()
                && !name.is_empty()
            {
                declared.entry(name).or_insert(offset);
            }
            offset += line.len();
        }
        let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
        for (name, &at) in &declared {
            let call = format!("{name}(");
            let first_use = program
                .match_indices(&call)
                .map(|(i, _)| i)
                .find(|&i| !program[..i].ends_with(is_ident))
                .unwrap();
            assert!(first_use >= at, "'{name}' used before its declaration:\n{program}");
        }
    }

    #[test]
    fn test_program_declares_before_use() {
        let fixtures: Vec<(Vec<&str>, &str)> = vec![
            (vec![], "mk_int(1)"),
            (vec!["(Box (value int) (item Cell))"], "scan_Box(mk_int(1))"),
            (vec!["(Node (value int) (next Node))"], "scan_Node(mk_int(1))"),
            (vec!["(Tree (left Tree) (right Tree))"], "scan_Tree(mk_int(1))"),
            (vec!["(DLLNode (value int) (next DLLNode) (prev DLLNode))"], "scan_DLLNode(mk_int(1))"),
            (vec!["(Pair (a Item) (b Item))", "(Item (payload Any))"], "scan_obj(mk_int(1))"),
        ];
        for (types, result) in fixtures {
            let program = emit_program(result, &registry_of(&types), &CompileOptions::default());
            assert_declared_before_use(&program);
        }

        let program = emit_program(
            "scan_Box(mk_int(1))",
            &registry_of(&["(Box (value int) (item Cell))"]),
            &CompileOptions::default(),
        );
        let prototype = program.find("static Obj* scan_obj(Obj* x);").unwrap();
        let scanner = program.find("static void* scan_Box(void* p) {").unwrap();
        assert!(prototype < scanner);
        assert!(program.contains("    scan_obj(x->item);"));
    }
}
