#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod pipeline_scenarios {

    use asapc::ast::Value;
    use asapc::codegen::emit_program;
    use asapc::evaluator::{compile_let_form, eval, menv::MEnv};
    use asapc::session::{CompileOptions, Session};
    use asapc::sexpr::parse_sexpr;
    use std::rc::Rc;

    /// How an input should be run and what it should produce
    #[derive(Debug)]
    enum TestResult {
        /// Interpretation mode with this printed value
        Interpreted(&'static str),
        /// Staged evaluation; code has every fragment of the first list and
        /// none of the second
        Compiled(Vec<&'static str>, Vec<&'static str>),
        /// Same, but the `let` is compiled even without staged bindings
        ForceCompiled(Vec<&'static str>, Vec<&'static str>),
    }
    use TestResult::*;

    fn new_root(options: CompileOptions) -> Rc<MEnv> {
        MEnv::root(Rc::new(Session::new(options)))
    }

    fn check_code(test_id: &str, input: &str, code: &str, present: &[&str], absent: &[&str]) {
        for fragment in present {
            assert!(code.contains(fragment), "{test_id}: '{input}' lacks '{fragment}':\n{code}");
        }
        for fragment in absent {
            assert!(!code.contains(fragment), "{test_id}: '{input}' contains '{fragment}':\n{code}");
        }
    }

    /// Every allocating binding is released once on each path, captured by
    /// a closure, or released by the owner of its alias group.
    fn check_balanced(test_id: &str, code: &str) {
        let lines: Vec<&str> = code.lines().map(str::trim).collect();
        let releases_of = |name: &str| {
            let calls = ["free_tree", "dec_ref", "free_unique", "deferred_release", "release_scc"]
                .map(|f| format!("{f}({name});"));
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
        let declared = lines
            .iter()
            .filter_map(|l| l.strip_prefix("Obj* ")?.split_once(" = ").map(|(name, _)| name))
            .filter(|name| *name != "_res");
        for name in declared {
            let assigned = [format!("Obj* {name} = "), format!("{name} = ")];
            let allocating = lines.iter().any(|l| {
                assigned.iter().any(|a| l.starts_with(a.as_str())) && (l.contains("mk_") || l.contains("reuse_as_"))
            });
            if !allocating {
                continue;
            }
            let released_by = format!("/* {name}: released by ");
            let owner = lines
                .iter()
                .find_map(|l| l.strip_prefix(released_by.as_str())?.strip_suffix(" */"));
            let expected = if lines.iter().any(|l| l.starts_with(&format!("/* {name}: captured by closure"))) {
                0
            } else if let Some(owner) = owner {
                assert_eq!(releases_of(owner), 1, "{test_id}: owner {owner} of {name}:\n{code}");
                0
            } else {
                1
            };
            assert_eq!(releases_of(name), expected, "{test_id}: releases of {name}:\n{code}");
        }
    }

    fn run_scenarios(cases: Vec<(&str, TestResult)>, options: &CompileOptions) {
        for (i, (input, expected)) in cases.iter().enumerate() {
            let test_id = format!("scenario #{}", i + 1);
            let menv = new_root(options.clone());
            let expr = parse_sexpr(input).unwrap();
            let result = match expected {
                ForceCompiled(..) => compile_let_form(&expr, &menv),
                _ => eval(&expr, &menv),
            };
            let value = result.unwrap_or_else(|e| panic!("{test_id}: '{input}' failed: {e}"));
            match (expected, &value) {
                (Interpreted(text), _) => {
                    assert!(!value.is_code(), "{test_id}: '{input}' should not compile");
                    assert_eq!(value.to_string(), *text, "{test_id}");
                }
                (Compiled(present, absent) | ForceCompiled(present, absent), Value::Code(code)) => {
                    check_code(&test_id, input, code, present, absent);
                    check_balanced(&test_id, code);
                }
                (_, other) => panic!("{test_id}: '{input}' expected code, got {other}"),
            }
        }
    }

    #[test]
    fn test_end_to_end_scenarios() {
        run_scenarios(
            vec![
                ("(let ((x 1)) x)", Interpreted("1")),
                (
                    "(let ((x (lift 10))) (+ x (lift 5)))",
                    Compiled(
                        vec![
                            "Obj* x = mk_int(10); /* x: shape tree",
                            "Obj* _res = add(x, mk_int(5));",
                            "free_tree(x); /* x: tree, free_tree */",
                        ],
                        vec!["dec_ref(x)"],
                    ),
                ),
                (
                    "(let ((x (cons 1 2))) x)",
                    ForceCompiled(
                        vec!["Obj* x = mk_pair(mk_int(1), mk_int(2)); /* x: shape tree", "free_tree(x);"],
                        vec![],
                    ),
                ),
                (
                    "(let ((y (lift 1))) (let ((x (cons y y))) x))",
                    Compiled(vec!["Obj* x = mk_pair(y, y); /* x: shape dag", "dec_ref(x);"], vec!["free_tree(x)"]),
                ),
                (
                    "(letrec ((r (cons 1 r))) r)",
                    ForceCompiled(
                        vec!["Obj* r = NULL; /* r: shape cyclic", "r = mk_pair(mk_int(1), r);", "deferred_release(r);"],
                        vec!["free_tree(r)", "dec_ref(r)"],
                    ),
                ),
                (
                    "(let ((x (lift 3))) (lambda (y) x))",
                    Compiled(
                        vec![
                            "Obj* x = mk_int(3);",
                            "closure(y) captures x",
                            "/* x: captured by closure, no free */",
                        ],
                        vec!["free_tree(x)", "dec_ref(x)", "deferred_release(x)"],
                    ),
                ),
            ],
            &CompileOptions::default(),
        );
    }

    #[test]
    fn test_release_properties() {
        run_scenarios(
            vec![
                // unused and non-escaping: released right after its declaration
                (
                    "(let ((u (lift 1)) (x (lift 2))) x)",
                    Compiled(vec!["free_tree(u); /* ASAP: unused */"], vec![]),
                ),
                // compile-time values are never declared or freed
                (
                    "(let ((m (menv)) (x (lift 2))) x)",
                    Compiled(vec!["Obj* x = mk_int(2);", "free_tree(x);"], vec!["Obj* m", "(m)"]),
                ),
                // aliases are released once, by the member used last
                (
                    "(let ((x (lift '(1 2))) (y x)) (car y))",
                    Compiled(vec!["Obj* y = x;", "/* x: released by y */"], vec!["free_tree(x)", "dec_ref(x)"]),
                ),
                // a binding that dies on entering one branch is released there,
                // and only the other path frees it after the body
                (
                    "(let ((a (lift '(1 2)))) (if (lift 1) (car a) 0))",
                    Compiled(
                        vec![
                            "int a_freed = 0;",
                            "Obj* _res = (is_true(mk_int(1)) ? car(a) : (free_tree(a), a_freed = 1, mk_int(0)));",
                            "if (!a_freed) free_tree(a);",
                        ],
                        vec![],
                    ),
                ),
                // a projection borrows its parent, which outlives it
                (
                    "(let ((a (lift '(1 2))) (b (car a)) (c (lift 3))) (+ b c))",
                    Compiled(
                        vec!["Obj* b = car(a);", "/* b: borrows from a, no free */", "free_tree(a);"],
                        vec!["free_tree(b)", "dead after b"],
                    ),
                ),
            ],
            &CompileOptions::default(),
        );
    }

    #[test]
    fn test_cyclic_freeze_option() {
        let options = CompileOptions {
            freeze_cyclic: true,
            ..CompileOptions::default()
        };
        run_scenarios(
            vec![(
                "(letrec ((r (cons 1 r))) r)",
                ForceCompiled(vec!["freeze_cyclic(r);", "release_scc(r->scc_id);"], vec!["deferred_release(r)"]),
            )],
            &options,
        );
    }

    #[test]
    fn test_doubly_linked_type_program() {
        let menv = new_root(CompileOptions::default());
        let deftype = parse_sexpr("(deftype DLLNode (value int) (next DLLNode) (prev DLLNode))").unwrap();
        eval(&deftype, &menv).unwrap();
        {
            let types = menv.session().types.borrow();
            let node = types.get("DLLNode").unwrap();
            assert!(node.field("prev").unwrap().is_weak());
            assert!(!node.field("value").unwrap().is_weak());
        }

        let staged = parse_sexpr("(scan DLLNode (lift 1))").unwrap();
        let Value::Code(code) = eval(&staged, &menv).unwrap() else {
            panic!("scan should stage code");
        };
        let program = emit_program(&code, &menv.session().types.borrow(), &menv.session().options);
        for fragment in [
            "WeakRef* prev;",
            "static Obj* scan_obj(Obj* x);",
            "static void* scan_DLLNode(void* p) {",
            "invalidate_weak(x->prev);",
            "Obj* result = scan_DLLNode(mk_int(1));",
        ] {
            assert!(program.contains(fragment), "program lacks '{fragment}'");
        }
    }

    #[test]
    fn test_errors_propagate() {
        let menv = new_root(CompileOptions::default());
        for (input, expected) in [
            ("(let ((x (lift 1))) (+ x nope))", "Unbound symbol: nope"),
            ("(car (lift 1) 2)", "ArityError"),
            ("(let ((x (lift 1))) 'sym)", "Type mismatch"),
        ] {
            let err = eval(&parse_sexpr(input).unwrap(), &menv).unwrap_err();
            assert!(err.to_string().contains(expected), "'{input}': {err}");
        }
    }
}
