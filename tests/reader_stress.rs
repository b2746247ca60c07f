#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod reader_stress {

    use asapc::ast::Value;
    use asapc::evaluator::{eval, menv::MEnv};
    use asapc::session::{CompileOptions, Session};
    use asapc::sexpr::{parse_sexpr, parse_sexprs};
    use std::rc::Rc;

    #[test]
    fn test_deeply_nested_input_parses_and_drops() {
        let depth = 100_000;
        let source = format!("{}{}", "(".repeat(depth), ")".repeat(depth));
        let parsed = parse_sexpr(&source).unwrap();

        let mut level = 0;
        let mut current = &parsed;
        while let Value::Cell(cell) = current {
            level += 1;
            current = cell.head();
        }
        assert_eq!(level, depth - 1);
        assert!(current.is_nil());
        drop(parsed);
    }

    #[test]
    fn test_unbalanced_deep_input_is_an_error() {
        let source = "(".repeat(50_000);
        assert!(parse_sexpr(&source).is_err());
        let source = format!("{})", ")".repeat(10));
        assert!(parse_sexpr(&source).is_err());
    }

    #[test]
    fn test_long_list_round_trips_through_display() {
        let items = vec!["7"; 10_000].join(" ");
        let parsed = parse_sexpr(&format!("({items})")).unwrap();
        let printed = parsed.to_string();
        assert_eq!(printed.len(), 20_001);
        assert_eq!(parse_sexprs(&printed).unwrap().len(), 1);
    }

    #[test]
    fn test_deep_evaluation_hits_depth_limit() {
        let menv = MEnv::root(Rc::new(Session::new(CompileOptions::default())));
        let nesting = 300;
        let source = format!("{}0{}", "(+ 1 ".repeat(nesting), ")".repeat(nesting));
        let err = eval(&parse_sexpr(&source).unwrap(), &menv).unwrap_err();
        assert!(err.to_string().contains("depth limit exceeded"), "{err}");

        let shallow = format!("{}0{}", "(+ 1 ".repeat(50), ")".repeat(50));
        assert_eq!(eval(&parse_sexpr(&shallow).unwrap(), &menv).unwrap(), Value::Int(50));
    }
}
