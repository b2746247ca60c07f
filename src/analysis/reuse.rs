//! Perceus-style reuse: a binding released early can donate its cell to a
//! later allocation of the same size.

use super::LetForm;
use super::liveness::Liveness;
use crate::ast::Value;
use std::rc::Rc;

/// Payload size of an integer cell
pub const INT_SIZE: usize = 8;
/// Payload size of a pair cell
pub const PAIR_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocSite {
    pub var: Rc<str>,
    pub size: usize,
    /// Statement holding the allocation
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReusePair {
    pub freed: Rc<str>,
    pub alloc: Rc<str>,
    pub size: usize,
}

/// Size of the cell a binding expression allocates at its top level, when
/// the emitted constructor can be rewritten into a reuse.
pub fn allocation_size(expr: &Value) -> Option<usize> {
    match expr {
        Value::Int(_) => Some(INT_SIZE),
        Value::Cell(_) => match expr.head_symbol() {
            Some("cons") => Some(PAIR_SIZE),
            Some("list") => expr.cdr().filter(|args| !args.is_nil()).map(|_| PAIR_SIZE),
            Some("quote") => match expr.cdr().and_then(Value::car) {
                Some(Value::Int(_)) => Some(INT_SIZE),
                Some(Value::Cell(_)) => Some(PAIR_SIZE),
                _ => None,
            },
            Some("lift") => expr.cdr().and_then(Value::car).and_then(allocation_size),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct ReuseContext {
    sites: Vec<AllocSite>,
    frees: Vec<AllocSite>,
    pairs: Vec<ReusePair>,
}

impl ReuseContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair each early free with the nearest later allocation of equal size
    /// that no other free has claimed. `early_free` gives the statement
    /// after which a binding is released early, if any.
    pub fn analyze(form: &LetForm, liveness: &Liveness, early_free: impl Fn(&str) -> Option<usize>) -> Self {
        let mut ctx = ReuseContext::new();
        for (line, binding) in form.bindings.iter().enumerate() {
            if let Some(size) = allocation_size(&binding.expr) {
                ctx.sites.push(AllocSite {
                    var: binding.name.clone(),
                    size,
                    line,
                });
            }
        }
        for site in &ctx.sites {
            if let Some(line) = early_free(&site.var) {
                ctx.frees.push(AllocSite {
                    var: site.var.clone(),
                    size: site.size,
                    line,
                });
            }
        }
        ctx.frees.sort_by_key(|f| f.line);

        let mut taken = vec![false; ctx.sites.len()];
        for free in &ctx.frees {
            let candidate = ctx.sites.iter().enumerate().find(|(i, site)| {
                !taken[*i]
                    && site.line > free.line
                    && site.size == free.size
                    && liveness
                        .last_statement(&free.var)
                        .is_none_or(|last| last <= free.line)
            });
            if let Some((i, site)) = candidate {
                taken[i] = true;
                tracing::debug!(freed = %free.var, alloc = %site.var, size = site.size, "reuse pair");
                ctx.pairs.push(ReusePair {
                    freed: free.var.clone(),
                    alloc: site.var.clone(),
                    size: site.size,
                });
            }
        }
        ctx
    }

    pub fn sites(&self) -> &[AllocSite] {
        &self.sites
    }

    pub fn pairs(&self) -> &[ReusePair] {
        &self.pairs
    }

    /// The pair whose allocation site is `var`'s declaration
    pub fn reuse_for_alloc(&self, var: &str) -> Option<&ReusePair> {
        self.pairs.iter().find(|p| &*p.alloc == var)
    }

    pub fn is_reused(&self, freed: &str) -> bool {
        self.pairs.iter().any(|p| &*p.freed == freed)
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::sexpr::parse_sexpr;
    use maplit::hashmap;
    use std::collections::HashMap;

    fn pairs_for(source: &str, early: HashMap<&str, usize>) -> Vec<(String, String)> {
        let form = LetForm::parse(&parse_sexpr(source).unwrap()).unwrap();
        let liveness = Liveness::analyze(&form, 64, 256);
        let ctx = ReuseContext::analyze(&form, &liveness, |name| early.get(name).copied());
        ctx.pairs()
            .iter()
            .map(|p| (p.freed.to_string(), p.alloc.to_string()))
            .collect()
    }

    #[test]
    fn test_allocation_sizes() {
        let cases = vec![
            ("5", Some(INT_SIZE)),
            ("(lift 5)", Some(INT_SIZE)),
            ("(cons 1 2)", Some(PAIR_SIZE)),
            ("(list 1)", Some(PAIR_SIZE)),
            ("(list)", None),
            ("'(1 2)", Some(PAIR_SIZE)),
            ("(lift '(1))", Some(PAIR_SIZE)),
            ("(+ 1 2)", None),
            ("x", None),
        ];
        for (source, expected) in cases {
            assert_eq!(allocation_size(&parse_sexpr(source).unwrap()), expected, "{source}");
        }
    }

    #[test]
    fn test_pairs_nearest_equal_size() {
        let source = "(let ((a (cons 1 2)) (b (car a)) (c 7) (d (cons 3 4)) (e (cons 5 6))) (cons d e))";
        let pairs = pairs_for(source, hashmap! { "a" => 1 });
        assert_eq!(pairs, vec![("a".to_owned(), "d".to_owned())]);
    }

    #[test]
    fn test_no_pair_without_later_allocation() {
        let source = "(let ((a (cons 1 2)) (b (car a))) b)";
        assert!(pairs_for(source, hashmap! { "a" => 1 }).is_empty());
    }

    #[test]
    fn test_each_allocation_claimed_once() {
        let source = "(let ((a 1) (b 2) (c (+ a b)) (d 3) (e 4)) (+ d e))";
        let pairs = pairs_for(source, hashmap! { "a" => 2, "b" => 2 });
        assert_eq!(
            pairs,
            vec![("a".to_owned(), "d".to_owned()), ("b".to_owned(), "e".to_owned())]
        );
    }

    #[test]
    fn test_size_mismatch_is_not_paired() {
        let source = "(let ((a 1) (b (+ a 1)) (c (cons 1 2))) (cons b c))";
        assert!(pairs_for(source, hashmap! { "a" => 1 }).is_empty());
    }
}
