//! Core value model shared by the reader, the evaluator and the emitter.
//!
//! [`Value`] is a tagged union over integers, symbols, cons cells, nil,
//! primitives, closures, staged code fragments and meta-environments. Cells
//! are reference counted so that sub-structure can be shared freely; long and
//! deeply nested structures are printed, compared and dropped without native
//! recursion along the list spine. Helper functions such as [`sym`], [`val`],
//! [`nil`] and [`list`] keep test code short.

use crate::Error;
use crate::builtinops::BuiltinOp;
use crate::evaluator::Environment;
use crate::evaluator::menv::MEnv;
use std::rc::Rc;

/// Type alias for integer values in the interpreter
pub type Int = i64;

/// Characters allowed in symbol names besides alphanumerics
pub(crate) const SYMBOL_SPECIAL_CHARS: &str = "+-*/<>=!?_$%&.:^~";

/// A cons cell. Fields are immutable once built.
pub struct Cell {
    head: Value,
    tail: Value,
}

impl Cell {
    pub fn head(&self) -> &Value {
        &self.head
    }

    pub fn tail(&self) -> &Value {
        &self.tail
    }
}

impl Drop for Cell {
    fn drop(&mut self) {
        // Unlink uniquely owned children onto a work list so that dropping a
        // 100k-deep structure does not recurse once per level.
        let mut pending = vec![
            std::mem::replace(&mut self.head, Value::Nil),
            std::mem::replace(&mut self.tail, Value::Nil),
        ];
        while let Some(value) = pending.pop() {
            if let Value::Cell(rc) = value
                && let Ok(mut cell) = Rc::try_unwrap(rc)
            {
                pending.push(std::mem::replace(&mut cell.head, Value::Nil));
                pending.push(std::mem::replace(&mut cell.tail, Value::Nil));
            }
        }
    }
}

/// User-defined function: parameters, body and the captured binding environment.
/// The MEnv is not captured; application builds a fresh child MEnv.
pub struct Closure {
    pub params: Vec<Rc<str>>,
    pub body: Value,
    pub env: Environment,
}

/// Core value type
#[derive(Clone)]
pub enum Value {
    Int(Int),
    Sym(Rc<str>),
    Cell(Rc<Cell>),
    Nil,
    /// Native primitive from the builtin registry
    Prim(&'static BuiltinOp),
    Closure(Rc<Closure>),
    /// Staged C expression text
    Code(Rc<str>),
    MEnv(Rc<MEnv>),
}

impl Value {
    pub fn cons(head: Value, tail: Value) -> Value {
        Value::Cell(Rc::new(Cell { head, tail }))
    }

    pub fn code(text: impl Into<Rc<str>>) -> Value {
        Value::Code(text.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_code(&self) -> bool {
        matches!(self, Value::Code(_))
    }

    /// Nil and integer zero are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Int(0))
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Value::Sym(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<Int> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&str> {
        match self {
            Value::Code(c) => Some(c),
            _ => None,
        }
    }

    /// Identity of a cons cell, shared by every clone of it
    pub fn cell_id(&self) -> Option<usize> {
        match self {
            Value::Cell(c) => Some(Rc::as_ptr(c).addr()),
            _ => None,
        }
    }

    pub fn car(&self) -> Option<&Value> {
        match self {
            Value::Cell(c) => Some(&c.head),
            _ => None,
        }
    }

    pub fn cdr(&self) -> Option<&Value> {
        match self {
            Value::Cell(c) => Some(&c.tail),
            _ => None,
        }
    }

    /// Symbol in head position of a cons, if any
    pub fn head_symbol(&self) -> Option<&str> {
        self.car().and_then(Value::as_symbol)
    }

    /// Iterate over the elements of a (possibly improper) list. Iteration
    /// stops at the first non-cell tail.
    pub fn iter(&self) -> ListIter<'_> {
        ListIter { cur: self }
    }

    /// Collect a proper list into a vector; `None` for improper lists and atoms
    /// other than nil.
    pub fn list_items(&self) -> Option<Vec<Value>> {
        let mut items = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Value::Nil => return Some(items),
                Value::Cell(c) => {
                    items.push(c.head.clone());
                    cur = &c.tail;
                }
                _ => return None,
            }
        }
    }

    /// Build a proper list from the given items
    pub fn from_items(items: impl IntoIterator<Item = Value, IntoIter: DoubleEndedIterator>) -> Value {
        items
            .into_iter()
            .rev()
            .fold(Value::Nil, |tail, head| Value::cons(head, tail))
    }

    /// Short variant name, used in type-mismatch messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Sym(_) => "symbol",
            Value::Cell(_) => "pair",
            Value::Nil => "nil",
            Value::Prim(_) => "primitive",
            Value::Closure(_) => "closure",
            Value::Code(_) => "code",
            Value::MEnv(_) => "menv",
        }
    }
}

pub struct ListIter<'a> {
    cur: &'a Value,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<&'a Value> {
        match self.cur {
            Value::Cell(c) => {
                self.cur = &c.tail;
                Some(&c.head)
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Sym(s) => write!(f, "Sym({s})"),
            Value::Cell(_) => write!(f, "List({self})"),
            Value::Nil => write!(f, "Nil"),
            Value::Prim(op) => write!(f, "Prim({})", op.id),
            Value::Closure(c) => {
                let params: Vec<&str> = c.params.iter().map(|p| p.as_ref()).collect();
                write!(f, "Closure(params={params:?}, body={})", c.body)
            }
            Value::Code(c) => write!(f, "Code({c})"),
            Value::MEnv(_) => write!(f, "MEnv"),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Sym(s) => write!(f, "{s}"),
            Value::Nil => write!(f, "()"),
            Value::Cell(_) => {
                write!(f, "(")?;
                let mut cur = self;
                let mut first = true;
                loop {
                    match cur {
                        Value::Cell(c) => {
                            if !first {
                                write!(f, " ")?;
                            }
                            write!(f, "{}", c.head)?;
                            first = false;
                            cur = &c.tail;
                        }
                        Value::Nil => break,
                        other => {
                            write!(f, " . {other}")?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            Value::Prim(op) => write!(f, "#<prim:{}>", op.id),
            Value::Closure(_) => write!(f, "#<closure>"),
            Value::Code(c) => write!(f, "{c}"),
            Value::MEnv(_) => write!(f, "#<menv>"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        let (mut a, mut b) = (self, other);
        loop {
            match (a, b) {
                (Value::Cell(x), Value::Cell(y)) => {
                    if Rc::ptr_eq(x, y) {
                        return true;
                    }
                    if x.head != y.head {
                        return false;
                    }
                    a = &x.tail;
                    b = &y.tail;
                }
                (Value::Int(x), Value::Int(y)) => return x == y,
                (Value::Sym(x), Value::Sym(y)) => return x == y,
                (Value::Nil, Value::Nil) => return true,
                (Value::Code(x), Value::Code(y)) => return x == y,
                (Value::Prim(x), Value::Prim(y)) => return x.id == y.id,
                (Value::Closure(x), Value::Closure(y)) => return Rc::ptr_eq(x, y),
                (Value::MEnv(x), Value::MEnv(y)) => return Rc::ptr_eq(x, y),
                _ => return false,
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Sym(Rc::from(s))
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Int(n as Int)
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(Int);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::from_items(v.into_iter().map(Into::into).collect::<Vec<_>>())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::from_items(arr.into_iter().map(Into::into).collect::<Vec<_>>())
    }
}

impl TryFrom<&Value> for Int {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Int, Error> {
        value
            .as_int()
            .ok_or_else(|| Error::TypeMismatch(format!("expected integer, got {}", value.type_name())))
    }
}

/// Helper for creating symbols
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::Sym(Rc::from(name.as_ref()))
}

/// Helper for creating values from Rust literals; `&str` becomes a symbol
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// The empty list
pub fn nil() -> Value {
    Value::Nil
}

/// Proper list from already-built values
pub fn list(items: Vec<Value>) -> Value {
    Value::from_items(items)
}

#[cfg(test)]
mod helper_function_tests {
    use super::*;

    #[test]
    fn test_helper_functions_data_driven() {
        let test_cases = vec![
            (val(42), Value::Int(42)),
            (val(-17), Value::Int(-17)),
            (val(255u8), Value::Int(255)),
            (val(Int::MIN), Value::Int(Int::MIN)),
            (sym("set-meta!"), Value::Sym(Rc::from("set-meta!"))),
            (val("foo"), Value::Sym(Rc::from("foo"))),
            (nil(), Value::Nil),
            (
                val([1, 2]),
                Value::cons(Value::Int(1), Value::cons(Value::Int(2), Value::Nil)),
            ),
            (
                list(vec![sym("quote"), sym("x")]),
                Value::cons(sym("quote"), Value::cons(sym("x"), Value::Nil)),
            ),
        ];

        for (i, (actual, expected)) in test_cases.iter().enumerate() {
            assert_eq!(actual, expected, "Test case {} failed", i + 1);
        }
    }

    #[test]
    fn test_display() {
        let cases = vec![
            (val(7), "7"),
            (nil(), "()"),
            (val([1, 2, 3]), "(1 2 3)"),
            (Value::cons(val(1), val(2)), "(1 . 2)"),
            (
                Value::cons(val(1), Value::cons(val(2), val(3))),
                "(1 2 . 3)",
            ),
            (list(vec![sym("a"), val([1]), nil()]), "(a (1) ())"),
            (Value::code("add(x, mk_int(5))"), "add(x, mk_int(5))"),
        ];
        for (i, (value, expected)) in cases.iter().enumerate() {
            assert_eq!(format!("{value}"), *expected, "case #{}", i + 1);
        }
    }

    #[test]
    fn test_long_list_print_length() {
        let long = Value::from_items(std::iter::repeat_n(Value::Int(7), 10_000).collect::<Vec<_>>());
        assert_eq!(format!("{long}").len(), 20_001);
    }

    #[test]
    fn test_structural_equality_and_accessors() {
        let a = val([1, 2, 3]);
        let b = val([1, 2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, val([1, 2]));
        assert_eq!(a.car(), Some(&Value::Int(1)));
        assert_eq!(a.cdr(), Some(&val([2, 3])));
        assert_eq!(a.list_items().map(|v| v.len()), Some(3));
        assert_eq!(Value::cons(val(1), val(2)).list_items(), None);
        assert_eq!(a.iter().count(), 3);
        assert_eq!(sym("x"), sym("x"));
        assert_ne!(sym("x"), Value::code("x"));
    }

    #[test]
    fn test_truthiness() {
        assert!(!nil().is_truthy());
        assert!(!val(0).is_truthy());
        assert!(val(1).is_truthy());
        assert!(sym("t").is_truthy());
        assert!(val([0]).is_truthy());
    }

    #[test]
    fn test_deep_structure_drop() {
        let mut deep = Value::Nil;
        for _ in 0..200_000 {
            deep = Value::cons(deep, Value::Nil);
        }
        drop(deep);
    }
}
