//! Built-in primitive registry.
//!
//! Every primitive is stage polymorphic: given only runtime values it reduces
//! them, but as soon as one operand is a [`Value::Code`] fragment it emits a
//! call to the runtime helper named by [`BuiltinOp::c_name`] instead.
//!
//! ```scheme
//! (+ 1 2)               ; => 3
//! (+ (lift 1) 2)        ; => add(mk_int(1), mk_int(2))
//! (- (lift 4))          ; => sub(mk_int(0), mk_int(4))
//! (< (lift 1) 2)        ; => lt_op(mk_int(1), mk_int(2))
//! ```
//!
//! ## Adding New Operations
//!
//! 1. Implement the reducer with the signature `fn(&[Value]) -> Result<Value, Error>`
//! 2. Add a [`BuiltinOp`] to `BUILTIN_OPS` with its C name, arity and emission style
//! 3. Provide the C helper in the runtime text emitted by `codegen::runtime`

use crate::Error;
use crate::ast::{Int, Value};
use crate::codegen::lift_value;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Represents the number of arguments a primitive accepts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    /// Check if the given number of arguments is valid for this arity
    pub fn validate(&self, arg_count: usize) -> Result<(), Error> {
        match self {
            Arity::Exact(n) if arg_count != *n => Err(Error::arity_error(*n, arg_count)),
            Arity::AtLeast(n) if arg_count < *n => Err(Error::arity_error(*n, arg_count)),
            _ => Ok(()),
        }
    }
}

/// How a primitive is rendered once one of its operands is staged
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmitStyle {
    /// Left fold of a binary helper: `add(add(a, b), c)`
    Fold,
    /// Plain call with every operand: `car(x)`, `lt_op(a, b)`
    Call,
    /// Right-nested pair construction terminated by `NULL`
    ListBuild,
}

/// Definition of a built-in primitive
#[derive(Debug)]
pub struct BuiltinOp {
    /// Identifier in the source language
    pub id: &'static str,
    /// Name of the runtime helper the emitter calls
    pub c_name: &'static str,
    pub arity: Arity,
    pub emit: EmitStyle,
    reduce: fn(&[Value]) -> Result<Value, Error>,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl BuiltinOp {
    /// Apply the primitive. Reduces when every operand is a runtime value,
    /// otherwise emits target code.
    pub fn apply(&self, args: &[Value]) -> Result<Value, Error> {
        self.arity.validate(args.len())?;
        if args.iter().any(Value::is_code) {
            return self.emit_call(args).map(Value::code);
        }
        (self.reduce)(args)
    }

    fn emit_call(&self, args: &[Value]) -> Result<String, Error> {
        let operands = args.iter().map(lift_value).collect::<Result<Vec<_>, _>>()?;
        Ok(match self.emit {
            EmitStyle::Fold => match operands.as_slice() {
                [only] if self.id == "-" => format!("{}(mk_int(0), {only})", self.c_name),
                [only] => only.clone(),
                [first, rest @ ..] => rest
                    .iter()
                    .fold(first.clone(), |acc, next| format!("{}({acc}, {next})", self.c_name)),
                [] => return Err(Error::arity_error(1, 0)),
            },
            EmitStyle::Call => format!("{}({})", self.c_name, operands.join(", ")),
            EmitStyle::ListBuild => operands
                .iter()
                .rev()
                .fold("NULL".to_owned(), |acc, item| format!("mk_pair({item}, {acc})")),
        })
    }
}

//
// Reducers
//

fn int_arg(value: &Value, op: &str) -> Result<Int, Error> {
    value.as_int().ok_or_else(|| {
        Error::TypeMismatch(format!(
            "'{op}' expects integer arguments, got {} {value}",
            value.type_name()
        ))
    })
}

fn bool_value(b: bool) -> Value {
    Value::Int(Int::from(b))
}

macro_rules! checked_fold {
    ($name:ident, $op:literal, $method:ident, $what:literal) => {
        fn $name(args: &[Value]) -> Result<Value, Error> {
            let (first, rest) = match args {
                [first, rest @ ..] => (int_arg(first, $op)?, rest),
                [] => return Err(Error::arity_error(1, 0)),
            };
            let mut acc = first;
            for arg in rest {
                acc = acc
                    .$method(int_arg(arg, $op)?)
                    .ok_or_else(|| Error::EvalError(concat!("Integer overflow in ", $what).into()))?;
            }
            Ok(Value::Int(acc))
        }
    };
}

checked_fold!(fold_add, "+", checked_add, "addition");
checked_fold!(fold_mul, "*", checked_mul, "multiplication");

fn builtin_add(args: &[Value]) -> Result<Value, Error> {
    if args.is_empty() {
        return Ok(Value::Int(0));
    }
    fold_add(args)
}

fn builtin_sub(args: &[Value]) -> Result<Value, Error> {
    match args {
        [only] => int_arg(only, "-")?
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| Error::EvalError("Integer overflow in negation".into())),
        [first, rest @ ..] => {
            let mut acc = int_arg(first, "-")?;
            for arg in rest {
                acc = acc
                    .checked_sub(int_arg(arg, "-")?)
                    .ok_or_else(|| Error::EvalError("Integer overflow in subtraction".into()))?;
            }
            Ok(Value::Int(acc))
        }
        [] => Err(Error::arity_error(1, 0)),
    }
}

fn builtin_div(args: &[Value]) -> Result<Value, Error> {
    divide(args, "/", Int::checked_div)
}

fn builtin_mod(args: &[Value]) -> Result<Value, Error> {
    divide(args, "%", Int::checked_rem)
}

fn divide(args: &[Value], op: &str, f: fn(Int, Int) -> Option<Int>) -> Result<Value, Error> {
    let [a, b] = args else {
        return Err(Error::arity_error(2, args.len()));
    };
    let (a, b) = (int_arg(a, op)?, int_arg(b, op)?);
    if b == 0 {
        return Err(Error::EvalError("Division by zero".into()));
    }
    f(a, b)
        .map(Value::Int)
        .ok_or_else(|| Error::EvalError("Integer overflow in division".into()))
}

macro_rules! numeric_comparison {
    ($name:ident, $op:tt, $op_str:literal) => {
        fn $name(args: &[Value]) -> Result<Value, Error> {
            let [a, b] = args else {
                return Err(Error::arity_error(2, args.len()));
            };
            Ok(bool_value(int_arg(a, $op_str)? $op int_arg(b, $op_str)?))
        }
    };
}

numeric_comparison!(builtin_lt, <, "<");
numeric_comparison!(builtin_gt, >, ">");
numeric_comparison!(builtin_le, <=, "<=");
numeric_comparison!(builtin_ge, >=, ">=");
numeric_comparison!(builtin_num_eq, ==, "=");

fn builtin_not(args: &[Value]) -> Result<Value, Error> {
    match args {
        [v] => Ok(bool_value(!v.is_truthy())),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

fn builtin_cons(args: &[Value]) -> Result<Value, Error> {
    match args {
        [head, tail] => Ok(Value::cons(head.clone(), tail.clone())),
        _ => Err(Error::arity_error(2, args.len())),
    }
}

fn builtin_car(args: &[Value]) -> Result<Value, Error> {
    match args {
        [v] => v
            .car()
            .cloned()
            .ok_or_else(|| Error::TypeMismatch(format!("car of non-cons {v}"))),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

fn builtin_cdr(args: &[Value]) -> Result<Value, Error> {
    match args {
        [v] => v
            .cdr()
            .cloned()
            .ok_or_else(|| Error::TypeMismatch(format!("cdr of non-cons {v}"))),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

fn builtin_null(args: &[Value]) -> Result<Value, Error> {
    match args {
        [v] => Ok(bool_value(v.is_nil())),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

fn builtin_pair(args: &[Value]) -> Result<Value, Error> {
    match args {
        [v] => Ok(bool_value(matches!(v, Value::Cell(_)))),
        _ => Err(Error::arity_error(1, args.len())),
    }
}

fn builtin_list(args: &[Value]) -> Result<Value, Error> {
    Ok(Value::from_items(args.to_vec()))
}

/// Identity for cells, value equality for atoms
fn builtin_eq(args: &[Value]) -> Result<Value, Error> {
    let [a, b] = args else {
        return Err(Error::arity_error(2, args.len()));
    };
    let same = match (a, b) {
        (Value::Cell(x), Value::Cell(y)) => std::rc::Rc::ptr_eq(x, y),
        (Value::Int(_) | Value::Sym(_) | Value::Nil | Value::Prim(_), _) => a == b,
        (Value::Closure(_) | Value::MEnv(_), _) => a == b,
        _ => false,
    };
    Ok(bool_value(same))
}

/// Global registry of all built-in primitives.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    vec![
        // Arithmetic
        BuiltinOp {
            id: "+",
            c_name: "add",
            arity: Arity::Any,
            emit: EmitStyle::Fold,
            reduce: builtin_add,
        },
        BuiltinOp {
            id: "-",
            c_name: "sub",
            arity: Arity::AtLeast(1),
            emit: EmitStyle::Fold,
            reduce: builtin_sub,
        },
        BuiltinOp {
            id: "*",
            c_name: "mul",
            arity: Arity::AtLeast(1),
            emit: EmitStyle::Fold,
            reduce: fold_mul,
        },
        BuiltinOp {
            id: "/",
            c_name: "div_op",
            arity: Arity::Exact(2),
            emit: EmitStyle::Call,
            reduce: builtin_div,
        },
        BuiltinOp {
            id: "%",
            c_name: "mod_op",
            arity: Arity::Exact(2),
            emit: EmitStyle::Call,
            reduce: builtin_mod,
        },
        // Comparison
        BuiltinOp {
            id: "<",
            c_name: "lt_op",
            arity: Arity::Exact(2),
            emit: EmitStyle::Call,
            reduce: builtin_lt,
        },
        BuiltinOp {
            id: ">",
            c_name: "gt_op",
            arity: Arity::Exact(2),
            emit: EmitStyle::Call,
            reduce: builtin_gt,
        },
        BuiltinOp {
            id: "<=",
            c_name: "le_op",
            arity: Arity::Exact(2),
            emit: EmitStyle::Call,
            reduce: builtin_le,
        },
        BuiltinOp {
            id: ">=",
            c_name: "ge_op",
            arity: Arity::Exact(2),
            emit: EmitStyle::Call,
            reduce: builtin_ge,
        },
        BuiltinOp {
            id: "=",
            c_name: "num_eq",
            arity: Arity::Exact(2),
            emit: EmitStyle::Call,
            reduce: builtin_num_eq,
        },
        // Logical
        BuiltinOp {
            id: "not",
            c_name: "not_op",
            arity: Arity::Exact(1),
            emit: EmitStyle::Call,
            reduce: builtin_not,
        },
        // Pairs and lists
        BuiltinOp {
            id: "cons",
            c_name: "mk_pair",
            arity: Arity::Exact(2),
            emit: EmitStyle::Call,
            reduce: builtin_cons,
        },
        BuiltinOp {
            id: "car",
            c_name: "car",
            arity: Arity::Exact(1),
            emit: EmitStyle::Call,
            reduce: builtin_car,
        },
        BuiltinOp {
            id: "cdr",
            c_name: "cdr",
            arity: Arity::Exact(1),
            emit: EmitStyle::Call,
            reduce: builtin_cdr,
        },
        BuiltinOp {
            id: "null?",
            c_name: "is_nil",
            arity: Arity::Exact(1),
            emit: EmitStyle::Call,
            reduce: builtin_null,
        },
        BuiltinOp {
            id: "pair?",
            c_name: "is_pair",
            arity: Arity::Exact(1),
            emit: EmitStyle::Call,
            reduce: builtin_pair,
        },
        BuiltinOp {
            id: "list",
            c_name: "mk_pair",
            arity: Arity::Any,
            emit: EmitStyle::ListBuild,
            reduce: builtin_list,
        },
        BuiltinOp {
            id: "eq?",
            c_name: "eq_op",
            arity: Arity::Exact(2),
            emit: EmitStyle::Call,
            reduce: builtin_eq,
        },
    ]
});

static BUILTIN_BY_ID: LazyLock<HashMap<&'static str, &'static BuiltinOp>> = LazyLock::new(|| {
    let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
    ops.iter().map(|op| (op.id, op)).collect()
});

/// Get all builtin primitives
pub fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin primitive by its source identifier
pub fn find_op(id: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_BY_ID.get(id).copied()
}
