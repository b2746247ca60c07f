//! asapc - staged, reflective evaluator with a static memory-management pipeline
//!
//! This crate interprets a small S-expression language and, whenever a
//! sub-expression is staged with `lift`, compiles it into C that targets a
//! runtime with a fixed menu of release strategies. The interesting part is
//! the pipeline that decides, per binding, how the generated code releases
//! heap objects:
//!
//! ```scheme
//! (let ((x (lift 10)))      ; staged binding => compilation mode
//!   (+ x (lift 5)))         ; body becomes add(x, mk_int(5))
//! ```
//!
//! produces a block that declares `x`, computes the body, and releases `x`
//! with `free_tree` because shape analysis proved it tree-shaped.
//!
//! ## Modules
//!
//! - `ast`: value model shared by the reader, evaluator and emitter
//! - `sexpr`: S-expression reader
//! - `evaluator`: stage-polymorphic evaluator over meta-environments
//! - `builtinops`: primitive registry (reduce values or emit code)
//! - `analysis`: escape, shape, liveness, RC-elision and reuse analyzers
//! - `types`: type registry and weak-field (back edge) detection
//! - `codegen`: block and program emission targeting the C runtime
//! - `runtime`: executable model of the C runtime strategies
//! - `session`, `arena`: compile options and per-run resources

use std::fmt;

/// Maximum evaluation depth before the evaluator reports an error instead of
/// overflowing the native stack.
pub const MAX_EVAL_DEPTH: usize = 200;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (stray `)`, misplaced `.`, bad token)
    InvalidSyntax,
    /// Input ended before the expression was complete (unterminated list, dangling quote)
    Incomplete,
    /// Extra input found after a complete, valid expression
    TrailingContent,
    /// Implementation-imposed limit exceeded (integer overflow)
    ImplementationLimit,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
    /// The problematic token or character encountered, if identifiable
    pub found: Option<String>,
}

impl ParseError {
    pub fn new(
        kind: ParseErrorKind,
        message: impl Into<String>,
        context: Option<String>,
        found: Option<String>,
    ) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
            found,
        }
    }

    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, None, None)
    }

    /// Create a ParseError with context extracted from input at a given byte offset
    pub fn with_context_and_found(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
        found: Option<String>,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        let prefix_chars = input
            .get(..error_offset.min(input.len()))
            .map_or(0, |s| s.chars().count());
        let context_start = prefix_chars.saturating_sub(20);

        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.chars().count() < input.chars().count() {
            display_context.push_str("[...]");
        }

        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        Self::new(kind, message, Some(display_context), found)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(found) = &self.found {
            write!(f, "\nFound: {found}")?;
        }
        if let Some(context) = &self.context {
            write!(f, "\nContext: {context}")?;
        }
        Ok(())
    }
}

/// Error type shared by the reader, evaluator and pipeline
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("ParseError: {0}")]
    ParseError(ParseError),
    #[error("Unbound symbol: {0}")]
    UnboundSymbol(String),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("{}", arity_message(.expected, .got, .expression))]
    ArityError {
        expected: usize,
        got: usize,
        expression: Option<String>,
    },
    #[error("EvaluationError: {0}")]
    EvalError(String),
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    /// An analyzer gave up on a node; the pipeline continues conservatively.
    #[error("Pipeline skipped node: {0}")]
    PipelineSkip(String),
}

fn arity_message(expected: &usize, got: &usize, expression: &Option<String>) -> String {
    match expression {
        Some(expr) => {
            format!("ArityError: expression {expr}: expected {expected} arguments, got {got}")
        }
        None => format!("ArityError: function expected {expected} arguments but got {got}"),
    }
}

impl Error {
    pub fn arity_error(expected: usize, got: usize) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: None,
        }
    }

    pub fn arity_error_with_expr(expected: usize, got: usize, expression: String) -> Self {
        Error::ArityError {
            expected,
            got,
            expression: Some(expression),
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::ParseError(err)
    }
}

pub mod analysis;
pub mod arena;
pub mod ast;
pub mod builtinops;
pub mod codegen;
pub mod evaluator;
pub mod runtime;
pub mod session;
pub mod sexpr;
pub mod types;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let cases = vec![
            (
                Error::UnboundSymbol("x".into()),
                "Unbound symbol: x".to_owned(),
            ),
            (
                Error::arity_error(2, 3),
                "ArityError: function expected 2 arguments but got 3".to_owned(),
            ),
            (
                Error::arity_error_with_expr(1, 0, "(car)".into()),
                "ArityError: expression (car): expected 1 arguments, got 0".to_owned(),
            ),
            (
                Error::ParseError(ParseError::new(
                    ParseErrorKind::Incomplete,
                    "Unterminated list",
                    Some("(1 2".into()),
                    None,
                )),
                "ParseError: Unterminated list\nContext: (1 2".to_owned(),
            ),
        ];

        for (i, (err, expected)) in cases.iter().enumerate() {
            assert_eq!(format!("{err}"), *expected, "case #{}", i + 1);
        }
    }

    #[test]
    fn test_parse_error_context_truncation() {
        let input = format!("{}@{}", "a".repeat(50), "b".repeat(200));
        let err = ParseError::with_context_and_found(
            ParseErrorKind::InvalidSyntax,
            "bad",
            &input,
            50,
            Some("@".into()),
        );
        let context = err.context.unwrap_or_default();
        assert!(context.starts_with("[...]"));
        assert!(context.ends_with("[...]"));
        assert!(context.contains('@'));
    }
}
