//! S-expression reader.
//!
//! Tokens (whitespace, `;` comments, atoms) are recognized with nom
//! combinators; list structure is assembled with an explicit frame stack so
//! that nesting depth is bounded only by memory.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, multispace1, not_line_ending},
    combinator::value,
    multi::many0_count,
    sequence::preceded,
};

use crate::ast::{Int, SYMBOL_SPECIAL_CHARS, Value, sym};
use crate::{ParseError, ParseErrorKind};

/// Skip whitespace and line comments
fn skip_trivia(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0_count(alt((multispace1, preceded(char(';'), not_line_ending)))),
    )
    .parse(input)
}

/// Recognize an atom token (integer, symbol or the dot marker)
fn atom_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c)).parse(input)
}

fn is_integer_token(token: &str) -> bool {
    let digits = token
        .strip_prefix('-')
        .or_else(|| token.strip_prefix('+'))
        .unwrap_or(token);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DotState {
    None,
    /// Just read `.`; exactly one expression must follow
    AwaitingTail,
    /// Tail read; only `)` may follow
    HaveTail,
}

enum Frame {
    List {
        items: Vec<Value>,
        tail: Option<Value>,
        dot: DotState,
        open_offset: usize,
    },
    Quote,
}

struct Reader<'a> {
    source: &'a str,
    stack: Vec<Frame>,
}

impl<'a> Reader<'a> {
    fn new(source: &'a str) -> Self {
        Reader {
            source,
            stack: Vec::new(),
        }
    }

    fn offset_of(&self, rest: &str) -> usize {
        self.source.len() - rest.len()
    }

    fn error_at(&self, kind: ParseErrorKind, message: &str, rest: &str, found: Option<String>) -> ParseError {
        ParseError::with_context_and_found(kind, message, self.source, self.offset_of(rest), found)
    }

    /// Hand a completed expression to the innermost open frame. Returns the
    /// expression when no frame is open, meaning a top-level datum is done.
    fn deliver(&mut self, mut completed: Value, rest: &str) -> Result<Option<Value>, ParseError> {
        loop {
            match self.stack.last_mut() {
                None => return Ok(Some(completed)),
                Some(Frame::Quote) => {
                    self.stack.pop();
                    completed = Value::from_items([sym("quote"), completed]);
                }
                Some(Frame::List { items, tail, dot, .. }) => {
                    match dot {
                        DotState::None => items.push(completed),
                        DotState::AwaitingTail => {
                            *tail = Some(completed);
                            *dot = DotState::HaveTail;
                        }
                        DotState::HaveTail => {
                            return Err(self.error_at(
                                ParseErrorKind::InvalidSyntax,
                                "More than one expression after '.' in dotted pair",
                                rest,
                                Some(completed.to_string()),
                            ));
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn close_list(&mut self, rest: &str) -> Result<Value, ParseError> {
        match self.stack.pop() {
            Some(Frame::List { items, tail, dot, .. }) => {
                if dot == DotState::AwaitingTail {
                    return Err(self.error_at(
                        ParseErrorKind::InvalidSyntax,
                        "Expected expression after '.'",
                        rest,
                        Some(")".into()),
                    ));
                }
                Ok(items
                    .into_iter()
                    .rev()
                    .fold(tail.unwrap_or(Value::Nil), |acc, item| Value::cons(item, acc)))
            }
            Some(Frame::Quote) => Err(self.error_at(
                ParseErrorKind::InvalidSyntax,
                "Quote must be followed by an expression",
                rest,
                Some(")".into()),
            )),
            None => Err(self.error_at(
                ParseErrorKind::InvalidSyntax,
                "Unexpected ')'",
                rest,
                Some(")".into()),
            )),
        }
    }

    fn mark_dot(&mut self, rest: &str) -> Result<(), ParseError> {
        if let Some(Frame::List { items, dot, .. }) = self.stack.last_mut()
            && *dot == DotState::None
            && !items.is_empty()
        {
            *dot = DotState::AwaitingTail;
            return Ok(());
        }
        Err(self.error_at(
            ParseErrorKind::InvalidSyntax,
            "Misplaced '.'",
            rest,
            Some(".".into()),
        ))
    }

    fn atom(&self, token: &str, rest: &str) -> Result<Value, ParseError> {
        if is_integer_token(token) {
            return token.parse::<Int>().map(Value::Int).map_err(|_| {
                self.error_at(
                    ParseErrorKind::ImplementationLimit,
                    "Integer literal out of range",
                    rest,
                    Some(token.to_owned()),
                )
            });
        }
        Ok(sym(token))
    }

    /// Read one datum starting at `input`, returning it with the unread rest.
    fn read_datum(&mut self, mut input: &'a str) -> Result<(Value, &'a str), ParseError> {
        loop {
            let (rest, ()) = skip_trivia(input).map_err(|_| {
                self.error_at(ParseErrorKind::InvalidSyntax, "Invalid comment", input, None)
            })?;
            input = rest;

            let Some(next) = input.chars().next() else {
                return Err(self.incomplete_error(input));
            };

            let completed = match next {
                '(' => {
                    self.stack.push(Frame::List {
                        items: Vec::new(),
                        tail: None,
                        dot: DotState::None,
                        open_offset: self.offset_of(input),
                    });
                    input = &input[1..];
                    continue;
                }
                ')' => {
                    let list = self.close_list(input)?;
                    input = &input[1..];
                    list
                }
                '\'' => {
                    self.stack.push(Frame::Quote);
                    input = &input[1..];
                    continue;
                }
                _ => {
                    let Ok((rest, token)) = atom_token(input) else {
                        return Err(self.error_at(
                            ParseErrorKind::InvalidSyntax,
                            "Unexpected character",
                            input,
                            Some(next.to_string()),
                        ));
                    };
                    if token == "." {
                        self.mark_dot(input)?;
                        input = rest;
                        continue;
                    }
                    let atom = self.atom(token, input)?;
                    input = rest;
                    atom
                }
            };

            if let Some(datum) = self.deliver(completed, input)? {
                return Ok((datum, input));
            }
        }
    }

    fn incomplete_error(&self, rest: &str) -> ParseError {
        match self.stack.last() {
            None => self.error_at(ParseErrorKind::Incomplete, "Empty input", rest, None),
            Some(Frame::Quote) => self.error_at(
                ParseErrorKind::Incomplete,
                "Quote must be followed by an expression",
                rest,
                None,
            ),
            Some(Frame::List { open_offset, .. }) => {
                let open_offset = *open_offset;
                ParseError::with_context_and_found(
                    ParseErrorKind::Incomplete,
                    format!("Unterminated list (opened at byte {open_offset})"),
                    self.source,
                    open_offset,
                    None,
                )
            }
        }
    }
}

/// Parse exactly one expression; anything but trivia after it is an error.
pub fn parse_sexpr(input: &str) -> Result<Value, ParseError> {
    let mut reader = Reader::new(input);
    let (datum, rest) = reader.read_datum(input)?;
    let (rest, ()) = skip_trivia(rest)
        .map_err(|_| reader.error_at(ParseErrorKind::InvalidSyntax, "Invalid comment", rest, None))?;
    if !rest.is_empty() {
        let found: String = rest.chars().take(10).collect();
        return Err(reader.error_at(
            ParseErrorKind::TrailingContent,
            "Unexpected content after expression",
            rest,
            Some(found),
        ));
    }
    Ok(datum)
}

/// Parse a sequence of expressions (used by the REPL for multi-form lines).
pub fn parse_sexprs(input: &str) -> Result<Vec<Value>, ParseError> {
    let mut reader = Reader::new(input);
    let mut out = Vec::new();
    let mut rest = input;
    loop {
        let (after, ()) = skip_trivia(rest)
            .map_err(|_| reader.error_at(ParseErrorKind::InvalidSyntax, "Invalid comment", rest, None))?;
        if after.is_empty() {
            return Ok(out);
        }
        let (datum, next) = reader.read_datum(after)?;
        out.push(datum);
        rest = next;
    }
}
