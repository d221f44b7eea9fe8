//! Built-in interpreter backend.
//!
//! A deliberately small C++-fragment interpreter: 64-bit integer bindings,
//! `std::cout` output, arithmetic evaluation and prefix completion. It gives
//! the shipped worker binary a real backend and lets the transport be
//! exercised end to end without linking a compiler. A production embedding
//! replaces it with its own [`Interpreter`] implementation.
//!
//! # Grammar
//!
//! ```text
//! program   := statement*
//! statement := (output | decl | assign | expr) ';'
//! output    := "std::cout" ("<<" (string | "std::endl" | expr))+
//! decl      := ("int"|"long"|"auto"|...) ident ("=" expr)?
//! assign    := ident "=" expr
//! expr      := term (("+"|"-") term)*
//! term      := factor (("*"|"/"|"%") factor)*
//! factor    := "(" expr ")" | integer | "-" factor | ident
//! ```
//!
//! Line comments (`//`) are stripped before parsing. String literals do not
//! support escaped quotes.

use crate::error::{Error, Result};
use crate::interpreter::{CaptureStream, Interpreter};
use std::collections::HashMap;
use winnow::Parser;
use winnow::ascii::{alpha1, digit1, multispace0, multispace1};
use winnow::combinator::{alt, delimited, opt, preceded, repeat};
use winnow::error::ContextError;
use winnow::token::{take_till, take_while};

type WResult<T> = std::result::Result<T, ContextError>;

/// Completion candidates inside the `std` namespace.
const STD_MEMBERS: &[&str] = &[
    "array",
    "cerr",
    "cin",
    "cout",
    "deque",
    "endl",
    "list",
    "map",
    "pair",
    "set",
    "size_t",
    "string",
    "string_view",
    "tuple",
    "unordered_map",
    "unordered_set",
    "valarray",
    "vector",
];

/// Keyword completion candidates.
const KEYWORDS: &[&str] = &[
    "auto", "bool", "break", "char", "const", "continue", "double", "else", "false", "float",
    "for", "if", "int", "long", "return", "true", "void", "while",
];

/// The default backend used by the worker binary.
pub struct EmbeddedInterpreter {
    #[allow(dead_code)]
    args: Vec<String>,
    vars: HashMap<String, i64>,
    captures: Vec<(CaptureStream, String)>,
}

impl EmbeddedInterpreter {
    /// Construct the backend with a compiler-style argument vector.
    ///
    /// The arguments are accepted for contract compatibility and logged;
    /// this backend has no compiler behind it to forward them to.
    pub fn create(args: &[String]) -> Result<Self> {
        for (i, arg) in args.iter().enumerate() {
            tracing::debug!(index = i, arg = %arg, "interpreter argument");
        }
        Ok(Self {
            args: args.to_vec(),
            vars: HashMap::new(),
            captures: Vec::new(),
        })
    }

    /// Route interpreter output to the innermost matching capture, or to the
    /// process stream when nothing captures it.
    fn emit(&mut self, stream: CaptureStream, text: &str) {
        if let Some((_, buffer)) = self
            .captures
            .iter_mut()
            .rev()
            .find(|(captured, _)| *captured == stream)
        {
            buffer.push_str(text);
            return;
        }
        match stream {
            CaptureStream::Stdout => print!("{text}"),
            CaptureStream::Stderr => eprint!("{text}"),
        }
    }

    fn exec(&mut self, stmt: Stmt) -> std::result::Result<(), String> {
        match stmt {
            Stmt::Decl { name, value } => {
                let value = match value {
                    Some(expr) => self.eval(&expr)?,
                    None => 0,
                };
                self.vars.insert(name, value);
            }
            Stmt::Assign { name, value } => {
                if !self.vars.contains_key(&name) {
                    return Err(format!("use of undeclared identifier '{name}'"));
                }
                let value = self.eval(&value)?;
                self.vars.insert(name, value);
            }
            Stmt::Print(items) => {
                let mut line = String::new();
                for item in items {
                    match item {
                        PrintItem::Text(text) => line.push_str(&text),
                        PrintItem::Endl => line.push('\n'),
                        PrintItem::Value(expr) => line.push_str(&self.eval(&expr)?.to_string()),
                    }
                }
                self.emit(CaptureStream::Stdout, &line);
            }
            Stmt::Expr(expr) => {
                self.eval(&expr)?;
            }
        }
        Ok(())
    }

    fn eval(&self, expr: &Expr) -> std::result::Result<i64, String> {
        match expr {
            Expr::Literal(value) => Ok(*value),
            Expr::Var(name) => self
                .vars
                .get(name)
                .copied()
                .ok_or_else(|| format!("use of undeclared identifier '{name}'")),
            Expr::Neg(inner) => Ok(self.eval(inner)?.wrapping_neg()),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                match op {
                    '+' => Ok(lhs.wrapping_add(rhs)),
                    '-' => Ok(lhs.wrapping_sub(rhs)),
                    '*' => Ok(lhs.wrapping_mul(rhs)),
                    '/' => lhs.checked_div(rhs).ok_or_else(|| div_error(rhs)),
                    '%' => lhs.checked_rem(rhs).ok_or_else(|| div_error(rhs)),
                    _ => Err(format!("unsupported operator '{op}'")),
                }
            }
        }
    }
}

fn div_error(rhs: i64) -> String {
    if rhs == 0 {
        "division by zero".to_string()
    } else {
        "integer overflow in division".to_string()
    }
}

impl Interpreter for EmbeddedInterpreter {
    fn process(&mut self, code: &str) -> Result<bool> {
        let source = strip_line_comments(code);
        let stmts = match program.parse(source.trim()) {
            Ok(stmts) => stmts,
            Err(e) => {
                self.emit(
                    CaptureStream::Stderr,
                    &format!("input_line:1:1: error: expected statement: {e}\n"),
                );
                return Ok(false);
            }
        };
        for stmt in stmts {
            if let Err(message) = self.exec(stmt) {
                self.emit(
                    CaptureStream::Stderr,
                    &format!("input_line:1:1: error: {message}\n"),
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn code_complete(&mut self, code: &str, _line: u32, col: u32) -> Result<Vec<String>> {
        let mut cut = (col.saturating_sub(1) as usize).min(code.len());
        while cut > 0 && !code.is_char_boundary(cut) {
            cut -= 1;
        }
        let prefix = &code[..cut];

        let mut token_start = 0;
        for (i, c) in prefix.char_indices() {
            if !(c.is_alphanumeric() || c == '_' || c == ':') {
                token_start = i + c.len_utf8();
            }
        }
        let token = &prefix[token_start..];

        let mut results = Vec::new();
        if let Some(partial) = token.strip_prefix("std::") {
            for candidate in STD_MEMBERS {
                if candidate.starts_with(partial) {
                    results.push((*candidate).to_string());
                }
            }
        } else if !token.is_empty() {
            for keyword in KEYWORDS {
                if keyword.starts_with(token) {
                    results.push((*keyword).to_string());
                }
            }
            let mut names: Vec<&String> = self
                .vars
                .keys()
                .filter(|name| name.starts_with(token))
                .collect();
            names.sort();
            results.extend(names.into_iter().cloned());
        }
        Ok(results)
    }

    fn evaluate(&mut self, code: &str) -> Result<i64> {
        let source = strip_line_comments(code);
        let trimmed = source.trim().trim_end_matches(';').trim_end();
        let parsed = expr
            .parse(trimmed)
            .map_err(|e| Error::Interpreter(format!("cannot parse expression: {e}")))?;
        self.eval(&parsed).map_err(Error::Interpreter)
    }

    fn begin_capture(&mut self, stream: CaptureStream) {
        self.captures.push((stream, String::new()));
    }

    fn end_capture(&mut self) -> String {
        self.captures
            .pop()
            .map(|(_, buffer)| buffer)
            .unwrap_or_default()
    }
}

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Decl { name: String, value: Option<Expr> },
    Assign { name: String, value: Expr },
    Print(Vec<PrintItem>),
    Expr(Expr),
}

/// One `<<` operand of an output statement.
#[derive(Debug, Clone, PartialEq)]
enum PrintItem {
    Text(String),
    Endl,
    Value(Expr),
}

/// A parsed integer expression.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(i64),
    Var(String),
    Neg(Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
}

/// Remove `//` comments outside string literals.
fn strip_line_comments(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut chars = code.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            '/' if !in_string && chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Parse a complete fragment.
fn program(input: &mut &str) -> WResult<Vec<Stmt>> {
    let stmts = repeat(0.., statement).parse_next(input)?;

    // Ensure we consumed all input
    multispace0.parse_next(input)?;
    if !input.is_empty() {
        return Err(ContextError::new());
    }

    Ok(stmts)
}

fn statement(input: &mut &str) -> WResult<Stmt> {
    let _ = multispace0.parse_next(input)?;
    let stmt = alt((output_stmt, decl_stmt, assign_stmt, expr_stmt)).parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let _ = ';'.parse_next(input)?;
    Ok(stmt)
}

fn output_stmt(input: &mut &str) -> WResult<Stmt> {
    let _ = "std::cout".parse_next(input)?;
    let items: Vec<PrintItem> = repeat(1.., print_item).parse_next(input)?;
    Ok(Stmt::Print(items))
}

fn print_item(input: &mut &str) -> WResult<PrintItem> {
    let _ = (multispace0, "<<", multispace0).parse_next(input)?;
    alt((
        "std::endl".map(|_: &str| PrintItem::Endl),
        string_literal.map(PrintItem::Text),
        expr.map(PrintItem::Value),
    ))
    .parse_next(input)
}

fn decl_stmt(input: &mut &str) -> WResult<Stmt> {
    let _ = alt(("long long", "int64_t", "int", "long", "auto")).parse_next(input)?;
    let _ = multispace1.parse_next(input)?;
    let name = identifier.parse_next(input)?;
    let value = opt(preceded((multispace0, '=', multispace0), expr)).parse_next(input)?;
    Ok(Stmt::Decl {
        name: name.to_string(),
        value,
    })
}

fn assign_stmt(input: &mut &str) -> WResult<Stmt> {
    let name = identifier.parse_next(input)?;
    let _ = (multispace0, '=', multispace0).parse_next(input)?;
    let value = expr.parse_next(input)?;
    Ok(Stmt::Assign {
        name: name.to_string(),
        value,
    })
}

fn expr_stmt(input: &mut &str) -> WResult<Stmt> {
    expr.map(Stmt::Expr).parse_next(input)
}

fn expr(input: &mut &str) -> WResult<Expr> {
    let mut acc = term(input)?;
    loop {
        let _ = multispace0.parse_next(input)?;
        let op: Option<char> = opt(alt(('+', '-'))).parse_next(input)?;
        let Some(op) = op else { break };
        let rhs = term(input)?;
        acc = Expr::Binary(op, Box::new(acc), Box::new(rhs));
    }
    Ok(acc)
}

fn term(input: &mut &str) -> WResult<Expr> {
    let mut acc = factor(input)?;
    loop {
        let _ = multispace0.parse_next(input)?;
        let op: Option<char> = opt(alt(('*', '/', '%'))).parse_next(input)?;
        let Some(op) = op else { break };
        let rhs = factor(input)?;
        acc = Expr::Binary(op, Box::new(acc), Box::new(rhs));
    }
    Ok(acc)
}

fn factor(input: &mut &str) -> WResult<Expr> {
    let _ = multispace0.parse_next(input)?;
    alt((
        delimited('(', expr, (multispace0, ')')),
        number,
        negation,
        variable,
    ))
    .parse_next(input)
}

fn number(input: &mut &str) -> WResult<Expr> {
    digit1.parse_to::<i64>().map(Expr::Literal).parse_next(input)
}

fn negation(input: &mut &str) -> WResult<Expr> {
    preceded('-', factor)
        .map(|inner| Expr::Neg(Box::new(inner)))
        .parse_next(input)
}

fn variable(input: &mut &str) -> WResult<Expr> {
    identifier
        .map(|name: &str| Expr::Var(name.to_string()))
        .parse_next(input)
}

/// Parse an identifier (variable or declaration name).
fn identifier<'a>(input: &mut &'a str) -> WResult<&'a str> {
    (
        alt((alpha1::<_, ContextError>, "_")),
        take_while(0.., |c: char| c.is_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

fn string_literal(input: &mut &str) -> WResult<String> {
    let raw: &str = delimited('"', take_till(0.., '"'), '"').parse_next(input)?;
    Ok(unescape(raw))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
