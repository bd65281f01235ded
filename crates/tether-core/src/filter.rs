//! Restricted predicate language for client-supplied filters.
//!
//! Clients send filters as source text; the server compiles them into a
//! [`Predicate`] that can only read fields of the record it is given. There are
//! no calls, assignments or loops, so a predicate always terminates and cannot
//! touch server state.
//!
//! ```text
//! doc => doc.score >= 0.5 && (doc.lang == "en" || !doc.draft)
//! meta.tags[0] =~ '^rust'
//! ```
//!
//! An optional leading binder (`doc =>` or `(doc) =>`) names the record; paths
//! starting with it resolve from the record root. Without a binder every path
//! is a field of the record.

use crate::config::ProtocolConfig;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// A compile error with the byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("at byte {offset}: {message}")]
pub struct FilterError {
    pub offset: usize,
    pub message: String,
}

impl FilterError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

type ParseResult<T> = std::result::Result<T, FilterError>;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// Compiled predicate expression.
#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Matches {
        operand: Box<Expr>,
        pattern: Regex,
    },
}

/// A compiled, side-effect-free filter over JSON records.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    /// Compile predicate source text.
    pub fn compile(source: &str) -> ParseResult<Self> {
        if source.len() > ProtocolConfig::MAX_PREDICATE_SOURCE_LEN {
            return Err(FilterError::new(
                ProtocolConfig::MAX_PREDICATE_SOURCE_LEN,
                format!(
                    "source is {} bytes, limit is {}",
                    source.len(),
                    ProtocolConfig::MAX_PREDICATE_SOURCE_LEN
                ),
            ));
        }

        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser::new(tokens);
        let binder = parser.binder();
        let expr = parser.expression(0)?;
        parser.expect_end()?;

        Ok(Self {
            source: source.to_string(),
            expr: strip_binder(expr, binder.as_deref()),
        })
    }

    /// Original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a record.
    pub fn matches(&self, record: &Value) -> bool {
        truthy(&eval(&self.expr, record))
    }

    /// Keep the records this predicate accepts.
    pub fn filter<'a, I>(&self, records: I) -> Vec<Value>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect()
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    AndAnd,
    OrOr,
    Bang,
    Minus,
    Cmp(CmpOp),
    Match,
    Arrow,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn tokenize(mut self) -> ParseResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let offset = self.pos;
            let Some(&c) = self.bytes.get(self.pos) else {
                tokens.push(Token {
                    tok: Tok::Eof,
                    offset,
                });
                return Ok(tokens);
            };

            let tok = match c {
                b'(' => self.single(Tok::LParen),
                b')' => self.single(Tok::RParen),
                b'[' => self.single(Tok::LBracket),
                b']' => self.single(Tok::RBracket),
                b'.' if !self.peek_is_digit(1) => self.single(Tok::Dot),
                b'-' => self.single(Tok::Minus),
                b'&' => self.pair(b'&', Tok::AndAnd)?,
                b'|' => self.pair(b'|', Tok::OrOr)?,
                b'!' => {
                    if self.rest().starts_with("!==") {
                        self.pos += 3;
                        Tok::Cmp(CmpOp::Ne)
                    } else if self.rest().starts_with("!=") {
                        self.pos += 2;
                        Tok::Cmp(CmpOp::Ne)
                    } else {
                        self.single(Tok::Bang)
                    }
                }
                b'=' => {
                    if self.rest().starts_with("===") {
                        self.pos += 3;
                        Tok::Cmp(CmpOp::Eq)
                    } else if self.rest().starts_with("==") {
                        self.pos += 2;
                        Tok::Cmp(CmpOp::Eq)
                    } else if self.rest().starts_with("=~") {
                        self.pos += 2;
                        Tok::Match
                    } else if self.rest().starts_with("=>") {
                        self.pos += 2;
                        Tok::Arrow
                    } else {
                        return Err(FilterError::new(offset, "assignment is not allowed"));
                    }
                }
                b'<' | b'>' => {
                    let strict = c == b'<';
                    self.pos += 1;
                    let or_equal = self.bytes.get(self.pos) == Some(&b'=');
                    if or_equal {
                        self.pos += 1;
                    }
                    Tok::Cmp(match (strict, or_equal) {
                        (true, false) => CmpOp::Lt,
                        (true, true) => CmpOp::Le,
                        (false, false) => CmpOp::Gt,
                        (false, true) => CmpOp::Ge,
                    })
                }
                b'"' | b'\'' => self.string(c)?,
                b'0'..=b'9' | b'.' => self.number()?,
                c if c == b'_' || c == b'$' || c.is_ascii_alphabetic() => self.ident(),
                _ => {
                    let ch = self.src[offset..].chars().next().unwrap_or('?');
                    return Err(FilterError::new(offset, format!("unexpected character '{}'", ch)));
                }
            };
            tokens.push(Token { tok, offset });
        }
    }

    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn peek_is_digit(&self, ahead: usize) -> bool {
        self.bytes
            .get(self.pos + ahead)
            .is_some_and(|b| b.is_ascii_digit())
    }

    fn skip_whitespace(&mut self) {
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn single(&mut self, tok: Tok) -> Tok {
        self.pos += 1;
        tok
    }

    fn pair(&mut self, second: u8, tok: Tok) -> ParseResult<Tok> {
        if self.bytes.get(self.pos + 1) == Some(&second) {
            self.pos += 2;
            Ok(tok)
        } else {
            Err(FilterError::new(
                self.pos,
                "bitwise operators are not supported, use && or ||",
            ))
        }
    }

    fn string(&mut self, quote: u8) -> ParseResult<Tok> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.rest().chars().next() else {
                return Err(FilterError::new(start, "unterminated string literal"));
            };
            self.pos += c.len_utf8();
            match c {
                '\\' => {
                    let Some(escaped) = self.rest().chars().next() else {
                        return Err(FilterError::new(start, "unterminated string literal"));
                    };
                    self.pos += escaped.len_utf8();
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                }
                c if c as u32 == quote as u32 => return Ok(Tok::Str(out)),
                c => out.push(c),
            }
        }
    }

    fn number(&mut self) -> ParseResult<Tok> {
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit() || *b == b'.')
        {
            self.pos += 1;
        }
        if matches!(self.bytes.get(self.pos), Some(b'e') | Some(b'E')) {
            self.pos += 1;
            if matches!(self.bytes.get(self.pos), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            while self.bytes.get(self.pos).is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = &self.src[start..self.pos];
        text.parse::<f64>()
            .map(Tok::Number)
            .map_err(|_| FilterError::new(start, format!("invalid number '{}'", text)))
    }

    fn ident(&mut self) -> Tok {
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| *b == b'_' || *b == b'$' || b.is_ascii_alphanumeric())
        {
            self.pos += 1;
        }
        match &self.src[start..self.pos] {
            "true" => Tok::True,
            "false" => Tok::False,
            "null" | "undefined" => Tok::Null,
            name => Tok::Ident(name.to_string()),
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].tok
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].offset
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consume `x =>` or `(x) =>` if present.
    fn binder(&mut self) -> Option<String> {
        let found = match (self.peek(), self.peek_at(1), self.peek_at(2), self.peek_at(3)) {
            (Tok::Ident(name), Tok::Arrow, _, _) => Some((name.clone(), 2)),
            (Tok::LParen, Tok::Ident(name), Tok::RParen, Tok::Arrow) => Some((name.clone(), 4)),
            _ => None,
        };
        let (name, consumed) = found?;
        self.pos += consumed;
        Some(name)
    }

    fn expect_end(&self) -> ParseResult<()> {
        match self.peek() {
            Tok::Eof => Ok(()),
            other => Err(FilterError::new(
                self.offset(),
                format!("unexpected trailing token {:?}", other),
            )),
        }
    }

    fn check_depth(&self, depth: usize) -> ParseResult<()> {
        if depth > ProtocolConfig::MAX_PREDICATE_DEPTH {
            return Err(FilterError::new(self.offset(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn expression(&mut self, depth: usize) -> ParseResult<Expr> {
        self.check_depth(depth)?;
        let mut left = self.conjunction(depth + 1)?;
        while self.eat(&Tok::OrOr) {
            let right = self.conjunction(depth + 1)?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn conjunction(&mut self, depth: usize) -> ParseResult<Expr> {
        let mut left = self.unary(depth)?;
        while self.eat(&Tok::AndAnd) {
            let right = self.unary(depth)?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self, depth: usize) -> ParseResult<Expr> {
        self.check_depth(depth)?;
        if self.eat(&Tok::Bang) {
            return Ok(Expr::Not(Box::new(self.unary(depth + 1)?)));
        }
        self.comparison(depth)
    }

    fn comparison(&mut self, depth: usize) -> ParseResult<Expr> {
        let left = self.operand(depth)?;
        match self.peek().clone() {
            Tok::Cmp(op) => {
                self.advance();
                let right = self.operand(depth)?;
                Ok(Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            Tok::Match => {
                self.advance();
                let offset = self.offset();
                let Tok::Str(pattern) = self.advance() else {
                    return Err(FilterError::new(offset, "=~ expects a string pattern"));
                };
                let pattern = Regex::new(&pattern)
                    .map_err(|e| FilterError::new(offset, format!("invalid pattern: {}", e)))?;
                Ok(Expr::Matches {
                    operand: Box::new(left),
                    pattern,
                })
            }
            _ => Ok(left),
        }
    }

    fn operand(&mut self, depth: usize) -> ParseResult<Expr> {
        let offset = self.offset();
        match self.advance() {
            Tok::Number(n) => Ok(Expr::Literal(number(n))),
            Tok::Minus => match self.advance() {
                Tok::Number(n) => Ok(Expr::Literal(number(-n))),
                _ => Err(FilterError::new(offset, "'-' must precede a number")),
            },
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::True => Ok(Expr::Literal(Value::Bool(true))),
            Tok::False => Ok(Expr::Literal(Value::Bool(false))),
            Tok::Null => Ok(Expr::Literal(Value::Null)),
            Tok::LParen => {
                let inner = self.expression(depth + 1)?;
                if !self.eat(&Tok::RParen) {
                    return Err(FilterError::new(self.offset(), "expected ')'"));
                }
                Ok(inner)
            }
            Tok::Ident(name) => self.path(name),
            Tok::Eof => Err(FilterError::new(offset, "unexpected end of predicate")),
            other => Err(FilterError::new(offset, format!("unexpected token {:?}", other))),
        }
    }

    fn path(&mut self, head: String) -> ParseResult<Expr> {
        let mut segments = vec![Segment::Field(head)];
        loop {
            if self.eat(&Tok::Dot) {
                let offset = self.offset();
                match self.advance() {
                    Tok::Ident(name) => segments.push(Segment::Field(name)),
                    _ => return Err(FilterError::new(offset, "expected field name after '.'")),
                }
            } else if self.eat(&Tok::LBracket) {
                let offset = self.offset();
                let segment = match self.advance() {
                    Tok::Str(name) => Segment::Field(name),
                    Tok::Number(n) if n >= 0.0 && n.fract() == 0.0 => Segment::Index(n as usize),
                    _ => {
                        return Err(FilterError::new(
                            offset,
                            "index must be a string or non-negative integer",
                        ))
                    }
                };
                if !self.eat(&Tok::RBracket) {
                    return Err(FilterError::new(self.offset(), "expected ']'"));
                }
                segments.push(segment);
            } else {
                return Ok(Expr::Path(segments));
            }
        }
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Rewrite `binder.x.y` paths to `x.y`.
fn strip_binder(expr: Expr, binder: Option<&str>) -> Expr {
    let Some(binder) = binder else {
        return expr;
    };
    let recurse = |e: Box<Expr>| Box::new(strip_binder(*e, Some(binder)));
    match expr {
        Expr::Path(mut segments) => {
            if matches!(segments.first(), Some(Segment::Field(name)) if name == binder) {
                segments.remove(0);
            }
            Expr::Path(segments)
        }
        Expr::Not(inner) => Expr::Not(recurse(inner)),
        Expr::And(l, r) => Expr::And(recurse(l), recurse(r)),
        Expr::Or(l, r) => Expr::Or(recurse(l), recurse(r)),
        Expr::Compare { op, left, right } => Expr::Compare {
            op,
            left: recurse(left),
            right: recurse(right),
        },
        Expr::Matches { operand, pattern } => Expr::Matches {
            operand: recurse(operand),
            pattern,
        },
        literal @ Expr::Literal(_) => literal,
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn eval(expr: &Expr, record: &Value) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(segments) => resolve(record, segments).cloned().unwrap_or(Value::Null),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, record))),
        Expr::And(l, r) => Value::Bool(truthy(&eval(l, record)) && truthy(&eval(r, record))),
        Expr::Or(l, r) => Value::Bool(truthy(&eval(l, record)) || truthy(&eval(r, record))),
        Expr::Compare { op, left, right } => {
            Value::Bool(compare(*op, &eval(left, record), &eval(right, record)))
        }
        Expr::Matches { operand, pattern } => Value::Bool(match eval(operand, record) {
            Value::String(s) => pattern.is_match(&s),
            _ => false,
        }),
    }
}

fn resolve<'v>(record: &'v Value, segments: &[Segment]) -> Option<&'v Value> {
    segments.iter().try_fold(record, |current, segment| match segment {
        Segment::Field(name) => current.get(name.as_str()),
        Segment::Index(i) => current.get(*i),
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (a, b) if a == b => Some(Ordering::Equal),
        _ => None,
    };

    match op {
        CmpOp::Eq => ordering == Some(Ordering::Equal),
        CmpOp::Ne => ordering != Some(Ordering::Equal),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}
