//! Row filter and assertion expressions.
//!
//! Custom selections over in-memory chunks and expression assertions share one
//! small language:
//!
//! ```text
//! amount >= 10 and (region in ['eu', 'us'] or not flagged)
//! `address.city` != null
//! value > 0 && value <= 100
//! ```
//!
//! Identifiers resolve against the current row; backticks allow dotted or
//! otherwise unusual column names. `True`, `False` and `None` are accepted as
//! aliases for `true`, `false` and `null`.

use crate::{ProbeError, Result};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    In,
    True,
    False,
    Null,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn apply(self, left: &Value, right: &Value) -> bool {
        match self {
            CompareOp::Eq => values_equal(left, right),
            CompareOp::Ne => !values_equal(left, right),
            CompareOp::Lt => compare_values(left, right) == Some(Ordering::Less),
            CompareOp::Le => matches!(
                compare_values(left, right),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CompareOp::Gt => compare_values(left, right) == Some(Ordering::Greater),
            CompareOp::Ge => matches!(
                compare_values(left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Column(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let root = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(ProbeError::expression(
                source,
                format!("unexpected trailing token {:?}", token),
            ));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Column names referenced by the expression, in first-use order.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_columns(&self.root, &mut out);
        out
    }

    /// Evaluates against a row, resolving identifiers through `resolve`.
    pub fn evaluate<F>(&self, resolve: &F) -> Result<Value>
    where
        F: Fn(&str) -> Option<Value>,
    {
        self.eval(&self.root, resolve)
    }

    /// Evaluates as a predicate. Null counts as false.
    pub fn matches<F>(&self, resolve: &F) -> Result<bool>
    where
        F: Fn(&str) -> Option<Value>,
    {
        match self.evaluate(resolve)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(ProbeError::expression(
                &self.source,
                format!("expected a boolean result, got {}", other),
            )),
        }
    }

    fn eval<F>(&self, expr: &Expr, resolve: &F) -> Result<Value>
    where
        F: Fn(&str) -> Option<Value>,
    {
        Ok(match expr {
            Expr::Literal(v) => v.clone(),
            Expr::Column(name) => resolve(name.as_str()).ok_or_else(|| {
                ProbeError::expression(&self.source, format!("unknown column '{}'", name))
            })?,
            Expr::Not(inner) => Value::Bool(!truthy(&self.eval(inner, resolve)?)),
            Expr::And(l, r) => {
                Value::Bool(truthy(&self.eval(l, resolve)?) && truthy(&self.eval(r, resolve)?))
            }
            Expr::Or(l, r) => {
                Value::Bool(truthy(&self.eval(l, resolve)?) || truthy(&self.eval(r, resolve)?))
            }
            Expr::Compare { op, left, right } => {
                let left = self.eval(left, resolve)?;
                let right = self.eval(right, resolve)?;
                Value::Bool(op.apply(&left, &right))
            }
            Expr::In {
                expr,
                list,
                negated,
            } => {
                let needle = self.eval(expr, resolve)?;
                let mut found = false;
                for item in list {
                    if values_equal(&needle, &self.eval(item, resolve)?) {
                        found = true;
                        break;
                    }
                }
                Value::Bool(found != *negated)
            }
        })
    }
}

impl std::str::FromStr for Expression {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        Expression::parse(s)
    }
}

fn collect_columns<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Column(name) => {
            if !out.contains(&name.as_str()) {
                out.push(name);
            }
        }
        Expr::Not(inner) => collect_columns(inner, out),
        Expr::And(l, r) | Expr::Or(l, r) => {
            collect_columns(l, out);
            collect_columns(r, out);
        }
        Expr::Compare { left, right, .. } => {
            collect_columns(left, out);
            collect_columns(right, out);
        }
        Expr::In { expr, list, .. } => {
            collect_columns(expr, out);
            for item in list {
                collect_columns(item, out);
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Equality with numeric coercion: `1 == 1.0`.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Ordering between comparable values. Nulls and mixed types do not order.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |message: String| ProbeError::expression(source, message);

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CompareOp::Eq), 2),
                    ('=', _) => (Token::Op(CompareOp::Eq), 1),
                    ('!', Some('=')) => (Token::Op(CompareOp::Ne), 2),
                    ('!', _) => (Token::Not, 1),
                    ('<', Some('=')) => (Token::Op(CompareOp::Le), 2),
                    ('<', Some('>')) => (Token::Op(CompareOp::Ne), 2),
                    ('<', _) => (Token::Op(CompareOp::Lt), 1),
                    ('>', Some('=')) => (Token::Op(CompareOp::Ge), 2),
                    _ => (Token::Op(CompareOp::Gt), 1),
                };
                tokens.push(token);
                i += width;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(err(format!("expected '{}{}' at offset {}", c, c, i)));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string literal".to_string())),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '`' => {
                let start = i + 1;
                let Some(len) = chars[start..].iter().position(|&ch| ch == '`') else {
                    return Err(err("unterminated quoted identifier".to_string()));
                };
                tokens.push(Token::Ident(chars[start..start + len].iter().collect()));
                i = start + len + 1;
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == '_'
                        || ((chars[i] == 'e' || chars[i] == 'E')
                            && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+'))
                        || ((chars[i] == '-' || chars[i] == '+')
                            && i > start
                            && (chars[i - 1] == 'e' || chars[i - 1] == 'E')))
                {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().filter(|&&ch| ch != '_').collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| err(format!("invalid number '{}'", literal)))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" | "AND" => Token::And,
                    "or" | "OR" => Token::Or,
                    "not" | "NOT" => Token::Not,
                    "in" | "IN" => Token::In,
                    "true" | "True" | "TRUE" => Token::True,
                    "false" | "False" | "FALSE" => Token::False,
                    "null" | "None" | "NULL" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(err(format!("unexpected character '{}' at offset {}", other, i))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ProbeError {
        ProbeError::expression(self.source, message)
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(self.error(format!("expected {:?}, found {:?}", expected, token))),
            None => Err(self.error(format!("expected {:?}, found end of input", expected))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.pos += 1;
                let right = self.parse_primary()?;
                Ok(Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            Some(Token::In) => {
                self.pos += 1;
                self.parse_in(left, false)
            }
            Some(Token::Not) if self.tokens.get(self.pos + 1) == Some(&Token::In) => {
                self.pos += 2;
                self.parse_in(left, true)
            }
            _ => Ok(left),
        }
    }

    fn parse_in(&mut self, expr: Expr, negated: bool) -> Result<Expr> {
        self.expect(&Token::LBracket)?;
        let mut list = Vec::new();
        if self.peek() == Some(&Token::RBracket) {
            self.pos += 1;
        } else {
            loop {
                list.push(self.parse_primary()?);
                match self.next() {
                    Some(Token::Comma) => {}
                    Some(Token::RBracket) => break,
                    other => {
                        return Err(self.error(format!("expected ',' or ']', found {:?}", other)));
                    }
                }
            }
        }
        Ok(Expr::In {
            expr: Box::new(expr),
            list,
            negated,
        })
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Minus) => match self.next() {
                Some(Token::Number(n)) => Ok(Expr::Literal(number_value(-n))),
                other => Err(self.error(format!("expected number after '-', found {:?}", other))),
            },
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Column(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// Integral literals stay integers so they compare and print naturally.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}
