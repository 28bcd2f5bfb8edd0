//! Message selectors
//!
//! The engine only needs `selects(message)`; [`DefaultSelectorFactory`]
//! provides a small filter language so that consumers can be created with a
//! selector string:
//!
//! ```text
//! color = 'red' AND (JMSPriority > 4 OR urgent = TRUE)
//! region IS NOT NULL AND NOT weight >= 10.5
//! ```
//!
//! Identifiers name message properties, or one of the header fields
//! `JMSPriority`, `JMSTimestamp`, `JMSMessageID`, `JMSDeliveryMode`.
//! A comparison whose identifier is missing evaluates to false.

use std::cmp::Ordering;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;

use crate::types::{Message, PropertyValue};
use crate::{BrokerError, Result};

pub trait Selector: Sync + Send + fmt::Debug {
    fn selects(&self, message: &Message) -> bool;

    fn expression(&self) -> &str;
}

pub trait SelectorFactory: Sync + Send {
    fn create(&self, expression: &str) -> Result<Arc<dyn Selector>>;
}

/// Blank expressions mean "no selector".
#[inline]
pub fn parse_selector(factory: &dyn SelectorFactory, expression: Option<&str>) -> Result<Option<Arc<dyn Selector>>> {
    match expression.map(str::trim) {
        None | Some("") => Ok(None),
        Some(expr) => factory.create(expr).map(Some),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSelectorFactory;

impl SelectorFactory for DefaultSelectorFactory {
    fn create(&self, expression: &str) -> Result<Arc<dyn Selector>> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser { tokens, pos: 0, depth: 0 };
        let expr = parser.parse_or()?;
        if let Some(t) = parser.peek() {
            return Err(BrokerError::InvalidSelector(format!("unexpected `{}` in `{}`", t, expression)));
        }
        Ok(Arc::new(DefaultSelector { expression: expression.to_string(), expr }))
    }
}

#[derive(Debug)]
pub struct DefaultSelector {
    expression: String,
    expr: Expr,
}

impl Selector for DefaultSelector {
    #[inline]
    fn selects(&self, message: &Message) -> bool {
        self.expr.eval(message)
    }

    #[inline]
    fn expression(&self) -> &str {
        &self.expression
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    fn from_property(p: &PropertyValue) -> Value {
        match p {
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(i) => Value::Int(*i),
            PropertyValue::Float(f) => Value::Float(*f),
            PropertyValue::String(s) => Value::Str(s.to_string()),
        }
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn holds(&self, ord: Ordering) -> bool {
        match self {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(String, Op, Value),
    IsNull(String, bool),
}

impl Expr {
    fn eval(&self, m: &Message) -> bool {
        match self {
            Expr::And(a, b) => a.eval(m) && b.eval(m),
            Expr::Or(a, b) => a.eval(m) || b.eval(m),
            Expr::Not(e) => !e.eval(m),
            Expr::Compare(ident, op, lit) => match lookup(m, ident) {
                Some(v) => v.compare(lit).map(|ord| op.holds(ord)).unwrap_or(false),
                None => false,
            },
            Expr::IsNull(ident, negated) => lookup(m, ident).is_none() != *negated,
        }
    }
}

fn lookup(m: &Message, ident: &str) -> Option<Value> {
    match ident {
        "JMSPriority" => Some(Value::Int(m.priority as i64)),
        "JMSTimestamp" => Some(Value::Int(m.timestamp)),
        "JMSMessageID" => Some(Value::Str(m.id.to_string())),
        "JMSDeliveryMode" => {
            Some(Value::Str(if m.persistent { "PERSISTENT" } else { "NON_PERSISTENT" }.to_string()))
        }
        _ => m.property(ident).map(Value::from_property),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Lit(Value),
    Op(Op),
    LParen,
    RParen,
    And,
    Or,
    Not,
    Is,
    Null,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => f.write_str(s),
            Token::Lit(v) => write!(f, "{:?}", v),
            Token::Op(op) => write!(f, "{:?}", op),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::And => f.write_str("AND"),
            Token::Or => f.write_str("OR"),
            Token::Not => f.write_str("NOT"),
            Token::Is => f.write_str("IS"),
            Token::Null => f.write_str("NULL"),
        }
    }
}

fn tokenize(s: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Op(Op::Eq));
            }
            '<' => {
                chars.next();
                let op = match chars.peek() {
                    Some('>') => Op::Ne,
                    Some('=') => Op::Le,
                    _ => Op::Lt,
                };
                if op != Op::Lt {
                    chars.next();
                }
                tokens.push(Token::Op(op));
            }
            '>' => {
                chars.next();
                let op = if chars.peek() == Some(&'=') {
                    chars.next();
                    Op::Ge
                } else {
                    Op::Gt
                };
                tokens.push(Token::Op(op));
            }
            '\'' => {
                chars.next();
                tokens.push(Token::Lit(Value::Str(string_literal(&mut chars, s)?)));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                tokens.push(Token::Lit(number_literal(&mut chars, s)?));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "TRUE" => Token::Lit(Value::Bool(true)),
                    "FALSE" => Token::Lit(Value::Bool(false)),
                    _ => Token::Ident(ident),
                });
            }
            c => return Err(BrokerError::InvalidSelector(format!("unexpected character `{}` in `{}`", c, s))),
        }
    }
    Ok(tokens)
}

fn string_literal(chars: &mut Peekable<Chars<'_>>, s: &str) -> Result<String> {
    let mut lit = String::new();
    loop {
        match chars.next() {
            Some('\'') => {
                // '' escapes a quote
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    lit.push('\'');
                } else {
                    return Ok(lit);
                }
            }
            Some(c) => lit.push(c),
            None => return Err(BrokerError::InvalidSelector(format!("unterminated string in `{}`", s))),
        }
    }
}

fn number_literal(chars: &mut Peekable<Chars<'_>>, s: &str) -> Result<Value> {
    let mut num = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '.' || c == '-' || c == 'e' || c == 'E' {
            num.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if let Ok(i) = num.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    num.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| BrokerError::InvalidSelector(format!("invalid number `{}` in `{}`", num, s)))
}

/// Deepest nesting of parentheses and `NOT` a selector may use.
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    #[inline]
    fn nested<F>(&mut self, f: F) -> Result<Expr>
    where
        F: FnOnce(&mut Self) -> Result<Expr>,
    {
        if self.depth >= MAX_DEPTH {
            return Err(BrokerError::InvalidSelector(format!("nesting deeper than {}", MAX_DEPTH)));
        }
        self.depth += 1;
        let res = f(self);
        self.depth -= 1;
        res
    }

    #[inline]
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    #[inline]
    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    #[inline]
    fn eat(&mut self, t: &Token) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            lhs = Expr::Or(Box::new(lhs), Box::new(self.parse_and()?));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.eat(&Token::And) {
            lhs = Expr::And(Box::new(lhs), Box::new(self.parse_not()?));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            Ok(Expr::Not(Box::new(self.nested(|p| p.parse_not())?)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let e = self.nested(|p| p.parse_or())?;
                if self.eat(&Token::RParen) {
                    Ok(e)
                } else {
                    Err(BrokerError::InvalidSelector("missing `)`".into()))
                }
            }
            Some(Token::Ident(ident)) => match self.next() {
                Some(Token::Op(op)) => match self.next() {
                    Some(Token::Lit(v)) => Ok(Expr::Compare(ident, op, v)),
                    other => Err(BrokerError::InvalidSelector(format!(
                        "expected literal after `{} {:?}`, found {:?}",
                        ident, op, other
                    ))),
                },
                Some(Token::Is) => {
                    let negated = self.eat(&Token::Not);
                    if self.eat(&Token::Null) {
                        Ok(Expr::IsNull(ident, negated))
                    } else {
                        Err(BrokerError::InvalidSelector(format!("expected NULL after `{} IS`", ident)))
                    }
                }
                other => Err(BrokerError::InvalidSelector(format!(
                    "expected comparison after `{}`, found {:?}",
                    ident, other
                ))),
            },
            other => Err(BrokerError::InvalidSelector(format!("unexpected {:?}", other))),
        }
    }
}
