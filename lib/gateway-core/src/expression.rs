//! Sandboxed expression and template language
//!
//! Expressions read request data through a [`Scope`] and can only do field
//! access, literal construction, comparisons, boolean logic and `+`
//! (numeric addition or string concatenation). There are no calls and no
//! assignment, so evaluating configuration-supplied text can never run code.
//!
//! ```text
//! req.headers.x-api-key != null && req.method == 'POST'
//! 'user-' + req.params.id
//! ```
//!
//! Templates interpolate expressions inside literal text: `"${req.ip}:${req.path}"`.

use crate::error::EvalError;
use serde_json::{Number, Value};
use std::fmt;

/// Source of root identifiers for expression evaluation
pub trait Scope {
    /// Resolve `root`, or `root.member` when a leading member is known.
    ///
    /// Implementations may use `member` to avoid materializing the whole
    /// root object. Unknown roots must fail with
    /// [`EvalError::UnknownIdentifier`].
    fn lookup(&self, root: &str, member: Option<&str>) -> Result<Value, EvalError>;
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Not,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Plus,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Name(String),
    Index(usize),
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(Value),
    Path { root: String, segments: Vec<Segment> },
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// A parsed expression, reusable across requests
#[derive(Clone, Debug, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let ast = parser.parse_or()?;
        if let Some((position, token)) = parser.tokens.get(parser.pos) {
            return Err(EvalError::Syntax {
                position: *position,
                message: format!("unexpected token {:?}", token),
            });
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Value, EvalError> {
        eval(&self.ast, scope)
    }

    /// Evaluate and coerce the result with JavaScript truthiness
    pub fn evaluate_bool(&self, scope: &dyn Scope) -> Result<bool, EvalError> {
        self.evaluate(scope).map(|v| truthy(&v))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum TemplatePart {
    Text(String),
    Expr(Expression),
}

/// A string with `${expression}` interpolations
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    source: String,
    parts: Vec<TemplatePart>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let bytes = source.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
                let start = i + 2;
                let end = find_closing_brace(source, start)?;
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                let inner = &source[start..end];
                let expr = Expression::parse(inner).map_err(|e| e.offset(start))?;
                parts.push(TemplatePart::Expr(expr));
                i = end + 1;
            } else {
                let ch = source[i..].chars().next().unwrap_or_default();
                text.push(ch);
                i += ch.len_utf8().max(1);
            }
        }
        if !text.is_empty() {
            parts.push(TemplatePart::Text(text));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template has no interpolations
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, TemplatePart::Text(_)))
    }

    pub fn render(&self, scope: &dyn Scope) -> Result<String, EvalError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Text(text) => out.push_str(text),
                TemplatePart::Expr(expr) => out.push_str(&render(&expr.evaluate(scope)?)),
            }
        }
        Ok(out)
    }
}

fn find_closing_brace(source: &str, start: usize) -> Result<usize, EvalError> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (offset, ch) in source[start..].char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                '}' => return Ok(start + offset),
                _ => {}
            },
        }
    }
    Err(EvalError::Syntax {
        position: start,
        message: "unterminated ${ interpolation".to_string(),
    })
}

/// JavaScript-style truthiness
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value for interpolation; `null` renders as an empty string
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let syntax = |position: usize, message: &str| EvalError::Syntax {
        position,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (pos, ch) = chars[i];
        let peek = chars.get(i + 1).map(|(_, c)| *c);

        match ch {
            c if c.is_whitespace() => {
                i += 1;
            }
            '.' => {
                tokens.push((pos, Token::Dot));
                i += 1;
            }
            '[' => {
                tokens.push((pos, Token::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push((pos, Token::RBracket));
                i += 1;
            }
            '(' => {
                tokens.push((pos, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((pos, Token::RParen));
                i += 1;
            }
            '+' => {
                tokens.push((pos, Token::Plus));
                i += 1;
            }
            '!' => {
                if peek == Some('=') {
                    // `!==` is accepted as an alias
                    let len = if chars.get(i + 2).map(|(_, c)| *c) == Some('=') { 3 } else { 2 };
                    tokens.push((pos, Token::NotEq));
                    i += len;
                } else {
                    tokens.push((pos, Token::Not));
                    i += 1;
                }
            }
            '=' => {
                if peek != Some('=') {
                    return Err(syntax(pos, "assignment is not allowed"));
                }
                let len = if chars.get(i + 2).map(|(_, c)| *c) == Some('=') { 3 } else { 2 };
                tokens.push((pos, Token::Eq));
                i += len;
            }
            '<' | '>' => {
                let token = match (ch, peek == Some('=')) {
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    (_, true) => Token::Ge,
                    (_, false) => Token::Gt,
                };
                tokens.push((pos, token));
                i += if peek == Some('=') { 2 } else { 1 };
            }
            '&' | '|' => {
                if peek != Some(ch) {
                    return Err(syntax(pos, "bitwise operators are not supported"));
                }
                tokens.push((pos, if ch == '&' { Token::And } else { Token::Or }));
                i += 2;
            }
            '\'' | '"' => {
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let c = chars[j].1;
                    if c == '\\' {
                        if let Some((_, escaped)) = chars.get(j + 1) {
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            j += 2;
                            continue;
                        }
                    }
                    if c == ch {
                        closed = true;
                        break;
                    }
                    value.push(c);
                    j += 1;
                }
                if !closed {
                    return Err(syntax(pos, "unterminated string literal"));
                }
                tokens.push((pos, Token::Str(value)));
                i = j + 1;
            }
            c if c.is_ascii_digit() => {
                let mut j = i;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(source.len());
                let text = &source[pos..end];
                let value: f64 = text
                    .parse()
                    .map_err(|_| syntax(pos, "invalid number literal"))?;
                tokens.push((pos, Token::Num(value)));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let mut j = i;
                while j < chars.len() {
                    let c = chars[j].1;
                    // `-` is allowed so header names read naturally
                    if c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(source.len());
                tokens.push((pos, Token::Ident(source[pos..end].to_string())));
                i = j;
            }
            other => {
                return Err(syntax(pos, &format!("unexpected character {:?}", other)));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            position: self.position(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvalError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", expected)))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_equality()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_equality()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_comparison()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::Plus) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = binary(BinaryOp::Add, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                _ => self.parse_path(name),
            },
            Some(token) => {
                self.pos -= 1;
                Err(self.error(format!("unexpected token {:?}", token)))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, EvalError> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => segments.push(Segment::Name(name)),
                        _ => {
                            self.pos -= 1;
                            return Err(self.error("expected property name after '.'"));
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let segment = match self.next() {
                        Some(Token::Str(key)) => Segment::Name(key),
                        Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            Segment::Index(n as usize)
                        }
                        _ => {
                            self.pos -= 1;
                            return Err(self.error("bracket access takes a string or index literal"));
                        }
                    };
                    self.expect(Token::RBracket)?;
                    segments.push(segment);
                }
                _ => return Ok(Expr::Path { root, segments }),
            }
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn eval(expr: &Expr, scope: &dyn Scope) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path { root, segments } => eval_path(root, segments, scope),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope)?))),
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::Or => {
                let l = eval(lhs, scope)?;
                if truthy(&l) {
                    Ok(l)
                } else {
                    eval(rhs, scope)
                }
            }
            BinaryOp::And => {
                let l = eval(lhs, scope)?;
                if truthy(&l) {
                    eval(rhs, scope)
                } else {
                    Ok(l)
                }
            }
            BinaryOp::Eq => Ok(Value::Bool(loose_eq(&eval(lhs, scope)?, &eval(rhs, scope)?))),
            BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(&eval(lhs, scope)?, &eval(rhs, scope)?))),
            BinaryOp::Add => add(&eval(lhs, scope)?, &eval(rhs, scope)?),
            ordering => compare(*ordering, &eval(lhs, scope)?, &eval(rhs, scope)?),
        },
    }
}

fn eval_path(root: &str, segments: &[Segment], scope: &dyn Scope) -> Result<Value, EvalError> {
    let (mut value, rest) = match segments.first() {
        Some(Segment::Name(first)) => (scope.lookup(root, Some(first))?, &segments[1..]),
        _ => (scope.lookup(root, None)?, segments),
    };

    let mut trail = match segments.first() {
        Some(Segment::Name(first)) if rest.len() < segments.len() => format!("{}.{}", root, first),
        _ => root.to_string(),
    };

    for segment in rest {
        value = member(&value, segment, &trail)?;
        match segment {
            Segment::Name(name) => {
                trail.push('.');
                trail.push_str(name);
            }
            Segment::Index(index) => trail.push_str(&format!("[{}]", index)),
        }
    }
    Ok(value)
}

fn member(value: &Value, segment: &Segment, trail: &str) -> Result<Value, EvalError> {
    let property = match segment {
        Segment::Name(name) => name.clone(),
        Segment::Index(index) => index.to_string(),
    };

    match value {
        Value::Null => Err(EvalError::UndefinedProperty {
            property,
            target: trail.to_string(),
        }),
        Value::Object(map) => Ok(map.get(&property).cloned().unwrap_or(Value::Null)),
        Value::Array(items) => match segment {
            Segment::Index(index) => Ok(items.get(*index).cloned().unwrap_or(Value::Null)),
            Segment::Name(name) if name == "length" => Ok(Value::from(items.len())),
            Segment::Name(name) => Ok(name
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Value::Null)),
        },
        Value::String(s) if property == "length" => Ok(Value::from(s.chars().count())),
        _ => Ok(Value::Null),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((as_number(lhs), as_number(rhs)), (Some(l), Some(r)) if l == r)
        }
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => lhs == rhs,
    }
}

fn add(lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::Number(l), Value::Number(r)) => {
            Ok(number(l.as_f64().unwrap_or_default() + r.as_f64().unwrap_or_default()))
        }
        (Value::String(_), _) | (_, Value::String(_)) => {
            Ok(Value::String(format!("{}{}", render(lhs), render(rhs))))
        }
        _ => Err(EvalError::InvalidOperands {
            op: "+",
            lhs: type_name(lhs),
            rhs: type_name(rhs),
        }),
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let ordering = match (lhs, rhs) {
        (Value::String(l), Value::String(r)) => l.partial_cmp(r),
        _ => match (as_number(lhs), as_number(rhs)) {
            (Some(l), Some(r)) if !matches!(lhs, Value::Null) && !matches!(rhs, Value::Null) => {
                l.partial_cmp(&r)
            }
            _ => None,
        },
    };

    let ordering = ordering.ok_or(EvalError::InvalidOperands {
        op: op.symbol(),
        lhs: type_name(lhs),
        rhs: type_name(rhs),
    })?;

    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(Value::Bool(result))
}
