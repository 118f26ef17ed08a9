//! The `eval` expression language used inside experiment files.
//!
//! A small, closed language over YAML values: no host-language evaluator
//! is involved, so an expression can only read names the resolver puts in
//! scope and call the built-ins listed below.
//!
//! | Form | Example |
//! |------|---------|
//! | literals | `3`, `0.5`, `'adam'`, `True`, `None`, `[1, 2]` |
//! | names | `learning_rate`, `E` |
//! | indexing / attributes | `E[-1]`, `E[0]['lr']`, `E[-1].lr` |
//! | arithmetic | `+ - * / // % **`, unary `-` |
//! | comparison | `== != < <= > >=`, `in`, `not in` (chainable) |
//! | logic | `and`, `or`, `not`, `a if cond else b` |
//! | built-ins | `len min max abs int float str round` |
//!
//! Integer arithmetic stays integral except for `/`; `//` and `%` floor
//! toward negative infinity.

use std::cmp::Ordering;

use serde_yaml::{Mapping, Value};
use thiserror::Error;
use trune_common::spec::{describe, key_to_string};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("syntax error at column {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("name `{0}` is not defined")]
    UnknownName(String),

    #[error("`{0}` is defined later in the same experiment and is not resolved yet")]
    Unresolved(String),

    #[error("unsupported operand types for `{op}`: {left} and {right}")]
    Operands {
        op: &'static str,
        left: String,
        right: String,
    },

    #[error("{0}")]
    Type(String),

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("key `{0}` not found")]
    MissingKey(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: &'static str,
        found: usize,
    },
}

pub type Result<T> = std::result::Result<T, ExprError>;

/// Name lookup for evaluation.
pub trait Scope {
    fn lookup(&self, name: &str) -> Result<Value>;
}

/// No names at all; literal-only evaluation.
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn lookup(&self, name: &str) -> Result<Value> {
        Err(ExprError::UnknownName(name.to_string()))
    }
}

impl Scope for Mapping {
    fn lookup(&self, name: &str) -> Result<Value> {
        self.get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownName(name.to_string()))
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(src: &str, scope: &dyn Scope) -> Result<Value> {
    parse(src)?.eval(scope)
}

/// Evaluate `src` as a literal, or `None` if it is not one.
pub fn parse_literal(src: &str) -> Option<Value> {
    evaluate(src, &EmptyScope).ok()
}

// ── AST ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `a < b <= c` holds when every adjacent pair does.
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Index(Box<Expr>, Box<Expr>),
    Attr(Box<Expr>, String),
    Call(String, Vec<Expr>),
}

// ── Tokenizer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    End,
}

const PUNCT: [&str; 19] = [
    "**", "//", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "<", ">", "(", ")", "[", "]",
    ",", ".",
];

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() {
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let mut float = false;
            if i < chars.len()
                && chars[i] == '.'
                && !chars.get(i + 1).is_some_and(|n| n.is_alphabetic() || *n == '_')
            {
                float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    float = true;
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let token = if float {
                text.parse().map(Token::Float).ok()
            } else {
                text.parse().map(Token::Int).ok()
            };
            let token = token.ok_or_else(|| syntax(start, format!("invalid number `{text}`")))?;
            out.push((start, token));
        } else if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            out.push((start, Token::Ident(chars[start..i].iter().collect())));
        } else if c == '\'' || c == '"' {
            i += 1;
            let mut s = String::new();
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(syntax(start, "unterminated string".into()));
                };
                i += 1;
                if ch == c {
                    break;
                }
                if ch == '\\' {
                    let Some(&esc) = chars.get(i) else {
                        return Err(syntax(start, "unterminated string".into()));
                    };
                    i += 1;
                    s.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                } else {
                    s.push(ch);
                }
            }
            out.push((start, Token::Str(s)));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let Some(p) = PUNCT.iter().find(|p| rest.starts_with(**p)) else {
                return Err(syntax(start, format!("unexpected character `{c}`")));
            };
            i += p.chars().count();
            out.push((start, Token::Punct(*p)));
        }
    }
    out.push((chars.len(), Token::End));
    Ok(out)
}

fn syntax(pos: usize, message: String) -> ExprError {
    ExprError::Syntax { pos, message }
}

// ── Parser ──────────────────────────────────────────────────────────────────

pub fn parse(src: &str) -> Result<Expr> {
    let mut p = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    let expr = p.expr()?;
    match p.peek() {
        Token::End => Ok(expr),
        other => Err(syntax(p.offset(), format!("unexpected {other:?}"))),
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn bump(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn at_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Token::Punct(q) if *q == p)
    }

    fn at_keyword(&self, k: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s == k)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        let hit = self.at_punct(p);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn eat_keyword(&mut self, k: &str) -> bool {
        let hit = self.at_keyword(k);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect_punct(&mut self, p: &str) -> Result<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(syntax(self.offset(), format!("expected `{p}`, found {:?}", self.peek())))
        }
    }

    fn expect_keyword(&mut self, k: &str) -> Result<()> {
        if self.eat_keyword(k) {
            Ok(())
        } else {
            Err(syntax(self.offset(), format!("expected `{k}`, found {:?}", self.peek())))
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let then = self.or_expr()?;
        if !self.eat_keyword("if") {
            return Ok(then);
        }
        let cond = self.or_expr()?;
        self.expect_keyword("else")?;
        let otherwise = self.expr()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat_keyword("or") {
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and_expr()?));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.not_expr()?;
        while self.eat_keyword("and") {
            lhs = Expr::And(Box::new(lhs), Box::new(self.not_expr()?));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let first = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = if self.eat_punct("==") {
                CmpOp::Eq
            } else if self.eat_punct("!=") {
                CmpOp::Ne
            } else if self.eat_punct("<=") {
                CmpOp::Le
            } else if self.eat_punct(">=") {
                CmpOp::Ge
            } else if self.eat_punct("<") {
                CmpOp::Lt
            } else if self.eat_punct(">") {
                CmpOp::Gt
            } else if self.eat_keyword("in") {
                CmpOp::In
            } else if self.at_keyword("not") {
                self.pos += 1;
                self.expect_keyword("in")?;
                CmpOp::NotIn
            } else {
                break;
            };
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn arith(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat_punct("+") {
                BinOp::Add
            } else if self.eat_punct("-") {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat_punct("*") {
                BinOp::Mul
            } else if self.eat_punct("//") {
                BinOp::FloorDiv
            } else if self.eat_punct("/") {
                BinOp::Div
            } else if self.eat_punct("%") {
                BinOp::Mod
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat_punct("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat_punct("+") {
            return self.unary();
        }
        self.power()
    }

    /// `**` binds tighter than unary minus on its left and is right-associative.
    fn power(&mut self) -> Result<Expr> {
        let base = self.postfix()?;
        if self.eat_punct("**") {
            let exp = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut e = self.atom()?;
        loop {
            if self.eat_punct("[") {
                let idx = self.expr()?;
                self.expect_punct("]")?;
                e = Expr::Index(Box::new(e), Box::new(idx));
            } else if self.eat_punct(".") {
                match self.bump() {
                    Token::Ident(name) => e = Expr::Attr(Box::new(e), name),
                    other => {
                        return Err(syntax(self.offset(), format!("expected attribute name, found {other:?}")))
                    }
                }
            } else if self.at_punct("(") {
                let Expr::Name(name) = e else {
                    return Err(syntax(self.offset(), "only built-in functions can be called".into()));
                };
                self.pos += 1;
                let args = self.sequence(")")?;
                e = Expr::Call(name, args);
            } else {
                return Ok(e);
            }
        }
    }

    fn sequence(&mut self, close: &str) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.eat_punct(close) {
            items.push(self.expr()?);
            if !self.eat_punct(",") {
                self.expect_punct(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn atom(&mut self) -> Result<Expr> {
        let offset = self.offset();
        Ok(match self.bump() {
            Token::Int(i) => Expr::Literal(Value::from(i)),
            Token::Float(f) => Expr::Literal(Value::from(f)),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Ident(name) => match name.as_str() {
                "True" => Expr::Literal(Value::Bool(true)),
                "False" => Expr::Literal(Value::Bool(false)),
                "None" => Expr::Literal(Value::Null),
                "and" | "or" | "not" | "if" | "else" | "in" => {
                    return Err(syntax(offset, format!("unexpected keyword `{name}`")))
                }
                _ => Expr::Name(name),
            },
            Token::Punct("(") => {
                let e = self.expr()?;
                self.expect_punct(")")?;
                e
            }
            Token::Punct("[") => Expr::List(self.sequence("]")?),
            Token::End => return Err(syntax(offset, "unexpected end of expression".into())),
            other => return Err(syntax(offset, format!("unexpected {other:?}"))),
        })
    }
}

// ── Evaluation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(v: &Value) -> Option<Num> {
        match v {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Num::Int(i)),
                None => n.as_f64().map(Num::Float),
            },
            Value::Bool(b) => Some(Num::Int(*b as i64)),
            _ => None,
        }
    }

    fn f(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn value(self) -> Value {
        match self {
            Num::Int(i) => Value::from(i),
            Num::Float(f) => Value::from(f),
        }
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Sequence(s) => !s.is_empty(),
        Value::Mapping(m) => !m.is_empty(),
        Value::Tagged(_) => true,
    }
}

impl Expr {
    pub fn eval(&self, scope: &dyn Scope) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Name(n) => scope.lookup(n),
            Expr::List(items) => Ok(Value::Sequence(
                items.iter().map(|e| e.eval(scope)).collect::<Result<_>>()?,
            )),
            Expr::Neg(e) => match Num::of(&e.eval(scope)?) {
                Some(Num::Int(i)) => Ok(i.checked_neg().map_or(Num::Float(-(i as f64)), Num::Int).value()),
                Some(Num::Float(f)) => Ok(Value::from(-f)),
                None => Err(ExprError::Type("bad operand type for unary `-`".into())),
            },
            Expr::Not(e) => Ok(Value::Bool(!truthy(&e.eval(scope)?))),
            Expr::Binary(op, l, r) => binary(*op, l.eval(scope)?, r.eval(scope)?),
            Expr::Compare(first, rest) => {
                let mut lhs = first.eval(scope)?;
                for (op, e) in rest {
                    let rhs = e.eval(scope)?;
                    if !compare(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::And(l, r) => {
                let lhs = l.eval(scope)?;
                if truthy(&lhs) {
                    r.eval(scope)
                } else {
                    Ok(lhs)
                }
            }
            Expr::Or(l, r) => {
                let lhs = l.eval(scope)?;
                if truthy(&lhs) {
                    Ok(lhs)
                } else {
                    r.eval(scope)
                }
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if truthy(&cond.eval(scope)?) {
                    then.eval(scope)
                } else {
                    otherwise.eval(scope)
                }
            }
            Expr::Index(target, idx) => index(&target.eval(scope)?, &idx.eval(scope)?),
            Expr::Attr(target, name) => match target.eval(scope)? {
                Value::Mapping(m) => m
                    .get(name.as_str())
                    .cloned()
                    .ok_or_else(|| ExprError::MissingKey(name.clone())),
                other => Err(ExprError::Type(format!("{} has no attribute `{name}`", describe(&other)))),
            },
            Expr::Call(name, args) => {
                let args = args.iter().map(|a| a.eval(scope)).collect::<Result<Vec<_>>>()?;
                call(name, args)
            }
        }
    }
}

fn operands(op: BinOp, l: &Value, r: &Value) -> ExprError {
    ExprError::Operands {
        op: op.symbol(),
        left: describe(l),
        right: describe(r),
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value> {
    if let (Some(a), Some(b)) = (Num::of(&l), Num::of(&r)) {
        return arithmetic(op, a, b).map(Num::value);
    }
    match (op, &l, &r) {
        (BinOp::Add, Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (BinOp::Add, Value::Sequence(a), Value::Sequence(b)) => {
            Ok(Value::Sequence(a.iter().chain(b).cloned().collect()))
        }
        (BinOp::Mul, Value::String(s), n) | (BinOp::Mul, n, Value::String(s)) => match Num::of(n) {
            Some(Num::Int(k)) => Ok(Value::String(s.repeat(k.max(0) as usize))),
            _ => Err(operands(op, &l, &r)),
        },
        (BinOp::Mul, Value::Sequence(s), n) | (BinOp::Mul, n, Value::Sequence(s)) => match Num::of(n) {
            Some(Num::Int(k)) => Ok(Value::Sequence(
                std::iter::repeat(s.iter().cloned()).take(k.max(0) as usize).flatten().collect(),
            )),
            _ => Err(operands(op, &l, &r)),
        },
        _ => Err(operands(op, &l, &r)),
    }
}

fn arithmetic(op: BinOp, a: Num, b: Num) -> Result<Num> {
    use Num::{Float, Int};
    let zero = match b {
        Int(i) => i == 0,
        Float(f) => f == 0.0,
    };
    if zero && matches!(op, BinOp::Div | BinOp::FloorDiv | BinOp::Mod) {
        return Err(ExprError::DivisionByZero);
    }
    Ok(match (op, a, b) {
        (BinOp::Div, a, b) => Float(a.f() / b.f()),
        (BinOp::Add, Int(x), Int(y)) => x.checked_add(y).map_or(Float(x as f64 + y as f64), Int),
        (BinOp::Sub, Int(x), Int(y)) => x.checked_sub(y).map_or(Float(x as f64 - y as f64), Int),
        (BinOp::Mul, Int(x), Int(y)) => x.checked_mul(y).map_or(Float(x as f64 * y as f64), Int),
        (BinOp::FloorDiv, Int(x), Int(y)) => match (x.checked_div(y), x.checked_rem(y)) {
            (Some(q), Some(r)) => Int(if r != 0 && (r < 0) != (y < 0) { q - 1 } else { q }),
            _ => Float((x as f64 / y as f64).floor()),
        },
        // `checked_rem` only fails for `i64::MIN % -1`, which is 0.
        (BinOp::Mod, Int(x), Int(y)) => match x.checked_rem(y) {
            Some(r) => Int(if r != 0 && (r < 0) != (y < 0) { r + y } else { r }),
            None => Int(0),
        },
        (BinOp::Pow, Int(x), Int(y)) if y >= 0 => match u32::try_from(y).ok().and_then(|e| x.checked_pow(e)) {
            Some(v) => Int(v),
            None => Float((x as f64).powf(y as f64)),
        },
        (BinOp::Add, a, b) => Float(a.f() + b.f()),
        (BinOp::Sub, a, b) => Float(a.f() - b.f()),
        (BinOp::Mul, a, b) => Float(a.f() * b.f()),
        (BinOp::FloorDiv, a, b) => Float((a.f() / b.f()).floor()),
        (BinOp::Mod, a, b) => Float(a.f() - b.f() * (a.f() / b.f()).floor()),
        (BinOp::Pow, a, b) => Float(a.f().powf(b.f())),
    })
}

fn equal(a: &Value, b: &Value) -> bool {
    match (Num::of(a), Num::of(b)) {
        (Some(x), Some(y)) => x.f() == y.f(),
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Result<Ordering> {
    if let (Some(x), Some(y)) = (Num::of(a), Num::of(b)) {
        return x
            .f()
            .partial_cmp(&y.f())
            .ok_or_else(|| ExprError::Type("cannot order NaN".into()));
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Sequence(x), Value::Sequence(y)) => {
            for (p, q) in x.iter().zip(y) {
                let o = order(p, q)?;
                if o != Ordering::Equal {
                    return Ok(o);
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => Err(ExprError::Type(format!(
            "cannot order {} and {}",
            describe(a),
            describe(b)
        ))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match haystack {
        Value::Sequence(s) => Ok(s.iter().any(|v| equal(v, needle))),
        Value::Mapping(m) => Ok(m.keys().any(|k| equal(k, needle))),
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            other => Err(ExprError::Type(format!("`in <string>` needs a string, not {}", describe(other)))),
        },
        other => Err(ExprError::Type(format!("{} is not a container", describe(other)))),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool> {
    Ok(match op {
        CmpOp::Eq => equal(a, b),
        CmpOp::Ne => !equal(a, b),
        CmpOp::Lt => order(a, b)? == Ordering::Less,
        CmpOp::Le => order(a, b)? != Ordering::Greater,
        CmpOp::Gt => order(a, b)? == Ordering::Greater,
        CmpOp::Ge => order(a, b)? != Ordering::Less,
        CmpOp::In => contains(b, a)?,
        CmpOp::NotIn => !contains(b, a)?,
    })
}

fn position(i: i64, len: usize) -> Result<usize> {
    let idx = if i < 0 { i + len as i64 } else { i };
    if idx < 0 || idx >= len as i64 {
        return Err(ExprError::IndexOutOfRange { index: i, len });
    }
    Ok(idx as usize)
}

fn index(target: &Value, idx: &Value) -> Result<Value> {
    match target {
        Value::Mapping(m) => m
            .iter()
            .find(|(k, _)| equal(k, idx))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ExprError::MissingKey(key_to_string(idx))),
        Value::Sequence(s) => match Num::of(idx) {
            Some(Num::Int(i)) => Ok(s[position(i, s.len())?].clone()),
            _ => Err(ExprError::Type(format!("sequence indices must be integers, not {}", describe(idx)))),
        },
        Value::String(s) => match Num::of(idx) {
            Some(Num::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::String(chars[position(i, chars.len())?].to_string()))
            }
            _ => Err(ExprError::Type(format!("string indices must be integers, not {}", describe(idx)))),
        },
        other => Err(ExprError::Type(format!("{} is not indexable", describe(other)))),
    }
}

// ── Built-ins ───────────────────────────────────────────────────────────────

fn arity(function: &str, expected: &'static str, found: usize) -> ExprError {
    ExprError::Arity {
        function: function.to_string(),
        expected,
        found,
    }
}

fn one(name: &str, args: Vec<Value>) -> Result<Value> {
    match <[Value; 1]>::try_from(args) {
        Ok([v]) => Ok(v),
        Err(args) => Err(arity(name, "1", args.len())),
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value> {
    match name {
        "len" => match one(name, args)? {
            Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
            Value::Sequence(s) => Ok(Value::from(s.len() as i64)),
            Value::Mapping(m) => Ok(Value::from(m.len() as i64)),
            other => Err(ExprError::Type(format!("{} has no len()", describe(&other)))),
        },
        "min" | "max" => {
            let items = match args.len() {
                0 => return Err(arity(name, "at least 1", 0)),
                1 => match args.into_iter().next() {
                    Some(Value::Sequence(s)) => s,
                    Some(other) => return Err(ExprError::Type(format!("{} is not iterable", describe(&other)))),
                    None => Vec::new(),
                },
                _ => args,
            };
            let mut iter = items.into_iter();
            let mut best = iter
                .next()
                .ok_or_else(|| ExprError::Type(format!("{name}() of an empty sequence")))?;
            let want = if name == "min" { Ordering::Less } else { Ordering::Greater };
            for v in iter {
                if order(&v, &best)? == want {
                    best = v;
                }
            }
            Ok(best)
        }
        "abs" => match Num::of(&one(name, args)?) {
            Some(Num::Int(i)) => Ok(i.checked_abs().map_or(Num::Float((i as f64).abs()), Num::Int).value()),
            Some(Num::Float(f)) => Ok(Value::from(f.abs())),
            None => Err(ExprError::Type("abs() needs a number".into())),
        },
        "int" => {
            let v = one(name, args)?;
            match (Num::of(&v), &v) {
                (Some(Num::Int(i)), _) => Ok(Value::from(i)),
                (Some(Num::Float(f)), _) => Ok(Value::from(f.trunc() as i64)),
                (None, Value::String(s)) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| ExprError::Type(format!("invalid literal for int(): {s:?}"))),
                _ => Err(ExprError::Type(format!("int() cannot convert {}", describe(&v)))),
            }
        }
        "float" => {
            let v = one(name, args)?;
            match (Num::of(&v), &v) {
                (Some(n), _) => Ok(Value::from(n.f())),
                (None, Value::String(s)) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| ExprError::Type(format!("could not convert string to float: {s:?}"))),
                _ => Err(ExprError::Type(format!("float() cannot convert {}", describe(&v)))),
            }
        }
        "str" => Ok(Value::String(render(&one(name, args)?))),
        "round" => {
            let (x, digits) = match args.as_slice() {
                [x] => (x, None),
                [x, d] => (x, Some(d)),
                _ => return Err(arity(name, "1 or 2", args.len())),
            };
            let x = Num::of(x).ok_or_else(|| ExprError::Type("round() needs a number".into()))?;
            match digits.map(Num::of) {
                None => Ok(Value::from(round_half_even(x.f()) as i64)),
                Some(Some(Num::Int(d))) => {
                    if let Num::Int(i) = x {
                        return Ok(Value::from(i));
                    }
                    let scale = 10f64.powi(d as i32);
                    Ok(Value::from(round_half_even(x.f() * scale) / scale))
                }
                Some(_) => Err(ExprError::Type("round() digits must be an integer".into())),
            }
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
        r - x.signum()
    } else {
        r
    }
}

/// Python-flavoured rendering, used by `str()`.
pub fn render(v: &Value) -> String {
    match v {
        Value::Null => "None".into(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => match n.as_f64() {
                Some(f) if f.is_finite() && f.fract() == 0.0 => format!("{f:.1}"),
                Some(f) => f.to_string(),
                None => n.to_string(),
            },
        },
        Value::String(s) => s.clone(),
        Value::Sequence(s) => format!("[{}]", s.iter().map(render).collect::<Vec<_>>().join(", ")),
        Value::Mapping(m) => format!(
            "{{{}}}",
            m.iter()
                .map(|(k, v)| format!("{}: {}", render(k), render(v)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::Tagged(t) => render(&t.value),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn eval(src: &str) -> Value {
        evaluate(src, &EmptyScope).unwrap()
    }

    #[test]
    fn arithmetic_follows_integer_and_float_rules() {
        assert_eq!(eval("2 + 3 * 4"), Value::from(14));
        assert_eq!(eval("7 / 2"), Value::from(3.5));
        assert_eq!(eval("7 // 2"), Value::from(3));
        assert_eq!(eval("-7 // 2"), Value::from(-4));
        assert_eq!(eval("-7 % 3"), Value::from(2));
        assert_eq!(eval("2 ** 10"), Value::from(1024));
        assert_eq!(eval("-2 ** 2"), Value::from(-4));
        assert_eq!(eval("2 ** -1"), Value::from(0.5));
        assert_eq!(eval("1e-3 * 2"), Value::from(0.002));
        assert_eq!(eval("(1 + 2) * 3"), Value::from(9));
    }

    #[test]
    fn integer_overflow_falls_back_to_float() {
        let min = "(-9223372036854775807 - 1)";
        let big = Value::from(9_223_372_036_854_775_808.0);
        assert_eq!(eval(&format!("{min} // -1")), big);
        assert_eq!(eval(&format!("{min} % -1")), Value::from(0));
        assert_eq!(eval(&format!("-{min}")), big);
        assert_eq!(eval(&format!("abs({min})")), big);
        assert_eq!(eval("7 // -2"), Value::from(-4));
        assert_eq!(eval("7 % -2"), Value::from(-1));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(evaluate("1 / 0", &EmptyScope), Err(ExprError::DivisionByZero));
        assert_eq!(evaluate("1 % 0", &EmptyScope), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn names_indexing_and_attributes() {
        let s = scope("a: 2\nE: [{lr: 0.1}, {lr: 0.2, tags: [x, y]}]\n");
        assert_eq!(evaluate("a * 3", &s).unwrap(), Value::from(6));
        assert_eq!(evaluate("E[-1].lr", &s).unwrap(), Value::from(0.2));
        assert_eq!(evaluate("E[0]['lr'] * 10", &s).unwrap(), Value::from(1.0));
        assert_eq!(evaluate("E[1].tags[0]", &s).unwrap(), Value::from("x"));
        assert_eq!(evaluate("len(E)", &s).unwrap(), Value::from(2));
        assert!(matches!(evaluate("E[5]", &s), Err(ExprError::IndexOutOfRange { .. })));
        assert!(matches!(evaluate("b", &s), Err(ExprError::UnknownName(_))));
    }

    #[test]
    fn logic_and_conditionals() {
        let s = scope("E: []\nsteps: 100\n");
        assert_eq!(evaluate("0.1 if len(E) == 0 else E[-1].lr / 2", &s).unwrap(), Value::from(0.1));
        assert_eq!(eval("1 < 2 <= 2"), Value::Bool(true));
        assert_eq!(eval("1 < 2 > 3"), Value::Bool(false));
        assert_eq!(eval("not 0 and 'x'"), Value::from("x"));
        assert_eq!(eval("None or 5"), Value::from(5));
        assert_eq!(eval("2 in [1, 2]"), Value::Bool(true));
        assert_eq!(eval("'a' not in 'xyz'"), Value::Bool(true));
        assert_eq!(evaluate("steps // 10 if steps > 50 else 1", &s).unwrap(), Value::from(10));
    }

    #[test]
    fn builtins() {
        assert_eq!(eval("min(3, 1, 2)"), Value::from(1));
        assert_eq!(eval("max([0.5, 2])"), Value::from(2));
        assert_eq!(eval("abs(-3)"), Value::from(3));
        assert_eq!(eval("int('42') + int(2.9)"), Value::from(44));
        assert_eq!(eval("float(3)"), Value::from(3.0));
        assert_eq!(eval("str(3) + '-' + str(0.5)"), Value::from("3-0.5"));
        assert_eq!(eval("round(2.5)"), Value::from(2));
        assert_eq!(eval("round(3.14159, 2)"), Value::from(3.14));
        assert_eq!(eval("'ab' * 2"), Value::from("abab"));
        assert_eq!(eval("[1] + [2]"), eval("[1, 2]"));
        assert!(matches!(evaluate("exec('x')", &EmptyScope), Err(ExprError::UnknownFunction(_))));
        assert!(matches!(evaluate("len(1, 2)", &EmptyScope), Err(ExprError::Arity { .. })));
    }

    #[test]
    fn syntax_errors_report_a_position() {
        assert!(matches!(parse("1 +"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("(1"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("'open"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("a b"), Err(ExprError::Syntax { pos: 2, .. })));
        assert!(matches!(parse("E[0](1)"), Err(ExprError::Syntax { .. })));
    }

    #[test]
    fn literals() {
        assert_eq!(parse_literal("0.05"), Some(Value::from(0.05)));
        assert_eq!(parse_literal("[1, 2]"), Some(eval("[1, 2]")));
        assert_eq!(parse_literal("True"), Some(Value::Bool(true)));
        assert_eq!(parse_literal("adam"), None);
        assert_eq!(parse_literal("path/to/x"), None);
    }
}
