//! Restricted expression evaluator.
//!
//! Operators author risk rules and approval conditions as free-form
//! expressions in YAML, so this evaluator must be safe to run on untrusted
//! input. The implementation is a hand-written lexer, a recursive-descent
//! parser that rejects anything outside the allowed grammar, and a
//! tree-walking interpreter over a binding map. There is no host `eval`,
//! no attribute access, no subscripting, and only a fixed whitelist of
//! callable functions.
//!
//! Allowed: int/float/string/bool literals, lists and tuples, variable
//! references, `+ - * / % **`, unary `+ - not`, comparisons
//! (`== != < <= > >= in not in`, chained Python-style), `and`/`or`, and
//! calls to `min max abs round floor ceil sqrt log`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

/// Functions callable by bare name inside expressions.
const ALLOWED_FUNCS: &[&str] = &["min", "max", "abs", "round", "floor", "ceil", "sqrt", "log"];

/// Rejection from the evaluator. Parsing and validation failures are
/// distinguished from runtime failures, but callers usually treat any
/// variant as "fail closed".
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unsafe expression: {0}")]
    Forbidden(String),
    #[error("evaluation error: {0}")]
    Eval(String),
}

pub type ExprResult<T> = Result<T, ExprError>;

// =============================================================================
// Values
// =============================================================================

/// A runtime value inside the expression sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Python-style truthiness: empty/zero values are false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Numeric view; booleans count as 0/1 like they do in Python.
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    None_,
    And,
    Or,
    Not,
    In,
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn tokenize(input: &str) -> ExprResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
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
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::DoubleStar);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ExprError::Syntax("assignment is not allowed".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(ExprError::Syntax("unexpected '!'".into()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::Syntax("unterminated string".into())),
                        Some('\\') => {
                            let escaped = chars.get(i + 1).copied();
                            match escaped {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some('\\') => s.push('\\'),
                                Some('\'') => s.push('\''),
                                Some('"') => s.push('"'),
                                Some(other) => {
                                    return Err(ExprError::Syntax(format!(
                                        "unknown escape '\\{other}'"
                                    )))
                                }
                                None => {
                                    return Err(ExprError::Syntax("unterminated string".into()))
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i < chars.len() && chars[i] == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
                {
                    is_float = true;
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
                        is_float = true;
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let f: f64 = text
                        .parse()
                        .map_err(|_| ExprError::Syntax(format!("bad float literal '{text}'")))?;
                    tokens.push(Token::Float(f));
                } else {
                    let n: i64 = text
                        .parse()
                        .map_err(|_| ExprError::Syntax(format!("bad int literal '{text}'")))?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(match ident.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "True" | "true" => Token::True,
                    "False" | "false" => Token::False,
                    "None" => Token::None_,
                    _ => Token::Ident(ident),
                });
            }
            other => return Err(ExprError::Syntax(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// =============================================================================
// Parser
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Pos,
    Neg,
    Not,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Chained comparison: `a < b <= c` holds iff every adjacent pair holds.
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek2(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> ExprResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(ExprError::Syntax(format!("expected {what}")))
        }
    }

    fn parse_expr(&mut self) -> ExprResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> ExprResult<Expr> {
        let first = self.parse_and()?;
        if self.peek() != Some(&Token::Or) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::Or) {
            operands.push(self.parse_and()?);
        }
        Ok(Expr::Or(operands))
    }

    fn parse_and(&mut self) -> ExprResult<Expr> {
        let first = self.parse_not()?;
        if self.peek() != Some(&Token::And) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::And) {
            operands.push(self.parse_not()?);
        }
        Ok(Expr::And(operands))
    }

    fn parse_not(&mut self) -> ExprResult<Expr> {
        // `not x in y` must not consume the `not` of `not in`; the comparison
        // level handles that pair itself, so only treat `not` as a prefix when
        // it is not followed by `in`.
        if self.peek() == Some(&Token::Not) && self.peek2() != Some(&Token::In) {
            self.pos += 1;
            let operand = self.parse_not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ExprResult<Expr> {
        let first = self.parse_arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::Ne) => CmpOp::Ne,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::Le) => CmpOp::Le,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::Ge) => CmpOp::Ge,
                Some(Token::In) => CmpOp::In,
                Some(Token::Not) if self.peek2() == Some(&Token::In) => CmpOp::NotIn,
                _ => break,
            };
            if op == CmpOp::NotIn {
                self.pos += 2;
            } else {
                self.pos += 1;
            }
            rest.push((op, self.parse_arith()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn parse_arith(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> ExprResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ExprResult<Expr> {
        match self.peek() {
            Some(Token::Plus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Pos, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> ExprResult<Expr> {
        let base = self.parse_postfix()?;
        if self.eat(&Token::DoubleStar) {
            // Right-associative; the exponent may carry its own unary sign.
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> ExprResult<Expr> {
        let atom = self.parse_atom()?;
        match self.peek() {
            Some(Token::Dot) => Err(ExprError::Forbidden("attribute access not allowed".into())),
            Some(Token::LBracket) => Err(ExprError::Forbidden("subscript not allowed".into())),
            _ => Ok(atom),
        }
    }

    fn parse_atom(&mut self) -> ExprResult<Expr> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::Int(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::None_) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                if name.starts_with("__") {
                    return Err(ExprError::Forbidden("dunder names not allowed".into()));
                }
                if self.eat(&Token::LParen) {
                    if !ALLOWED_FUNCS.contains(&name.as_str()) {
                        return Err(ExprError::Forbidden(format!(
                            "function '{name}' not allowed"
                        )));
                    }
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.eat(&Token::Comma) {
                                if self.peek() == Some(&Token::RParen) {
                                    self.pos += 1;
                                    break;
                                }
                                continue;
                            }
                            self.expect(&Token::RParen, "')'")?;
                            break;
                        }
                    }
                    return Ok(Expr::Call(name, args));
                }
                Ok(Expr::Name(name))
            }
            Some(Token::LParen) => {
                if self.eat(&Token::RParen) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_expr()?;
                if self.eat(&Token::Comma) {
                    // Tuple literal; evaluates to a list value.
                    let mut items = vec![first];
                    while self.peek() != Some(&Token::RParen) {
                        items.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RParen, "')'")?;
                    return Ok(Expr::List(items));
                }
                self.expect(&Token::RParen, "')'")?;
                Ok(first)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.eat(&Token::Comma) {
                            if self.peek() == Some(&Token::RBracket) {
                                self.pos += 1;
                                break;
                            }
                            continue;
                        }
                        self.expect(&Token::RBracket, "']'")?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(other) => Err(ExprError::Syntax(format!("unexpected token {other:?}"))),
            None => Err(ExprError::Syntax("unexpected end of expression".into())),
        }
    }
}

fn parse(input: &str) -> ExprResult<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExprError::Syntax("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Syntax(format!(
            "unexpected token {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

// =============================================================================
// Interpreter
// =============================================================================

fn eval_node(expr: &Expr, vars: &BTreeMap<String, Value>) -> ExprResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => vars
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::Eval(format!("name '{name}' is not defined"))),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_node(item, vars)?);
            }
            Ok(Value::List(out))
        }
        Expr::Unary(op, operand) => {
            let v = eval_node(operand, vars)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                UnaryOp::Pos => match v {
                    Value::Int(_) | Value::Float(_) => Ok(v),
                    Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                    other => Err(ExprError::Eval(format!(
                        "bad operand type for unary +: '{}'",
                        other.type_name()
                    ))),
                },
                UnaryOp::Neg => match v {
                    Value::Int(i) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| ExprError::Eval("integer overflow".into())),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
                    other => Err(ExprError::Eval(format!(
                        "bad operand type for unary -: '{}'",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let a = eval_node(lhs, vars)?;
            let b = eval_node(rhs, vars)?;
            eval_binop(*op, &a, &b)
        }
        Expr::Compare(first, rest) => {
            let mut left = eval_node(first, vars)?;
            for (op, rhs) in rest {
                let right = eval_node(rhs, vars)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        // `and`/`or` return the deciding operand, as Python does.
        Expr::And(operands) => {
            let mut last = Value::Bool(true);
            for operand in operands {
                last = eval_node(operand, vars)?;
                if !last.truthy() {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        Expr::Or(operands) => {
            let mut last = Value::Bool(false);
            for operand in operands {
                last = eval_node(operand, vars)?;
                if last.truthy() {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_node(arg, vars)?);
            }
            call_builtin(name, values)
        }
    }
}

fn eval_binop(op: BinOp, a: &Value, b: &Value) -> ExprResult<Value> {
    let type_err = || {
        ExprError::Eval(format!(
            "unsupported operand types: '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))
    };

    match op {
        BinOp::Add => match (a, b) {
            (Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{x}{y}"))),
            (Value::List(x), Value::List(y)) => {
                let mut out = x.clone();
                out.extend(y.iter().cloned());
                Ok(Value::List(out))
            }
            _ => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x
                    .checked_add(y)
                    .map(Value::Int)
                    .ok_or_else(|| ExprError::Eval("integer overflow".into())),
                _ => {
                    let (x, y) = (a.as_f64().ok_or_else(type_err)?, b.as_f64().ok_or_else(type_err)?);
                    Ok(Value::Float(x + y))
                }
            },
        },
        BinOp::Sub => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x
                .checked_sub(y)
                .map(Value::Int)
                .ok_or_else(|| ExprError::Eval("integer overflow".into())),
            _ => {
                let (x, y) = (a.as_f64().ok_or_else(type_err)?, b.as_f64().ok_or_else(type_err)?);
                Ok(Value::Float(x - y))
            }
        },
        BinOp::Mul => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x
                .checked_mul(y)
                .map(Value::Int)
                .ok_or_else(|| ExprError::Eval("integer overflow".into())),
            _ => {
                let (x, y) = (a.as_f64().ok_or_else(type_err)?, b.as_f64().ok_or_else(type_err)?);
                Ok(Value::Float(x * y))
            }
        },
        // True division: always a float, like Python 3.
        BinOp::Div => {
            let (x, y) = (a.as_f64().ok_or_else(type_err)?, b.as_f64().ok_or_else(type_err)?);
            if y == 0.0 {
                return Err(ExprError::Eval("division by zero".into()));
            }
            Ok(Value::Float(x / y))
        }
        // Remainder takes the divisor's sign, matching Python's `%`.
        BinOp::Mod => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => {
                if y == 0 {
                    return Err(ExprError::Eval("modulo by zero".into()));
                }
                let r = x % y;
                let r = if r != 0 && (r < 0) != (y < 0) { r + y } else { r };
                Ok(Value::Int(r))
            }
            _ => {
                let (x, y) = (a.as_f64().ok_or_else(type_err)?, b.as_f64().ok_or_else(type_err)?);
                if y == 0.0 {
                    return Err(ExprError::Eval("modulo by zero".into()));
                }
                let r = x % y;
                let r = if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r };
                Ok(Value::Float(r))
            }
        },
        BinOp::Pow => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) if y >= 0 => {
                let exp = u32::try_from(y)
                    .map_err(|_| ExprError::Eval("exponent too large".into()))?;
                x.checked_pow(exp)
                    .map(Value::Int)
                    .ok_or_else(|| ExprError::Eval("integer overflow".into()))
            }
            _ => {
                let (x, y) = (a.as_f64().ok_or_else(type_err)?, b.as_f64().ok_or_else(type_err)?);
                let r = x.powf(y);
                if r.is_nan() {
                    return Err(ExprError::Eval("math domain error".into()));
                }
                Ok(Value::Float(r))
            }
        },
    }
}

/// Structural equality with numeric cross-type comparison; values of
/// unrelated types are simply unequal (no error), like `==` in Python.
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => false,
    }
}

fn values_cmp(a: &Value, b: &Value) -> ExprResult<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| ExprError::Eval("cannot order NaN".into()));
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                match values_cmp(l, r)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => Err(ExprError::Eval(format!(
            "'<' not supported between '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn contains(needle: &Value, haystack: &Value) -> ExprResult<bool> {
    match haystack {
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(ExprError::Eval(format!(
                "'in <str>' requires str, not '{}'",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.iter().any(|item| values_equal(needle, item))),
        Value::Map(map) => match needle {
            Value::Str(key) => Ok(map.contains_key(key)),
            other => Err(ExprError::Eval(format!(
                "'in <map>' requires str, not '{}'",
                other.type_name()
            ))),
        },
        other => Err(ExprError::Eval(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> ExprResult<bool> {
    match op {
        CmpOp::Eq => Ok(values_equal(a, b)),
        CmpOp::Ne => Ok(!values_equal(a, b)),
        CmpOp::Lt => Ok(values_cmp(a, b)? == Ordering::Less),
        CmpOp::Le => Ok(values_cmp(a, b)? != Ordering::Greater),
        CmpOp::Gt => Ok(values_cmp(a, b)? == Ordering::Greater),
        CmpOp::Ge => Ok(values_cmp(a, b)? != Ordering::Less),
        CmpOp::In => contains(a, b),
        CmpOp::NotIn => Ok(!contains(a, b)?),
    }
}

fn numeric_arg(name: &str, v: &Value) -> ExprResult<f64> {
    v.as_f64().ok_or_else(|| {
        ExprError::Eval(format!(
            "{name}() requires a number, got '{}'",
            v.type_name()
        ))
    })
}

fn float_to_int(f: f64) -> ExprResult<i64> {
    if !f.is_finite() || f < i64::MIN as f64 || f > i64::MAX as f64 {
        return Err(ExprError::Eval("result out of integer range".into()));
    }
    Ok(f as i64)
}

fn fold_extreme(name: &str, args: Vec<Value>, want_max: bool) -> ExprResult<Value> {
    let items = if args.len() == 1 {
        match args.into_iter().next().unwrap() {
            Value::List(items) => items,
            other => {
                return Err(ExprError::Eval(format!(
                    "{name}() arg is not iterable: '{}'",
                    other.type_name()
                )))
            }
        }
    } else {
        args
    };

    let mut iter = items.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| ExprError::Eval(format!("{name}() arg is an empty sequence")))?;
    for item in iter {
        let ord = values_cmp(&item, &best)?;
        let better = if want_max {
            ord == Ordering::Greater
        } else {
            ord == Ordering::Less
        };
        if better {
            best = item;
        }
    }
    Ok(best)
}

fn call_builtin(name: &str, args: Vec<Value>) -> ExprResult<Value> {
    let argc = args.len();
    let arity = move |expected: std::ops::RangeInclusive<usize>| -> ExprResult<()> {
        if expected.contains(&argc) {
            Ok(())
        } else {
            Err(ExprError::Eval(format!(
                "{name}() takes {} to {} arguments ({argc} given)",
                expected.start(),
                expected.end(),
            )))
        }
    };

    match name {
        "min" => fold_extreme("min", args, false),
        "max" => fold_extreme("max", args, true),
        "abs" => {
            arity(1..=1)?;
            match &args[0] {
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| ExprError::Eval("integer overflow".into())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                other => Err(ExprError::Eval(format!(
                    "abs() requires a number, got '{}'",
                    other.type_name()
                ))),
            }
        }
        "round" => {
            arity(1..=2)?;
            let x = numeric_arg("round", &args[0])?;
            if args.len() == 2 {
                let ndigits = numeric_arg("round", &args[1])?;
                let factor = 10f64.powi(ndigits as i32);
                Ok(Value::Float((x * factor).round() / factor))
            } else {
                Ok(Value::Int(float_to_int(x.round())?))
            }
        }
        "floor" => {
            arity(1..=1)?;
            Ok(Value::Int(float_to_int(numeric_arg("floor", &args[0])?.floor())?))
        }
        "ceil" => {
            arity(1..=1)?;
            Ok(Value::Int(float_to_int(numeric_arg("ceil", &args[0])?.ceil())?))
        }
        "sqrt" => {
            arity(1..=1)?;
            let x = numeric_arg("sqrt", &args[0])?;
            if x < 0.0 {
                return Err(ExprError::Eval("math domain error".into()));
            }
            Ok(Value::Float(x.sqrt()))
        }
        "log" => {
            arity(1..=2)?;
            let x = numeric_arg("log", &args[0])?;
            if x <= 0.0 {
                return Err(ExprError::Eval("math domain error".into()));
            }
            if args.len() == 2 {
                let base = numeric_arg("log", &args[1])?;
                if base <= 0.0 || base == 1.0 {
                    return Err(ExprError::Eval("math domain error".into()));
                }
                Ok(Value::Float(x.ln() / base.ln()))
            } else {
                Ok(Value::Float(x.ln()))
            }
        }
        // Unreachable: the parser already rejects unlisted names.
        other => Err(ExprError::Forbidden(format!("function '{other}' not allowed"))),
    }
}

/// Safely evaluate a restricted expression against a binding map.
///
/// Parsing validates the whole expression before anything runs; every
/// failure mode surfaces as an [`ExprError`].
pub fn safe_eval(expr: &str, vars: &BTreeMap<String, Value>) -> ExprResult<Value> {
    let ast = parse(expr)?;
    eval_node(&ast, vars)
}
