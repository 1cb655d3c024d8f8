//! Small expression engine for success/failure conditions.
//!
//! Covers the part of the rollout controller's condition language that is
//! meaningful over a numeric result list: literals, `result`, indexing,
//! `len`/`isNaN`/`isInf`, arithmetic, comparisons, boolean logic and the
//! ternary operator.

use std::fmt;

/// Error raised while parsing or evaluating a condition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExprError {
    message: String,
    offset: Option<usize>,
}

impl ExprError {
    fn at(offset: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: Some(offset),
        }
    }

    fn eval(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: None,
        }
    }
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{} (at offset {offset})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// A runtime value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Value<'a> {
    Number(f64),
    Bool(bool),
    List(&'a [f64]),
}

impl Value<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "float64",
            Value::Bool(_) => "bool",
            Value::List(_) => "[]float64",
        }
    }

    fn number(self, what: &str) -> Result<f64, ExprError> {
        match self {
            Value::Number(n) => Ok(n),
            other => Err(ExprError::eval(format!(
                "{what}: expected float64, got {}",
                other.type_name()
            ))),
        }
    }

    fn boolean(self, what: &str) -> Result<bool, ExprError> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::eval(format!(
                "{what}: expected bool, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Parse and evaluate `source` with `result` bound to `result`.
pub(crate) fn evaluate<'a>(source: &str, result: &'a [f64]) -> Result<Value<'a>, ExprError> {
    let tokens = tokenize(source)?;
    let ast = Parser {
        tokens,
        index: 0,
        depth: 0,
    }
    .parse()?;
    eval(&ast, result)
}

// ── Lexer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Number(f64),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let text = if text.starts_with('.') {
                format!("0{text}")
            } else {
                text
            };
            let n = text
                .parse::<f64>()
                .map_err(|_| ExprError::at(start, format!("invalid number {text:?}")))?;
            tokens.push(Token {
                tok: Tok::Number(n),
                offset: start,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token {
                tok: Tok::Ident(chars[start..i].iter().collect()),
                offset: start,
            });
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (tok, width) = match (c, next) {
            ('&', Some('&')) => (Tok::AndAnd, 2),
            ('|', Some('|')) => (Tok::OrOr, 2),
            ('<', Some('=')) => (Tok::Le, 2),
            ('>', Some('=')) => (Tok::Ge, 2),
            ('=', Some('=')) => (Tok::EqEq, 2),
            ('!', Some('=')) => (Tok::Ne, 2),
            ('<', _) => (Tok::Lt, 1),
            ('>', _) => (Tok::Gt, 1),
            ('!', _) => (Tok::Bang, 1),
            ('(', _) => (Tok::LParen, 1),
            (')', _) => (Tok::RParen, 1),
            ('[', _) => (Tok::LBracket, 1),
            (']', _) => (Tok::RBracket, 1),
            (',', _) => (Tok::Comma, 1),
            ('?', _) => (Tok::Question, 1),
            (':', _) => (Tok::Colon, 1),
            ('+', _) => (Tok::Plus, 1),
            ('-', _) => (Tok::Minus, 1),
            ('*', _) => (Tok::Star, 1),
            ('/', _) => (Tok::Slash, 1),
            ('%', _) => (Tok::Percent, 1),
            _ => return Err(ExprError::at(start, format!("unexpected character {c:?}"))),
        };
        tokens.push(Token { tok, offset: start });
        i += width;
    }

    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Bool(bool),
    Result,
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Deepest AST the parser builds. Bounds recursion in the parser and in `eval`.
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
}

impl Parser {
    fn parse(mut self) -> Result<Expr, ExprError> {
        if self.tokens.is_empty() {
            return Err(ExprError::at(0, "empty expression"));
        }
        let expr = self.ternary()?;
        if let Some(tok) = self.tokens.get(self.index) {
            return Err(ExprError::at(tok.offset, "unexpected trailing input"));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.index).map(|t| &t.tok)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map(|t| t.offset)
            .unwrap_or(0)
    }

    fn consume(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn consume_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Ident(w)) if w == word) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::at(self.offset(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), ExprError> {
        if self.consume(tok) {
            Ok(())
        } else {
            Err(ExprError::at(self.offset(), format!("expected {what}")))
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        self.descend()?;
        let expr = self.conditional();
        self.depth -= 1;
        expr
    }

    fn conditional(&mut self) -> Result<Expr, ExprError> {
        let cond = self.or()?;
        if self.consume(&Tok::Question) {
            let then = self.ternary()?;
            self.expect(&Tok::Colon, "':' in ternary")?;
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.and()?;
        while self.consume(&Tok::OrOr) || self.consume_word("or") {
            self.descend()?;
            let rhs = self.and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.equality()?;
        while self.consume(&Tok::AndAnd) || self.consume_word("and") {
            self.descend()?;
            let rhs = self.equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Tok::EqEq) => BinOp::Eq,
                Some(Tok::Ne) => BinOp::Ne,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.index += 1;
            self.descend()?;
            let rhs = self.comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => BinOp::Lt,
                Some(Tok::Le) => BinOp::Le,
                Some(Tok::Gt) => BinOp::Gt,
                Some(Tok::Ge) => BinOp::Ge,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.index += 1;
            self.descend()?;
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.index += 1;
            self.descend()?;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.index += 1;
            self.descend()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        enum Prefix {
            Neg,
            Plus,
            Not,
        }
        let prefix = if self.consume(&Tok::Minus) {
            Prefix::Neg
        } else if self.consume(&Tok::Plus) {
            Prefix::Plus
        } else if self.consume(&Tok::Bang) || self.consume_word("not") {
            Prefix::Not
        } else {
            return self.postfix();
        };
        self.descend()?;
        let operand = self.unary();
        self.depth -= 1;
        let operand = operand?;
        Ok(match prefix {
            Prefix::Neg => Expr::Neg(Box::new(operand)),
            Prefix::Plus => operand,
            Prefix::Not => Expr::Not(Box::new(operand)),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut expr = self.primary()?;
        while self.consume(&Tok::LBracket) {
            self.descend()?;
            let index = self.ternary()?;
            self.expect(&Tok::RBracket, "']'")?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
        }
        self.depth = base;
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        let tok = self
            .tokens
            .get(self.index)
            .map(|t| t.tok.clone())
            .ok_or_else(|| ExprError::at(offset, "unexpected end of expression"))?;
        self.index += 1;

        match tok {
            Tok::Number(n) => Ok(Expr::Number(n)),
            Tok::LParen => {
                let expr = self.ternary()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(expr)
            }
            Tok::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "result" => Ok(Expr::Result),
                _ if self.consume(&Tok::LParen) => {
                    let mut args = Vec::new();
                    if !self.consume(&Tok::RParen) {
                        loop {
                            args.push(self.ternary()?);
                            if self.consume(&Tok::RParen) {
                                break;
                            }
                            self.expect(&Tok::Comma, "',' or ')'")?;
                        }
                    }
                    Ok(Expr::Call(name, args))
                }
                _ => Err(ExprError::at(offset, format!("unknown name {name:?}"))),
            },
            _ => Err(ExprError::at(offset, "unexpected token")),
        }
    }
}

// ── Evaluation ─────────────────────────────────────────────────

fn eval<'a>(expr: &Expr, result: &'a [f64]) -> Result<Value<'a>, ExprError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Result => Ok(Value::List(result)),
        Expr::Neg(inner) => Ok(Value::Number(-eval(inner, result)?.number("unary -")?)),
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, result)?.boolean("!")?)),
        Expr::Ternary(cond, then, otherwise) => {
            if eval(cond, result)?.boolean("ternary condition")? {
                eval(then, result)
            } else {
                eval(otherwise, result)
            }
        }
        Expr::Index(target, index) => {
            let list = match eval(target, result)? {
                Value::List(list) => list,
                other => {
                    return Err(ExprError::eval(format!(
                        "cannot index {}",
                        other.type_name()
                    )));
                }
            };
            let i = eval(index, result)?.number("index")?;
            if i.fract() != 0.0 {
                return Err(ExprError::eval(format!("non-integer index {i}")));
            }
            let len = list.len() as f64;
            let pos = if i < 0.0 { len + i } else { i };
            if pos < 0.0 || pos >= len {
                return Err(ExprError::eval(format!(
                    "index out of range: {i} (array length is {})",
                    list.len()
                )));
            }
            Ok(Value::Number(list[pos as usize]))
        }
        Expr::Call(name, args) => call(name, args, result),
        Expr::Binary(BinOp::And, lhs, rhs) => {
            if !eval(lhs, result)?.boolean("&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(rhs, result)?.boolean("&&")?))
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            if eval(lhs, result)?.boolean("||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(rhs, result)?.boolean("||")?))
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, result)?;
            let rhs = eval(rhs, result)?;
            binary(*op, lhs, rhs)
        }
    }
}

fn binary<'a>(op: BinOp, lhs: Value<'a>, rhs: Value<'a>) -> Result<Value<'a>, ExprError> {
    match op {
        BinOp::Eq | BinOp::Ne => {
            let equal = match (lhs, rhs) {
                (Value::Number(a), Value::Number(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::List(a), Value::List(b)) => a == b,
                (a, b) => {
                    return Err(ExprError::eval(format!(
                        "cannot compare {} with {}",
                        a.type_name(),
                        b.type_name()
                    )));
                }
            };
            Ok(Value::Bool(if op == BinOp::Eq { equal } else { !equal }))
        }
        BinOp::And => Ok(Value::Bool(lhs.boolean("&&")? && rhs.boolean("&&")?)),
        BinOp::Or => Ok(Value::Bool(lhs.boolean("||")? || rhs.boolean("||")?)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let a = lhs.number("left operand")?;
            let b = rhs.number("right operand")?;
            Ok(Value::Bool(match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                _ => a >= b,
            }))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            let a = lhs.number("left operand")?;
            let b = rhs.number("right operand")?;
            Ok(Value::Number(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                _ => a % b,
            }))
        }
    }
}

fn call<'a>(name: &str, args: &[Expr], result: &'a [f64]) -> Result<Value<'a>, ExprError> {
    let [arg] = args else {
        return Err(ExprError::eval(format!(
            "{name}() takes 1 argument, got {}",
            args.len()
        )));
    };
    let value = eval(arg, result)?;
    match name {
        "len" => match value {
            Value::List(list) => Ok(Value::Number(list.len() as f64)),
            other => Err(ExprError::eval(format!(
                "invalid argument for len (type {})",
                other.type_name()
            ))),
        },
        "isNaN" => Ok(Value::Bool(value.number("isNaN")?.is_nan())),
        "isInf" => Ok(Value::Bool(value.number("isInf")?.is_infinite())),
        _ => Err(ExprError::eval(format!("unknown function {name}()"))),
    }
}
