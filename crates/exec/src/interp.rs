//! Lexer, parser, and evaluator for the runner's expression language.
//!
//! The language is deliberately tiny: `let`, assignment, `if`/`else`,
//! `for x in ...`, literals, arrays, objects, indexing, arithmetic and
//! comparison operators, and calls into a fixed helper whitelist.  Values
//! are JSON values throughout, so the `data` input and the `result` output
//! need no conversion layer.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::{ExecError, RunOutcome};

/// Helper whitelist.  Anything else called from a script is rejected.
pub const BUILTIN_NAMES: &[&str] = &[
    "abs", "min", "max", "round", "floor", "ceil", "sqrt", "pow", "len", "sum", "sorted", "range",
    "append", "join", "split", "upper", "lower", "trim", "str", "num", "keys", "values",
    "contains", "date_now", "date_today", "json_parse", "json_dump", "print",
];

// ── Tokens ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Let,
    If,
    Else,
    For,
    In,
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Assign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    /// A newline separated this token from the previous one.  Postfix
    /// operators (call, index) do not continue across such a break.
    nl_before: bool,
}

fn lex(code: &str) -> Result<Vec<Token>, ExecError> {
    let mut tokens = Vec::new();
    let mut chars = code.chars().peekable();
    let mut line = 1usize;
    let mut nl_pending = false;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                nl_pending = true;
                chars.next();
            }
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '#' => {
                // Comment to end of line.
                while let Some(&c2) = chars.peek() {
                    if c2 == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c2) = chars.next() {
                    if c2 == quote {
                        closed = true;
                        break;
                    }
                    if c2 == '\\' {
                        match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => break,
                        }
                    } else {
                        if c2 == '\n' {
                            line += 1;
                        }
                        s.push(c2);
                    }
                }
                if !closed {
                    return Err(ExecError::Parse { line, message: "unterminated string".into() });
                }
                tokens.push(Token { tok: Tok::Str(s), line, nl_before: std::mem::take(&mut nl_pending) });
            }
            '0'..='9' => {
                let mut s = String::new();
                let mut is_float = false;
                while let Some(&c2) = chars.peek() {
                    if c2.is_ascii_digit() {
                        s.push(c2);
                        chars.next();
                    } else if c2 == '.' && !is_float {
                        // Lookahead: ".5" continues the number, "." alone is not ours.
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                            is_float = true;
                            s.push(c2);
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                let tok = if is_float {
                    Tok::Float(s.parse().map_err(|_| ExecError::Parse {
                        line,
                        message: format!("bad number '{s}'"),
                    })?)
                } else {
                    Tok::Int(s.parse().map_err(|_| ExecError::Parse {
                        line,
                        message: format!("bad number '{s}'"),
                    })?)
                };
                tokens.push(Token { tok, line, nl_before: std::mem::take(&mut nl_pending) });
            }
            c2 if c2.is_alphabetic() || c2 == '_' => {
                let mut s = String::new();
                while let Some(&c3) = chars.peek() {
                    if c3.is_alphanumeric() || c3 == '_' {
                        s.push(c3);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let tok = match s.as_str() {
                    "let" => Tok::Let,
                    "if" => Tok::If,
                    "else" => Tok::Else,
                    "for" => Tok::For,
                    "in" => Tok::In,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(s),
                };
                tokens.push(Token { tok, line, nl_before: std::mem::take(&mut nl_pending) });
            }
            _ => {
                chars.next();
                let tok = match c {
                    '+' => Tok::Plus,
                    '-' => Tok::Minus,
                    '*' => Tok::Star,
                    '/' => Tok::Slash,
                    '%' => Tok::Percent,
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    ',' => Tok::Comma,
                    ':' => Tok::Colon,
                    '=' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Tok::EqEq
                        } else {
                            Tok::Assign
                        }
                    }
                    '!' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Tok::Ne
                        } else {
                            Tok::Bang
                        }
                    }
                    '<' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Tok::Le
                        } else {
                            Tok::Lt
                        }
                    }
                    '>' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Tok::Ge
                        } else {
                            Tok::Gt
                        }
                    }
                    '&' => {
                        if chars.peek() == Some(&'&') {
                            chars.next();
                            Tok::AndAnd
                        } else {
                            return Err(ExecError::Parse { line, message: "single '&'".into() });
                        }
                    }
                    '|' => {
                        if chars.peek() == Some(&'|') {
                            chars.next();
                            Tok::OrOr
                        } else {
                            return Err(ExecError::Parse { line, message: "single '|'".into() });
                        }
                    }
                    other => {
                        return Err(ExecError::Parse {
                            line,
                            message: format!("unexpected character '{other}'"),
                        });
                    }
                };
                tokens.push(Token { tok, line, nl_before: std::mem::take(&mut nl_pending) });
            }
        }
    }

    Ok(tokens)
}

// ── AST ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Var(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(Tok, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone)]
enum Stmt {
    Let(String, Expr),
    Assign(String, Expr),
    AssignIndex(String, Vec<Expr>, Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    For(String, Expr, Vec<Stmt>),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct Program {
    stmts: Vec<Stmt>,
}

// ── Parser ───────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn line(&self) -> usize {
        self.peek().map(|t| t.line).unwrap_or_else(|| {
            self.tokens.last().map(|t| t.line).unwrap_or(1)
        })
    }

    fn err(&self, message: impl Into<String>) -> ExecError {
        ExecError::Parse { line: self.line(), message: message.into() }
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, expected: &Tok) -> Result<(), ExecError> {
        if self.peek().is_some_and(|t| &t.tok == expected) {
            self.pos += 1;
            return Ok(());
        }
        let found = self
            .peek()
            .map(|t| format!("{:?}", t.tok))
            .unwrap_or_else(|| "end of input".to_string());
        Err(self.err(format!("expected {expected:?}, found {found}")))
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ExecError> {
        self.eat(&Tok::LBrace)?;
        let mut stmts = Vec::new();
        while let Some(t) = self.peek() {
            if t.tok == Tok::RBrace {
                break;
            }
            stmts.push(self.parse_stmt()?);
        }
        self.eat(&Tok::RBrace)?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ExecError> {
        match self.peek().map(|t| t.tok.clone()) {
            Some(Tok::Let) => {
                self.advance();
                let name = match self.advance() {
                    Some(Token { tok: Tok::Ident(name), .. }) => name,
                    _ => return Err(self.err("expected name after 'let'")),
                };
                self.eat(&Tok::Assign)?;
                let value = self.parse_expr()?;
                Ok(Stmt::Let(name, value))
            }
            Some(Tok::If) => {
                self.advance();
                let cond = self.parse_expr()?;
                let then_block = self.parse_block()?;
                let else_block = if self.peek().map(|t| &t.tok) == Some(&Tok::Else) {
                    self.advance();
                    if self.peek().map(|t| &t.tok) == Some(&Tok::If) {
                        vec![self.parse_stmt()?]
                    } else {
                        self.parse_block()?
                    }
                } else {
                    Vec::new()
                };
                Ok(Stmt::If(cond, then_block, else_block))
            }
            Some(Tok::For) => {
                self.advance();
                let var = match self.advance() {
                    Some(Token { tok: Tok::Ident(name), .. }) => name,
                    _ => return Err(self.err("expected loop variable after 'for'")),
                };
                self.eat(&Tok::In)?;
                let iterable = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::For(var, iterable, body))
            }
            Some(Tok::Ident(name)) => {
                // Distinguish `name = ...`, `name[i] = ...`, and a bare
                // expression statement by lookahead.
                let start = self.pos;
                self.advance();
                match self.peek().map(|t| t.tok.clone()) {
                    Some(Tok::Assign) => {
                        self.advance();
                        let value = self.parse_expr()?;
                        Ok(Stmt::Assign(name, value))
                    }
                    Some(Tok::LBracket) => {
                        // Collect index chain, then check for '='.
                        let mut indices = Vec::new();
                        while self.peek().map(|t| &t.tok) == Some(&Tok::LBracket) {
                            self.advance();
                            indices.push(self.parse_expr()?);
                            self.eat(&Tok::RBracket)?;
                        }
                        if self.peek().map(|t| &t.tok) == Some(&Tok::Assign) {
                            self.advance();
                            let value = self.parse_expr()?;
                            Ok(Stmt::AssignIndex(name, indices, value))
                        } else {
                            self.pos = start;
                            Ok(Stmt::Expr(self.parse_expr()?))
                        }
                    }
                    _ => {
                        self.pos = start;
                        Ok(Stmt::Expr(self.parse_expr()?))
                    }
                }
            }
            Some(_) => Ok(Stmt::Expr(self.parse_expr()?)),
            None => Err(self.err("unexpected end of input")),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExecError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.parse_and()?;
        while self.peek().map(|t| &t.tok) == Some(&Tok::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(Tok::OrOr, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.parse_comparison()?;
        while self.peek().map(|t| &t.tok) == Some(&Tok::AndAnd) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(Tok::AndAnd, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExecError> {
        let left = self.parse_additive()?;
        let op = match self.peek().map(|t| t.tok.clone()) {
            Some(op @ (Tok::EqEq | Tok::Ne | Tok::Lt | Tok::Le | Tok::Gt | Tok::Ge)) => op,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().map(|t| t.tok.clone()) {
                Some(op @ (Tok::Plus | Tok::Minus)) => op,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|t| t.tok.clone()) {
                Some(op @ (Tok::Star | Tok::Slash | Tok::Percent)) => op,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExecError> {
        match self.peek().map(|t| &t.tok) {
            Some(Tok::Minus) => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Tok::Bang) => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExecError> {
        let mut expr = self.parse_primary()?;
        // Postfix operators never continue across a line break.
        while let Some(t) = self.peek() {
            if t.nl_before {
                break;
            }
            match t.tok {
                Tok::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.eat(&Tok::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExecError> {
        let token = self.advance().ok_or_else(|| self.err("unexpected end of input"))?;
        match token.tok {
            Tok::Int(n) => Ok(Expr::Lit(json!(n))),
            Tok::Float(f) => Ok(Expr::Lit(json!(f))),
            Tok::Str(s) => Ok(Expr::Lit(json!(s))),
            Tok::True => Ok(Expr::Lit(json!(true))),
            Tok::False => Ok(Expr::Lit(json!(false))),
            Tok::Null => Ok(Expr::Lit(Value::Null)),
            Tok::LParen => {
                let inner = self.parse_expr()?;
                self.eat(&Tok::RParen)?;
                Ok(inner)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                loop {
                    if self.peek().map(|t| &t.tok) == Some(&Tok::RBracket) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                    if self.peek().map(|t| &t.tok) == Some(&Tok::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.eat(&Tok::RBracket)?;
                Ok(Expr::Array(items))
            }
            Tok::LBrace => {
                let mut entries = Vec::new();
                loop {
                    match self.peek().map(|t| t.tok.clone()) {
                        Some(Tok::RBrace) => break,
                        Some(Tok::Str(key)) => {
                            self.advance();
                            self.eat(&Tok::Colon)?;
                            entries.push((key, self.parse_expr()?));
                        }
                        Some(Tok::Ident(key)) => {
                            self.advance();
                            self.eat(&Tok::Colon)?;
                            entries.push((key, self.parse_expr()?));
                        }
                        _ => return Err(self.err("expected object key")),
                    }
                    if self.peek().map(|t| &t.tok) == Some(&Tok::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.eat(&Tok::RBrace)?;
                Ok(Expr::Object(entries))
            }
            Tok::Ident(name) => {
                // Call only when '(' follows on the same line.
                let is_call = self
                    .peek()
                    .is_some_and(|t| t.tok == Tok::LParen && !t.nl_before);
                if is_call {
                    self.advance();
                    let mut args = Vec::new();
                    loop {
                        if self.peek().map(|t| &t.tok) == Some(&Tok::RParen) {
                            break;
                        }
                        args.push(self.parse_expr()?);
                        if self.peek().map(|t| &t.tok) == Some(&Tok::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                    self.eat(&Tok::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(ExecError::Parse {
                line: token.line,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }
}

// ── Evaluator ────────────────────────────────────────────────────────────────

struct Interp {
    env: HashMap<String, Value>,
    printed: Vec<String>,
    ops_left: u64,
    max_ops: u64,
}

impl Program {
    pub fn parse(code: &str) -> Result<Self, ExecError> {
        let tokens = lex(code)?;
        let mut parser = Parser { tokens, pos: 0 };
        let mut stmts = Vec::new();
        while parser.peek().is_some() {
            stmts.push(parser.parse_stmt()?);
        }
        Ok(Self { stmts })
    }

    pub fn eval(&self, data: Value, max_ops: u64) -> Result<RunOutcome, ExecError> {
        let mut interp = Interp {
            env: HashMap::from([("data".to_string(), data)]),
            printed: Vec::new(),
            ops_left: max_ops,
            max_ops,
        };
        for stmt in &self.stmts {
            interp.exec(stmt)?;
        }
        Ok(RunOutcome { result: interp.env.remove("result"), printed: interp.printed })
    }
}

impl Interp {
    fn charge(&mut self) -> Result<(), ExecError> {
        if self.ops_left == 0 {
            return Err(ExecError::BudgetExceeded(self.max_ops));
        }
        self.ops_left -= 1;
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), ExecError> {
        self.charge()?;
        match stmt {
            Stmt::Let(name, expr) | Stmt::Assign(name, expr) => {
                let value = self.eval(expr)?;
                self.env.insert(name.clone(), value);
            }
            Stmt::AssignIndex(name, indices, expr) => {
                let value = self.eval(expr)?;
                let index_values: Vec<Value> =
                    indices.iter().map(|i| self.eval(i)).collect::<Result<_, _>>()?;
                let target = self
                    .env
                    .get_mut(name)
                    .ok_or_else(|| ExecError::Runtime(format!("undefined variable '{name}'")))?;
                let mut slot = target;
                for index in &index_values {
                    slot = match (slot, index) {
                        (Value::Array(items), Value::Number(n)) => {
                            let i = n.as_u64().ok_or_else(|| {
                                ExecError::Runtime("negative array index".into())
                            })? as usize;
                            items.get_mut(i).ok_or_else(|| {
                                ExecError::Runtime(format!("index {i} out of bounds"))
                            })?
                        }
                        (Value::Object(map), Value::String(key)) => {
                            map.entry(key.clone()).or_insert(Value::Null)
                        }
                        _ => return Err(ExecError::Runtime("invalid assignment target".into())),
                    };
                }
                *slot = value;
            }
            Stmt::If(cond, then_block, else_block) => {
                let branch = if truthy(&self.eval(cond)?) { then_block } else { else_block };
                for s in branch {
                    self.exec(s)?;
                }
            }
            Stmt::For(var, iterable, body) => {
                let items = match self.eval(iterable)? {
                    Value::Array(items) => items,
                    Value::String(s) => s.chars().map(|c| json!(c.to_string())).collect(),
                    Value::Object(map) => map.keys().map(|k| json!(k)).collect(),
                    other => {
                        return Err(ExecError::Runtime(format!(
                            "cannot iterate over {}",
                            type_name(&other)
                        )));
                    }
                };
                for item in items {
                    self.env.insert(var.clone(), item);
                    for s in body {
                        self.exec(s)?;
                    }
                }
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExecError> {
        self.charge()?;
        match expr {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Array(items) => {
                let values: Vec<Value> = items.iter().map(|e| self.eval(e)).collect::<Result<_, _>>()?;
                Ok(Value::Array(values))
            }
            Expr::Object(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value_expr) in entries {
                    map.insert(key.clone(), self.eval(value_expr)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Var(name) => self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| ExecError::Runtime(format!("undefined variable '{name}'"))),
            Expr::Neg(inner) => {
                let v = self.eval(inner)?;
                match v {
                    Value::Number(n) if n.is_i64() => Ok(json!(-n.as_i64().unwrap_or(0))),
                    Value::Number(n) => Ok(json!(-n.as_f64().unwrap_or(0.0))),
                    other => Err(ExecError::Runtime(format!("cannot negate {}", type_name(&other)))),
                }
            }
            Expr::Not(inner) => {
                let v = self.eval(inner)?;
                Ok(json!(!truthy(&v)))
            }
            Expr::Binary(op, left, right) => {
                // Short-circuit logic before evaluating the right side.
                if *op == Tok::AndAnd {
                    let l = self.eval(left)?;
                    if !truthy(&l) {
                        return Ok(json!(false));
                    }
                    let r = self.eval(right)?;
                    return Ok(json!(truthy(&r)));
                }
                if *op == Tok::OrOr {
                    let l = self.eval(left)?;
                    if truthy(&l) {
                        return Ok(json!(true));
                    }
                    let r = self.eval(right)?;
                    return Ok(json!(truthy(&r)));
                }
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary_op(op, l, r)
            }
            Expr::Index(target, index) => {
                let t = self.eval(target)?;
                let i = self.eval(index)?;
                match (&t, &i) {
                    (Value::Array(items), Value::Number(n)) => {
                        let idx = n.as_u64().ok_or_else(|| {
                            ExecError::Runtime("negative array index".into())
                        })? as usize;
                        items
                            .get(idx)
                            .cloned()
                            .ok_or_else(|| ExecError::Runtime(format!("index {idx} out of bounds")))
                    }
                    (Value::Object(map), Value::String(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
                    (Value::String(s), Value::Number(n)) => {
                        let idx = n.as_u64().unwrap_or(0) as usize;
                        s.chars()
                            .nth(idx)
                            .map(|c| json!(c.to_string()))
                            .ok_or_else(|| ExecError::Runtime(format!("index {idx} out of bounds")))
                    }
                    _ => Err(ExecError::Runtime(format!(
                        "cannot index {} with {}",
                        type_name(&t),
                        type_name(&i)
                    ))),
                }
            }
            Expr::Call(name, args) => {
                let values: Vec<Value> = args.iter().map(|a| self.eval(a)).collect::<Result<_, _>>()?;
                self.call_builtin(name, values)
            }
        }
    }

    fn call_builtin(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        if !BUILTIN_NAMES.contains(&name) {
            return Err(ExecError::UnknownFunction(name.to_string()));
        }
        let arity_err = |want: &str| ExecError::Runtime(format!("{name} expects {want}"));
        match name {
            "print" => {
                let text = args
                    .iter()
                    .map(display)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.printed.push(text);
                Ok(Value::Null)
            }
            "abs" => match args.first() {
                Some(Value::Number(n)) if n.is_i64() => Ok(json!(n.as_i64().unwrap_or(0).abs())),
                Some(Value::Number(n)) => Ok(json!(n.as_f64().unwrap_or(0.0).abs())),
                _ => Err(arity_err("one number")),
            },
            "min" | "max" => {
                let items: Vec<Value> = match args.as_slice() {
                    [Value::Array(items)] => items.clone(),
                    _ => args,
                };
                let mut nums: Vec<f64> = Vec::with_capacity(items.len());
                let mut all_int = true;
                for v in &items {
                    let n = v.as_f64().ok_or_else(|| arity_err("numbers"))?;
                    all_int &= v.as_i64().is_some();
                    nums.push(n);
                }
                let picked = if name == "min" {
                    nums.iter().cloned().fold(f64::INFINITY, f64::min)
                } else {
                    nums.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
                };
                if nums.is_empty() {
                    return Err(arity_err("at least one number"));
                }
                Ok(if all_int { json!(picked as i64) } else { json!(picked) })
            }
            "round" => {
                let x = args.first().and_then(Value::as_f64).ok_or_else(|| arity_err("a number"))?;
                let digits = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                let factor = 10f64.powi(digits as i32);
                let rounded = (x * factor).round() / factor;
                if digits <= 0 && rounded.fract() == 0.0 && args.first().and_then(Value::as_i64).is_some() {
                    Ok(json!(rounded as i64))
                } else {
                    Ok(json!(rounded))
                }
            }
            "floor" => Ok(json!(args.first().and_then(Value::as_f64).ok_or_else(|| arity_err("a number"))?.floor() as i64)),
            "ceil" => Ok(json!(args.first().and_then(Value::as_f64).ok_or_else(|| arity_err("a number"))?.ceil() as i64)),
            "sqrt" => Ok(json!(args.first().and_then(Value::as_f64).ok_or_else(|| arity_err("a number"))?.sqrt())),
            "pow" => {
                let base = args.first().and_then(Value::as_f64).ok_or_else(|| arity_err("two numbers"))?;
                let exp = args.get(1).and_then(Value::as_f64).ok_or_else(|| arity_err("two numbers"))?;
                Ok(json!(base.powf(exp)))
            }
            "len" => match args.first() {
                Some(Value::Array(items)) => Ok(json!(items.len())),
                Some(Value::String(s)) => Ok(json!(s.chars().count())),
                Some(Value::Object(map)) => Ok(json!(map.len())),
                _ => Err(arity_err("an array, string, or object")),
            },
            "sum" => match args.first() {
                Some(Value::Array(items)) => {
                    let mut total = 0.0;
                    let mut all_int = true;
                    for v in items {
                        total += v.as_f64().ok_or_else(|| arity_err("an array of numbers"))?;
                        all_int &= v.as_i64().is_some();
                    }
                    Ok(if all_int { json!(total as i64) } else { json!(total) })
                }
                _ => Err(arity_err("an array of numbers")),
            },
            "sorted" => match args.into_iter().next() {
                Some(Value::Array(mut items)) => {
                    items.sort_by(|a, b| match (a.as_f64(), b.as_f64()) {
                        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                        _ => display(a).cmp(&display(b)),
                    });
                    Ok(Value::Array(items))
                }
                _ => Err(arity_err("an array")),
            },
            "range" => {
                let (start, end) = match args.len() {
                    1 => (0, args[0].as_i64().ok_or_else(|| arity_err("integers"))?),
                    _ => (
                        args[0].as_i64().ok_or_else(|| arity_err("integers"))?,
                        args.get(1).and_then(Value::as_i64).ok_or_else(|| arity_err("integers"))?,
                    ),
                };
                let mut items = Vec::new();
                let mut i = start;
                while i < end {
                    // The budget covers materialization so huge ranges stop
                    // here instead of exhausting memory.
                    self.charge()?;
                    items.push(json!(i));
                    i += 1;
                }
                Ok(Value::Array(items))
            }
            "append" => {
                let mut iter = args.into_iter();
                match (iter.next(), iter.next()) {
                    (Some(Value::Array(mut items)), Some(value)) => {
                        items.push(value);
                        Ok(Value::Array(items))
                    }
                    _ => Err(arity_err("an array and a value")),
                }
            }
            "join" => {
                let sep = args.get(1).and_then(Value::as_str).unwrap_or(",").to_string();
                match args.into_iter().next() {
                    Some(Value::Array(items)) => {
                        Ok(json!(items.iter().map(display).collect::<Vec<_>>().join(&sep)))
                    }
                    _ => Err(arity_err("an array")),
                }
            }
            "split" => {
                let s = args.first().and_then(Value::as_str).ok_or_else(|| arity_err("a string"))?;
                let sep = args.get(1).and_then(Value::as_str).unwrap_or(" ");
                Ok(json!(s.split(sep).map(|p| p.to_string()).collect::<Vec<_>>()))
            }
            "upper" => Ok(json!(args.first().and_then(Value::as_str).ok_or_else(|| arity_err("a string"))?.to_uppercase())),
            "lower" => Ok(json!(args.first().and_then(Value::as_str).ok_or_else(|| arity_err("a string"))?.to_lowercase())),
            "trim" => Ok(json!(args.first().and_then(Value::as_str).ok_or_else(|| arity_err("a string"))?.trim())),
            "str" => Ok(json!(args.first().map(display).unwrap_or_default())),
            "num" => {
                let v = args.first().ok_or_else(|| arity_err("one value"))?;
                match v {
                    Value::Number(_) => Ok(v.clone()),
                    Value::String(s) => s
                        .trim()
                        .parse::<f64>()
                        .map(|f| if f.fract() == 0.0 { json!(f as i64) } else { json!(f) })
                        .map_err(|_| ExecError::Runtime(format!("cannot parse '{s}' as a number"))),
                    other => Err(ExecError::Runtime(format!("cannot convert {} to number", type_name(other)))),
                }
            }
            "keys" => match args.first() {
                Some(Value::Object(map)) => Ok(json!(map.keys().cloned().collect::<Vec<_>>())),
                _ => Err(arity_err("an object")),
            },
            "values" => match args.into_iter().next() {
                Some(Value::Object(map)) => Ok(Value::Array(map.into_iter().map(|(_, v)| v).collect())),
                _ => Err(arity_err("an object")),
            },
            "contains" => {
                let haystack = args.first().ok_or_else(|| arity_err("two values"))?;
                let needle = args.get(1).ok_or_else(|| arity_err("two values"))?;
                let found = match haystack {
                    Value::Array(items) => items.contains(needle),
                    Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
                    Value::Object(map) => needle.as_str().map(|n| map.contains_key(n)).unwrap_or(false),
                    _ => false,
                };
                Ok(json!(found))
            }
            "date_now" => Ok(json!(chrono::Utc::now().to_rfc3339())),
            "date_today" => Ok(json!(chrono::Utc::now().format("%Y-%m-%d").to_string())),
            "json_parse" => {
                let s = args.first().and_then(Value::as_str).ok_or_else(|| arity_err("a string"))?;
                serde_json::from_str(s).map_err(|e| ExecError::Runtime(format!("invalid JSON: {e}")))
            }
            "json_dump" => {
                let v = args.first().ok_or_else(|| arity_err("one value"))?;
                Ok(json!(serde_json::to_string(v).unwrap_or_default()))
            }
            _ => Err(ExecError::UnknownFunction(name.to_string())),
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Human rendering: strings bare, everything else as compact JSON.
fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn binary_op(op: &Tok, l: Value, r: Value) -> Result<Value, ExecError> {
    // String concatenation with +.
    if *op == Tok::Plus {
        if let (Value::String(a), b) = (&l, &r) {
            return Ok(json!(format!("{a}{}", display(b))));
        }
        if let (a, Value::String(b)) = (&l, &r) {
            return Ok(json!(format!("{}{b}", display(a))));
        }
    }

    match op {
        Tok::EqEq => return Ok(json!(l == r)),
        Tok::Ne => return Ok(json!(l != r)),
        _ => {}
    }

    let (a, b) = match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            // Lexicographic comparison for strings.
            if let (Value::String(a), Value::String(b)) = (&l, &r) {
                return Ok(match op {
                    Tok::Lt => json!(a < b),
                    Tok::Le => json!(a <= b),
                    Tok::Gt => json!(a > b),
                    Tok::Ge => json!(a >= b),
                    _ => {
                        return Err(ExecError::Runtime(format!(
                            "invalid operands for {op:?}: string, string"
                        )));
                    }
                });
            }
            return Err(ExecError::Runtime(format!(
                "invalid operands for {op:?}: {}, {}",
                type_name(&l),
                type_name(&r)
            )));
        }
    };

    let both_int = l.as_i64().is_some() && r.as_i64().is_some();
    let num = |x: f64| -> Value {
        if both_int && x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
            json!(x as i64)
        } else {
            json!(x)
        }
    };

    Ok(match op {
        Tok::Plus => num(a + b),
        Tok::Minus => num(a - b),
        Tok::Star => num(a * b),
        Tok::Slash => {
            if b == 0.0 {
                return Err(ExecError::Runtime("division by zero".into()));
            }
            // Division always yields a float; integer results stay exact.
            let q = a / b;
            if both_int && q.fract() == 0.0 { json!(q as i64) } else { json!(q) }
        }
        Tok::Percent => {
            if b == 0.0 {
                return Err(ExecError::Runtime("modulo by zero".into()));
            }
            num(a % b)
        }
        Tok::Lt => json!(a < b),
        Tok::Le => json!(a <= b),
        Tok::Gt => json!(a > b),
        Tok::Ge => json!(a >= b),
        other => return Err(ExecError::Runtime(format!("unsupported operator {other:?}"))),
    })
}
