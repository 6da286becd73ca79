//! A minimal scripting language sufficient to drive every task a worker
//! needs to run: numeric/string expressions, assignment, `while`/`if`
//! control flow, function definitions, and a fixed builtin table bridging
//! into the task/worker API and into NDArrays.
//!
//! This does not attempt to parse any existing guest language (Python,
//! Groovy, …) — the worker side of this crate has no process-in-process
//! interpreter to shell out to, so [`ExprEngine`] is a small interpreter of
//! its own: tokenizer, recursive-descent parser, tree-walking evaluator.
//! Grammar:
//!
//! ```text
//! program    := stmt*
//! block      := '{' stmt* '}'
//! stmt       := "fn" ident '(' params ')' block
//!             | "while" '(' expr ')' block
//!             | "if" '(' expr ')' block ("else" block)?
//!             | ident '=' expr
//!             | expr
//! expr       := or
//! or         := and ("||" and)*
//! and        := equality ("&&" equality)*
//! equality   := relational (("==" | "!=") relational)*
//! relational := additive (("<" | ">" | "<=" | ">=") additive)*
//! additive   := multiplicative (("+" | "-") multiplicative)*
//! multiplicative := unary (("*" | "/" | "%") unary)*
//! unary      := ("-" | "!") unary | postfix
//! postfix    := primary ("." ident ('(' args ')')? | '(' args ')')*
//! primary    := number | string | "true" | "false" | "null" | ident | '(' expr ')'
//! ```
//!
//! If the last statement of the script is a bare expression, its value is
//! the script's result; any other statement kind produces no result. `#`
//! starts a line comment.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::{Callable, OpaqueHandle, Value};

use super::engine::{ExecutionContext, ScriptEngine};

/// The crate's one concrete [`ScriptEngine`].
#[derive(Debug, Default)]
pub struct ExprEngine;

impl ScriptEngine for ExprEngine {
    fn execute(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>, String> {
        let tokens = tokenize(ctx.script)?;
        let program = Parser::new(tokens).parse_program()?;
        exec_block(&program, ctx)
    }
}

// ---------------------------------------------------------------- tokens --

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Symbol(&'static str),
    Eof,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                if chars[i] == '.' {
                    if is_float {
                        break;
                    }
                    is_float = true;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            if is_float {
                tokens.push(Token::Float(
                    text.parse().map_err(|_| format!("bad number: {text}"))?,
                ));
            } else {
                tokens.push(Token::Int(
                    text.parse().map_err(|_| format!("bad number: {text}"))?,
                ));
            }
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c == '"' {
            i += 1;
            let mut s = String::new();
            while i < chars.len() && chars[i] != '"' {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    i += 1;
                    s.push(match chars[i] {
                        'n' => '\n',
                        't' => '\t',
                        '"' => '"',
                        '\\' => '\\',
                        other => other,
                    });
                } else {
                    s.push(chars[i]);
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err("unterminated string literal".to_string());
            }
            i += 1;
            tokens.push(Token::Str(s));
            continue;
        }
        if i + 1 < chars.len() {
            let two: String = chars[i..i + 2].iter().collect();
            let sym = match two.as_str() {
                "==" => Some("=="),
                "!=" => Some("!="),
                "<=" => Some("<="),
                ">=" => Some(">="),
                "&&" => Some("&&"),
                "||" => Some("||"),
                _ => None,
            };
            if let Some(sym) = sym {
                tokens.push(Token::Symbol(sym));
                i += 2;
                continue;
            }
        }
        let sym = match c {
            '(' => "(",
            ')' => ")",
            '{' => "{",
            '}' => "}",
            ',' => ",",
            '.' => ".",
            '=' => "=",
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '%' => "%",
            '<' => "<",
            '>' => ">",
            '!' => "!",
            other => return Err(format!("unexpected character: {other:?}")),
        };
        tokens.push(Token::Symbol(sym));
        i += 1;
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

// ------------------------------------------------------------------ ast --

#[derive(Debug, Clone)]
enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    Call(Box<Expr>, Vec<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Stmt {
    FnDef(String, Vec<String>, Vec<Stmt>),
    While(Expr, Vec<Stmt>),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    Assign(String, Expr),
    Expr(Expr),
}

// --------------------------------------------------------------- parser --

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn check_symbol(&self, s: &str) -> bool {
        matches!(self.peek(), Token::Symbol(sym) if *sym == s)
    }

    fn check_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == kw)
    }

    fn expect_symbol(&mut self, s: &str) -> Result<(), String> {
        if self.check_symbol(s) {
            self.advance();
            Ok(())
        } else {
            Err(format!("expected {s:?}, found {:?}", self.peek()))
        }
    }

    fn expect_ident(&mut self) -> Result<String, String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>, String> {
        let mut stmts = Vec::new();
        while !self.at_end() {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, String> {
        self.expect_symbol("{")?;
        let mut stmts = Vec::new();
        while !self.check_symbol("}") {
            if self.at_end() {
                return Err("unexpected end of script inside block".to_string());
            }
            stmts.push(self.parse_stmt()?);
        }
        self.expect_symbol("}")?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, String> {
        if self.check_keyword("fn") {
            self.advance();
            let name = self.expect_ident()?;
            self.expect_symbol("(")?;
            let mut params = Vec::new();
            while !self.check_symbol(")") {
                params.push(self.expect_ident()?);
                if self.check_symbol(",") {
                    self.advance();
                }
            }
            self.expect_symbol(")")?;
            let body = self.parse_block()?;
            return Ok(Stmt::FnDef(name, params, body));
        }
        if self.check_keyword("while") {
            self.advance();
            self.expect_symbol("(")?;
            let cond = self.parse_expr()?;
            self.expect_symbol(")")?;
            let body = self.parse_block()?;
            return Ok(Stmt::While(cond, body));
        }
        if self.check_keyword("if") {
            self.advance();
            self.expect_symbol("(")?;
            let cond = self.parse_expr()?;
            self.expect_symbol(")")?;
            let then_body = self.parse_block()?;
            let else_body = if self.check_keyword("else") {
                self.advance();
                self.parse_block()?
            } else {
                Vec::new()
            };
            return Ok(Stmt::If(cond, then_body, else_body));
        }
        if let Token::Ident(name) = self.peek().clone() {
            if matches!(self.peek_at(1), Token::Symbol("=")) {
                self.advance();
                self.advance();
                let expr = self.parse_expr()?;
                return Ok(Stmt::Assign(name, expr));
            }
        }
        Ok(Stmt::Expr(self.parse_expr()?))
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.check_symbol("||") {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_equality()?;
        while self.check_symbol("&&") {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_relational()?;
        loop {
            let op = if self.check_symbol("==") {
                BinOp::Eq
            } else if self.check_symbol("!=") {
                BinOp::Ne
            } else {
                break;
            };
            self.advance();
            let right = self.parse_relational()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.check_symbol("<=") {
                BinOp::Le
            } else if self.check_symbol(">=") {
                BinOp::Ge
            } else if self.check_symbol("<") {
                BinOp::Lt
            } else if self.check_symbol(">") {
                BinOp::Gt
            } else {
                break;
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.check_symbol("+") {
                BinOp::Add
            } else if self.check_symbol("-") {
                BinOp::Sub
            } else {
                break;
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.check_symbol("*") {
                BinOp::Mul
            } else if self.check_symbol("/") {
                BinOp::Div
            } else if self.check_symbol("%") {
                BinOp::Mod
            } else {
                break;
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.check_symbol("-") {
            self.advance();
            return Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)));
        }
        if self.check_symbol("!") {
            self.advance();
            return Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check_symbol(".") {
                self.advance();
                let name = self.expect_ident()?;
                if self.check_symbol("(") {
                    let args = self.parse_args()?;
                    expr = Expr::Call(Box::new(Expr::Field(Box::new(expr), name)), args);
                } else {
                    expr = Expr::Field(Box::new(expr), name);
                }
            } else if self.check_symbol("(") {
                let args = self.parse_args()?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, String> {
        self.expect_symbol("(")?;
        let mut args = Vec::new();
        while !self.check_symbol(")") {
            args.push(self.parse_expr()?);
            if self.check_symbol(",") {
                self.advance();
            }
        }
        self.expect_symbol(")")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Token::Int(i) => Ok(Expr::Int(i)),
            Token::Float(f) => Ok(Expr::Float(f)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ => Ok(Expr::Ident(name)),
            },
            Token::Symbol("(") => {
                let expr = self.parse_expr()?;
                self.expect_symbol(")")?;
                Ok(expr)
            }
            other => Err(format!("unexpected token: {other:?}")),
        }
    }
}

// ------------------------------------------------------------- evaluator --

fn exec_block(stmts: &[Stmt], ctx: &mut ExecutionContext) -> Result<Option<Value>, String> {
    let mut last_value = None;
    for (i, stmt) in stmts.iter().enumerate() {
        let is_last = i + 1 == stmts.len();
        last_value = None;
        match stmt {
            Stmt::FnDef(name, params, body) => {
                let params = params.clone();
                let body = Arc::new(body.clone());
                let func = Value::Callable(Callable::new(move |args: &[Value]| {
                    call_user_function(&params, &body, args)
                }));
                ctx.set(name.clone(), func);
            }
            Stmt::Assign(name, expr) => {
                let value = eval(expr, ctx)?;
                ctx.set(name.clone(), value);
            }
            Stmt::While(cond, body) => loop {
                if ctx.cancel_requested() {
                    ctx.cancel();
                    return Err("task canceled".to_string());
                }
                if !truthy(&eval(cond, ctx)?) {
                    break;
                }
                exec_block(body, ctx)?;
            },
            Stmt::If(cond, then_body, else_body) => {
                if truthy(&eval(cond, ctx)?) {
                    exec_block(then_body, ctx)?;
                } else {
                    exec_block(else_body, ctx)?;
                }
            }
            Stmt::Expr(expr) => {
                let value = eval(expr, ctx)?;
                if is_last {
                    last_value = Some(value);
                }
            }
        }
    }
    Ok(last_value)
}

fn call_user_function(params: &[String], body: &[Stmt], args: &[Value]) -> Result<Value, String> {
    let mut bindings = HashMap::new();
    for (p, a) in params.iter().zip(args.iter()) {
        bindings.insert(p.clone(), a.clone());
    }
    let mut ctx = ExecutionContext::detached(bindings);
    let result = exec_block(body, &mut ctx)?;
    Ok(result.unwrap_or(Value::Null))
}

fn eval(expr: &Expr, ctx: &mut ExecutionContext) -> Result<Value, String> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::Int(*i)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Ident(name) => ctx
            .get(name)
            .ok_or_else(|| format!("undefined variable: {name}")),
        Expr::Unary(op, inner) => {
            let v = eval(inner, ctx)?;
            apply_unary(*op, v)
        }
        Expr::Binary(BinOp::And, l, r) => {
            let lv = eval(l, ctx)?;
            if !truthy(&lv) {
                return Ok(Value::Bool(false));
            }
            let rv = eval(r, ctx)?;
            Ok(Value::Bool(truthy(&rv)))
        }
        Expr::Binary(BinOp::Or, l, r) => {
            let lv = eval(l, ctx)?;
            if truthy(&lv) {
                return Ok(Value::Bool(true));
            }
            let rv = eval(r, ctx)?;
            Ok(Value::Bool(truthy(&rv)))
        }
        Expr::Binary(op, l, r) => {
            let lv = eval(l, ctx)?;
            let rv = eval(r, ctx)?;
            apply_binary(*op, lv, rv)
        }
        Expr::Field(obj, attr) => {
            let v = eval(obj, ctx)?;
            field_access(&v, attr)
        }
        Expr::Call(callee, args) => {
            let mut arg_values = Vec::with_capacity(args.len());
            for a in args {
                arg_values.push(eval(a, ctx)?);
            }
            call(callee, &arg_values, ctx)
        }
    }
}

fn call(callee: &Expr, args: &[Value], ctx: &mut ExecutionContext) -> Result<Value, String> {
    if let Expr::Field(obj, method) = callee {
        if let Expr::Ident(name) = &**obj {
            if name == "task" {
                return call_task_method(method, args, ctx);
            }
        }
        return Err(format!("unsupported method call: .{method}"));
    }
    if let Expr::Ident(name) = callee {
        if let Some(Value::Callable(c)) = ctx.get(name) {
            return c.call(args);
        }
        return call_builtin(name, args);
    }
    Err("expression is not callable".to_string())
}

fn call_task_method(
    method: &str,
    args: &[Value],
    ctx: &ExecutionContext,
) -> Result<Value, String> {
    match method {
        "update" => {
            let message = args.first().and_then(|v| v.as_str().map(str::to_string));
            let current = args.get(1).and_then(Value::as_i64);
            let maximum = args.get(2).and_then(Value::as_i64);
            let info = args.get(3).and_then(|v| v.as_map().cloned());
            ctx.update(message, current, maximum, info);
            Ok(Value::Null)
        }
        "export" => {
            let name = args
                .first()
                .and_then(|v| v.as_str())
                .ok_or("task.export requires a name string")?
                .to_string();
            let value = args.get(1).cloned().unwrap_or(Value::Null);
            ctx.export(name, value);
            Ok(Value::Null)
        }
        "set_output" => {
            let name = args
                .first()
                .and_then(|v| v.as_str())
                .ok_or("task.set_output requires a name string")?
                .to_string();
            let value = args.get(1).cloned().unwrap_or(Value::Null);
            ctx.set_output(name, value);
            Ok(Value::Null)
        }
        "cancel_requested" => Ok(Value::Bool(ctx.cancel_requested())),
        "cancel" => {
            ctx.cancel();
            Ok(Value::Null)
        }
        "fail" => {
            let msg = args.first().and_then(|v| v.as_str()).unwrap_or("");
            ctx.fail(msg);
            Ok(Value::Null)
        }
        other => Err(format!("unknown task method: {other}")),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "sqrt" => {
            let x = args
                .first()
                .and_then(Value::as_f64)
                .ok_or("sqrt expects a number")?;
            Ok(Value::Float(x.sqrt()))
        }
        "abs" => match args.first() {
            Some(Value::Int(i)) => Ok(Value::Int(i.abs())),
            Some(Value::Float(f)) => Ok(Value::Float(f.abs())),
            _ => Err("abs expects a number".to_string()),
        },
        "floor" => {
            let x = args
                .first()
                .and_then(Value::as_f64)
                .ok_or("floor expects a number")?;
            Ok(Value::Int(x.floor() as i64))
        }
        "len" => match args.first() {
            Some(Value::String(s)) => Ok(Value::Int(s.chars().count() as i64)),
            Some(Value::List(items)) => Ok(Value::Int(items.len() as i64)),
            Some(Value::Map(m)) => Ok(Value::Int(m.len() as i64)),
            _ => Err("len expects a string, list, or map".to_string()),
        },
        "str" => Ok(Value::String(
            args.first().map(ToString::to_string).unwrap_or_default(),
        )),
        "sleep" => {
            let ms = args.first().and_then(Value::as_i64).unwrap_or(0).max(0);
            std::thread::sleep(std::time::Duration::from_millis(ms as u64));
            Ok(Value::Null)
        }
        "thread_name" => Ok(Value::String(
            std::thread::current().name().unwrap_or("").to_string(),
        )),
        "opaque" => {
            let type_name = args
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or("demo_opaque")
                .to_string();
            Ok(Value::Opaque(OpaqueHandle::new(type_name)))
        }
        "byte_sum" => {
            let r = match args.first() {
                Some(Value::NDArray(r)) => r,
                _ => return Err("byte_sum expects an ndarray".to_string()),
            };
            let arr = crate::ndarray::NDArray::from_ref(r).map_err(|e| e.to_string())?;
            Ok(Value::Int(arr.byte_sum() as i64))
        }
        other => Err(format!("unknown function: {other}")),
    }
}

fn field_access(value: &Value, attr: &str) -> Result<Value, String> {
    match value {
        Value::NDArray(nd) => match attr {
            "dtype" => Ok(Value::String(nd.dtype.clone())),
            "shape" => Ok(Value::List(
                nd.shape.iter().map(|&n| Value::Int(n as i64)).collect(),
            )),
            "shm" => Ok(Value::Shm(nd.shm.clone())),
            other => Err(format!("ndarray has no field {other}")),
        },
        Value::Shm(shm) => match attr {
            "name" => Ok(Value::String(shm.name.clone())),
            "rsize" => Ok(Value::Int(shm.rsize as i64)),
            other => Err(format!("shm has no field {other}")),
        },
        Value::Map(m) => m
            .get(attr)
            .cloned()
            .ok_or_else(|| format!("no such field: {attr}")),
        other => Err(format!("{other} has no fields")),
    }
}

fn apply_unary(op: UnOp, v: Value) -> Result<Value, String> {
    match op {
        UnOp::Neg => match v {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err("unary - expects a number".to_string()),
        },
        UnOp::Not => Ok(Value::Bool(!truthy(&v))),
    }
}

fn apply_binary(op: BinOp, l: Value, r: Value) -> Result<Value, String> {
    use BinOp::*;
    match op {
        Add => match (&l, &r) {
            (Value::String(a), _) => Ok(Value::String(format!("{a}{r}"))),
            (_, Value::String(b)) => Ok(Value::String(format!("{l}{b}"))),
            _ => numeric_binop(l, r, |a, b| a + b, |a, b| a + b),
        },
        Sub => numeric_binop(l, r, |a, b| a - b, |a, b| a - b),
        Mul => numeric_binop(l, r, |a, b| a * b, |a, b| a * b),
        Div => match (&l, &r) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err("division by zero".to_string());
                }
                Ok(Value::Int(a.div_euclid(*b)))
            }
            _ => {
                let a = l.as_f64().ok_or("/ expects numbers")?;
                let b = r.as_f64().ok_or("/ expects numbers")?;
                Ok(Value::Float(a / b))
            }
        },
        Mod => match (&l, &r) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err("modulo by zero".to_string());
                }
                Ok(Value::Int(a.rem_euclid(*b)))
            }
            _ => Err("% expects integers".to_string()),
        },
        Eq => Ok(Value::Bool(values_equal(&l, &r))),
        Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        Lt | Gt | Le | Ge => {
            let a = l.as_f64().ok_or("comparison expects numbers")?;
            let b = r.as_f64().ok_or("comparison expects numbers")?;
            Ok(Value::Bool(match op {
                Lt => a < b,
                Gt => a > b,
                Le => a <= b,
                Ge => a >= b,
                _ => unreachable!(),
            }))
        }
        And | Or => unreachable!("short-circuited in eval"),
    }
}

fn numeric_binop(
    l: Value,
    r: Value,
    fi: impl Fn(i64, i64) -> i64,
    ff: impl Fn(f64, f64) -> f64,
) -> Result<Value, String> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(fi(a, b))),
        (a, b) => {
            let af = a.as_f64().ok_or("arithmetic expects numbers")?;
            let bf = b.as_f64().ok_or("arithmetic expects numbers")?;
            Ok(Value::Float(ff(af, bf)))
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::List(items) => !items.is_empty(),
        Value::Map(m) => !m.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Args;

    fn run(script: &str, inputs: Args) -> Result<Option<Value>, String> {
        let mut bindings = HashMap::new();
        for (k, v) in &inputs {
            bindings.insert(k.clone(), v.clone());
        }
        let mut ctx = ExecutionContext::detached(bindings);
        let tokens = tokenize(script)?;
        let program = Parser::new(tokens).parse_program()?;
        exec_block(&program, &mut ctx)
    }

    #[test]
    fn script_engine_trait_object_executes() {
        let engine: Box<dyn ScriptEngine> = Box::new(ExprEngine);
        let mut ctx = ExecutionContext::detached(HashMap::new());
        let result = engine.execute(&mut ctx).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn evaluates_arithmetic_with_precedence() {
        let result = run("1 + 2 * 3", Args::new()).unwrap();
        assert_eq!(result, Some(Value::Int(7)));
    }

    #[test]
    fn collatz_style_loop_counts_steps() {
        let mut inputs = Args::new();
        inputs.insert("n".to_string(), Value::Int(6));
        let script = r#"
            steps = 0
            while (n != 1) {
                if (n % 2 == 0) { n = n / 2 } else { n = 3 * n + 1 }
                steps = steps + 1
            }
            steps
        "#;
        let result = run(script, inputs).unwrap();
        assert_eq!(result, Some(Value::Int(8)));
    }

    #[test]
    fn function_definition_and_call() {
        let mut inputs = Args::new();
        inputs.insert("age".to_string(), Value::Float(16.0));
        let script = r#"
            fn sqrt_age(a) { sqrt(a) }
            sqrt_age(age)
        "#;
        let result = run(script, inputs).unwrap();
        assert_eq!(result, Some(Value::Float(4.0)));
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let err = run("x + 1", Args::new()).unwrap_err();
        assert!(err.contains("undefined variable"));
    }

    #[test]
    fn string_concatenation_via_plus() {
        let result = run(r#""a" + "b""#, Args::new()).unwrap();
        assert_eq!(result, Some(Value::String("ab".to_string())));
    }
}
