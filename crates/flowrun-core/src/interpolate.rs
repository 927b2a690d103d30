// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Variable interpolation with a small expression sublanguage.
//!
//! Strings may embed `{{ expression }}` tokens. An expression is a dotted
//! path (`variables.a.b`, `steps.fetch.status`, `env.HOME`,
//! `workflow.id`), an array index (`items[0]`), a literal, or a function
//! call (`upper(name)`). Expressions are parsed with a hand-written
//! recursive-descent parser; there is no runtime code evaluation.
//!
//! After substitution the result may itself contain tokens, so
//! interpolation re-runs until it reaches a fixed point or exceeds the
//! depth cap.

use crate::context::ExecutionContext;
use crate::error::InterpolationError;
use chrono::Utc;
use serde_json::{json, Value};

/// Interpolation behavior switches.
#[derive(Debug, Clone)]
pub struct InterpolationOptions {
    /// Missing paths are errors instead of empty strings.
    pub strict: bool,

    /// Re-interpolation cap.
    pub max_depth: usize,
}

impl Default for InterpolationOptions {
    fn default() -> Self {
        Self {
            strict: false,
            max_depth: 10,
        }
    }
}

/// Resolves `{{ expr }}` tokens against an [`ExecutionContext`].
#[derive(Debug, Clone, Default)]
pub struct Interpolator {
    options: InterpolationOptions,
}

type Result<T> = std::result::Result<T, InterpolationError>;

impl Interpolator {
    pub fn new(options: InterpolationOptions) -> Self {
        Self { options }
    }

    pub fn strict(&self) -> bool {
        self.options.strict
    }

    /// Interpolates every string leaf of a JSON-like value. A string that
    /// is exactly one `{{ expr }}` token keeps the expression's native
    /// type; anything else renders to a string.
    pub fn interpolate(&self, ctx: &ExecutionContext, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => self.interpolate_string_value(ctx, s),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.interpolate(ctx, item)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.interpolate(ctx, v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Interpolates a string, rendering every token into string context.
    pub fn interpolate_str(&self, ctx: &ExecutionContext, input: &str) -> Result<String> {
        let mut current = input.to_string();
        for _ in 0..self.options.max_depth {
            let next = self.render_pass(ctx, &current, self.options.strict)?;
            if next == current {
                return Ok(next);
            }
            current = next;
            if !current.contains("{{") {
                return Ok(current);
            }
        }
        Err(InterpolationError::MaxDepthExceeded(self.options.max_depth))
    }

    /// Evaluates a step condition. Conditions are expressions in the same
    /// sublanguage; missing paths resolve permissively so that
    /// `condition: "false"` and the empty string stay falsy regardless of
    /// the configured strictness.
    pub fn evaluate_condition(&self, ctx: &ExecutionContext, condition: &str) -> Result<bool> {
        let trimmed = condition.trim();
        if trimmed.is_empty() {
            return Ok(false);
        }
        let rendered = if trimmed.contains("{{") {
            let mut current = trimmed.to_string();
            for _ in 0..self.options.max_depth {
                let next = self.render_pass(ctx, &current, false)?;
                if next == current {
                    break;
                }
                current = next;
                if !current.contains("{{") {
                    break;
                }
            }
            current
        } else {
            match parse_expression(trimmed) {
                Ok(expr) => {
                    let value = self.eval(ctx, &expr, false)?;
                    coerce_to_string(&value)
                }
                // Not a parseable expression: judge the raw text.
                Err(_) => trimmed.to_string(),
            }
        };
        Ok(is_truthy(&rendered))
    }

    /// One left-to-right substitution pass. A string that is exactly one
    /// token evaluates to that expression's string form here; the typed
    /// variant is handled by [`interpolate`].
    ///
    /// [`interpolate`]: Interpolator::interpolate
    fn render_pass(&self, ctx: &ExecutionContext, input: &str, strict: bool) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];
            match after_open.find("}}") {
                None => {
                    // Unclosed token: emit verbatim, no error.
                    out.push_str(&rest[open..]);
                    return Ok(out);
                }
                Some(close) => {
                    let expression = &after_open[..close];
                    let expr = parse_expression(expression)?;
                    let value = self.eval(ctx, &expr, strict)?;
                    out.push_str(&coerce_to_string(&value));
                    rest = &after_open[close + 2..];
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    fn interpolate_string_value(&self, ctx: &ExecutionContext, s: &str) -> Result<Value> {
        if let Some(expression) = single_token(s) {
            let expr = parse_expression(expression)?;
            let value = self.eval(ctx, &expr, self.options.strict)?;
            // A string result may itself carry tokens.
            if let Value::String(inner) = &value {
                if inner.contains("{{") {
                    return Ok(Value::String(self.interpolate_str(ctx, inner)?));
                }
            }
            return Ok(value);
        }
        Ok(Value::String(self.interpolate_str(ctx, s)?))
    }

    fn eval(&self, ctx: &ExecutionContext, expr: &Expr, strict: bool) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(segments) => {
                let resolved = resolve_path(ctx, segments);
                match resolved {
                    Some(v) => Ok(v),
                    None if strict => {
                        Err(InterpolationError::UndefinedVariable(path_display(segments)))
                    }
                    None => Ok(Value::Null),
                }
            }
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(ctx, arg, strict)?);
                }
                call_function(name, &values)
            }
        }
    }
}

/// Returns the inner expression when the whole string is one token.
fn single_token(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

/// Renders a value into string context. Objects and arrays are
/// JSON-serialized; null renders as the empty string.
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Condition truthiness: empty, `false`, `0` and `null` are falsy.
pub fn is_truthy(rendered: &str) -> bool {
    let t = rendered.trim();
    !(t.is_empty() || t.eq_ignore_ascii_case("false") || t == "0" || t.eq_ignore_ascii_case("null"))
}

// ---------------------------------------------------------------------------
// Expression grammar
//
//   expr     := literal | call | path
//   call     := ident '(' ( expr ( ',' expr )* )? ')'
//   path     := ident segment*
//   segment  := '.' ident | '[' integer ']'
//   literal  := number | quoted string
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<PathSegment>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

fn path_display(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        match seg {
            PathSegment::Key(k) => {
                if i > 0 {
                    out.push('.');
                }
                out.push_str(k);
            }
            PathSegment::Index(n) => {
                out.push('[');
                out.push_str(&n.to_string());
                out.push(']');
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == '\\' {
                        match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => break,
                        }
                    } else if c == quote {
                        closed = true;
                        break;
                    } else {
                        value.push(c);
                    }
                }
                if !closed {
                    return Err(InterpolationError::malformed(
                        expression,
                        "unterminated string literal",
                    ));
                }
                tokens.push(Token::Str(value));
            }
            '-' | '0'..='9' => {
                let mut number = String::new();
                if c == '-' {
                    number.push(c);
                    chars.next();
                }
                let mut saw_digit = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        if c.is_ascii_digit() {
                            saw_digit = true;
                        }
                        number.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !saw_digit {
                    return Err(InterpolationError::malformed(expression, "bare '-'"));
                }
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(InterpolationError::malformed(
                    expression,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

fn parse_expression(expression: &str) -> Result<Expr> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(InterpolationError::malformed(expression, "empty expression"));
    }
    let mut parser = Parser {
        expression,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(InterpolationError::malformed(
            expression,
            "trailing tokens after expression",
        ));
    }
    Ok(expr)
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

    fn malformed(&self, reason: impl Into<String>) -> InterpolationError {
        InterpolationError::malformed(self.expression, reason)
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(raw)) => {
                let value = if raw.contains('.') {
                    raw.parse::<f64>()
                        .ok()
                        .and_then(|f| serde_json::Number::from_f64(f))
                        .map(Value::Number)
                } else {
                    raw.parse::<i64>().ok().map(|n| json!(n))
                };
                value
                    .map(Expr::Literal)
                    .ok_or_else(|| self.malformed(format!("invalid number '{raw}'")))
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.next();
                    let args = self.parse_args()?;
                    Ok(Expr::Call(name, args))
                } else if self.peek().is_none() && matches!(name.as_str(), "true" | "false" | "null")
                {
                    // Keyword literals, not variable lookups.
                    Ok(Expr::Literal(match name.as_str() {
                        "true" => Value::Bool(true),
                        "false" => Value::Bool(false),
                        _ => Value::Null,
                    }))
                } else {
                    let mut segments = vec![PathSegment::Key(name)];
                    self.parse_segments(&mut segments)?;
                    Ok(Expr::Path(segments))
                }
            }
            Some(other) => Err(self.malformed(format!("unexpected token {other:?}"))),
            None => Err(self.malformed("empty expression")),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(other) => {
                    return Err(self.malformed(format!("expected ',' or ')', got {other:?}")))
                }
                None => return Err(self.malformed("unterminated call")),
            }
        }
    }

    fn parse_segments(&mut self, segments: &mut Vec<PathSegment>) -> Result<()> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(key)) => segments.push(PathSegment::Key(key)),
                        _ => return Err(self.malformed("expected identifier after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = match self.next() {
                        Some(Token::Number(raw)) => raw
                            .parse::<usize>()
                            .map_err(|_| self.malformed(format!("invalid index '{raw}'")))?,
                        _ => return Err(self.malformed("expected index after '['")),
                    };
                    if !matches!(self.next(), Some(Token::RBracket)) {
                        return Err(self.malformed("expected ']'"));
                    }
                    segments.push(PathSegment::Index(index));
                }
                _ => return Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

fn resolve_path(ctx: &ExecutionContext, segments: &[PathSegment]) -> Option<Value> {
    let PathSegment::Key(root) = &segments[0] else {
        return None;
    };

    let (base, rest): (Value, &[PathSegment]) = match root.as_str() {
        "variables" => {
            let PathSegment::Key(name) = segments.get(1)? else {
                return None;
            };
            (ctx.get_variable(name)?, &segments[2..])
        }
        "steps" => {
            let PathSegment::Key(step_id) = segments.get(1)? else {
                return None;
            };
            (ctx.get_step_output(step_id)?, &segments[2..])
        }
        "env" => {
            let PathSegment::Key(name) = segments.get(1)? else {
                return None;
            };
            (
                Value::String(ctx.get_environment_variable(name)?),
                &segments[2..],
            )
        }
        "workflow" => {
            let PathSegment::Key(field) = segments.get(1)? else {
                return None;
            };
            let value = match field.as_str() {
                "id" => Value::String(ctx.workflow_id().to_string()),
                "startTime" => Value::String(ctx.start_time().to_rfc3339()),
                "currentStepId" => ctx
                    .current_step_id()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
                _ => return None,
            };
            (value, &segments[2..])
        }
        // Bare name is shorthand for `variables.name`.
        name => (ctx.get_variable(name)?, &segments[1..]),
    };

    descend(base, rest)
}

fn descend(mut current: Value, segments: &[PathSegment]) -> Option<Value> {
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(mut map)) => map.remove(key)?,
            (PathSegment::Index(i), Value::Array(mut items)) => {
                if *i >= items.len() {
                    return None;
                }
                items.swap_remove(*i)
            }
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Built-in functions
// ---------------------------------------------------------------------------

fn call_function(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "upper" => Ok(Value::String(string_arg(name, args, 0)?.to_uppercase())),
        "lower" => Ok(Value::String(string_arg(name, args, 0)?.to_lowercase())),
        "trim" => Ok(Value::String(string_arg(name, args, 0)?.trim().to_string())),
        "replace" => {
            let s = string_arg(name, args, 0)?;
            let from = string_arg(name, args, 1)?;
            let to = string_arg(name, args, 2)?;
            Ok(Value::String(s.replace(&from, &to)))
        }
        "length" => {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(map)) => map.len(),
                Some(other) => coerce_to_string(other).chars().count(),
                None => return Err(InterpolationError::function(name, "missing argument")),
            };
            Ok(json!(len))
        }
        "concat" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&coerce_to_string(arg));
            }
            Ok(Value::String(out))
        }
        "add" => numeric_binop(name, args, |a, b| Some(a + b), |a, b| a.checked_add(b)),
        "sub" => numeric_binop(name, args, |a, b| Some(a - b), |a, b| a.checked_sub(b)),
        "mul" => numeric_binop(name, args, |a, b| Some(a * b), |a, b| a.checked_mul(b)),
        "divide" => {
            let a = number_arg(name, args, 0)?;
            let b = number_arg(name, args, 1)?;
            if b == 0.0 {
                return Err(InterpolationError::function(name, "division by zero"));
            }
            let result = a / b;
            if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
                Ok(json!(result as i64))
            } else {
                serde_json::Number::from_f64(result)
                    .map(Value::Number)
                    .ok_or_else(|| InterpolationError::function(name, "non-finite result"))
            }
        }
        "date" => Ok(Value::String(Utc::now().format("%Y-%m-%d").to_string())),
        "now" => Ok(Value::String(
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        )),
        _ => Err(InterpolationError::UnknownFunction(name.to_string())),
    }
}

fn string_arg(name: &str, args: &[Value], index: usize) -> Result<String> {
    args.get(index)
        .map(coerce_to_string)
        .ok_or_else(|| InterpolationError::function(name, format!("missing argument {index}")))
}

fn number_arg(name: &str, args: &[Value], index: usize) -> Result<f64> {
    let value = args
        .get(index)
        .ok_or_else(|| InterpolationError::function(name, format!("missing argument {index}")))?;
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| InterpolationError::function(name, "non-finite number")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| InterpolationError::function(name, format!("'{s}' is not a number"))),
        Value::Null => Ok(0.0),
        other => Err(InterpolationError::function(
            name,
            format!("'{}' is not a number", coerce_to_string(other)),
        )),
    }
}

fn numeric_binop(
    name: &str,
    args: &[Value],
    float_op: impl Fn(f64, f64) -> Option<f64>,
    int_op: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Value> {
    let both_ints = matches!(
        (args.first(), args.get(1)),
        (Some(Value::Number(a)), Some(Value::Number(b))) if a.is_i64() && b.is_i64()
    );
    if both_ints {
        let a = args[0].as_i64().expect("checked i64");
        let b = args[1].as_i64().expect("checked i64");
        if let Some(result) = int_op(a, b) {
            return Ok(json!(result));
        }
    }
    let a = number_arg(name, args, 0)?;
    let b = number_arg(name, args, 1)?;
    let result = float_op(a, b)
        .ok_or_else(|| InterpolationError::function(name, "arithmetic overflow"))?;
    if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        return Ok(json!(result as i64));
    }
    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| InterpolationError::function(name, "non-finite result"))
}
