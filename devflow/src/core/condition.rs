//! Boolean condition evaluation for `if="..."` attributes.
//!
//! Grammar, applied to the variable-substituted text:
//!
//! - `a OR b`, `a AND b`, `NOT a` (`OR` binds loosest, `NOT` tightest)
//! - `file <path> exists`, `file <path> not exists`
//! - `<name> is defined | is empty | is true | is false`
//! - `<lhs> OP <rhs>` with `OP` one of `== != <= >= < >`
//! - the literal `true`; anything else is false
//!
//! Malformed expressions never fail the workflow: they log a warning and
//! evaluate to `false`.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::vars::VariableEnvironment;

static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^file\s+(.+?)\s+(not\s+)?exists$").expect("file predicate regex")
});
static PREDICATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.\-]+)\s+is\s+(defined|empty|true|false)$")
        .expect("predicate regex")
});
static PREDICATE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\sis\s+(defined|empty|true|false)$").expect("suffix regex"));
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").expect("number regex")
});

const OPERATORS: [&str; 6] = ["==", "!=", "<=", ">=", "<", ">"];

/// Filesystem existence checks used by `file <path> exists`.
pub trait FileProbe {
    fn exists(&self, path: &str) -> bool;
}

/// Probe for contexts without a workspace; every file is absent.
pub struct NoFiles;

impl FileProbe for NoFiles {
    fn exists(&self, _path: &str) -> bool {
        false
    }
}

/// Evaluate `expr` against `env`. Never fails; malformed input is `false`.
pub fn evaluate(expr: &str, env: &VariableEnvironment, files: &dyn FileProbe) -> bool {
    let substituted = match env.substitute(expr) {
        Ok(text) => text,
        Err(err) => {
            warn!(condition = expr, reason = %err, "condition evaluates to false");
            return false;
        }
    };
    match eval_expr(substituted.trim(), env, files) {
        Ok(result) => {
            debug!(condition = expr, result, "condition evaluated");
            result
        }
        Err(reason) => {
            warn!(condition = expr, %reason, "malformed condition evaluates to false");
            false
        }
    }
}

fn eval_expr(expr: &str, env: &VariableEnvironment, files: &dyn FileProbe) -> Result<bool, String> {
    if expr.is_empty() {
        return Err("empty expression".to_string());
    }

    let any = split_keyword(expr, "OR");
    if any.len() > 1 {
        let results = eval_all(&any, "OR", env, files)?;
        return Ok(results.into_iter().any(|r| r));
    }

    let all = split_keyword(expr, "AND");
    if all.len() > 1 {
        let results = eval_all(&all, "AND", env, files)?;
        return Ok(results.into_iter().all(|r| r));
    }

    if let Some(rest) = expr.strip_prefix("NOT")
        && (rest.is_empty() || rest.starts_with(char::is_whitespace))
    {
        let rest = rest.trim();
        if rest.is_empty() {
            return Err("NOT without operand".to_string());
        }
        return eval_expr(rest, env, files).map(|r| !r);
    }

    if let Some(caps) = FILE_RE.captures(expr) {
        let path = unquote(caps[1].trim());
        let exists = files.exists(path);
        return Ok(if caps.get(2).is_some() { !exists } else { exists });
    }

    if let Some(caps) = PREDICATE_RE.captures(expr) {
        return Ok(eval_predicate(&caps[1], &caps[2], env));
    }
    if PREDICATE_SUFFIX_RE.is_match(expr) {
        return Err(format!("predicate subject must be a single name in '{expr}'"));
    }

    if let Some((lhs, op, rhs)) = split_comparison(expr) {
        if lhs.is_empty() || rhs.is_empty() {
            return Err(format!("comparison '{op}' missing an operand"));
        }
        let left = coerce_token(lhs, env);
        let right = coerce_token(rhs, env);
        return Ok(compare(&left, op, &right));
    }

    Ok(expr == "true")
}

fn eval_all(
    parts: &[&str],
    keyword: &str,
    env: &VariableEnvironment,
    files: &dyn FileProbe,
) -> Result<Vec<bool>, String> {
    parts
        .iter()
        .map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return Err(format!("{keyword} missing an operand"));
            }
            eval_expr(part, env, files)
        })
        .collect()
}

fn eval_predicate(name: &str, predicate: &str, env: &VariableEnvironment) -> bool {
    let value = env.resolve(name);
    match predicate {
        "defined" => value.is_some(),
        "empty" => match value {
            None => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        },
        "true" => matches!(value, Some(Value::Bool(true)))
            || matches!(value, Some(Value::String(s)) if s == "true"),
        "false" => matches!(value, Some(Value::Bool(false)))
            || matches!(value, Some(Value::String(s)) if s == "false"),
        _ => false,
    }
}

/// Split on a whitespace-delimited keyword outside quoted strings.
fn split_keyword<'a>(expr: &'a str, keyword: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut prev_ws = true;
    let mut skip_until = 0;
    for (i, c) in expr.char_indices() {
        if i < skip_until {
            continue;
        }
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None => {
                let rest = &expr[i..];
                let after = rest.get(keyword.len()..).and_then(|s| s.chars().next());
                if prev_ws
                    && rest.starts_with(keyword)
                    && after.is_none_or(char::is_whitespace)
                {
                    parts.push(&expr[start..i]);
                    start = i + keyword.len();
                    skip_until = start;
                    prev_ws = true;
                    continue;
                }
            }
        }
        prev_ws = c.is_whitespace();
    }
    parts.push(&expr[start..]);
    parts
}

/// Find the first comparison operator outside quotes.
fn split_comparison(expr: &str) -> Option<(&str, &'static str, &str)> {
    let mut quote: Option<char> = None;
    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None => {
                for op in OPERATORS {
                    if expr[i..].starts_with(op) {
                        let lhs = expr[..i].trim();
                        let rhs = expr[i + op.len()..].trim();
                        return Some((lhs, op, rhs));
                    }
                }
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
enum Operand {
    Num(f64),
    Bool(bool),
    Str(String),
    Null,
}

impl Operand {
    fn display(&self) -> String {
        match self {
            Operand::Num(n) => n.to_string(),
            Operand::Bool(b) => b.to_string(),
            Operand::Str(s) => s.clone(),
            Operand::Null => String::new(),
        }
    }
}

fn coerce_token(token: &str, env: &VariableEnvironment) -> Operand {
    if is_quoted(token) {
        return Operand::Str(token[1..token.len() - 1].to_string());
    }
    if let Some(value) = env.resolve(token) {
        return from_value(value);
    }
    coerce_literal(token)
}

fn coerce_literal(token: &str) -> Operand {
    if NUMBER_RE.is_match(token)
        && let Ok(n) = token.parse::<f64>()
    {
        return Operand::Num(n);
    }
    match token {
        "true" => Operand::Bool(true),
        "false" => Operand::Bool(false),
        _ => Operand::Str(token.to_string()),
    }
}

fn from_value(value: &Value) -> Operand {
    match value {
        Value::Number(n) => n.as_f64().map(Operand::Num).unwrap_or(Operand::Null),
        Value::Bool(b) => Operand::Bool(*b),
        Value::String(s) => coerce_literal(s),
        Value::Null => Operand::Null,
        other => Operand::Str(other.to_string()),
    }
}

fn compare(left: &Operand, op: &str, right: &Operand) -> bool {
    let ordering = match (left, right) {
        (Operand::Num(a), Operand::Num(b)) => a.partial_cmp(b),
        (Operand::Bool(a), Operand::Bool(b)) => Some(a.cmp(b)),
        (Operand::Null, Operand::Null) => Some(Ordering::Equal),
        _ => Some(left.display().cmp(&right.display())),
    };
    let Some(ordering) = ordering else {
        return op == "!=";
    };
    match op {
        "==" => ordering == Ordering::Equal,
        "!=" => ordering != Ordering::Equal,
        "<" => ordering == Ordering::Less,
        ">" => ordering == Ordering::Greater,
        "<=" => ordering != Ordering::Greater,
        ">=" => ordering != Ordering::Less,
        _ => false,
    }
}

fn is_quoted(token: &str) -> bool {
    token.len() >= 2
        && ((token.starts_with('"') && token.ends_with('"'))
            || (token.starts_with('\'') && token.ends_with('\'')))
}

fn unquote(token: &str) -> &str {
    if is_quoted(token) {
        &token[1..token.len() - 1]
    } else {
        token
    }
}
