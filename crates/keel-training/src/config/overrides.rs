//! `KEY=VALUE` overrides from the command line.
//!
//! Keys are dotted paths; numeric segments index into arrays, so
//! `data.train.pipeline.0.type=LoadImageFromNdarray` targets the first stage.
//! Values accept lists (`[a,b]` or bare `a,b`), tuples (`(a,b)`, stored as
//! arrays) and any nesting of the two, e.g. `"[(1,2),(3,4)]"`.

use crate::config::loader::merge_tables;
use crate::error::{LaunchError, LaunchResult};
use std::str::FromStr;
use toml::{Table, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub key: String,
    /// `None` unsets the key (`key=None`).
    pub value: Option<Value>,
    raw: String,
}

impl ConfigOverride {
    pub fn new(key: impl Into<String>, raw: &str) -> Self {
        let raw = strip_quotes(raw.trim()).to_string();
        Self { key: key.into(), value: parse_value(&raw), raw }
    }
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| format!("override `{s}` must be in the form key=value"))?;
        let key = key.trim();
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(format!("override `{s}` has an empty key segment"));
        }
        Ok(Self::new(key, value))
    }
}

impl std::fmt::Display for ConfigOverride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.raw)
    }
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches(|c| c == '\'' || c == '"')
}

/// Parse an override value. Returns `None` for the literal `None`.
pub fn parse_value(raw: &str) -> Option<Value> {
    let raw = strip_quotes(raw.trim());
    if raw == "None" {
        return None;
    }
    Some(parse_iterable(raw))
}

fn parse_iterable(s: &str) -> Value {
    let s = s.trim();
    if let Some(inner) = enclosed(s) {
        if inner.trim().is_empty() {
            return Value::Array(Vec::new());
        }
        return Value::Array(split_top_level(inner).into_iter().map(parse_iterable).collect());
    }
    if has_top_level_comma(s) {
        return Value::Array(split_top_level(s).into_iter().map(parse_iterable).collect());
    }
    parse_scalar(s)
}

/// Returns the inside of `s` when the whole string is one bracketed group.
fn enclosed(s: &str) -> Option<&str> {
    let close = match s.chars().next()? {
        '[' => ']',
        '(' => ')',
        _ => return None,
    };
    let mut depth = 0usize;
    for (idx, ch) in s.char_indices() {
        match ch {
            '[' | '(' => depth += 1,
            ']' | ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return (idx == s.len() - 1 && ch == close).then(|| &s[1..idx]);
                }
            }
            _ => {}
        }
    }
    None
}

fn has_top_level_comma(s: &str) -> bool {
    let mut depth = 0usize;
    for ch in s.chars() {
        match ch {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, ch) in s.char_indices() {
        match ch {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn parse_scalar(s: &str) -> Value {
    let s = strip_quotes(s.trim());
    if let Ok(i) = s.parse::<i64>() {
        return Value::Integer(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::Float(f);
    }
    if s.eq_ignore_ascii_case("true") {
        return Value::Boolean(true);
    }
    if s.eq_ignore_ascii_case("false") {
        return Value::Boolean(false);
    }
    Value::String(s.to_string())
}

/// Merge one override into a raw config table.
///
/// Existing values keep their type: a scalar can only be replaced by the
/// same kind of scalar (integers widen to floats, anything renders into a
/// string slot), an existing table only merges with a table, and array
/// indices must already exist. Missing keys are created; whether they are
/// allowed is decided when the table is deserialized into the schema.
pub fn apply_override(root: &mut Table, over: &ConfigOverride) -> LaunchResult<()> {
    let segments: Vec<&str> = over.key.split('.').collect();
    let mut node = Value::Table(std::mem::take(root));
    let result = assign(&mut node, &segments, over);
    if let Value::Table(table) = node {
        *root = table;
    }
    result
}

fn assign(node: &mut Value, path: &[&str], over: &ConfigOverride) -> LaunchResult<()> {
    let Some((head, rest)) = path.split_first() else {
        return Err(LaunchError::config(format!("override `{over}` has an empty key")));
    };

    match node {
        Value::Table(table) => {
            if !rest.is_empty() {
                if over.value.is_none() && !table.contains_key(*head) {
                    return Ok(());
                }
                let child =
                    table.entry((*head).to_string()).or_insert_with(|| Value::Table(Table::new()));
                return assign(child, rest, over);
            }
            let Some(value) = &over.value else {
                table.remove(*head);
                return Ok(());
            };
            match table.get_mut(*head) {
                Some(existing) => replace(existing, value.clone(), over),
                None => {
                    table.insert((*head).to_string(), value.clone());
                    Ok(())
                }
            }
        }
        Value::Array(items) => {
            let index: usize = head.parse().map_err(|_| {
                LaunchError::config(format!(
                    "override `{over}`: `{head}` indexes an array and must be a number"
                ))
            })?;
            let len = items.len();
            let child = items.get_mut(index).ok_or_else(|| {
                LaunchError::config(format!(
                    "override `{over}`: index {index} out of range for array of length {len}"
                ))
            })?;
            if !rest.is_empty() {
                return assign(child, rest, over);
            }
            match &over.value {
                Some(value) => replace(child, value.clone(), over),
                None => Err(LaunchError::config(format!(
                    "override `{over}`: array elements cannot be unset"
                ))),
            }
        }
        other => Err(LaunchError::config(format!(
            "override `{over}`: `{head}` is inside a {} value",
            other.type_str()
        ))),
    }
}

fn replace(existing: &mut Value, incoming: Value, over: &ConfigOverride) -> LaunchResult<()> {
    match incoming {
        Value::Table(incoming) => {
            if let Value::Table(current) = existing {
                merge_tables(current, incoming);
                return Ok(());
            }
            Err(mismatch(over, existing.type_str(), "table"))
        }
        Value::Integer(i) if existing.is_float() => {
            *existing = Value::Float(i as f64);
            Ok(())
        }
        incoming if existing.same_type(&incoming) => {
            *existing = incoming;
            Ok(())
        }
        Value::Integer(_) | Value::Float(_) | Value::Boolean(_) if existing.is_str() => {
            *existing = Value::String(over.raw.clone());
            Ok(())
        }
        incoming => Err(mismatch(over, existing.type_str(), incoming.type_str())),
    }
}

fn mismatch(over: &ConfigOverride, expected: &str, found: &str) -> LaunchError {
    LaunchError::config(format!(
        "override `{over}` has type {found} but `{}` is a {expected}",
        over.key
    ))
}
