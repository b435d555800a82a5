//! Structural pattern matching for validation rules.
//!
//! Target and pattern are both JSON trees; matching recurses over the pair:
//! - maps: every pattern key must exist in the target and match; extra target
//!   keys are ignored
//! - sequences: a single-map pattern is broadcast over every target element,
//!   otherwise lengths must agree and elements match pairwise
//! - scalars: `*` matches any present scalar, `*`/`?` inside strings are
//!   wildcards, `>`, `>=`, `<`, `<=` compare numbers, `!`/`!=` negate

use serde_json::{Map, Value};

use crate::engine::error::EngineError;
use crate::engine::matching::{has_wildcard, wildcard_match};

/// A structural mismatch, located by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub path: String,
    pub detail: String,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation error at path '{}': {}", self.path, self.detail)
    }
}

/// Why a pattern did not match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// The resource does not satisfy the pattern.
    Mismatch(Mismatch),
    /// The pattern itself cannot be evaluated.
    Malformed(EngineError),
}

impl From<EngineError> for MatchError {
    fn from(e: EngineError) -> Self {
        MatchError::Malformed(e)
    }
}

/// Match `resource` against the main pattern and then each alternative.
///
/// Succeeds on the first candidate that matches. When none match, the
/// mismatch of the first candidate is reported.
pub fn match_any<'a>(
    resource: &Value,
    candidates: impl IntoIterator<Item = &'a Value>,
) -> Result<(), MatchError> {
    let mut first_mismatch = None;
    let mut evaluated = 0usize;
    for pattern in candidates {
        evaluated += 1;
        match match_pattern(resource, pattern) {
            Ok(()) => return Ok(()),
            Err(MatchError::Mismatch(m)) => {
                first_mismatch.get_or_insert(m);
            }
            Err(malformed) => return Err(malformed),
        }
    }
    match first_mismatch {
        Some(m) => Err(MatchError::Mismatch(m)),
        None if evaluated == 0 => Err(MatchError::Malformed(EngineError::malformed(
            "validate rule has neither pattern nor anyPattern",
        ))),
        None => Ok(()),
    }
}

/// Match a resource against a single pattern document.
pub fn match_pattern(resource: &Value, pattern: &Value) -> Result<(), MatchError> {
    match_value(resource, pattern, "")
}

fn match_value(resource: &Value, pattern: &Value, path: &str) -> Result<(), MatchError> {
    match pattern {
        Value::Object(pattern_map) => match resource {
            Value::Object(resource_map) => match_map(resource_map, pattern_map, path),
            other => Err(mismatch(path, format!("expected an object, found {}", type_name(other)))),
        },
        Value::Array(pattern_items) => match resource {
            Value::Array(resource_items) => match_array(resource_items, pattern_items, path),
            other => Err(mismatch(path, format!("expected a sequence, found {}", type_name(other)))),
        },
        scalar => match_scalar(resource, scalar, path),
    }
}

fn match_map(
    resource: &Map<String, Value>,
    pattern: &Map<String, Value>,
    path: &str,
) -> Result<(), MatchError> {
    for (key, pattern_value) in pattern {
        let child = child_path(path, key);
        match resource.get(key) {
            Some(value) => match_value(value, pattern_value, &child)?,
            None => return Err(mismatch(&child, "field is missing".to_string())),
        }
    }
    Ok(())
}

fn match_array(resource: &[Value], pattern: &[Value], path: &str) -> Result<(), MatchError> {
    if let [element @ Value::Object(_)] = pattern {
        for (i, value) in resource.iter().enumerate() {
            match_value(value, element, &child_path(path, &i.to_string()))?;
        }
        return Ok(());
    }
    if resource.len() != pattern.len() {
        return Err(mismatch(
            path,
            format!(
                "expected {} elements, found {}",
                pattern.len(),
                resource.len()
            ),
        ));
    }
    for (i, (value, element)) in resource.iter().zip(pattern).enumerate() {
        match_value(value, element, &child_path(path, &i.to_string()))?;
    }
    Ok(())
}

fn match_scalar(resource: &Value, pattern: &Value, path: &str) -> Result<(), MatchError> {
    if resource.is_object() || resource.is_array() {
        return Err(mismatch(
            path,
            format!("expected a scalar, found {}", type_name(resource)),
        ));
    }
    let matched = match pattern {
        Value::Null => resource.is_null(),
        Value::Bool(b) => resource.as_bool() == Some(*b),
        Value::Number(n) => match (n.as_f64(), numeric_value(resource)) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => false,
        },
        Value::String(s) => match_string_pattern(resource, s)?,
        Value::Object(_) | Value::Array(_) => false,
    };
    if matched {
        Ok(())
    } else {
        Err(mismatch(
            path,
            format!("expected '{}', found '{}'", display(pattern), display(resource)),
        ))
    }
}

fn match_string_pattern(resource: &Value, pattern: &str) -> Result<bool, EngineError> {
    if pattern == "*" {
        return Ok(!resource.is_null());
    }
    if let Some(rest) = pattern
        .strip_prefix("!=")
        .or_else(|| pattern.strip_prefix('!'))
    {
        return Ok(!match_string_pattern(resource, rest.trim_start())?);
    }
    if let Some((op, operand)) = split_operator(pattern) {
        let bound: f64 = operand.trim().parse().map_err(|_| {
            EngineError::malformed(format!(
                "operator '{}' requires a number, found '{}'",
                op.symbol(),
                operand
            ))
        })?;
        return Ok(numeric_value(resource).is_some_and(|actual| op.holds(actual, bound)));
    }
    let text = match resource {
        Value::String(s) => s.clone(),
        Value::Number(_) | Value::Bool(_) => resource.to_string(),
        _ => return Ok(false),
    };
    if has_wildcard(pattern) {
        wildcard_match(pattern, &text)
    } else {
        Ok(text == pattern)
    }
}

#[derive(Debug, Clone, Copy)]
enum Comparison {
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
}

impl Comparison {
    fn holds(self, actual: f64, bound: f64) -> bool {
        match self {
            Comparison::Greater => actual > bound,
            Comparison::GreaterEqual => actual >= bound,
            Comparison::Less => actual < bound,
            Comparison::LessEqual => actual <= bound,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Comparison::Greater => ">",
            Comparison::GreaterEqual => ">=",
            Comparison::Less => "<",
            Comparison::LessEqual => "<=",
        }
    }
}

fn split_operator(pattern: &str) -> Option<(Comparison, &str)> {
    // two-character operators first
    [
        (">=", Comparison::GreaterEqual),
        ("<=", Comparison::LessEqual),
        (">", Comparison::Greater),
        ("<", Comparison::Less),
    ]
    .into_iter()
    .find_map(|(prefix, op)| pattern.strip_prefix(prefix).map(|rest| (op, rest)))
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Append an escaped JSON pointer token.
pub(crate) fn child_path(parent: &str, token: &str) -> String {
    format!("{}/{}", parent, token.replace('~', "~0").replace('/', "~1"))
}

fn mismatch(path: &str, detail: String) -> MatchError {
    MatchError::Mismatch(Mismatch {
        path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        detail,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "an object",
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
