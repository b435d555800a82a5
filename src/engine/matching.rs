//! Resource selection: does a rule's ResourceDescription apply to a resource?
//!
//! A non-matching rule is a normal skip, never an error. Errors are only
//! returned for selectors that cannot be evaluated (bad wildcard, unknown
//! selector operator).

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use crate::crd::{ExcludeResources, LabelSelector, ResourceDescription, ResourceRef};
use crate::engine::error::EngineError;

/// Whether `s` contains wildcard markers.
pub fn has_wildcard(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// Match `value` against a `*`/`?` wildcard pattern.
pub fn wildcard_match(pattern: &str, value: &str) -> Result<bool, EngineError> {
    if !has_wildcard(pattern) {
        return Ok(pattern == value);
    }
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expr.push('$');
    let re = Regex::new(&expr)
        .map_err(|e| EngineError::malformed(format!("invalid wildcard '{}': {}", pattern, e)))?;
    Ok(re.is_match(value))
}

/// Labels of a JSON object (`metadata.labels`), non-string values ignored.
pub fn object_labels(resource: &Value) -> BTreeMap<String, String> {
    resource
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a rule's ResourceDescription selects `resource`.
pub fn rule_matches(desc: &ResourceDescription, resource: &Value) -> Result<bool, EngineError> {
    let identity = ResourceRef::from_object(resource);
    let labels = object_labels(resource);

    if !desc.kinds.iter().any(|k| k == &identity.kind) {
        return Ok(false);
    }
    if let Some(name) = &desc.name
        && !wildcard_match(name, &identity.name)?
    {
        return Ok(false);
    }
    if let Some(namespace) = &desc.namespace {
        match &identity.namespace {
            Some(ns) if wildcard_match(namespace, ns)? => {}
            _ => return Ok(false),
        }
    }
    if let Some(selector) = &desc.selector
        && !selector_matches(selector, &labels)?
    {
        return Ok(false);
    }
    if let Some(exclude) = &desc.exclude
        && is_excluded(exclude, &identity, &labels)?
    {
        return Ok(false);
    }
    Ok(true)
}

fn is_excluded(
    exclude: &ExcludeResources,
    identity: &ResourceRef,
    labels: &BTreeMap<String, String>,
) -> Result<bool, EngineError> {
    if exclude.kinds.iter().any(|k| k == &identity.kind) {
        return Ok(true);
    }
    if let Some(name) = &exclude.name
        && wildcard_match(name, &identity.name)?
    {
        return Ok(true);
    }
    if let (Some(pattern), Some(ns)) = (&exclude.namespace, &identity.namespace)
        && wildcard_match(pattern, ns)?
    {
        return Ok(true);
    }
    if let Some(selector) = &exclude.selector
        && !is_empty_selector(selector)
        && selector_matches(selector, labels)?
    {
        return Ok(true);
    }
    Ok(false)
}

fn is_empty_selector(selector: &LabelSelector) -> bool {
    selector.match_labels.is_empty() && selector.match_expressions.is_empty()
}

/// Evaluate a label selector. An empty selector matches everything.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, EngineError> {
    for (key, value) in &selector.match_labels {
        if labels.get(key) != Some(value) {
            return Ok(false);
        }
    }
    for expr in &selector.match_expressions {
        let current = labels.get(&expr.key);
        let matched = match expr.operator.as_str() {
            "In" => current.is_some_and(|v| expr.values.contains(v)),
            "NotIn" => current.is_none_or(|v| !expr.values.contains(v)),
            "Exists" => current.is_some(),
            "DoesNotExist" => current.is_none(),
            other => {
                return Err(EngineError::malformed(format!(
                    "unknown selector operator '{}' for key '{}'",
                    other, expr.key
                )));
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}
