//! Overlay to patch conversion.
//!
//! An overlay is a partial document merged structurally onto the target.
//! Keys missing from the target become `add` operations, differing values
//! become `replace`, equal values produce nothing. Inside maps, keys written
//! as `(key)` are anchors: the map is only applied when the target's value
//! for `key` matches. In sequences, anchored elements are applied to every
//! target element they match; plain elements are matched by index and
//! surplus elements are appended.

use serde_json::{Map, Value};

use crate::engine::error::EngineError;
use crate::engine::patches::PatchOperation;
use crate::engine::pattern::{MatchError, child_path, match_pattern};

/// Compute the minimal patch that merges `overlay` onto `target`.
pub fn overlay_patches(target: &Value, overlay: &Value) -> Result<Vec<PatchOperation>, EngineError> {
    if !overlay.is_object() {
        return Err(EngineError::malformed("overlay must be an object"));
    }
    let mut ops = Vec::new();
    overlay_value(target, overlay, "", &mut ops)?;
    Ok(ops)
}

fn overlay_value(
    target: &Value,
    overlay: &Value,
    path: &str,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), EngineError> {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => {
            overlay_map_onto(target_map, overlay_map, path, ops)
        }
        (Value::Array(target_items), Value::Array(overlay_items)) => {
            overlay_array_onto(target_items, overlay_items, path, ops)
        }
        (current, desired) => {
            let desired = strip_anchors(desired)?;
            if *current != desired {
                ops.push(PatchOperation::Replace {
                    path: path.to_string(),
                    value: desired,
                });
            }
            Ok(())
        }
    }
}

fn overlay_map_onto(
    target: &Map<String, Value>,
    overlay: &Map<String, Value>,
    path: &str,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), EngineError> {
    if !anchors_match(target, overlay)? {
        return Ok(());
    }
    for (key, value) in overlay {
        if anchor_name(key).is_some() {
            continue;
        }
        let child = child_path(path, key);
        match target.get(key) {
            Some(current) => overlay_value(current, value, &child, ops)?,
            None => ops.push(PatchOperation::Add {
                path: child,
                value: strip_anchors(value)?,
            }),
        }
    }
    Ok(())
}

fn overlay_array_onto(
    target: &[Value],
    overlay: &[Value],
    path: &str,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), EngineError> {
    for (index, element) in overlay.iter().enumerate() {
        if has_anchors(element) {
            for (i, current) in target.iter().enumerate() {
                if let (Value::Object(current_map), Value::Object(element_map)) = (current, element)
                    && anchors_match(current_map, element_map)?
                {
                    overlay_value(current, element, &child_path(path, &i.to_string()), ops)?;
                }
            }
            continue;
        }
        match target.get(index) {
            Some(current) => {
                overlay_value(current, element, &child_path(path, &index.to_string()), ops)?
            }
            None => ops.push(PatchOperation::Add {
                path: child_path(path, "-"),
                value: strip_anchors(element)?,
            }),
        }
    }
    Ok(())
}

/// `(key)` -> `Some("key")`.
fn anchor_name(key: &str) -> Option<&str> {
    key.strip_prefix('(')
        .and_then(|k| k.strip_suffix(')'))
        .filter(|k| !k.is_empty())
}

fn has_anchors(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.keys().any(|k| anchor_name(k).is_some()))
}

fn anchors_match(target: &Map<String, Value>, overlay: &Map<String, Value>) -> Result<bool, EngineError> {
    for (key, expected) in overlay {
        let Some(name) = anchor_name(key) else {
            continue;
        };
        if expected.is_object() || expected.is_array() {
            return Err(EngineError::malformed(format!(
                "anchor '{}' must have a scalar value",
                key
            )));
        }
        let Some(actual) = target.get(name) else {
            return Ok(false);
        };
        match match_pattern(actual, expected) {
            Ok(()) => {}
            Err(MatchError::Mismatch(_)) => return Ok(false),
            Err(MatchError::Malformed(e)) => return Err(e),
        }
    }
    Ok(true)
}

/// Content added wholesale keeps anchor keys as plain keys.
fn strip_anchors(value: &Value) -> Result<Value, EngineError> {
    Ok(match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, v) in map {
                let plain = anchor_name(key).unwrap_or(key);
                out.insert(plain.to_string(), strip_anchors(v)?);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_anchors).collect::<Result<_, _>>()?),
        scalar => scalar.clone(),
    })
}
