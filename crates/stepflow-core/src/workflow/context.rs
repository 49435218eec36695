//! Run context helpers: dotted-path access, `${ }` value resolution, deltas
//! between forked contexts, and size limits.
//!
//! The run context is a single JSON object. Every step reads from it and writes
//! its output back into it; the scheduler persists the whole object after each
//! step.

use serde_json::{json, Map, Value};

use super::expression::{ExpressionError, ExpressionEvaluator};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of the run context (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Path access
// ---------------------------------------------------------------------------

/// Look up a dotted path (`a.b.0.c`). Numeric segments index arrays.
pub fn get_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at a dotted path, creating intermediate objects.
///
/// Non-object intermediates are replaced by objects. An empty path replaces
/// the whole context when `value` is an object.
pub fn set_path(context: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        if value.is_object() {
            *context = value;
        }
        return;
    };

    let mut current = context;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else { return };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

/// Shallow-merge the keys of `data` into the object at `path` (root when `None`).
pub fn merge_at(context: &mut Value, path: Option<&str>, data: Map<String, Value>) {
    let target = match path {
        Some(p) if !p.is_empty() => {
            if !matches!(get_path(context, p), Some(Value::Object(_))) {
                set_path(context, p, Value::Object(Map::new()));
            }
            match get_path_mut(context, p) {
                Some(v) => v,
                None => return,
            }
        }
        _ => context,
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        map.extend(data);
    }
}

fn get_path_mut<'a>(context: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = context;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Value resolution
// ---------------------------------------------------------------------------

/// Resolve `${ expr }` references inside a JSON value.
///
/// - a string that is exactly one `${ expr }` becomes the expression's value,
///   keeping its JSON type;
/// - other strings have each fragment replaced by its textual rendering;
/// - arrays and objects are resolved recursively;
/// - everything else is returned unchanged.
pub fn resolve_value(
    value: &Value,
    context: &Value,
    evaluator: &ExpressionEvaluator,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => resolve_string(s, context, evaluator),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, context, evaluator))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_map(map, context, evaluator).map(Value::Object),
        other => Ok(other.clone()),
    }
}

pub fn resolve_map(
    map: &Map<String, Value>,
    context: &Value,
    evaluator: &ExpressionEvaluator,
) -> Result<Map<String, Value>, ExpressionError> {
    let mut out = Map::with_capacity(map.len());
    for (k, v) in map {
        out.insert(k.clone(), resolve_value(v, context, evaluator)?);
    }
    Ok(out)
}

fn resolve_string(
    s: &str,
    context: &Value,
    evaluator: &ExpressionEvaluator,
) -> Result<Value, ExpressionError> {
    let trimmed = s.trim();
    if let Some(inner) = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        if !inner.contains("${") && !inner.contains('}') {
            return evaluator.evaluate(inner.trim(), context);
        }
    }

    if !s.contains("${") {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let value = evaluator.evaluate(after[..end].trim(), context)?;
                out.push_str(&value_to_string(&value));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Convert a JSON value to a display string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Forked contexts
// ---------------------------------------------------------------------------

/// Top-level keys of `result` that are new or changed relative to `seed`,
/// excluding `skip` (iteration bindings).
pub fn delta(seed: &Value, result: &Value, skip: &[&str]) -> Value {
    let mut out = Map::new();
    if let Value::Object(after) = result {
        for (k, v) in after {
            if skip.contains(&k.as_str()) {
                continue;
            }
            if seed.get(k) != Some(v) {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

// ---------------------------------------------------------------------------
// Size limits
// ---------------------------------------------------------------------------

/// Replace outputs larger than [`MAX_STEP_OUTPUT_SIZE`] with a marker object.
pub fn limit_output(state_id: &str, output: Value) -> Value {
    let size = serialized_size(&output);
    if size <= MAX_STEP_OUTPUT_SIZE {
        return output;
    }
    tracing::warn!(
        state_id,
        size,
        max = MAX_STEP_OUTPUT_SIZE,
        "step output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
        "_message": format!("output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"),
    })
}

/// Fail when the context has grown past [`MAX_CONTEXT_SIZE`].
pub fn check_context_size(context: &Value) -> Result<(), String> {
    let size = serialized_size(context);
    if size > MAX_CONTEXT_SIZE {
        return Err(format!(
            "context size ({size} bytes) exceeds maximum ({MAX_CONTEXT_SIZE} bytes)"
        ));
    }
    Ok(())
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
