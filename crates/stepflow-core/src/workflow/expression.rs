//! Sandboxed JEXL expression evaluator for switch conditions, transforms,
//! foreach item lists and `${ }` interpolation.
//!
//! Wraps `jexl_eval::Evaluator` with a fixed set of pure transforms. No
//! transform touches the clock, filesystem, network or environment, and every
//! expression is checked against an [`ExpressionLimits`] budget before it is
//! parsed.
//!
//! **Security note:** run data is always passed as the evaluation context,
//! NEVER interpolated into expression strings.

use std::borrow::Cow;

use jexl_parser::ast::Expression;
use jexl_parser::Parser;
use serde_json::{json, Number, Value};
use stepflow_types::config::ExpressionLimits;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("expression nesting depth {depth} exceeds limit {max}")]
    TooDeep { depth: usize, max: usize },

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("expected {expected}, got {actual}")]
    WrongType { expected: &'static str, actual: String },
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms registered.
///
/// Besides string and boolean helpers, two existence primitives are provided:
/// - `obj|hasField('a.b')` is true when the dotted key path exists in `obj`,
///   even if its value is null.
/// - `a.b|fieldOr(default)` yields `default` when `a.b` is missing or null.
///
/// Missing properties evaluate to `null` rather than failing, at the top
/// level as well as nested.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
    limits: ExpressionLimits,
}

impl ExpressionEvaluator {
    /// Create an evaluator with default limits.
    pub fn new() -> Self {
        Self::with_limits(ExpressionLimits::default())
    }

    pub fn with_limits(limits: ExpressionLimits) -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            // Search transforms
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Length transform (works on strings, arrays, and objects)
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            // Existence primitives
            .with_transform("hasField", |args: &[Value]| {
                let subject = args.first().unwrap_or(&Value::Null);
                let path = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(has_path(subject, path)))
            })
            .with_transform("fieldOr", |args: &[Value]| {
                let value = args.first().cloned().unwrap_or(Value::Null);
                if value.is_null() {
                    Ok(args.get(1).cloned().unwrap_or(Value::Null))
                } else {
                    Ok(value)
                }
            });

        Self { evaluator, limits }
    }

    pub fn limits(&self) -> ExpressionLimits {
        self.limits
    }

    /// Reject expressions that exceed the length or nesting budget.
    pub fn check_budget(&self, expression: &str) -> Result<(), ExpressionError> {
        if expression.len() > self.limits.max_length {
            return Err(ExpressionError::TooLong {
                len: expression.len(),
                max: self.limits.max_length,
            });
        }
        let depth = nesting_depth(expression);
        if depth > self.limits.max_depth {
            return Err(ExpressionError::TooDeep {
                depth,
                max: self.limits.max_depth,
            });
        }
        Ok(())
    }

    /// Evaluate an expression and return the raw JSON value.
    ///
    /// Integral numeric results are normalised to JSON integers.
    pub fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.check_budget(expression)?;

        let context = bind_missing_identifiers(expression, context);
        let value = self
            .evaluator
            .eval_in_context(expression, context.as_ref())
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(normalize_numbers(value))
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate(expression, context).map(|v| is_truthy(&v))
    }

    /// Evaluate an expression that must yield an array. `null` counts as empty.
    pub fn evaluate_array(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<Vec<Value>, ExpressionError> {
        match self.evaluate(expression, context)? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(ExpressionError::WrongType {
                expected: "array",
                actual: type_name(&other).to_string(),
            }),
        }
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Bind every top-level identifier the expression reads but the context
/// lacks to `null`. The context is only cloned when something is missing.
///
/// Syntax errors are left for the evaluator to report.
fn bind_missing_identifiers<'a>(expression: &str, context: &'a Value) -> Cow<'a, Value> {
    let Value::Object(map) = context else {
        return Cow::Borrowed(context);
    };
    let Ok(ast) = Parser::parse(expression) else {
        return Cow::Borrowed(context);
    };

    let mut identifiers = Vec::new();
    collect_identifiers(&ast, &mut identifiers);
    identifiers.retain(|name| !map.contains_key(*name));
    if identifiers.is_empty() {
        return Cow::Borrowed(context);
    }

    let mut bound = map.clone();
    for name in identifiers {
        bound.insert(name.to_string(), Value::Null);
    }
    Cow::Owned(Value::Object(bound))
}

/// Root identifiers referenced by `expr`. Filter idents name fields of the
/// filtered elements and are not context lookups.
fn collect_identifiers<'e>(expr: &'e Expression, out: &mut Vec<&'e str>) {
    match expr {
        Expression::Identifier(name) => out.push(name),
        Expression::Array(items) => items.iter().for_each(|e| collect_identifiers(e, out)),
        Expression::Object(fields) => fields.iter().for_each(|(_, e)| collect_identifiers(e, out)),
        Expression::BinaryOperation { left, right, .. } => {
            collect_identifiers(left, out);
            collect_identifiers(right, out);
        }
        Expression::Transform { subject, args, .. } => {
            collect_identifiers(subject, out);
            for arg in args.iter().flatten() {
                collect_identifiers(arg, out);
            }
        }
        Expression::DotOperation { subject, .. } => collect_identifiers(subject, out),
        Expression::IndexOperation { subject, index } => {
            collect_identifiers(subject, out);
            collect_identifiers(index, out);
        }
        Expression::Conditional { left, truthy, falsy } => {
            collect_identifiers(left, out);
            collect_identifiers(truthy, out);
            collect_identifiers(falsy, out);
        }
        Expression::Filter { right, .. } => collect_identifiers(right, out),
        Expression::Number(_)
        | Expression::String(_)
        | Expression::Boolean(_)
        | Expression::Null => {}
    }
}

fn has_path(subject: &Value, path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    let mut current = subject;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return false,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => current = next,
                None => return false,
            },
            _ => return false,
        }
    }
    true
}

/// Maximum bracket nesting, ignoring brackets inside string literals.
fn nesting_depth(expression: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in expression.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => {
                depth += 1;
                max = max.max(depth);
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

/// JEXL computes in f64; turn `2.0` back into `2`.
fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => match n.as_f64() {
            Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                Value::Number(Number::from(f as i64))
            }
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
