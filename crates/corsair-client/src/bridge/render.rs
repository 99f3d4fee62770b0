//! Turning task payloads into operator-facing text.

use std::fmt::Write as _;

use serde_json::{Map, Value};

use corsair_proto::v1::Spite;

/// Parsed and formatted task output.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    /// Canonical name of the function whose parser ran.
    pub function: String,
    pub value: Value,
    pub text: String,
}

/// Fallback parser for payloads without a registered parser.
pub fn generic_parse(spite: &Spite) -> Value {
    let mut obj = Map::new();
    if !spite.name.is_empty() {
        obj.insert("name".into(), Value::String(spite.name.clone()));
    }
    if spite.status != 0 {
        obj.insert("status".into(), Value::from(spite.status));
    }
    if !spite.body.is_empty() {
        let body = String::from_utf8(spite.body.clone()).map_or_else(
            |_| Value::String(format!("<{} bytes>", spite.body.len())),
            Value::String,
        );
        obj.insert("body".into(), body);
    }
    Value::Object(obj)
}

/// Fallback formatter: `key: value` lines for objects, one item per line
/// for arrays, bare text for scalars.
pub fn generic_render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(obj) => {
            let width = obj.keys().map(String::len).max().unwrap_or(0);
            let mut out = String::new();
            for (key, item) in obj {
                if !out.is_empty() {
                    out.push('\n');
                }
                let _ = write!(out, "{key:<width$}  {}", scalar_text(item));
            }
            out
        }
        Value::Bool(_) | Value::Number(_) => value.to_string(),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(|v| !v.is_object() && !v.is_array()) => items
            .iter()
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}
