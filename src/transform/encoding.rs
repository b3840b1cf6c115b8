//! Compact re-encoding of JSON text content.
//!
//! Objects become indented `key: value` lines; arrays of flat objects
//! sharing one key set become a header plus comma-separated rows:
//!
//! ```text
//! issues[2]{id,open,title}:
//!   1,true,Fix login
//!   2,false,"Crash, on start"
//! ```

use serde_json::{Map, Value};

use super::TransformError;

const INDENT: &str = "  ";

/// Projected token count of a text (4 bytes per token, rounded up)
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Encode a JSON object or array.
///
/// Scalars are rejected: there is nothing to gain from re-encoding them.
pub fn encode(value: &Value) -> Result<String, TransformError> {
    let mut out = String::new();
    match value {
        Value::Object(map) => encode_object(map, 0, &mut out),
        Value::Array(items) => encode_array(None, items, 0, &mut out),
        _ => return Err(TransformError::Encoding("not a container".to_string())),
    }
    // Lines are written with a trailing newline
    out.pop();
    Ok(out)
}

fn push_indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

fn encode_object(map: &Map<String, Value>, depth: usize, out: &mut String) {
    for (key, value) in map {
        match value {
            Value::Object(inner) if !inner.is_empty() => {
                push_indent(depth, out);
                out.push_str(&encode_key(key));
                out.push_str(":\n");
                encode_object(inner, depth + 1, out);
            }
            Value::Array(items) => encode_array(Some(key), items, depth, out),
            _ => {
                push_indent(depth, out);
                out.push_str(&encode_key(key));
                out.push_str(": ");
                out.push_str(&encode_scalar(value));
                out.push('\n');
            }
        }
    }
}

fn encode_array(key: Option<&str>, items: &[Value], depth: usize, out: &mut String) {
    push_indent(depth, out);
    if let Some(key) = key {
        out.push_str(&encode_key(key));
    }
    out.push_str(&format!("[{}]", items.len()));

    if items.iter().all(is_scalar) {
        out.push(':');
        if !items.is_empty() {
            out.push(' ');
            let row: Vec<String> = items.iter().map(encode_scalar).collect();
            out.push_str(&row.join(","));
        }
        out.push('\n');
        return;
    }

    if let Some(fields) = uniform_fields(items) {
        let header: Vec<String> = fields.iter().map(|f| encode_key(f)).collect();
        out.push_str(&format!("{{{}}}:\n", header.join(",")));
        for item in items {
            push_indent(depth + 1, out);
            let row: Vec<String> = fields
                .iter()
                .map(|f| encode_scalar(item.get(f.as_str()).unwrap_or(&Value::Null)))
                .collect();
            out.push_str(&row.join(","));
            out.push('\n');
        }
        return;
    }

    out.push_str(":\n");
    for item in items {
        match item {
            Value::Object(map) if !map.is_empty() => {
                push_indent(depth + 1, out);
                out.push_str("-\n");
                encode_object(map, depth + 2, out);
            }
            Value::Array(inner) => {
                push_indent(depth + 1, out);
                out.push_str("-\n");
                encode_array(None, inner, depth + 2, out);
            }
            _ => {
                push_indent(depth + 1, out);
                out.push_str("- ");
                out.push_str(&encode_scalar(item));
                out.push('\n');
            }
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

/// Shared key order when every item is a non-empty flat object with the same keys
fn uniform_fields(items: &[Value]) -> Option<Vec<String>> {
    let first = items.first()?.as_object()?;
    if first.is_empty() {
        return None;
    }
    let fields: Vec<String> = first.keys().cloned().collect();
    let uniform = items.iter().all(|item| {
        item.as_object().is_some_and(|map| {
            map.len() == fields.len()
                && fields
                    .iter()
                    .all(|f| map.get(f.as_str()).is_some_and(is_scalar))
        })
    });
    uniform.then_some(fields)
}

fn encode_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if bare {
        key.to_string()
    } else {
        quote(key)
    }
}

fn encode_scalar(value: &Value) -> String {
    match value {
        Value::String(s) if needs_quotes(s) => quote(s),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.trim() != s
        || matches!(s, "true" | "false" | "null")
        || s.parse::<f64>().is_ok()
        || s.starts_with('-')
        || s.chars().any(|c| {
            matches!(c, ',' | ':' | '"' | '\\' | '[' | ']' | '{' | '}') || c.is_control()
        })
}

fn quote(s: &str) -> String {
    // serde_json escaping is valid for our quoted form
    Value::String(s.to_string()).to_string()
}
