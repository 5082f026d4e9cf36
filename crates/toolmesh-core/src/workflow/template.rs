//! `${expr}` template rendering.
//!
//! A string that is exactly one `${expr}` yields the raw value (numbers stay
//! numbers, objects stay objects). Otherwise every placeholder is spliced in
//! as text. Objects and arrays are rendered recursively.

use serde_json::{Map, Value};

use super::expr::{self, to_text, ExprError};

/// One `${...}` occurrence: byte range of the whole placeholder plus the
/// expression inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placeholder<'a> {
    start: usize,
    end: usize,
    inner: &'a str,
}

/// Find every placeholder in `template`. A `}` inside a quoted string
/// literal does not close the placeholder.
fn scan(template: &str) -> Result<Vec<Placeholder<'_>>, ExprError> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(offset) = template[from..].find("${") {
        let start = from + offset;
        let body = start + 2;
        let mut quote = None;
        let mut escaped = false;
        let mut close = None;
        for (i, ch) in template[body..].char_indices() {
            match quote {
                Some(_) if escaped => escaped = false,
                Some(_) if ch == '\\' => escaped = true,
                Some(q) if ch == q => quote = None,
                Some(_) => {}
                None if ch == '\'' || ch == '"' => quote = Some(ch),
                None if ch == '}' => {
                    close = Some(body + i);
                    break;
                }
                None => {}
            }
        }
        let Some(close) = close else {
            return Err(ExprError::Template(format!(
                "unterminated placeholder at offset {}",
                start
            )));
        };
        found.push(Placeholder {
            start,
            end: close + 1,
            inner: &template[body..close],
        });
        from = close + 1;
    }
    Ok(found)
}

/// Expressions referenced by `${...}` placeholders in `template`.
pub fn placeholders(template: &str) -> Result<Vec<&str>, ExprError> {
    Ok(scan(template)?.into_iter().map(|p| p.inner).collect())
}

pub fn render_str(template: &str, ctx: &Map<String, Value>) -> Result<Value, ExprError> {
    if !template.contains("${") {
        return Ok(Value::String(template.to_string()));
    }
    let found = scan(template)?;
    if let [only] = found.as_slice() {
        let (before, after) = (&template[..only.start], &template[only.end..]);
        if before.trim().is_empty() && after.trim().is_empty() {
            return expr::evaluate_str(only.inner, ctx);
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for placeholder in found {
        out.push_str(&template[last..placeholder.start]);
        out.push_str(&to_text(&expr::evaluate_str(placeholder.inner, ctx)?));
        last = placeholder.end;
    }
    out.push_str(&template[last..]);
    Ok(Value::String(out))
}

/// Render a string template that must produce text (provider and tool names).
pub fn render_text(template: &str, ctx: &Map<String, Value>) -> Result<String, ExprError> {
    Ok(to_text(&render_str(template, ctx)?))
}

pub fn render_value(template: &Value, ctx: &Map<String, Value>) -> Result<Value, ExprError> {
    match template {
        Value::String(s) => render_str(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| render_value(v, ctx).map(|v| (k.clone(), v)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Collect every placeholder expression inside a JSON template.
pub fn value_placeholders(template: &Value) -> Result<Vec<String>, ExprError> {
    let mut found = Vec::new();
    collect(template, &mut found)?;
    Ok(found)
}

fn collect(template: &Value, found: &mut Vec<String>) -> Result<(), ExprError> {
    match template {
        Value::String(s) => {
            found.extend(placeholders(s)?.into_iter().map(str::to_string));
        }
        Value::Array(items) => {
            for item in items {
                collect(item, found)?;
            }
        }
        Value::Object(map) => {
            for value in map.values() {
                collect(value, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}
