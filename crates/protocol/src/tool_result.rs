//! Tool-result payload extraction.
//!
//! The agent reports tool results in half a dozen shapes depending on the
//! tool. [`extract_tool_result`] normalizes all of them into
//! stdout/stderr/is_error; the ladder is ordered and the first matching
//! shape wins.

use serde_json::Value;

/// Normalized tool result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedResult {
    pub stdout: String,
    pub stderr: String,
    pub is_error: bool,
}

/// How many `files`/`matches` entries are rendered before truncation.
const LIST_PREVIEW_LEN: usize = 10;

/// Normalize a `tool_use_result` payload. First matching shape wins:
///
/// 1. scalar string → stdout
/// 2. `{stdout, stderr?, isError?}` → verbatim
/// 3. `{file: {content}}` → stdout = content
/// 4. `{newTodos, oldTodos}` → stdout = todo diff
/// 5. `{files: []}` → first 10 joined, `… and N more` when truncated
/// 6. `{matches: []}` → formatted matches, same truncation
/// 7. `{content | output | result | text}` → normalized to string
///
/// Unknown maps render as compact JSON minus `isError`/`type`.
pub fn extract_tool_result(payload: &Value) -> ExtractedResult {
    // 1. Scalar string.
    if let Value::String(s) = payload {
        return ExtractedResult {
            stdout: s.clone(),
            ..Default::default()
        };
    }

    let Some(map) = payload.as_object() else {
        // Numbers, bools, arrays: render as-is.
        return ExtractedResult {
            stdout: payload.to_string(),
            ..Default::default()
        };
    };

    let is_error = map
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    // 2. Exec-style {stdout, stderr?, isError?}.
    if let Some(stdout) = map.get("stdout") {
        return ExtractedResult {
            stdout: value_to_text(stdout),
            stderr: map.get("stderr").map(value_to_text).unwrap_or_default(),
            is_error,
        };
    }

    // 3. File read {file: {content}}.
    if let Some(content) = map
        .get("file")
        .and_then(|f| f.get("content"))
    {
        return ExtractedResult {
            stdout: value_to_text(content),
            is_error,
            ..Default::default()
        };
    }

    // 4. Todo list update.
    if let (Some(new), old) = (
        map.get("newTodos").and_then(Value::as_array),
        map.get("oldTodos").and_then(Value::as_array),
    ) {
        return ExtractedResult {
            stdout: todo_diff(old.map(|v| v.as_slice()).unwrap_or(&[]), new),
            is_error,
            ..Default::default()
        };
    }

    // 5. File listing.
    if let Some(files) = map.get("files").and_then(Value::as_array) {
        return ExtractedResult {
            stdout: preview_list(files, |v| value_to_text(v)),
            is_error,
            ..Default::default()
        };
    }

    // 6. Search matches.
    if let Some(matches) = map.get("matches").and_then(Value::as_array) {
        return ExtractedResult {
            stdout: preview_list(matches, format_match),
            is_error,
            ..Default::default()
        };
    }

    // 7. Generic content-ish keys.
    for key in ["content", "output", "result", "text"] {
        if let Some(v) = map.get(key) {
            return ExtractedResult {
                stdout: value_to_text(v),
                is_error,
                ..Default::default()
            };
        }
    }

    // Unknown map: compact JSON minus bookkeeping keys.
    let mut stripped = map.clone();
    stripped.remove("isError");
    stripped.remove("type");
    ExtractedResult {
        stdout: Value::Object(stripped).to_string(),
        is_error,
        ..Default::default()
    }
}

/// Render a value as display text: strings verbatim, arrays of text
/// blocks concatenated, everything else compact JSON.
fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                match item {
                    Value::String(s) => out.push_str(s),
                    Value::Object(o) => {
                        if let Some(Value::String(text)) = o.get("text") {
                            out.push_str(text);
                        } else {
                            out.push_str(&item.to_string());
                        }
                    }
                    other => out.push_str(&other.to_string()),
                }
            }
            out
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn format_match(m: &Value) -> String {
    if let Some(o) = m.as_object() {
        let file = o.get("file").or_else(|| o.get("path")).map(value_to_text);
        let line = o.get("line").or_else(|| o.get("line_number"));
        match (file, line) {
            (Some(file), Some(line)) => return format!("{file}:{line}"),
            (Some(file), None) => return file,
            _ => {}
        }
    }
    value_to_text(m)
}

fn preview_list(items: &[Value], render: impl Fn(&Value) -> String) -> String {
    let mut out: Vec<String> = items.iter().take(LIST_PREVIEW_LEN).map(&render).collect();
    if items.len() > LIST_PREVIEW_LEN {
        out.push(format!("… and {} more", items.len() - LIST_PREVIEW_LEN));
    }
    out.join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Todo diff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One line per entry of the new list: `+` for items absent from the old
/// list, otherwise a status marker (`✓` completed, `→` in-progress,
/// `○` pending).
fn todo_diff(old: &[Value], new: &[Value]) -> String {
    let old_keys: Vec<String> = old.iter().map(todo_key).collect();

    new.iter()
        .map(|todo| {
            let marker = if !old_keys.contains(&todo_key(todo)) {
                "+"
            } else {
                match todo.get("status").and_then(Value::as_str) {
                    Some("completed") => "✓",
                    Some("in_progress") => "→",
                    _ => "○",
                }
            };
            format!("{marker} {}", todo_label(todo))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn todo_key(todo: &Value) -> String {
    todo.get("id")
        .map(value_to_text)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| todo_label(todo))
}

fn todo_label(todo: &Value) -> String {
    todo.get("content")
        .or_else(|| todo.get("title"))
        .map(value_to_text)
        .unwrap_or_else(|| todo.to_string())
}
