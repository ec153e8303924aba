//! Tool-call extraction from model output.
//!
//! Models emit tool invocations in two text shapes:
//!
//! 1. A JSON object carrying `"name"` and either `"parameters"` or
//!    `"input"`: `{"name": "run_command", "parameters": {"command": "ls"}}`
//! 2. A function-call line: `run_command(command="ls", timeout=30)`
//!
//! Candidates that fail to parse are silently dropped — they are model
//! hallucinations, not errors, and surfacing them would just add noise.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::{ToolCall, ToolParams};

static FUNCTION_CALL: Lazy<Regex> = Lazy::new(|| {
    // name( ... )  — args parsed separately; the lazy body match keeps the
    // regex from swallowing adjacent calls.
    Regex::new(r"(?m)\b([A-Za-z_][A-Za-z0-9_]*)\(([^()]*)\)").expect("function-call regex")
});

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    // key="quoted" | key='quoted' | key=bare
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'|([^,\s][^,]*))"#)
        .expect("key-value regex")
});

/// Extract every recognisable tool call from a block of model output.
///
/// JSON-object candidates are tried first; function-call syntax is only
/// scanned outside the spans the JSON pass consumed, so one invocation is
/// never reported twice.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut consumed: Vec<(usize, usize)> = Vec::new();

    for (start, end, candidate) in json_object_spans(text) {
        if let Some(call) = parse_json_candidate(&candidate) {
            calls.push(call);
            consumed.push((start, end));
        }
    }

    for capture in FUNCTION_CALL.captures_iter(text) {
        let whole = capture.get(0).expect("capture 0 always present");
        if consumed
            .iter()
            .any(|&(s, e)| whole.start() >= s && whole.end() <= e)
        {
            continue;
        }
        let name = capture[1].to_string();
        let args = &capture[2];
        // Bare word() with no key=value args is ordinary prose or code, not
        // a tool call.
        if !args.contains('=') {
            continue;
        }
        let mut params = ToolParams::new();
        for kv in KEY_VALUE.captures_iter(args) {
            let key = kv[1].to_string();
            let value = if let Some(quoted) = kv.get(2).or_else(|| kv.get(3)) {
                Value::String(unescape(quoted.as_str()))
            } else {
                coerce_bare(kv[4].trim())
            };
            params.insert(key, value);
        }
        if !params.is_empty() {
            calls.push(ToolCall { name, params });
        }
    }

    calls
}

/// Balanced-brace object spans in the text, innermost-to-outermost order
/// avoided by skipping nested starts once an object is open.
fn json_object_spans(text: &str) -> Vec<(usize, usize, String)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            let mut end = None;
            for (offset, &b) in bytes[i..].iter().enumerate() {
                if escaped {
                    escaped = false;
                    continue;
                }
                match b {
                    b'\\' if in_string => escaped = true,
                    b'"' => in_string = !in_string,
                    b'{' if !in_string => depth += 1,
                    b'}' if !in_string => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(i + offset + 1);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            match end {
                Some(end) => {
                    spans.push((i, end, text[i..end].to_string()));
                    i = end;
                }
                None => break, // unbalanced tail; nothing more to find
            }
        } else {
            i += 1;
        }
    }
    spans
}

fn parse_json_candidate(candidate: &str) -> Option<ToolCall> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let object = value.as_object()?;
    let name = object.get("name")?.as_str()?.to_string();
    let params = object
        .get("parameters")
        .or_else(|| object.get("input"))?
        .as_object()?
        .clone();
    Some(ToolCall { name, params })
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Coerce an unquoted argument to bool, integer, or string.
fn coerce_bare(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                Value::Number(n.into())
            } else {
                Value::String(raw.to_string())
            }
        }
    }
}
