use serde_json::Value;
use uuid::Uuid;

use crate::model::{FunctionCallingSchema, ToolCall};

/// Recovers structured tool calls from free text when the model was
/// re-invoked without the `tools` field (the tools-not-supported fallback,
/// `spec.md` §4.6's `exec` note) but still tried to call one. Returns an
/// empty vec, never an error — a failed parse just means "no tool calls",
/// per §7's "Parse errors ... yield no tool calls."
pub fn extract_tool_calls(text: &str, schema: FunctionCallingSchema) -> Vec<ToolCall> {
    match schema {
        FunctionCallingSchema::Json => extract_json_tool_calls(text),
        FunctionCallingSchema::Xml => extract_xml_tool_calls(text),
        FunctionCallingSchema::None => Vec::new(),
    }
}

fn extract_json_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let candidate = &rest[start..];
        match first_balanced_object(candidate) {
            Some((object_text, consumed)) => {
                if let Ok(value) = serde_json::from_str::<Value>(object_text) {
                    if let Some(call) = json_object_to_tool_call(&value) {
                        calls.push(call);
                    }
                }
                rest = &candidate[consumed..];
            }
            None => break,
        }
    }
    calls
}

/// Finds the first balanced `{...}` span in `text`, respecting string
/// literals so a brace inside a quoted argument value doesn't unbalance the
/// scan. Returns the slice and how many bytes were consumed.
fn first_balanced_object(text: &str) -> Option<(&str, usize)> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&text[..=i], i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

fn json_object_to_tool_call(value: &Value) -> Option<ToolCall> {
    let name = value.get("name").and_then(Value::as_str)?;
    let arguments = value.get("arguments").cloned().unwrap_or_else(|| Value::Object(Default::default()));
    Some(ToolCall::new(new_call_id(), name, arguments))
}

fn extract_xml_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut rest = text;
    while let Some(open_start) = rest.find('<') {
        let after_open = &rest[open_start + 1..];
        let Some(name_end) = after_open.find('>') else { break };
        let tag = &after_open[..name_end];
        if tag.is_empty() || tag.starts_with('/') || tag.contains(char::is_whitespace) {
            rest = &after_open[name_end + 1..];
            continue;
        }
        let closing_tag = format!("</{tag}>");
        let body_start = &after_open[name_end + 1..];
        match body_start.find(&closing_tag) {
            Some(body_end) => {
                let body = &body_start[..body_end];
                let arguments = parse_xml_arguments(body);
                calls.push(ToolCall::new(new_call_id(), tag, arguments));
                rest = &body_start[body_end + closing_tag.len()..];
            }
            None => {
                rest = body_start;
            }
        }
    }
    calls
}

fn parse_xml_arguments(body: &str) -> Value {
    let mut map = serde_json::Map::new();
    let mut rest = body;
    while let Some(open_start) = rest.find('<') {
        let after_open = &rest[open_start + 1..];
        let Some(name_end) = after_open.find('>') else { break };
        let tag = after_open[..name_end].trim();
        if tag.is_empty() || tag.starts_with('/') {
            rest = &after_open[name_end + 1..];
            continue;
        }
        let closing_tag = format!("</{tag}>");
        let value_start = &after_open[name_end + 1..];
        match value_start.find(&closing_tag) {
            Some(value_end) => {
                map.insert(tag.to_string(), Value::String(value_start[..value_end].trim().to_string()));
                rest = &value_start[value_end + closing_tag.len()..];
            }
            None => break,
        }
    }
    Value::Object(map)
}

fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_a_single_json_tool_call() {
        let text = r#"Sure, calling it now: {"name": "echo", "arguments": {"x": "ping"}} done."#;
        let calls = extract_tool_calls(text, FunctionCallingSchema::Json);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "echo");
        assert_eq!(calls[0].arguments_value().unwrap(), serde_json::json!({"x": "ping"}));
    }

    #[test]
    fn json_extraction_ignores_unrelated_objects() {
        let text = r#"here is some data: {"foo": "bar"}"#;
        let calls = extract_tool_calls(text, FunctionCallingSchema::Json);
        assert!(calls.is_empty());
    }

    #[test]
    fn extracts_xml_tool_call_with_nested_args() {
        let text = "<search>\n<q>rust async traits</q>\n</search>";
        let calls = extract_tool_calls(text, FunctionCallingSchema::Xml);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(
            calls[0].arguments_value().unwrap(),
            serde_json::json!({"q": "rust async traits"})
        );
    }

    #[test]
    fn none_schema_never_extracts_anything() {
        let calls = extract_tool_calls(r#"{"name": "echo", "arguments": {}}"#, FunctionCallingSchema::None);
        assert!(calls.is_empty());
    }
}
