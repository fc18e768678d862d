//! Layered JSON extraction from language-model output.
//!
//! Models are treated as an unreliable external service: their output must
//! pass through this validating adapter before it enters the typed data
//! model. Extraction is attempted in order:
//!
//! 1. a fenced ```json code block
//! 2. the first balanced `{ ... }` object in the raw text
//! 3. the raw text parsed as JSON directly
//!
//! Callers pair a failed extraction with a named sentinel value (e.g.
//! `QueryAnalysis::fallback`), so a malformed model response never
//! propagates as an error.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap())
}

/// Extract the first JSON object from model output, trying each layer in turn.
pub fn extract_json_object(text: &str) -> Option<Value> {
    if let Some(caps) = fenced_block_re().captures(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&caps[1]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    if let Some(candidate) = first_balanced_object(text) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    serde_json::from_str::<Value>(text.trim())
        .ok()
        .filter(|v| v.is_object())
}

/// Find the first balanced `{ ... }` span, respecting string literals.
fn first_balanced_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read a numeric field, accepting numbers or numeric strings.
pub fn field_f64(obj: &Value, key: &str, default: f64) -> f64 {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

/// Read a boolean field, accepting bools or "true"/"false" strings.
pub fn field_bool(obj: &Value, key: &str, default: bool) -> bool {
    match obj.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => default,
        },
        _ => default,
    }
}

/// Read a string field, or the default when absent or not a string.
pub fn field_string(obj: &Value, key: &str, default: &str) -> String {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| default.to_string())
}

/// Read a string-list field, skipping non-string entries. Missing → empty.
pub fn field_string_list(obj: &Value, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_fenced_json_block() {
        let text = "Here you go:\n```json\n{\"complexity\": \"simple\"}\n```\nDone.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["complexity"], "simple");
    }

    #[test]
    fn extracts_unfenced_block() {
        let text = "```\n{\"a\": 1}\n```";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn extracts_bare_object_from_prose() {
        let text = "Sure! The result is {\"score\": 0.7, \"note\": \"a {nested} brace\"} as requested.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["score"], 0.7);
    }

    #[test]
    fn respects_braces_inside_strings() {
        let text = r#"{"msg": "open { and close }", "n": 2}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["n"], 2);
    }

    #[test]
    fn parses_raw_json_text() {
        let value = extract_json_object("  {\"ok\": true}  ").unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn returns_none_for_garbage() {
        assert!(extract_json_object("no json here at all").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn field_helpers_tolerate_type_drift() {
        let obj = json!({
            "score": "7.5",
            "flag": "true",
            "name": 42,
            "items": ["a", 1, "b"]
        });
        assert_eq!(field_f64(&obj, "score", 0.0), 7.5);
        assert!(field_bool(&obj, "flag", false));
        assert_eq!(field_string(&obj, "name", "fallback"), "fallback");
        assert_eq!(field_string_list(&obj, "items"), vec!["a", "b"]);
        assert_eq!(field_f64(&obj, "missing", 1.25), 1.25);
    }
}
