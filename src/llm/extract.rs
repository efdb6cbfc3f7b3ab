//! JSON extraction from model output.
//!
//! Structured-output responses often wrap JSON in commentary or a fenced
//! code block. The extractor scans for a fenced `json` block first, then
//! falls back to the last balanced object or array in the text.

use serde_json::Value;

/// Extract the JSON payload from model text.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(fenced) = extract_fenced(text) {
        if let Ok(value) = serde_json::from_str(fenced.trim()) {
            return Some(value);
        }
    }

    extract_last_balanced(text).and_then(|candidate| serde_json::from_str(candidate).ok())
}

/// Find the contents of the first ```json fenced block.
fn extract_fenced(text: &str) -> Option<&str> {
    let fence_start = text
        .find("```json")
        .or_else(|| text.find("```JSON"))
        .or_else(|| text.find("```Json"))?;
    let body_start = fence_start + "```json".len();
    let rest = &text[body_start..];
    let fence_end = rest.find("```")?;
    Some(&rest[..fence_end])
}

/// Find the last balanced `{…}` or `[…]` region in the text.
///
/// Scans backwards over candidate closers, matching braces with string and
/// escape awareness so embedded quotes don't break the balance count.
fn extract_last_balanced(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();

    for end in (0..bytes.len()).rev() {
        let close = bytes[end];
        if close != b'}' && close != b']' {
            continue;
        }
        let open = if close == b'}' { b'{' } else { b'[' };

        let mut depth = 0i32;
        let mut in_string = false;
        let mut start = None;

        for i in (0..=end).rev() {
            let b = bytes[i];
            if in_string {
                // Reverse scan: a quote is the string boundary unless the
                // preceding byte escapes it
                if b == b'"' && (i == 0 || bytes[i - 1] != b'\\') {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b if b == close => depth += 1,
                b if b == open => {
                    depth -= 1;
                    if depth == 0 {
                        start = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }

        if let Some(start) = start {
            let candidate = &text[start..=end];
            if serde_json::from_str::<Value>(candidate).is_ok() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here is the result:\n```json\n{\"a\": 1}\n```\nThanks!";
        assert_eq!(extract_json(text), Some(json!({"a": 1})));
    }

    #[test]
    fn test_extract_fenced_block_case_insensitive() {
        let text = "```JSON\n[1, 2, 3]\n```";
        assert_eq!(extract_json(text), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_extract_bare_object() {
        let text = r#"The answer is {"name": "Ada", "age": 36} as requested."#;
        assert_eq!(extract_json(text), Some(json!({"name": "Ada", "age": 36})));
    }

    #[test]
    fn test_extract_last_of_multiple() {
        let text = r#"First {"a": 1} then {"b": 2}"#;
        assert_eq!(extract_json(text), Some(json!({"b": 2})));
    }

    #[test]
    fn test_extract_array() {
        let text = "items: [1, 2, 3]";
        assert_eq!(extract_json(text), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_nested_and_quoted_braces() {
        let text = r#"{"outer": {"inner": "has } brace"}}"#;
        assert_eq!(
            extract_json(text),
            Some(json!({"outer": {"inner": "has } brace"}}))
        );
    }

    #[test]
    fn test_no_json() {
        assert_eq!(extract_json("no structured data here"), None);
    }

    #[test]
    fn test_pure_json() {
        assert_eq!(extract_json(r#"{"ok": true}"#), Some(json!({"ok": true})));
    }
}
