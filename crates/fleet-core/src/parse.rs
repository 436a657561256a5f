//! Tolerant parsing of structured output produced by external executors.
//!
//! [`parse_structured`] first tries strict JSON. If that fails it applies a
//! single deterministic repair pass (strip markdown code fences, cut the
//! outermost object/array out of surrounding prose, drop trailing commas)
//! and tries once more. On failure the raw text is kept in the error.

use serde_json::Value;

/// Structured output that could not be parsed, with the raw text retained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparseable structured output: {reason}")]
pub struct ParseError {
    pub reason: String,
    pub raw: String,
}

/// Parse `raw` into a JSON value, repairing common formatting damage.
pub fn parse_structured(raw: &str) -> Result<Value, ParseError> {
    let trimmed = raw.trim();
    let first_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let repaired = repair(trimmed);
    serde_json::from_str::<Value>(&repaired).map_err(|e| ParseError {
        reason: if repaired == trimmed {
            first_err.to_string()
        } else {
            format!("{first_err}; after repair: {e}")
        },
        raw: raw.to_string(),
    })
}

fn repair(text: &str) -> String {
    let unfenced = strip_code_fences(text);
    let body = outermost_json(unfenced).unwrap_or(unfenced);
    strip_trailing_commas(body)
}

fn strip_code_fences(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    // Skip an info string such as ```json
    let body_start = after.find('\n').map_or(0, |i| i + 1);
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

fn outermost_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer)?;
    (end > start).then(|| &text[start..=end])
}

fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}' | ']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_json_passes_through() {
        assert_eq!(parse_structured(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn fenced_block_is_unwrapped() {
        let raw = "Here you go:\n```json\n{\"results\": []}\n```\nDone.";
        assert_eq!(parse_structured(raw).unwrap(), json!({"results": []}));
    }

    #[test]
    fn prose_around_object_is_dropped() {
        let raw = "Result follows {\"ok\": true} hope this helps";
        assert_eq!(parse_structured(raw).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn trailing_commas_are_removed() {
        let raw = r#"{"results": [{"id": "a", "status": "success",},],}"#;
        assert_eq!(
            parse_structured(raw).unwrap(),
            json!({"results": [{"id": "a", "status": "success"}]})
        );
    }

    #[test]
    fn commas_inside_strings_survive_repair() {
        let raw = r#"note: {"msg": "a, }", "n": 2,}"#;
        assert_eq!(parse_structured(raw).unwrap(), json!({"msg": "a, }", "n": 2}));
    }

    #[test]
    fn garbage_keeps_raw_text() {
        let err = parse_structured("no json here").unwrap_err();
        assert_eq!(err.raw, "no json here");
        assert!(!err.reason.is_empty());
    }
}
