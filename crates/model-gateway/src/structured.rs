//! Structured (JSON) output recovery.
//!
//! Model text is parsed in two steps: the whole response (minus markdown
//! fences) first, then the largest balanced `{...}` span found anywhere in the
//! text. Anything still unparseable, or parseable but not matching the target
//! type, becomes `ModelError::Parse` carrying a truncated copy of the raw text.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ModelError;

/// Raw model text kept in a `Parse` error, in bytes.
pub const MAX_RAW_DIAGNOSTIC: usize = 2000;

/// Truncate a string to at most `max_bytes` bytes at a character boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// Strip markdown code blocks from a response.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Longest substring that starts with `{` and ends at its matching `}`.
/// Braces inside JSON string literals are ignored.
pub fn largest_balanced_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;

    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' {
            continue;
        }
        if let Some((s, e)) = best {
            // Spans starting inside the current best cannot be longer
            if start < e && start > s {
                continue;
            }
        }
        if let Some(end) = matching_brace(bytes, start) {
            let longer = best.map(|(s, e)| end - start > e - s).unwrap_or(true);
            if longer {
                best = Some((start, end));
            }
        }
    }

    best.map(|(s, e)| &text[s..=e])
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
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
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_error(reason: impl Into<String>, raw: &str) -> ModelError {
    ModelError::Parse {
        reason: reason.into(),
        raw: truncate_to_char_boundary(raw, MAX_RAW_DIAGNOSTIC).to_string(),
    }
}

/// Parse model text into a JSON value using the two-step recovery.
pub fn parse_value(text: &str) -> Result<Value, ModelError> {
    let first_err = match serde_json::from_str::<Value>(strip_code_blocks(text)) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Some(candidate) = largest_balanced_object(text) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            tracing::debug!("Recovered JSON object from surrounding model text");
            return Ok(value);
        }
    }

    Err(parse_error(format!("invalid JSON: {}", first_err), text))
}

/// Parse model text and validate it against `T`.
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T, ModelError> {
    let value = parse_value(text)?;
    serde_json::from_value(value).map_err(|e| parse_error(format!("schema violation: {}", e), text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        decision: String,
        score: u8,
    }

    #[test]
    fn test_truncate_to_char_boundary() {
        let text = "Hello 世界";
        let truncated = truncate_to_char_boundary(text, 8);
        assert!(truncated.len() <= 8);
        assert!(text.starts_with(truncated));
        assert_eq!(truncate_to_char_boundary("Hello", 100), "Hello");
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("{}"), "{}");
    }

    #[test]
    fn test_direct_parse() {
        let reply: Reply = parse_structured(r#"{"decision":"BUY","score":7}"#).unwrap();
        assert_eq!(reply, Reply { decision: "BUY".into(), score: 7 });
    }

    #[test]
    fn test_fenced_parse() {
        let reply: Reply = parse_structured("```json\n{\"decision\":\"SELL\",\"score\":3}\n```").unwrap();
        assert_eq!(reply.decision, "SELL");
    }

    #[test]
    fn test_recovers_object_from_prose() {
        let text = r#"Sure! Here is my analysis: {"decision":"BUY","score":8,"note":"a } inside"} Hope that helps {x}"#;
        let reply: Reply = parse_structured(text).unwrap();
        assert_eq!(reply.score, 8);
    }

    #[test]
    fn test_largest_object_wins() {
        let text = r#"{"a":1} and then {"decision":"BUY","score":1}"#;
        assert_eq!(
            largest_balanced_object(text),
            Some(r#"{"decision":"BUY","score":1}"#)
        );
    }

    #[test]
    fn test_stray_open_brace_is_skipped() {
        let text = r#"{ unfinished thought... {"decision":"SELL","score":2}"#;
        let reply: Reply = parse_structured(text).unwrap();
        assert_eq!(reply.decision, "SELL");
    }

    #[test]
    fn test_unrecoverable_text_is_parse_error() {
        let err = parse_structured::<Reply>("I cannot answer that.").unwrap_err();
        match err {
            ModelError::Parse { raw, .. } => assert_eq!(raw, "I cannot answer that."),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_schema_violation_is_parse_error() {
        let err = parse_structured::<Reply>(r#"{"decision":"BUY"}"#).unwrap_err();
        assert!(matches!(err, ModelError::Parse { ref reason, .. } if reason.contains("schema")));
    }

    #[test]
    fn test_raw_text_truncated() {
        let long = "x".repeat(MAX_RAW_DIAGNOSTIC * 2);
        match parse_structured::<Reply>(&long).unwrap_err() {
            ModelError::Parse { raw, .. } => assert_eq!(raw.len(), MAX_RAW_DIAGNOSTIC),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
