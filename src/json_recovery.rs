//! Robust JSON recovery for LLM extractor outputs (spec §4.8).
//!
//! Grounded in `risk_briefing::extract_json_object`'s brace-depth scanner and
//! `intelligence::prompts::extract_json_from_response`'s fenced-code cascade;
//! unified here into one pipeline shared by every extractor.

use serde::de::DeserializeOwned;

use crate::error::{Result, TimeboxError};

/// Try, in order: (a) plain JSON, (b) fenced code (```` ``` ```` or ```` ```json ````),
/// (c) the first JSON object embedded in prose, (d) a double-encoded JSON string.
pub fn recover_json_object(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }

    if let Some(fenced) = extract_fenced(trimmed, "```json") {
        if serde_json::from_str::<serde_json::Value>(&fenced).is_ok() {
            return Some(fenced);
        }
    }
    if let Some(fenced) = extract_fenced(trimmed, "```") {
        if fenced.trim_start().starts_with('{') && serde_json::from_str::<serde_json::Value>(&fenced).is_ok() {
            return Some(fenced);
        }
    }

    if let Some(embedded) = extract_json_object_by_brace_depth(trimmed) {
        return Some(embedded);
    }

    // Double-encoded: the whole response is itself a JSON string containing JSON.
    if let Ok(serde_json::Value::String(inner)) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(embedded) = extract_json_object_by_brace_depth(&inner) {
            return Some(embedded);
        }
    }

    None
}

fn extract_fenced(text: &str, marker: &str) -> Option<String> {
    let start = text.find(marker)?;
    let after_marker = start + marker.len();
    let rest = &text[after_marker..];
    let body_start = if marker == "```json" { rest } else { rest.trim_start_matches(|c: char| c != '\n').get(1..).unwrap_or(rest) };
    let end = body_start.find("```")?;
    Some(body_start[..end].trim().to_string())
}

/// First balanced `{...}` object found, aware of string escapes (ignores
/// braces inside quoted strings).
fn extract_json_object_by_brace_depth(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escape {
            escape = false;
            continue;
        }
        if b == b'\\' && in_string {
            escape = true;
            continue;
        }
        if b == b'"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..=i];
                    if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                        return Some(candidate.to_string());
                    }
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

/// Run the full recovery pipeline and deserialize into `T`, mapping all
/// failure modes to `TimeboxError::Parse`.
pub fn recover_and_parse<T: DeserializeOwned>(text: &str) -> Result<T> {
    let recovered = recover_json_object(text).ok_or_else(|| TimeboxError::Parse(format!("no JSON object recoverable from response: {text:?}")))?;
    serde_json::from_str(&recovered).map_err(|e| TimeboxError::Parse(format!("failed to deserialize recovered JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        ok: bool,
    }

    #[test]
    fn recovers_plain_json() {
        let parsed: Sample = recover_and_parse(r#"{"ok": true}"#).unwrap();
        assert_eq!(parsed, Sample { ok: true });
    }

    #[test]
    fn recovers_json_fenced_with_language_tag() {
        let text = "Sure, here you go:\n```json\n{\"ok\": true}\n```\nHope that helps.";
        let parsed: Sample = recover_and_parse(text).unwrap();
        assert_eq!(parsed, Sample { ok: true });
    }

    #[test]
    fn recovers_json_fenced_without_language_tag() {
        let text = "```\n{\"ok\": true}\n```";
        let parsed: Sample = recover_and_parse(text).unwrap();
        assert_eq!(parsed, Sample { ok: true });
    }

    #[test]
    fn recovers_json_embedded_in_prose() {
        let text = "The answer is {\"ok\": true} as requested.";
        let parsed: Sample = recover_and_parse(text).unwrap();
        assert_eq!(parsed, Sample { ok: true });
    }

    #[test]
    fn recovers_double_encoded_json_string() {
        let text = r#""{\"ok\": true}""#;
        let parsed: Sample = recover_and_parse(text).unwrap();
        assert_eq!(parsed, Sample { ok: true });
    }

    #[test]
    fn ignores_braces_inside_strings_when_scanning() {
        let text = r#"noise {"ok": true, "note": "contains a } brace"} trailing"#;
        let parsed: Sample = recover_and_parse(text).unwrap();
        assert_eq!(parsed, Sample { ok: true });
    }

    #[test]
    fn fails_on_unrecoverable_text() {
        let err = recover_and_parse::<Sample>("no json here at all").unwrap_err();
        assert!(matches!(err, TimeboxError::Parse(_)));
    }
}
