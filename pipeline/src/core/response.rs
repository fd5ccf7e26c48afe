//! Interpretation of free-form reasoning-service output as JSON.
//!
//! The service is asked for a single JSON value but routinely wraps it in code
//! fences, surrounds it with prose, or emits invalid escapes and raw control
//! characters inside strings. [`interpret`] isolates the first balanced JSON
//! span and runs it through progressively looser repairs until one parses.

use serde_json::Value;
use tracing::debug;

use crate::core::errors::{ResponseFormatError, preview};

/// Maximum bytes of offending text kept in a failure preview.
pub const PREVIEW_LIMIT: usize = 200;

/// Outcome of interpreting one response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Parsed(Value),
    Failed { reason: String, preview: String },
}

impl ParsedResponse {
    pub fn into_result(self) -> Result<Value, ResponseFormatError> {
        match self {
            ParsedResponse::Parsed(value) => Ok(value),
            ParsedResponse::Failed { reason, preview } => {
                Err(ResponseFormatError { reason, preview })
            }
        }
    }
}

/// Extract the JSON value embedded in `text`.
///
/// When the value is an array, its first non-array object element is returned
/// instead (arrays without such an element are returned unchanged).
pub fn interpret(text: &str) -> ParsedResponse {
    let stripped = strip_code_fences(text);
    let Some(span) = locate_json_span(stripped) else {
        return ParsedResponse::Failed {
            reason: "no balanced JSON object or array found".to_string(),
            preview: preview(text.trim(), PREVIEW_LIMIT),
        };
    };
    match parse_with_repairs(span) {
        Ok(value) => ParsedResponse::Parsed(unwrap_single_object(value)),
        Err(reason) => ParsedResponse::Failed {
            reason,
            preview: preview(span, PREVIEW_LIMIT),
        },
    }
}

/// Strip a leading fence line (```` ``` ```` or ```` ```json ````) and a
/// trailing fence marker.
fn strip_code_fences(text: &str) -> &str {
    let mut clean = text.trim();
    if clean.starts_with("```") {
        clean = match clean.find('\n') {
            Some(idx) => &clean[idx + 1..],
            None => clean.trim_start_matches('`'),
        };
    }
    if let Some(stripped) = clean.trim_end().strip_suffix("```") {
        clean = stripped;
    }
    clean.trim()
}

/// Find the minimal balanced span starting at the first `{` or `[`.
///
/// The delimiter that appears first is tried first; if it never balances the
/// other one is tried.
fn locate_json_span(text: &str) -> Option<&str> {
    let mut starts: Vec<usize> = ['{', '[']
        .iter()
        .filter_map(|open| text.find(*open))
        .collect();
    starts.sort_unstable();
    starts
        .into_iter()
        .find_map(|start| balanced_span_from(text, start))
}

fn balanced_span_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (offset, c) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    let end = start + offset + c.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_with_repairs(span: &str) -> Result<Value, String> {
    let strict_err = match serde_json::from_str::<Value>(span) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    let escaped = repair_escapes(span);
    if let Ok(value) = serde_json::from_str::<Value>(&escaped) {
        debug!("response parsed after escape repair");
        return Ok(value);
    }

    let sanitized = sanitize_control_chars(&escaped);
    if let Ok(value) = serde_json::from_str::<Value>(&sanitized) {
        debug!("response parsed after control-character sanitization");
        return Ok(value);
    }

    let repaired = best_effort_repair(&sanitized);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            debug!("response parsed after best-effort repair");
            Ok(value)
        }
        Err(err) => Err(format!(
            "invalid JSON ({strict_err}); still invalid after repair ({err})"
        )),
    }
}

/// Double every backslash inside a string literal that does not start a valid
/// JSON escape.
fn repair_escapes(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = false;
                out.push(c);
                i += 1;
            }
            '\\' => match chars.get(i + 1) {
                Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't') => {
                    out.push(c);
                    out.push(chars[i + 1]);
                    i += 2;
                }
                Some('u') if is_unicode_escape(&chars[i + 2..]) => {
                    out.extend(&chars[i..i + 6]);
                    i += 6;
                }
                _ => {
                    out.push_str("\\\\");
                    i += 1;
                }
            },
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn is_unicode_escape(rest: &[char]) -> bool {
    rest.len() >= 4 && rest[..4].iter().all(char::is_ascii_hexdigit)
}

/// Rewrite raw 0x00-0x1F characters inside string literals as `\u00XX`.
fn sanitize_control_chars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escape_next = false;

    for c in input.chars() {
        if in_string {
            if escape_next {
                escape_next = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escape_next = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

/// Last-resort fixes: typographic quotes used as string delimiters, trailing
/// commas, and `//` line comments outside strings.
fn best_effort_repair(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    // Closing delimiter of the string we are in, if any.
    let mut closer: Option<char> = None;
    let mut escape_next = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(close) = closer {
            if escape_next {
                escape_next = false;
                out.push(c);
            } else if c == '\\' {
                escape_next = true;
                out.push(c);
            } else if c == close || (close == '\u{201D}' && c == '\u{201C}') {
                closer = None;
                out.push('"');
            } else if c == '"' {
                // Plain quote inside a typographic string.
                out.push_str("\\\"");
            } else {
                out.push(c);
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                closer = Some('"');
                out.push('"');
            }
            '\u{201C}' | '\u{201D}' => {
                closer = Some('\u{201D}');
                out.push('"');
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '}' | ']' => {
                let trimmed_len = out.trim_end().len();
                if out[..trimmed_len].ends_with(',') {
                    out.replace_range(trimmed_len - 1..trimmed_len, "");
                }
                out.push(c);
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

fn unwrap_single_object(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            if let Some(idx) = items.iter().position(Value::is_object) {
                return items.into_iter().nth(idx).unwrap_or(Value::Null);
            }
            Value::Array(items)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parsed(text: &str) -> Value {
        match interpret(text) {
            ParsedResponse::Parsed(value) => value,
            ParsedResponse::Failed { reason, .. } => panic!("expected parse, got: {reason}"),
        }
    }

    #[test]
    fn extracts_object_surrounded_by_prose() {
        let text = "Sure! Here is the plan:\n{\"a\": 1, \"b\": [1, 2]}\nLet me know.";
        assert_eq!(parsed(text), json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn braces_inside_strings_do_not_end_the_span() {
        let text = r#"prefix {"code": "fn main() { println!(\"}\"); }", "n": 2} suffix }"#;
        assert_eq!(
            parsed(text),
            json!({"code": "fn main() { println!(\"}\"); }", "n": 2})
        );
    }

    #[test]
    fn strips_code_fences() {
        let text = "```json\n{\"edits\": []}\n```";
        assert_eq!(parsed(text), json!({"edits": []}));
    }

    #[test]
    fn fenced_block_after_prose() {
        let text = "Result follows.\n```json\n{\"ok\": true}\n```\nDone.";
        assert_eq!(parsed(text), json!({"ok": true}));
    }

    #[test]
    fn repairs_invalid_backslash_escape() {
        let text = r#"{"pattern": "\d+\.\d+", "path": "C:\temp\x"}"#;
        assert_eq!(
            parsed(text),
            json!({"pattern": "\\d+\\.\\d+", "path": "C:\temp\\x"})
        );
    }

    #[test]
    fn keeps_valid_unicode_escape_and_repairs_short_one() {
        let text = r#"{"a": "\u00e9", "b": "\u12"}"#;
        assert_eq!(parsed(text), json!({"a": "é", "b": "\\u12"}));
    }

    #[test]
    fn sanitizes_raw_control_characters() {
        let text = "{\"content\": \"line one\nline two\tend\"}";
        assert_eq!(parsed(text), json!({"content": "line one\nline two\tend"}));
    }

    #[test]
    fn best_effort_repairs_trailing_commas_and_comments() {
        let text = "{\n  \"a\": [1, 2,],\n  // note\n  \"b\": \"x, }\",\n}";
        assert_eq!(parsed(text), json!({"a": [1, 2], "b": "x, }"}));
    }

    #[test]
    fn best_effort_repairs_typographic_quotes() {
        let text = "{\u{201C}title\u{201D}: \u{201C}say \"hi\"\u{201D}}";
        assert_eq!(parsed(text), json!({"title": "say \"hi\""}));
    }

    #[test]
    fn array_wrapping_single_object_is_unwrapped() {
        let text = r#"[[1], {"path": "a.ts"}, {"path": "b.ts"}]"#;
        assert_eq!(parsed(text), json!({"path": "a.ts"}));
    }

    #[test]
    fn array_without_objects_is_returned_as_is() {
        assert_eq!(parsed("[1, 2, 3]"), json!([1, 2, 3]));
    }

    #[test]
    fn earliest_delimiter_wins() {
        let text = r#"[{"x": {"y": 1}}] and {"z": 2}"#;
        assert_eq!(parsed(text), json!({"x": {"y": 1}}));
    }

    #[test]
    fn falls_back_to_other_delimiter_when_first_never_balances() {
        let text = r#"list [unterminated then {"ok": 1}"#;
        assert_eq!(parsed(text), json!({"ok": 1}));
    }

    #[test]
    fn missing_json_fails_with_bounded_preview() {
        let text = "no structure here ".repeat(40);
        let ParsedResponse::Failed { reason, preview } = interpret(&text) else {
            panic!("expected failure");
        };
        assert!(reason.contains("no balanced JSON"));
        assert!(preview.len() <= PREVIEW_LIMIT + 3);
    }

    #[test]
    fn unrepairable_span_fails() {
        let err = interpret("{\"a\": nope}").into_result().unwrap_err();
        assert!(err.reason.contains("invalid JSON"));
        assert_eq!(err.preview, "{\"a\": nope}");
    }
}
