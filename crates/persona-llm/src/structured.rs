//! Recovery parsing for structured (JSON) model output.
//!
//! Models asked for "only a JSON object" still wrap it in prose or code fences
//! often enough that callers need a tiered parser. Each tier is tried in order:
//! the raw text, the text with code fences removed, then the first balanced
//! `{...}` span. Callers decide the fallback for [`ParseOutcome::Malformed`].

use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    Parsed(T),
    Malformed,
}

impl<T> ParseOutcome<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            ParseOutcome::Parsed(v) => Some(v),
            ParseOutcome::Malformed => None,
        }
    }

    pub fn unwrap_or_else(self, fallback: impl FnOnce() -> T) -> T {
        match self {
            ParseOutcome::Parsed(v) => v,
            ParseOutcome::Malformed => fallback(),
        }
    }
}

pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> ParseOutcome<T> {
    let text = raw.trim();
    if text.is_empty() {
        return ParseOutcome::Malformed;
    }

    if let Ok(v) = serde_json::from_str::<T>(text) {
        return ParseOutcome::Parsed(v);
    }

    let unfenced = strip_code_fences(text);
    if unfenced != text {
        if let Ok(v) = serde_json::from_str::<T>(unfenced) {
            return ParseOutcome::Parsed(v);
        }
    }

    if let Some(span) = first_object_span(unfenced).or_else(|| first_object_span(text)) {
        if let Ok(v) = serde_json::from_str::<T>(span) {
            return ParseOutcome::Parsed(v);
        }
    }

    tracing::debug!(chars = text.chars().count(), "model output is not valid structured output");
    ParseOutcome::Malformed
}

/// Returns the body of the first fenced block, or the trimmed input if there is none.
/// A language tag right after the opening fence (```json) is dropped.
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(open) = text.find("```") else {
        return text;
    };
    let body = text[open + 3..].trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    let end = body.find("```").unwrap_or(body.len());
    body[..end].trim()
}

/// First balanced `{...}` span, ignoring braces inside string literals.
fn first_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Summary {
        summary: String,
    }

    fn summary(raw: &str) -> Option<String> {
        parse_structured::<Summary>(raw).ok().map(|s| s.summary)
    }

    #[test]
    fn test_raw_json() {
        assert_eq!(summary(r#"{"summary":"x"}"#).as_deref(), Some("x"));
    }

    #[test]
    fn test_code_fenced_json() {
        assert_eq!(
            summary("```json\n{\"summary\":\"x\"}\n```").as_deref(),
            Some("x")
        );
        assert_eq!(summary("```\n{\"summary\":\"y\"}```").as_deref(), Some("y"));
    }

    #[test]
    fn test_json_inside_prose() {
        let raw = "Sure! Here is the result: {\"summary\": \"uses {braces} inside\"} Hope it helps.";
        assert_eq!(summary(raw).as_deref(), Some("uses {braces} inside"));
    }

    #[test]
    fn test_escaped_quotes_in_string() {
        let raw = r#"note {"summary": "say \"hi\" }"} trailing"#;
        assert_eq!(summary(raw).as_deref(), Some("say \"hi\" }"));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(parse_structured::<Summary>("no json here"), ParseOutcome::Malformed);
        assert_eq!(parse_structured::<Summary>("{\"summary\": "), ParseOutcome::Malformed);
        assert_eq!(parse_structured::<Summary>("   "), ParseOutcome::Malformed);
    }

    #[test]
    fn test_strip_code_fences_passthrough() {
        assert_eq!(strip_code_fences("  plain text "), "plain text");
        assert_eq!(strip_code_fences("```text\nbody\n```"), "body");
    }
}
