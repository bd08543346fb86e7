use serde::{Deserialize, Serialize};

/// Tunable caps for ingestion, retrieval and tool calls.
///
/// Character caps are heuristics for token cost; adjust them to the context
/// window of the deployed models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Upload size cap, enforced before normalization
    pub max_upload_bytes: usize,
    /// Cap on text extracted from a fetched web page
    pub url_text_max_chars: usize,
    pub url_fetch_timeout_ms: u64,
    /// Summarizer input is truncated to this many characters
    pub summary_input_max_chars: usize,
    /// Size of the heuristic summary used when model output cannot be parsed
    pub summary_fallback_chars: usize,
    /// Byte budget for the tool result handed to the composer
    pub tool_result_max_bytes: usize,
    /// Tool response bodies are cut at this many bytes before parsing
    pub tool_response_max_bytes: usize,
    pub tool_timeout_ms: u64,
    /// Loopback tool endpoints are refused unless set
    pub allow_loopback_tools: bool,
    /// Number of prior messages sent to the models
    pub history_window: usize,
    pub retrieval_top_k: usize,
    pub similarity_threshold: f32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            url_text_max_chars: 150_000,
            url_fetch_timeout_ms: 15_000,
            summary_input_max_chars: 50_000,
            summary_fallback_chars: 800,
            tool_result_max_bytes: 8_000,
            tool_response_max_bytes: 1024 * 1024,
            tool_timeout_ms: 10_000,
            allow_loopback_tools: false,
            history_window: 10,
            retrieval_top_k: 3,
            similarity_threshold: 0.3,
        }
    }
}

/// Returns at most `max_chars` characters of `text`, cut on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Returns the longest prefix of `text` that fits in `max_bytes`, cut on a char boundary.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_truncate_bytes_never_splits_a_char() {
        // "é" is two bytes
        assert_eq!(truncate_bytes("héllo", 2), "h");
        assert_eq!(truncate_bytes("héllo", 3), "hé");
        assert_eq!(truncate_bytes("日本語", 7), "日本");
        assert_eq!(truncate_bytes("abc", 10), "abc");
        assert_eq!(truncate_bytes("abc", 0), "");
    }

    #[test]
    fn test_partial_limits_fill_defaults() {
        let limits: Limits = serde_json::from_str(r#"{"retrieval_top_k": 5}"#).unwrap();
        assert_eq!(limits.retrieval_top_k, 5);
        assert_eq!(limits.max_upload_bytes, 10 * 1024 * 1024);
        assert!(!limits.allow_loopback_tools);
    }
}
