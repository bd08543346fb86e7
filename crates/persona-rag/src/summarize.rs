use persona_core::limits::truncate_chars;
use persona_core::Limits;
use persona_error::Result;
use persona_llm::{parse_structured, strip_code_fences, ChatModel, ParseOutcome};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

const SUMMARY_PROMPT: &str = "You summarize documents for a knowledge base. \
Write a concise summary (at most five sentences) of the document the user sends. \
Respond with ONLY a JSON object of the form {\"summary\": \"...\"} and nothing else.";

#[derive(Deserialize)]
struct SummaryOutput {
    summary: String,
}

/// 文档摘要生成器
pub struct Summarizer {
    model: Arc<dyn ChatModel>,
    input_max_chars: usize,
    fallback_chars: usize,
}

impl Summarizer {
    pub fn new(model: Arc<dyn ChatModel>, limits: &Limits) -> Self {
        Self {
            model,
            input_max_chars: limits.summary_input_max_chars,
            fallback_chars: limits.summary_fallback_chars,
        }
    }

    /// 生成摘要；模型输出无法解析时退化为启发式摘要，仅在模型调用失败时返回错误
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn summarize(&self, text: &str) -> Result<String> {
        let input = truncate_chars(text, self.input_max_chars);
        let raw = self.model.prompt(SUMMARY_PROMPT, input).await?;
        Ok(self.interpret(&raw, input))
    }

    fn interpret(&self, raw: &str, input: &str) -> String {
        match parse_structured::<SummaryOutput>(raw) {
            ParseOutcome::Parsed(out) if !out.summary.trim().is_empty() => {
                out.summary.trim().to_string()
            }
            _ => {
                tracing::debug!("Summary output not structured, using heuristic summary");
                let from_output = heuristic(strip_code_fences(raw), self.fallback_chars);
                if from_output.is_empty() {
                    heuristic(input, self.fallback_chars)
                } else {
                    from_output
                }
            }
        }
    }
}

/// First `max_chars` characters with whitespace collapsed.
fn heuristic(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_chars).to_string()
}
