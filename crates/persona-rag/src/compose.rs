use persona_core::limits::truncate_bytes;
use persona_core::{Agent, Limits};
use persona_error::Result;
use persona_llm::{parse_structured, ChatModel, ChatTurn, ParseOutcome};
use persona_tools::ToolExecution;
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

/// Refusal used whenever no grounded answer can be produced.
pub const INSUFFICIENT_INFORMATION: &str = "I don't have enough information to answer that. \
Could you rephrase your question or ask about something else?";

const KNOWLEDGE_POLICY: &str = "Answer using ONLY the knowledge provided below. It is the sole \
permissible source of facts. You may paraphrase and summarize it, but never add facts, numbers, \
names or details that it does not contain. If the knowledge is not sufficient to answer, say \
plainly that you don't have enough information to answer instead of guessing.";

const TOOL_POLICY: &str = "A tool was called on the user's behalf; its result is provided below \
as JSON. Compose a helpful answer from that result only. If the call failed, timed out or was \
blocked, explain honestly that you could not retrieve the information right now, without \
inventing an answer.";

const CLASSIFY_POLICY: &str = "No knowledge is available for this conversation. First classify \
the user's latest message:\n\
- \"casual\": a greeting, thanks, small talk or a question about who you are.\n\
- \"info_request\": anything that needs facts or information to answer.\n\
For \"casual\" write a short, friendly reply in character. For \"info_request\" do not answer \
from general knowledge; reply that you don't have enough information to answer.\n\
Respond with ONLY a JSON object and no other text:\n\
{\"type\":\"casual\",\"reply\":\"...\"} or {\"type\":\"info_request\",\"reply\":\"...\"}";

const LANGUAGE_POLICY: &str =
    "Always reply in the same language as the user's most recent message.";

/// Context the final answer must be grounded in.
#[derive(Debug, Clone, Copy)]
pub enum Grounding<'a> {
    Knowledge(&'a str),
    Tool(&'a ToolExecution),
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Casual,
    InfoRequest,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Casual => "casual",
            Classification::InfoRequest => "info_request",
        }
    }
}

#[derive(Deserialize)]
struct ClassifiedReply {
    #[serde(rename = "type", alias = "classification")]
    kind: Classification,
    #[serde(default)]
    reply: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Composed {
    pub text: String,
    /// Set when the no-knowledge classifier ran and its output parsed
    pub classification: Option<Classification>,
}

pub struct Composer {
    model: Arc<dyn ChatModel>,
    tool_result_max_bytes: usize,
}

impl Composer {
    pub fn new(model: Arc<dyn ChatModel>, limits: &Limits) -> Self {
        Self {
            model,
            tool_result_max_bytes: limits.tool_result_max_bytes,
        }
    }

    /// Produces the assistant reply. Never returns an empty string.
    #[instrument(skip_all, fields(agent_id = %agent.id, history = history.len()))]
    pub async fn compose(
        &self,
        agent: &Agent,
        history: &[ChatTurn],
        latest: &str,
        grounding: Grounding<'_>,
    ) -> Result<Composed> {
        let mut turns = history.to_vec();
        turns.push(ChatTurn::user(latest));

        let context_block = match grounding {
            Grounding::Knowledge(context) if !context.trim().is_empty() => {
                format!("{KNOWLEDGE_POLICY}\n\nKnowledge:\n<<<\n{context}\n>>>")
            }
            Grounding::Tool(execution) => {
                let result = execution.to_context();
                let result = truncate_bytes(&result, self.tool_result_max_bytes);
                format!("{TOOL_POLICY}\n\nTool \"{}\" result:\n{result}", execution.tool_name)
            }
            Grounding::Knowledge(_) | Grounding::Empty => {
                return self.classify_and_reply(agent, &turns).await;
            }
        };

        let system = system_prompt(agent, &context_block);
        let reply = self.model.chat(&system, &turns).await?;
        let reply = reply.trim();
        Ok(Composed {
            text: if reply.is_empty() {
                INSUFFICIENT_INFORMATION.to_string()
            } else {
                reply.to_string()
            },
            classification: None,
        })
    }

    async fn classify_and_reply(&self, agent: &Agent, turns: &[ChatTurn]) -> Result<Composed> {
        let system = system_prompt(agent, CLASSIFY_POLICY);
        let raw = self.model.chat(&system, turns).await?;

        let composed = match parse_structured::<ClassifiedReply>(&raw) {
            ParseOutcome::Parsed(out) => {
                let reply = out.reply.trim();
                // only small talk may pass through ungrounded
                let text = match out.kind {
                    Classification::Casual if !reply.is_empty() => reply.to_string(),
                    _ => INSUFFICIENT_INFORMATION.to_string(),
                };
                Composed {
                    text,
                    classification: Some(out.kind),
                }
            }
            ParseOutcome::Malformed => {
                tracing::warn!("Classification output unparseable, using static refusal");
                Composed {
                    text: INSUFFICIENT_INFORMATION.to_string(),
                    classification: None,
                }
            }
        };
        tracing::debug!(
            classification = composed.classification.map(|c| c.as_str()),
            "No-knowledge reply composed"
        );
        Ok(composed)
    }
}

fn system_prompt(agent: &Agent, policy: &str) -> String {
    let mut parts = vec![agent.instructions.trim().to_string()];
    if let Some(tone) = agent.tone.as_deref().filter(|t| !t.trim().is_empty()) {
        parts.push(format!("Tone: {}", tone.trim()));
    }
    if let Some(style) = agent.response_style.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(format!("Response style: {}", style.trim()));
    }
    parts.push(LANGUAGE_POLICY.to_string());
    parts.push(policy.to_string());
    parts.retain(|p| !p.is_empty());
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_core::HttpMethod;
    use persona_llm::mock::ScriptedChatModel;
    use persona_tools::{ToolData, ToolOutcome};
    use uuid::Uuid;

    fn agent() -> Agent {
        let mut a = Agent::new(Uuid::new_v4(), "Barista", "You are the assistant of a coffee shop.");
        a.tone = Some("warm".into());
        a.response_style = Some("two sentences max".into());
        a
    }

    fn composer(model: Arc<ScriptedChatModel>) -> Composer {
        Composer::new(model, &Limits::default())
    }

    #[tokio::test]
    async fn test_knowledge_prompt_carries_policy() {
        let model = Arc::new(ScriptedChatModel::new(["We open at 8."]));
        let history = vec![ChatTurn::user("hi"), ChatTurn::assistant("hello!")];
        let out = composer(model.clone())
            .compose(&agent(), &history, "when do you open?", Grounding::Knowledge("Open 8-18"))
            .await
            .unwrap();
        assert_eq!(out.text, "We open at 8.");
        assert_eq!(out.classification, None);

        let call = &model.calls()[0];
        assert!(call.system.starts_with("You are the assistant of a coffee shop."));
        assert!(call.system.contains("Tone: warm"));
        assert!(call.system.contains("Response style: two sentences max"));
        assert!(call.system.contains("ONLY the knowledge"));
        assert!(call.system.contains("same language"));
        assert!(call.system.contains("Open 8-18"));
        assert_eq!(call.turns.len(), 3);
        assert_eq!(call.last_user(), Some("when do you open?"));
    }

    #[tokio::test]
    async fn test_unparseable_classification_is_static_refusal() {
        let model = Arc::new(ScriptedChatModel::new(["Sure, the capital of France is Paris."]));
        let out = composer(model)
            .compose(&agent(), &[], "capital of France?", Grounding::Empty)
            .await
            .unwrap();
        assert_eq!(out.text, INSUFFICIENT_INFORMATION);
        assert_eq!(out.classification, None);
    }

    #[tokio::test]
    async fn test_casual_reply_passes_through() {
        let model = Arc::new(ScriptedChatModel::new([
            "```json\n{\"type\":\"casual\",\"reply\":\"Hi there! How can I help?\"}\n```",
        ]));
        let out = composer(model.clone())
            .compose(&agent(), &[], "hello", Grounding::Knowledge("   "))
            .await
            .unwrap();
        assert_eq!(out.text, "Hi there! How can I help?");
        assert_eq!(out.classification, Some(Classification::Casual));
        assert!(model.calls()[0].system.contains("info_request"));
    }

    #[tokio::test]
    async fn test_info_request_empty_reply_degrades() {
        let model = Arc::new(ScriptedChatModel::new([r#"{"type":"info_request","reply":""}"#]));
        let out = composer(model)
            .compose(&agent(), &[], "price of beans?", Grounding::Empty)
            .await
            .unwrap();
        assert_eq!(out.text, INSUFFICIENT_INFORMATION);
        assert_eq!(out.classification, Some(Classification::InfoRequest));
    }

    #[tokio::test]
    async fn test_info_request_answer_is_discarded() {
        let model = Arc::new(ScriptedChatModel::new([
            r#"{"type":"info_request","reply":"Beans cost $3.20 per kilo."}"#,
        ]));
        let out = composer(model)
            .compose(&agent(), &[], "price of beans?", Grounding::Empty)
            .await
            .unwrap();
        assert_eq!(out.text, INSUFFICIENT_INFORMATION);
        assert_eq!(out.classification, Some(Classification::InfoRequest));
    }

    #[tokio::test]
    async fn test_tool_result_truncated() {
        let execution = ToolExecution {
            tool_id: Uuid::new_v4(),
            tool_name: "weather".into(),
            method: HttpMethod::Get,
            url: "https://api.example.com/weather?city=Paris".into(),
            outcome: ToolOutcome::Success {
                status: 200,
                elapsed_ms: 12,
                data: ToolData::Text("x".repeat(20_000)),
            },
        };
        let model = Arc::new(ScriptedChatModel::new(["It is sunny."]));
        let limits = Limits {
            tool_result_max_bytes: 500,
            ..Limits::default()
        };
        let out = Composer::new(model.clone(), &limits)
            .compose(&agent(), &[], "weather?", Grounding::Tool(&execution))
            .await
            .unwrap();
        assert_eq!(out.text, "It is sunny.");
        let system = &model.calls()[0].system;
        assert!(system.contains("Tool \"weather\" result"));
        assert!(system.len() < 2_000);
    }

    #[tokio::test]
    async fn test_tool_result_byte_cap_on_multibyte_text() {
        let execution = ToolExecution {
            tool_id: Uuid::new_v4(),
            tool_name: "menu".into(),
            method: HttpMethod::Get,
            url: "https://api.example.com/menu".into(),
            outcome: ToolOutcome::Success {
                status: 200,
                elapsed_ms: 3,
                data: ToolData::Text("café ".repeat(2_000)),
            },
        };
        let model = Arc::new(ScriptedChatModel::new(["Coffee is available."]));
        let limits = Limits {
            tool_result_max_bytes: 401,
            ..Limits::default()
        };
        let bare = system_prompt(&agent(), TOOL_POLICY).len();
        Composer::new(model.clone(), &limits)
            .compose(&agent(), &[], "menu?", Grounding::Tool(&execution))
            .await
            .unwrap();
        let system = &model.calls()[0].system;
        assert!(system.contains("café"));
        assert!(system.len() <= bare + 401 + 64);
    }

    #[tokio::test]
    async fn test_empty_model_reply_never_returned() {
        let model = Arc::new(ScriptedChatModel::new(["  "]));
        let out = composer(model)
            .compose(&agent(), &[], "q", Grounding::Knowledge("facts"))
            .await
            .unwrap();
        assert_eq!(out.text, INSUFFICIENT_INFORMATION);
    }
}
