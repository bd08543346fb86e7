use persona_core::{Tool, ToolPlan};
use persona_llm::{parse_structured, ChatModel, ChatTurn, ParseOutcome, TurnRole};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::instrument;

const PLANNER_RULES: &str = r#"You decide whether answering the user's latest message requires calling one of the tools below.

Choose exactly one action:
- "call": exactly one tool is relevant and every required parameter value is known, either stated explicitly or safely inferable from the conversation. Never call a tool with a required parameter missing.
- "ask": a tool is relevant but at least one required parameter value is unknown. List the missing parameter names.
- "none": no tool is relevant.

Respond with ONLY one JSON object and no other text:
{"action":"call","toolId":"<tool id>","params":{"<name>":<value>}}
{"action":"ask","toolId":"<tool id>","missing":["<name>"]}
{"action":"none"}"#;

/// Planner output before validation against the catalog.
#[derive(Debug, Deserialize)]
struct RawPlan {
    action: String,
    #[serde(default, rename = "toolId", alias = "tool_id", alias = "tool")]
    tool_id: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    missing: Option<Value>,
}

/// Tool planner: one model call that picks `call`, `ask` or `none`.
pub struct ToolPlanner {
    model: Arc<dyn ChatModel>,
}

impl ToolPlanner {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Never fails: backend errors and unparseable output both yield `ToolPlan::None`.
    #[instrument(skip_all, fields(tools = tools.len()))]
    pub async fn plan(&self, tools: &[Tool], history: &[ChatTurn], latest: &str) -> ToolPlan {
        if tools.is_empty() {
            return ToolPlan::None;
        }
        let system = planner_prompt(tools);
        let user = conversation_prompt(history, latest);

        let raw = match self.model.prompt(&system, &user).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Tool planner call failed, continuing without tools");
                return ToolPlan::None;
            }
        };

        let plan = match parse_structured::<RawPlan>(&raw) {
            ParseOutcome::Parsed(p) => resolve_plan(p, tools),
            ParseOutcome::Malformed => {
                tracing::warn!("Tool planner output unparseable, treating as none");
                ToolPlan::None
            }
        };
        tracing::info!(action = plan.kind(), "Tool plan decided");
        plan
    }
}

fn planner_prompt(tools: &[Tool]) -> String {
    let mut out = String::from(PLANNER_RULES);
    out.push_str("\n\nAvailable tools:\n");
    for tool in tools {
        let _ = writeln!(out, "\nTool id: {}", tool.id);
        let _ = writeln!(out, "Name: {}", tool.name);
        let _ = writeln!(out, "Description: {}", tool.description);
        let _ = writeln!(out, "Method: {}", tool.method);
        if tool.parameters.is_empty() {
            out.push_str("Parameters: none\n");
            continue;
        }
        out.push_str("Parameters:\n");
        for p in &tool.parameters {
            let _ = write!(
                out,
                "- {} ({}, {})",
                p.name,
                p.param_type.as_str(),
                if p.required { "required" } else { "optional" }
            );
            match p.description.as_deref().filter(|d| !d.trim().is_empty()) {
                Some(d) => {
                    let _ = writeln!(out, ": {d}");
                }
                None => out.push('\n'),
            }
        }
    }
    out
}

fn conversation_prompt(history: &[ChatTurn], latest: &str) -> String {
    let mut out = String::new();
    if !history.is_empty() {
        out.push_str("Conversation so far:\n");
        for turn in history {
            let who = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
            };
            let _ = writeln!(out, "{who}: {}", turn.content);
        }
        out.push('\n');
    }
    let _ = write!(out, "Latest user message:\n{latest}");
    out
}

fn find_tool<'a>(tools: &'a [Tool], id: &Value) -> Option<&'a Tool> {
    let key = match id {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    tools
        .iter()
        .find(|t| t.id.to_string().eq_ignore_ascii_case(&key))
        .or_else(|| tools.iter().find(|t| t.name.eq_ignore_ascii_case(&key)))
}

/// Keeps string, number and boolean values; objects, arrays and nulls are dropped.
/// Keys are renamed to the declared parameter spelling when they match ignoring case.
fn scalar_params(tool: &Tool, params: Option<Value>) -> Map<String, Value> {
    let Some(Value::Object(obj)) = params else {
        return Map::new();
    };
    obj.into_iter()
        .filter(|(_, v)| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)))
        .map(|(k, v)| match tool.parameter(&k) {
            Some(p) => (p.name.clone(), v),
            None => (k, v),
        })
        .collect()
}

fn missing_required(tool: &Tool, params: &Map<String, Value>) -> Vec<String> {
    tool.required_parameters()
        .filter(|p| match params.get(&p.name) {
            None => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .map(|p| p.name.clone())
        .collect()
}

/// Re-validates the model's choice against the catalog.
fn resolve_plan(raw: RawPlan, tools: &[Tool]) -> ToolPlan {
    let action = raw.action.trim().to_ascii_lowercase();
    if action == "none" {
        return ToolPlan::None;
    }
    let Some(tool) = raw.tool_id.as_ref().and_then(|id| find_tool(tools, id)) else {
        tracing::debug!(action = %action, "Planner named an unknown tool");
        return ToolPlan::None;
    };

    match action.as_str() {
        "call" => {
            let params = scalar_params(tool, raw.params);
            let missing = missing_required(tool, &params);
            if missing.is_empty() {
                ToolPlan::Call {
                    tool_id: tool.id,
                    params,
                }
            } else {
                ToolPlan::Ask {
                    tool_id: tool.id,
                    missing,
                }
            }
        }
        "ask" => {
            let mut missing: Vec<String> = match raw.missing {
                Some(Value::Array(items)) => items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::String(s) if !s.trim().is_empty() => Some(
                            tool.parameter(&s)
                                .map(|p| p.name.clone())
                                .unwrap_or(s),
                        ),
                        _ => None,
                    })
                    .collect(),
                Some(Value::String(s)) if !s.trim().is_empty() => vec![s],
                _ => Vec::new(),
            };
            if missing.is_empty() {
                missing = missing_required(tool, &Map::new());
            }
            if missing.is_empty() {
                ToolPlan::None
            } else {
                ToolPlan::Ask {
                    tool_id: tool.id,
                    missing,
                }
            }
        }
        _ => ToolPlan::None,
    }
}

/// Assistant reply asking the user for the parameters a tool still needs.
pub fn clarification_message(tool: &Tool, missing: &[String]) -> String {
    let mut out = format!(
        "To use \"{}\" I need a bit more information:\n",
        tool.name
    );
    for name in missing {
        let description = tool
            .parameter(name)
            .and_then(|p| p.description.as_deref())
            .filter(|d| !d.trim().is_empty());
        match description {
            Some(d) => {
                let _ = writeln!(out, "- {name}: {d}");
            }
            None => {
                let _ = writeln!(out, "- {name}");
            }
        }
    }
    out.push_str("Could you provide these details?");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_core::{HttpMethod, ParamType, ToolParameter};
    use persona_llm::mock::ScriptedChatModel;
    use uuid::Uuid;

    fn weather_tool() -> Tool {
        Tool::new(
            Uuid::new_v4(),
            "t1",
            "Current weather for a city",
            HttpMethod::Get,
            "https://api.example.com/weather",
        )
        .with_parameter(ToolParameter {
            name: "city".into(),
            param_type: ParamType::String,
            required: true,
            description: Some("City name".into()),
        })
        .with_parameter(ToolParameter {
            name: "units".into(),
            param_type: ParamType::String,
            required: false,
            description: None,
        })
    }

    async fn plan_with(reply: &str, tools: &[Tool]) -> (ToolPlan, Arc<ScriptedChatModel>) {
        let model = Arc::new(ScriptedChatModel::new([reply]));
        let planner = ToolPlanner::new(model.clone());
        let plan = planner.plan(tools, &[], "what's the weather?").await;
        (plan, model)
    }

    #[tokio::test]
    async fn test_call_with_params() {
        let tool = weather_tool();
        let (plan, model) = plan_with(
            r#"{"action":"call","toolId":"t1","params":{"city":"Paris"}}"#,
            std::slice::from_ref(&tool),
        )
        .await;
        let ToolPlan::Call { tool_id, params } = plan else {
            panic!("expected call");
        };
        assert_eq!(tool_id, tool.id);
        assert_eq!(params.get("city"), Some(&Value::String("Paris".into())));

        let calls = model.calls();
        assert!(calls[0].system.contains(&tool.id.to_string()));
        assert!(calls[0].system.contains("- city (string, required): City name"));
        assert!(calls[0].last_user().unwrap().contains("what's the weather?"));
    }

    #[tokio::test]
    async fn test_ask_lists_missing() {
        let tool = weather_tool();
        let (plan, _) = plan_with(
            r#"{"action":"ask","toolId":"t1","missing":["city"]}"#,
            std::slice::from_ref(&tool),
        )
        .await;
        assert_eq!(
            plan,
            ToolPlan::Ask {
                tool_id: tool.id,
                missing: vec!["city".into()]
            }
        );
    }

    #[tokio::test]
    async fn test_call_missing_required_becomes_ask() {
        let tool = weather_tool();
        let (plan, _) = plan_with(
            r#"{"action":"call","toolId":"t1","params":{"units":"metric","city":null}}"#,
            std::slice::from_ref(&tool),
        )
        .await;
        assert_eq!(plan.kind(), "ask");
    }

    #[tokio::test]
    async fn test_non_scalar_params_dropped() {
        let tool = weather_tool();
        let (plan, _) = plan_with(
            r#"Here you go: {"action":"call","tool_id":"T1","params":{"CITY":"Oslo","units":{"a":1},"extra":[1]}}"#,
            std::slice::from_ref(&tool),
        )
        .await;
        let ToolPlan::Call { params, .. } = plan else {
            panic!("expected call");
        };
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("city"), Some(&Value::String("Oslo".into())));
    }

    #[tokio::test]
    async fn test_unparseable_and_unknown_are_none() {
        let tool = weather_tool();
        let (plan, _) = plan_with("I think you should call the weather tool", std::slice::from_ref(&tool)).await;
        assert_eq!(plan, ToolPlan::None);

        let (plan, _) = plan_with(
            r#"{"action":"call","toolId":"nope","params":{}}"#,
            std::slice::from_ref(&tool),
        )
        .await;
        assert_eq!(plan, ToolPlan::None);
    }

    #[tokio::test]
    async fn test_backend_failure_is_none() {
        let model = Arc::new(ScriptedChatModel::default());
        model.push_failure("boom");
        let planner = ToolPlanner::new(model);
        let plan = planner.plan(&[weather_tool()], &[], "hi").await;
        assert_eq!(plan, ToolPlan::None);
    }

    #[tokio::test]
    async fn test_no_tools_skips_model() {
        let model = Arc::new(ScriptedChatModel::default());
        let planner = ToolPlanner::new(model.clone());
        assert_eq!(planner.plan(&[], &[], "hi").await, ToolPlan::None);
        assert_eq!(model.call_count(), 0);
    }

    #[test]
    fn test_clarification_mentions_params() {
        let tool = weather_tool();
        let msg = clarification_message(&tool, &["city".into(), "units".into()]);
        assert!(msg.contains("\"t1\""));
        assert!(msg.contains("- city: City name"));
        assert!(msg.contains("- units\n"));
    }
}
