use persona_core::{HttpMethod, Limits, Tool, ToolTelemetry};
use persona_fetch::{is_loopback, HttpFetch, HttpRequest, HttpResponse};
use persona_error::{PersonaError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;
use url::Url;

/// Parsed body of a tool response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ToolData {
    Json(Value),
    Text(String),
    /// Declared JSON that failed to parse
    Unparsable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        status: u16,
        elapsed_ms: u64,
        data: ToolData,
    },
    /// Network error or non-2xx response
    Failed {
        status: Option<u16>,
        elapsed_ms: u64,
        error: String,
        data: Option<ToolData>,
    },
    /// Refused before any request was sent
    Blocked { reason: String },
    TimedOut { elapsed_ms: u64, timeout_ms: u64 },
}

/// Result of one tool invocation, handed to the composer as data.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    pub tool_id: uuid::Uuid,
    pub tool_name: String,
    pub method: HttpMethod,
    pub url: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolExecution {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn telemetry(&self) -> ToolTelemetry {
        let (status, elapsed_ms, error) = match &self.outcome {
            ToolOutcome::Success {
                status, elapsed_ms, ..
            } => (Some(*status), *elapsed_ms, None),
            ToolOutcome::Failed {
                status,
                elapsed_ms,
                error,
                ..
            } => (*status, *elapsed_ms, Some(error.clone())),
            ToolOutcome::Blocked { reason } => (None, 0, Some(reason.clone())),
            ToolOutcome::TimedOut {
                elapsed_ms,
                timeout_ms,
            } => (
                None,
                *elapsed_ms,
                Some(format!("timed out after {timeout_ms} ms")),
            ),
        };
        ToolTelemetry {
            tool_id: self.tool_id,
            tool_name: self.tool_name.clone(),
            method: self.method,
            url: self.url.clone(),
            status,
            elapsed_ms,
            error,
        }
    }

    /// JSON rendering used as the composer's context.
    pub fn to_context(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{:?}", self.outcome))
    }
}

pub struct ToolExecutor {
    fetch: Arc<dyn HttpFetch>,
    timeout: Duration,
    max_body_bytes: usize,
    allow_loopback: bool,
}

impl ToolExecutor {
    pub fn new(fetch: Arc<dyn HttpFetch>, limits: &Limits) -> Self {
        Self {
            fetch,
            timeout: Duration::from_millis(limits.tool_timeout_ms),
            max_body_bytes: limits.tool_response_max_bytes,
            allow_loopback: limits.allow_loopback_tools,
        }
    }

    /// Performs the call. Every failure mode is returned as a `ToolOutcome`.
    #[instrument(skip(self, tool, params), fields(tool = %tool.name, method = %tool.method))]
    pub async fn execute(&self, tool: &Tool, params: &Map<String, Value>) -> ToolExecution {
        let mut execution = ToolExecution {
            tool_id: tool.id,
            tool_name: tool.name.clone(),
            method: tool.method,
            url: tool.endpoint.clone(),
            outcome: ToolOutcome::Blocked {
                reason: String::new(),
            },
        };

        let req = match build_request(tool, params) {
            Ok(req) => req,
            Err(e) => {
                execution.outcome = ToolOutcome::Blocked {
                    reason: e.user_message(),
                };
                return execution;
            }
        };
        execution.url = req.url.to_string();

        if !self.allow_loopback && is_loopback(&req.url) {
            tracing::warn!(url = %req.url, "Blocked tool call to loopback address");
            execution.outcome = ToolOutcome::Blocked {
                reason: "tool endpoint resolves to a loopback address".to_string(),
            };
            return execution;
        }

        let req = req
            .timeout(self.timeout)
            .max_body_bytes(self.max_body_bytes);
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.fetch.fetch(req)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let timeout_ms = self.timeout.as_millis() as u64;

        execution.outcome = match result {
            Err(_) | Ok(Err(PersonaError::Timeout { .. })) => ToolOutcome::TimedOut {
                elapsed_ms,
                timeout_ms,
            },
            Ok(Err(e)) => ToolOutcome::Failed {
                status: None,
                elapsed_ms,
                error: e.to_string(),
                data: None,
            },
            Ok(Ok(resp)) if resp.is_success() => ToolOutcome::Success {
                status: resp.status,
                elapsed_ms,
                data: parse_body(&resp),
            },
            Ok(Ok(resp)) => ToolOutcome::Failed {
                status: Some(resp.status),
                elapsed_ms,
                error: format!("endpoint returned HTTP {}", resp.status),
                data: Some(parse_body(&resp)),
            },
        };

        let t = execution.telemetry();
        tracing::info!(
            status = ?t.status,
            elapsed_ms = t.elapsed_ms,
            success = execution.is_success(),
            "Tool call finished"
        );
        execution
    }
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_request(tool: &Tool, params: &Map<String, Value>) -> Result<HttpRequest> {
    let mut url = Url::parse(&tool.endpoint)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PersonaError::validation("tool endpoint must be an http(s) URL"));
    }

    let mut req = match tool.method {
        HttpMethod::Get => {
            if !params.is_empty() {
                let mut query = url.query_pairs_mut();
                for (k, v) in params {
                    query.append_pair(k, &scalar_text(v));
                }
            }
            HttpRequest::get(url)
        }
        HttpMethod::Post => {
            let body = serde_json::to_vec(params)?;
            HttpRequest::post(url, body).header("Content-Type", "application/json")
        }
    };

    for (k, v) in &tool.headers {
        if tool.method == HttpMethod::Post && k.eq_ignore_ascii_case("content-type") {
            continue;
        }
        req = req.header(k.clone(), v.clone());
    }
    if req.header_value("accept").is_none() {
        req = req.header("Accept", "application/json");
    }
    Ok(req)
}

fn parse_body(resp: &HttpResponse) -> ToolData {
    if resp.is_json() {
        match serde_json::from_slice(&resp.body) {
            Ok(v) => ToolData::Json(v),
            Err(_) => ToolData::Unparsable,
        }
    } else {
        ToolData::Text(resp.text_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use persona_fetch::mock::RecordingFetch;
    use uuid::Uuid;

    fn tool(method: HttpMethod, endpoint: &str) -> Tool {
        Tool::new(Uuid::new_v4(), "weather", "weather lookup", method, endpoint)
    }

    fn params(city: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("city".into(), Value::String(city.into()));
        m
    }

    fn executor(fetch: Arc<RecordingFetch>, limits: &Limits) -> ToolExecutor {
        ToolExecutor::new(fetch, limits)
    }

    #[tokio::test]
    async fn test_get_puts_params_in_query() {
        let fetch = Arc::new(RecordingFetch::new().respond(
            200,
            "application/json",
            r#"{"temp":21}"#,
        ));
        let exec = executor(fetch.clone(), &Limits::default());
        let t = tool(HttpMethod::Get, "https://api.example.com/weather")
            .with_header("X-Api-Key", "secret");

        let result = exec.execute(&t, &params("Paris")).await;

        let reqs = fetch.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].url.as_str(), "https://api.example.com/weather?city=Paris");
        assert_eq!(reqs[0].method, HttpMethod::Get);
        assert_eq!(reqs[0].header_value("accept"), Some("application/json"));
        assert_eq!(reqs[0].header_value("x-api-key"), Some("secret"));
        assert!(reqs[0].body.is_none());

        assert!(result.is_success());
        match result.outcome {
            ToolOutcome::Success { status, data, .. } => {
                assert_eq!(status, 200);
                assert_eq!(data, ToolData::Json(serde_json::json!({"temp": 21})));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_post_sends_json_body() {
        let fetch = Arc::new(RecordingFetch::new().respond(201, "text/plain", "created"));
        let exec = executor(fetch.clone(), &Limits::default());
        let t = tool(HttpMethod::Post, "https://api.example.com/orders");

        let mut p = params("Rome");
        p.insert("count".into(), serde_json::json!(2));
        let result = exec.execute(&t, &p).await;

        let req = &fetch.requests()[0];
        assert_eq!(req.header_value("content-type"), Some("application/json"));
        let body: Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"city": "Rome", "count": 2}));
        match result.outcome {
            ToolOutcome::Success { status, data, .. } => {
                assert_eq!(status, 201);
                assert_eq!(data, ToolData::Text("created".into()));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_loopback_blocked_unless_allowed() {
        let t = tool(HttpMethod::Get, "http://127.0.0.1/admin");

        let fetch = Arc::new(RecordingFetch::new());
        let result = executor(fetch.clone(), &Limits::default())
            .execute(&t, &Map::new())
            .await;
        assert!(matches!(result.outcome, ToolOutcome::Blocked { .. }));
        assert!(fetch.requests().is_empty());
        assert!(result.telemetry().error.is_some());

        let limits = Limits {
            allow_loopback_tools: true,
            ..Limits::default()
        };
        let fetch = Arc::new(RecordingFetch::new().respond(200, "text/plain", "ok"));
        let result = executor(fetch.clone(), &limits).execute(&t, &Map::new()).await;
        assert!(result.is_success());
        assert_eq!(fetch.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_data() {
        let t = tool(HttpMethod::Get, "https://api.example.com/weather");

        let fetch = Arc::new(RecordingFetch::new().respond(503, "application/json", "{oops"));
        let result = executor(fetch, &Limits::default())
            .execute(&t, &params("Paris"))
            .await;
        match &result.outcome {
            ToolOutcome::Failed { status, data, .. } => {
                assert_eq!(*status, Some(503));
                assert_eq!(data.as_ref(), Some(&ToolData::Unparsable));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(result.telemetry().status, Some(503));

        let fetch = Arc::new(RecordingFetch::new().fail(PersonaError::Network {
            operation: "connect".into(),
            message: "refused".into(),
        }));
        let result = executor(fetch, &Limits::default())
            .execute(&t, &params("Paris"))
            .await;
        assert!(matches!(
            result.outcome,
            ToolOutcome::Failed { status: None, .. }
        ));
        assert!(result.to_context().contains("\"outcome\": \"failed\""));
    }

    struct Stalled;

    #[async_trait]
    impl HttpFetch for Stalled {
        async fn fetch(&self, _req: HttpRequest) -> Result<HttpResponse> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(PersonaError::Internal {
                message: "unreachable".into(),
                details: None,
            })
        }
    }

    #[tokio::test]
    async fn test_timeout_is_captured() {
        let limits = Limits {
            tool_timeout_ms: 20,
            ..Limits::default()
        };
        let exec = ToolExecutor::new(Arc::new(Stalled), &limits);
        let t = tool(HttpMethod::Get, "https://api.example.com/slow");
        let result = exec.execute(&t, &Map::new()).await;
        assert!(matches!(
            result.outcome,
            ToolOutcome::TimedOut { timeout_ms: 20, .. }
        ));
    }
}
