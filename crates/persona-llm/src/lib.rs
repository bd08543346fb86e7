use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub mod mock;
pub mod structured;

pub use persona_error::{PersonaError, Result};
pub use structured::{parse_structured, strip_code_fences, ParseOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

/// One prior or current message in a chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generates the next assistant message. `turns` ends with the user message.
    async fn chat(&self, system: &str, turns: &[ChatTurn]) -> Result<String>;

    /// Single-shot generation.
    async fn prompt(&self, system: &str, user: &str) -> Result<String> {
        self.chat(system, &[ChatTurn::user(user)]).await
    }
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default())
    }
}

fn network_error(e: reqwest::Error) -> PersonaError {
    if e.is_timeout() {
        PersonaError::from(e)
    } else {
        PersonaError::Network {
            operation: "http_request".to_string(),
            message: e.to_string(),
        }
    }
}

/// Maps a non-2xx provider response to an error, keeping Retry-After on 429.
async fn provider_error(provider: &str, resp: Response, embedding: bool) -> PersonaError {
    let status = resp.status();
    let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
        Some(
            resp.headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(5)),
        )
    } else {
        None
    };
    let txt = resp.text().await.unwrap_or_default();
    let message = format!("status={} body={}", status, txt);
    if embedding {
        PersonaError::EmbeddingService {
            provider: provider.to_string(),
            message,
            retry_after,
        }
    } else {
        PersonaError::LlmService {
            provider: provider.to_string(),
            message,
            retry_after,
        }
    }
}

// ========== OpenAI-compatible (covers OpenAI, DeepSeek, some Qwen proxies) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-4o-mini, deepseek-chat
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OaiChatReq<'a> {
    model: &'a str,
    messages: Vec<OaiChatReqMsg<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip(self, system, turns), fields(model = %self.cfg.chat_model, turns = turns.len()))]
    async fn chat(&self, system: &str, turns: &[ChatTurn]) -> Result<String> {
        let url = format!(
            "{}/v1/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(OaiChatReqMsg {
            role: "system",
            content: system,
        });
        for t in turns {
            messages.push(OaiChatReqMsg {
                role: t.role.as_str(),
                content: &t.content,
            });
        }
        let body = OaiChatReq {
            model: &self.cfg.chat_model,
            messages,
            temperature: self.cfg.temperature,
            max_tokens: self.cfg.max_tokens,
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            return Err(provider_error("openai_compat", resp, false).await);
        }

        let data: OaiChatResp = resp.json().await.map_err(network_error)?;
        let content = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(content)
    }
}

#[derive(Serialize)]
struct OaiEmbedReq<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OaiEmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

#[async_trait]
impl EmbedModel for OpenAiCompatClient {
    #[instrument(skip(self, texts), fields(inputs = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .as_deref()
            .ok_or_else(|| PersonaError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;
        let url = format!("{}/v1/embeddings", self.cfg.base_url.trim_end_matches('/'));
        let body = OaiEmbedReq {
            model,
            input: texts,
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            return Err(provider_error("openai_compat", resp, true).await);
        }

        let data: OaiEmbedResp = resp.json().await.map_err(network_error)?;
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ========== Anthropic (Claude) ==========

#[derive(Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,   // e.g. claude-3-5-sonnet-latest
    pub api_url: String, // default https://api.anthropic.com
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(cfg: AnthropicConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct AnthMessageContent {
    r#type: &'static str,
    text: String,
}

#[derive(Serialize)]
struct AnthMessageReqMsg {
    role: &'static str,
    content: Vec<AnthMessageContent>,
}

#[derive(Serialize)]
struct AnthMessageReq<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<AnthMessageReqMsg>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct AnthMessageRespContent {
    #[allow(dead_code)]
    r#type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthMessageResp {
    content: Vec<AnthMessageRespContent>,
}

/// Messages API needs alternating roles starting with `user`; adjacent turns of
/// the same role are merged and a leading assistant turn is dropped.
fn anthropic_messages(turns: &[ChatTurn]) -> Vec<AnthMessageReqMsg> {
    let mut out: Vec<AnthMessageReqMsg> = Vec::new();
    for t in turns {
        if out.is_empty() && t.role == TurnRole::Assistant {
            continue;
        }
        let role = t.role.as_str();
        match out.last_mut() {
            Some(last) if last.role == role => last.content.push(AnthMessageContent {
                r#type: "text",
                text: t.content.clone(),
            }),
            _ => out.push(AnthMessageReqMsg {
                role,
                content: vec![AnthMessageContent {
                    r#type: "text",
                    text: t.content.clone(),
                }],
            }),
        }
    }
    out
}

#[async_trait]
impl ChatModel for AnthropicClient {
    #[instrument(skip(self, system, turns), fields(model = %self.cfg.model, turns = turns.len()))]
    async fn chat(&self, system: &str, turns: &[ChatTurn]) -> Result<String> {
        let url = format!("{}/v1/messages", self.cfg.api_url.trim_end_matches('/'));
        let body = AnthMessageReq {
            model: &self.cfg.model,
            system,
            messages: anthropic_messages(turns),
            max_tokens: self.cfg.max_tokens,
            temperature: self.cfg.temperature,
        };

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            return Err(provider_error("anthropic", resp, false).await);
        }

        let data: AnthMessageResp = resp.json().await.map_err(network_error)?;
        let mut out = String::new();
        for c in data.content.into_iter() {
            if let Some(t) = c.text {
                out.push_str(&t);
            }
        }
        Ok(out)
    }
}

// ========== Qwen (DashScope) Embeddings ==========

#[derive(Clone)]
pub struct QwenDashScopeConfig {
    pub api_key: String,
    pub model: String,   // e.g. text-embedding-v2 / v3
    pub api_url: String, // default https://dashscope.aliyuncs.com/compatible-mode/v1/embeddings
}

#[derive(Clone)]
pub struct QwenDashScopeClient {
    http: Client,
    cfg: QwenDashScopeConfig,
}

impl QwenDashScopeClient {
    pub fn new(cfg: QwenDashScopeConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[async_trait]
impl EmbedModel for QwenDashScopeClient {
    #[instrument(skip(self, texts), fields(inputs = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = OaiEmbedReq {
            model: &self.cfg.model,
            input: texts,
        };
        let resp = self
            .http
            .post(&self.cfg.api_url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        if !resp.status().is_success() {
            return Err(provider_error("dashscope", resp, true).await);
        }
        let data: OaiEmbedResp = resp.json().await.map_err(network_error)?;
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ========== Provider Factory & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    },
    #[serde(rename = "anthropic")]
    Anthropic {
        api_url: Option<String>,
        api_key: String,
        model: String,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EmbedProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "qwen")]
    QwenDashScope {
        api_url: Option<String>,
        api_key: String,
        model: String,
    },
    /// DeepSeek speaks the OpenAI embeddings protocol
    #[serde(rename = "deepseek")]
    DeepSeek {
        base_url: Option<String>,
        api_key: String,
        model: String,
    },
}

pub struct Providers {
    pub chat: Arc<dyn ChatModel>,
    pub embed: Arc<dyn EmbedModel>,
}

pub fn make_providers(chat: ChatProviderConfig, embed: EmbedProviderConfig) -> Result<Providers> {
    let chat: Arc<dyn ChatModel> = match chat {
        ChatProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
            temperature,
            max_tokens,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: model,
            embedding_model: None,
            temperature: temperature.or(Some(0.2)),
            max_tokens,
        })),
        ChatProviderConfig::Anthropic {
            api_url,
            api_key,
            model,
            temperature,
            max_tokens,
        } => Arc::new(AnthropicClient::new(AnthropicConfig {
            api_url: api_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            api_key,
            model,
            temperature: temperature.or(Some(0.2)),
            max_tokens: max_tokens.unwrap_or(2048),
        })),
    };

    let embed: Arc<dyn EmbedModel> = match embed {
        EmbedProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: "".into(),
            embedding_model: Some(model),
            temperature: None,
            max_tokens: None,
        })),
        EmbedProviderConfig::QwenDashScope {
            api_url,
            api_key,
            model,
        } => Arc::new(QwenDashScopeClient::new(QwenDashScopeConfig {
            api_key,
            model,
            api_url: api_url.unwrap_or_else(|| {
                "https://dashscope.aliyuncs.com/compatible-mode/v1/embeddings".into()
            }),
        })),
        EmbedProviderConfig::DeepSeek {
            base_url,
            api_key,
            model,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url: base_url.unwrap_or_else(|| "https://api.deepseek.com".into()),
            api_key,
            chat_model: "".into(),
            embedding_model: Some(model),
            temperature: None,
            max_tokens: None,
        })),
    };

    Ok(Providers { chat, embed })
}
