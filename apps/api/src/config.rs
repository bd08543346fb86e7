use persona_core::Limits;
use persona_llm::{ChatProviderConfig, EmbedProviderConfig};
use serde::Deserialize;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "configs/default.yaml";

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub server: ServerCfg,
    pub chat_provider: ChatCfgYaml,
    pub embedding_provider: EmbedCfgYaml,
    #[serde(default)]
    pub store: StoreCfg,
    #[serde(default)]
    pub identity: IdentityCfg,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Debug, Deserialize)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ChatCfgYaml {
    pub kind: String,
    pub base_url: Option<String>,
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct EmbedCfgYaml {
    pub kind: String,
    pub base_url: Option<String>,
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: String,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    #[default]
    Sled,
}

#[derive(Debug, Deserialize)]
pub struct StoreCfg {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "data/persona".into()
}

/// 未携带 `x-user-id` 的请求归属到此身份
#[derive(Debug, Deserialize)]
pub struct IdentityCfg {
    pub default_user: String,
}

impl Default for IdentityCfg {
    fn default() -> Self {
        Self {
            default_user: "local".into(),
        }
    }
}

pub fn load_config() -> anyhow::Result<AppConfig> {
    let path = std::env::var("PERSONA_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let s = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("read config {}: {}", path, e))?;
    let cfg = parse_config(&s)?;
    info!(path = %path, store = ?cfg.store.kind, chat = %cfg.chat_provider.kind, "load_config");
    Ok(cfg)
}

pub fn parse_config(s: &str) -> anyhow::Result<AppConfig> {
    let cfg: AppConfig = serde_yaml::from_str(s)?;
    if cfg.identity.default_user.trim().is_empty() {
        anyhow::bail!("identity.default_user must not be empty");
    }
    Ok(cfg)
}

fn read_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env {}", key))
}

impl ChatCfgYaml {
    pub fn to_provider_config(&self) -> anyhow::Result<ChatProviderConfig> {
        Ok(match self.kind.as_str() {
            "openai_compat" => ChatProviderConfig::OpenAiCompat {
                base_url: self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".into()),
                api_key: read_env(self.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY"))?,
                model: self.model.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            },
            "anthropic" => ChatProviderConfig::Anthropic {
                api_url: self.api_url.clone(),
                api_key: read_env(self.api_key_env.as_deref().unwrap_or("ANTHROPIC_API_KEY"))?,
                model: self.model.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            },
            other => anyhow::bail!("unsupported chat provider kind={}", other),
        })
    }
}

impl EmbedCfgYaml {
    pub fn to_provider_config(&self) -> anyhow::Result<EmbedProviderConfig> {
        Ok(match self.kind.as_str() {
            "openai_compat" => EmbedProviderConfig::OpenAiCompat {
                base_url: self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".into()),
                api_key: read_env(self.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY"))?,
                model: self.model.clone(),
            },
            "qwen" => EmbedProviderConfig::QwenDashScope {
                api_url: self.api_url.clone(),
                api_key: read_env(self.api_key_env.as_deref().unwrap_or("DASHSCOPE_API_KEY"))?,
                model: self.model.clone(),
            },
            "deepseek" => EmbedProviderConfig::DeepSeek {
                base_url: self.base_url.clone(),
                api_key: read_env(self.api_key_env.as_deref().unwrap_or("DEEPSEEK_API_KEY"))?,
                model: self.model.clone(),
            },
            other => anyhow::bail!("unsupported embedding provider kind={}", other),
        })
    }
}
