use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum PersonaError {
    // === 业务错误 ===
    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("not allowed: {operation}")]
    Unauthorized { operation: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("conflict: {details}")]
    Conflict { details: String },

    #[error("payload too large: {size} bytes exceeds {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("unsupported media type: {mime_type}")]
    UnsupportedMediaType { mime_type: String },

    /// 无法从上传内容中提取文本；`message` 直接展示给用户
    #[error("extraction failed ({source_kind}): {message}")]
    Extraction { source_kind: String, message: String },

    // === 技术错误 ===
    #[error("store error: {operation} failed")]
    Store { operation: String, message: String },

    #[error("llm service error ({provider})")]
    LlmService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("embedding service error ({provider})")]
    EmbeddingService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("service unavailable: {service}")]
    ServiceUnavailable {
        service: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("network error: {operation}")]
    Network { operation: String, message: String },

    // === 系统错误 ===
    #[error("internal error: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    #[error("configuration error: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("serialization error: {format}")]
    Serialization { format: String, message: String },

    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("concurrency error: {operation}")]
    Concurrency { operation: String, message: String },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 技术错误但不影响核心功能
    High,     // 影响核心功能的错误
    Critical, // 系统级严重错误
}

/// 错误元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub error_id: String,
    pub severity: ErrorSeverity,
    pub component: String,
    pub operation: Option<String>,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: std::collections::HashMap<String, String>,
}

impl PersonaError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        PersonaError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PersonaError::Validation {
            message: message.into(),
        }
    }

    pub fn store(operation: &str, err: impl std::fmt::Display) -> Self {
        PersonaError::Store {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }

    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PersonaError::NotFound { .. } | PersonaError::InvalidRequest { .. } => {
                ErrorSeverity::Low
            }
            PersonaError::Unauthorized { .. }
            | PersonaError::Validation { .. }
            | PersonaError::Conflict { .. }
            | PersonaError::PayloadTooLarge { .. }
            | PersonaError::UnsupportedMediaType { .. }
            | PersonaError::Extraction { .. } => ErrorSeverity::Medium,
            PersonaError::LlmService { .. } | PersonaError::EmbeddingService { .. } => {
                ErrorSeverity::Medium
            }
            PersonaError::ServiceUnavailable { .. }
            | PersonaError::Network { .. }
            | PersonaError::Timeout { .. } => ErrorSeverity::Medium,
            PersonaError::Store { .. }
            | PersonaError::Serialization { .. }
            | PersonaError::Concurrency { .. } => ErrorSeverity::High,
            PersonaError::Internal { .. } | PersonaError::Configuration { .. } => {
                ErrorSeverity::Critical
            }
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            PersonaError::ServiceUnavailable { retry_after, .. } => retry_after.is_some(),
            PersonaError::Network { .. } | PersonaError::Timeout { .. } => true,
            PersonaError::LlmService { retry_after, .. }
            | PersonaError::EmbeddingService { retry_after, .. } => retry_after.is_some(),
            PersonaError::Concurrency { .. } => true,
            _ => false,
        }
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            PersonaError::ServiceUnavailable { retry_after, .. }
            | PersonaError::LlmService { retry_after, .. }
            | PersonaError::EmbeddingService { retry_after, .. } => *retry_after,
            PersonaError::Network { .. } => Some(std::time::Duration::from_millis(500)),
            PersonaError::Timeout { .. } => Some(std::time::Duration::from_millis(1000)),
            PersonaError::Concurrency { .. } => Some(std::time::Duration::from_millis(100)),
            _ => None,
        }
    }

    /// 记录错误日志
    pub fn log(&self, metadata: &ErrorMetadata) {
        match metadata.severity {
            ErrorSeverity::Low => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    user_id = ?metadata.user_id,
                    agent_id = ?metadata.agent_id,
                    request_id = ?metadata.request_id,
                    error = %self,
                    "business error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    user_id = ?metadata.user_id,
                    agent_id = ?metadata.agent_id,
                    request_id = ?metadata.request_id,
                    error = %self,
                    context = ?metadata.context,
                    "technical error"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    error_id = %metadata.error_id,
                    component = %metadata.component,
                    operation = ?metadata.operation,
                    user_id = ?metadata.user_id,
                    agent_id = ?metadata.agent_id,
                    request_id = ?metadata.request_id,
                    error = %self,
                    context = ?metadata.context,
                    severity = ?metadata.severity,
                    "severe error"
                );
            }
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            PersonaError::NotFound { .. } => 404,
            PersonaError::InvalidRequest { .. } => 400,
            PersonaError::Unauthorized { .. } => 403,
            PersonaError::Validation { .. } => 400,
            PersonaError::Conflict { .. } => 409,
            PersonaError::PayloadTooLarge { .. } => 413,
            PersonaError::UnsupportedMediaType { .. } => 415,
            PersonaError::Extraction { .. } => 422,
            PersonaError::ServiceUnavailable { .. } => 503,
            // rate-limited upstream model
            PersonaError::LlmService {
                retry_after: Some(_),
                ..
            }
            | PersonaError::EmbeddingService {
                retry_after: Some(_),
                ..
            } => 503,
            PersonaError::Timeout { .. } => 504,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            PersonaError::NotFound { resource } => format!("{resource} was not found"),
            PersonaError::InvalidRequest { reason } => reason.clone(),
            PersonaError::Unauthorized { .. } => {
                "You are not allowed to perform this operation".to_string()
            }
            PersonaError::Validation { message } => message.clone(),
            PersonaError::Conflict { .. } => "The operation conflicts with current state, please retry".to_string(),
            PersonaError::PayloadTooLarge { limit, .. } => {
                format!("File is too large; the maximum size is {} MB", limit / (1024 * 1024))
            }
            PersonaError::UnsupportedMediaType { mime_type } => {
                format!("Files of type {mime_type} are not supported")
            }
            PersonaError::Extraction { message, .. } => message.clone(),
            PersonaError::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable, please try again later".to_string()
            }
            PersonaError::Timeout { .. } => "The request timed out, please retry".to_string(),
            _ => "Something went wrong while processing your request".to_string(),
        }
    }
}

/// 创建错误元数据的便捷构造器
pub struct ErrorMetadataBuilder {
    metadata: ErrorMetadata,
}

impl ErrorMetadataBuilder {
    pub fn new(component: &str) -> Self {
        Self {
            metadata: ErrorMetadata {
                error_id: uuid::Uuid::new_v4().to_string(),
                severity: ErrorSeverity::Medium,
                component: component.to_string(),
                operation: None,
                user_id: None,
                agent_id: None,
                request_id: None,
                timestamp: chrono::Utc::now(),
                context: std::collections::HashMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.metadata.operation = Some(operation.to_string());
        self
    }

    pub fn user_id(mut self, user_id: &str) -> Self {
        self.metadata.user_id = Some(user_id.to_string());
        self
    }

    pub fn agent_id(mut self, agent_id: &str) -> Self {
        self.metadata.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn request_id(mut self, request_id: &str) -> Self {
        self.metadata.request_id = Some(request_id.to_string());
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(mut self, error: &PersonaError) -> ErrorMetadata {
        self.metadata.severity = error.severity();
        self.metadata
    }
}

pub type Result<T> = std::result::Result<T, PersonaError>;

// === 转换实现 ===

impl From<serde_json::Error> for PersonaError {
    fn from(err: serde_json::Error) -> Self {
        PersonaError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for PersonaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PersonaError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000, // 默认超时时间
            }
        } else if err.is_connect() {
            PersonaError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            PersonaError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<uuid::Error> for PersonaError {
    fn from(err: uuid::Error) -> Self {
        PersonaError::Serialization {
            format: "uuid".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for PersonaError {
    fn from(err: url::ParseError) -> Self {
        PersonaError::InvalidRequest {
            reason: format!("invalid url: {err}"),
        }
    }
}

impl From<tokio::task::JoinError> for PersonaError {
    fn from(err: tokio::task::JoinError) -> Self {
        PersonaError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<sled::Error> for PersonaError {
    fn from(err: sled::Error) -> Self {
        PersonaError::Store {
            operation: "sled".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for PersonaError {
    fn from(err: anyhow::Error) -> Self {
        PersonaError::Internal {
            message: err.to_string(),
            details: None,
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for PersonaError {
    fn into_response(self) -> axum::response::Response {
        let status_code = StatusCode::from_u16(self.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let retryable = self.is_retryable();
        let body = serde_json::json!({
            "error": self.to_string(),
            "message": self.user_message(),
            "retryable": retryable
        });

        let mut response = (status_code, Json(body)).into_response();
        if let Some(delay) = self.retry_after().filter(|_| retryable) {
            // Retry-After is whole seconds, rounded up
            let secs = delay.as_millis().div_ceil(1000).max(1);
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_message_is_user_facing() {
        let err = PersonaError::Extraction {
            source_kind: "pdf".into(),
            message: "Please upload a searchable PDF".into(),
        };
        assert_eq!(err.user_message(), "Please upload a searchable PDF");
        assert_eq!(err.to_http_status(), 422);
        assert_eq!(err.severity(), ErrorSeverity::Medium);
    }

    #[test]
    fn test_retry_policy() {
        let err = PersonaError::Timeout {
            operation: "tool_call".into(),
            timeout_ms: 10,
        };
        assert!(err.is_retryable());
        assert!(err.retry_after().is_some());

        let err = PersonaError::validation("bad tool");
        assert!(!err.is_retryable());
        assert_eq!(err.to_http_status(), 400);

        let throttled = PersonaError::EmbeddingService {
            provider: "qwen".into(),
            message: "429".into(),
            retry_after: Some(std::time::Duration::from_secs(2)),
        };
        assert!(throttled.is_retryable());
        assert_eq!(throttled.to_http_status(), 503);

        let broken = PersonaError::EmbeddingService {
            provider: "qwen".into(),
            message: "bad model".into(),
            retry_after: None,
        };
        assert!(!broken.is_retryable());
        assert_eq!(broken.to_http_status(), 500);
    }

    #[test]
    fn test_metadata_builder_takes_severity_from_error() {
        let err = PersonaError::store("insert_document", "disk full");
        let meta = ErrorMetadataBuilder::new("ingest")
            .operation("upload")
            .agent_id("a1")
            .context("filename", "notes.txt")
            .build(&err);
        assert_eq!(meta.severity, ErrorSeverity::High);
        assert_eq!(meta.context.get("filename").map(String::as_str), Some("notes.txt"));
    }
}
