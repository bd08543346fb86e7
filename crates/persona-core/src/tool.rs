use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::{Error, HeaderMap, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            other => Err(Error::validation(format!(
                "unsupported tool method {other}, expected GET or POST"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// An external HTTP capability exposed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub description: String,
    pub method: HttpMethod,
    pub endpoint: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default)]
    pub headers: HeaderMap,
    pub created_at: DateTime<Utc>,
}

impl Tool {
    pub fn new(
        agent_id: Uuid,
        name: impl Into<String>,
        description: impl Into<String>,
        method: HttpMethod,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            name: name.into(),
            description: description.into(),
            method,
            endpoint: endpoint.into(),
            parameters: Vec::new(),
            headers: HeaderMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ToolParameter> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ToolParameter> {
        self.parameters.iter().filter(|p| p.required)
    }

    /// Checks the structural invariants: non-empty name, http(s) endpoint,
    /// parameter names and header keys unique ignoring case.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("tool name must not be empty"));
        }

        let url = url::Url::parse(&self.endpoint)
            .map_err(|e| Error::validation(format!("invalid tool endpoint: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::validation("tool endpoint must be an http(s) URL"));
        }

        let mut seen = HashSet::new();
        for p in &self.parameters {
            if p.name.trim().is_empty() {
                return Err(Error::validation("tool parameter name must not be empty"));
            }
            if !seen.insert(p.name.to_ascii_lowercase()) {
                return Err(Error::validation(format!(
                    "duplicate tool parameter: {}",
                    p.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for key in self.headers.keys() {
            if !seen.insert(key.to_ascii_lowercase()) {
                return Err(Error::validation(format!("duplicate tool header: {key}")));
            }
        }
        Ok(())
    }
}

/// Decision taken by the tool planner for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ToolPlan {
    Call {
        tool_id: Uuid,
        params: serde_json::Map<String, serde_json::Value>,
    },
    Ask {
        tool_id: Uuid,
        missing: Vec<String>,
    },
    None,
}

impl ToolPlan {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolPlan::Call { .. } => "call",
            ToolPlan::Ask { .. } => "ask",
            ToolPlan::None => "none",
        }
    }
}
