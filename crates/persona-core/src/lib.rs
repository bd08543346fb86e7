use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod limits;
pub mod repo;
pub mod tool;

pub use limits::Limits;
pub use persona_error::{PersonaError as Error, Result};
pub use repo::Repository;
pub use tool::{HttpMethod, ParamType, Tool, ToolParameter, ToolPlan};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// External identity (login name, SSO subject, widget visitor key)
    pub identity: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub instructions: String,
    pub tone: Option<String>,
    pub response_style: Option<String>,
    /// Key used by the embeddable widget to address this agent
    pub public_key: String,
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(user_id: Uuid, name: impl Into<String>, instructions: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            description: None,
            instructions: instructions.into(),
            tone: None,
            response_style: None,
            public_key: format!("pk_{}", Uuid::new_v4().simple()),
            public: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }
}

/// One ingested unit of knowledge.
///
/// `processed == true` implies `embedding` holds a non-empty serialized vector;
/// only processed documents take part in retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub user_id: Uuid,
    pub filename: String,
    pub content: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub summary: Option<String>,
    /// JSON array of floats
    pub embedding: Option<String>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeDocument {
    pub fn new(
        agent_id: Uuid,
        user_id: Uuid,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        content: String,
        size_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            user_id,
            filename: filename.into(),
            content,
            size_bytes,
            mime_type: mime_type.into(),
            summary: None,
            embedding: None,
            processed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stores the vector and flips `processed`. Empty vectors are rejected so the
    /// processed invariant cannot be broken.
    pub fn mark_processed(&mut self, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::validation("embedding vector is empty"));
        }
        self.embedding = Some(serde_json::to_string(vector)?);
        self.processed = true;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_unprocessed(&mut self) {
        self.embedding = None;
        self.processed = false;
        self.updated_at = Utc::now();
    }

    /// Deserializes the stored vector. `None` when missing, malformed or empty.
    pub fn embedding_vector(&self) -> Option<Vec<f32>> {
        let raw = self.embedding.as_deref()?;
        let vector: Vec<f32> = serde_json::from_str(raw).ok()?;
        if vector.is_empty() {
            None
        } else {
            Some(vector)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Absent for anonymous widget visitors
    pub user_id: Option<Uuid>,
    pub title: Option<String>,
    pub via_widget: bool,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(agent_id: Uuid, user_id: Option<Uuid>, via_widget: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            user_id,
            title: None,
            via_widget,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub metadata: Option<MessageMetadata>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::User, content.into(), None)
    }

    pub fn assistant(
        conversation_id: Uuid,
        content: impl Into<String>,
        metadata: MessageMetadata,
    ) -> Self {
        Self::new(conversation_id, Role::Assistant, content.into(), Some(metadata))
    }

    fn new(
        conversation_id: Uuid,
        role: Role,
        content: String,
        metadata: Option<MessageMetadata>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Telemetry attached to assistant messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    pub retrieval: Option<RetrievalStats>,
    /// `casual` / `info_request` when the no-knowledge classifier ran
    pub classification: Option<String>,
    /// `call` / `ask` / `none` when the agent has tools
    pub tool_plan: Option<String>,
    pub tool: Option<ToolTelemetry>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalStats {
    pub candidates: usize,
    pub passages: usize,
    pub top_similarity: Option<f32>,
    /// True when nothing passed the threshold and the top passages were used anyway
    pub below_threshold_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolTelemetry {
    pub tool_id: Uuid,
    pub tool_name: String,
    pub method: HttpMethod,
    pub url: String,
    pub status: Option<u16>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Free-form string map used for tool headers.
pub type HeaderMap = BTreeMap<String, String>;
