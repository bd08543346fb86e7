use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use persona_core::{
    Agent, Conversation, HeaderMap as ToolHeaders, HttpMethod, KnowledgeDocument, Limits, Message,
    Repository, Tool, ToolParameter,
};
use persona_error::{ErrorMetadataBuilder, PersonaError, Result};
use persona_rag::{ChatPipeline, Ingestor, Upload};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub pipeline: Arc<ChatPipeline>,
    pub ingestor: Arc<Ingestor>,
    pub limits: Limits,
    pub default_user: String,
}

pub fn build_router(state: AppState) -> Router {
    // multipart framing overhead on top of the file itself
    let body_limit = state.limits.max_upload_bytes + 64 * 1024;
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/agents", get(list_agents).post(create_agent))
        .route(
            "/api/v1/agents/:id",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route(
            "/api/v1/agents/:id/documents",
            get(list_documents).post(upload_document),
        )
        .route("/api/v1/agents/:id/documents/url", post(ingest_url))
        .route("/api/v1/documents/:id", delete(delete_document))
        .route("/api/v1/documents/:id/reprocess", post(reprocess_document))
        .route("/api/v1/agents/:id/tools", get(list_tools).post(create_tool))
        .route("/api/v1/tools/:id", delete(delete_tool))
        .route(
            "/api/v1/agents/:id/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/v1/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/v1/public/:key/chat", post(public_chat))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Resolves the caller from `x-user-id`, provisioning the user on first sight.
async fn caller(state: &AppState, headers: &HeaderMap) -> Result<Uuid> {
    let identity = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(&state.default_user);
    state.repo.ensure_user(identity).await
}

async fn owned_agent(state: &AppState, user_id: Uuid, agent_id: Uuid) -> Result<Agent> {
    let agent = state
        .repo
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| PersonaError::not_found(format!("agent {agent_id}")))?;
    if !agent.is_owned_by(user_id) {
        return Err(PersonaError::Unauthorized {
            operation: format!("access agent {agent_id}"),
        });
    }
    Ok(agent)
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PersonaError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

// ===============
// Agents
// ===============

#[derive(Deserialize)]
struct CreateAgentReq {
    name: String,
    instructions: String,
    description: Option<String>,
    tone: Option<String>,
    response_style: Option<String>,
    #[serde(default)]
    public: bool,
}

#[derive(Deserialize)]
struct UpdateAgentReq {
    name: Option<String>,
    instructions: Option<String>,
    description: Option<String>,
    tone: Option<String>,
    response_style: Option<String>,
    public: Option<bool>,
}

async fn list_agents(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Vec<Agent>>> {
    let user_id = caller(&state, &headers).await?;
    Ok(Json(state.repo.list_agents(user_id).await?))
}

async fn create_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateAgentReq>,
) -> Result<(StatusCode, Json<Agent>)> {
    let user_id = caller(&state, &headers).await?;
    non_empty("name", &req.name)?;
    non_empty("instructions", &req.instructions)?;

    let mut agent = Agent::new(user_id, req.name.trim(), req.instructions);
    agent.description = req.description;
    agent.tone = req.tone;
    agent.response_style = req.response_style;
    agent.public = req.public;
    state.repo.insert_agent(&agent).await?;
    tracing::info!(agent_id = %agent.id, user_id = %user_id, "Agent created");
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn get_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Agent>> {
    let user_id = caller(&state, &headers).await?;
    Ok(Json(owned_agent(&state, user_id, id).await?))
}

async fn update_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateAgentReq>,
) -> Result<Json<Agent>> {
    let user_id = caller(&state, &headers).await?;
    let mut agent = owned_agent(&state, user_id, id).await?;
    if let Some(name) = req.name {
        non_empty("name", &name)?;
        agent.name = name.trim().to_string();
    }
    if let Some(instructions) = req.instructions {
        non_empty("instructions", &instructions)?;
        agent.instructions = instructions;
    }
    if req.description.is_some() {
        agent.description = req.description;
    }
    if req.tone.is_some() {
        agent.tone = req.tone;
    }
    if req.response_style.is_some() {
        agent.response_style = req.response_style;
    }
    if let Some(public) = req.public {
        agent.public = public;
    }
    agent.updated_at = Utc::now();
    state.repo.update_agent(&agent).await?;
    Ok(Json(agent))
}

async fn delete_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let user_id = caller(&state, &headers).await?;
    owned_agent(&state, user_id, id).await?;
    state.repo.delete_agent(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ===============
// Knowledge documents
// ===============

/// Document listing without content and vector.
#[derive(Serialize)]
struct DocumentView {
    id: Uuid,
    agent_id: Uuid,
    filename: String,
    mime_type: String,
    size_bytes: u64,
    summary: Option<String>,
    processed: bool,
    created_at: DateTime<Utc>,
}

impl From<KnowledgeDocument> for DocumentView {
    fn from(d: KnowledgeDocument) -> Self {
        Self {
            id: d.id,
            agent_id: d.agent_id,
            filename: d.filename,
            mime_type: d.mime_type,
            size_bytes: d.size_bytes,
            summary: d.summary,
            processed: d.processed,
            created_at: d.created_at,
        }
    }
}

async fn owned_document(state: &AppState, user_id: Uuid, id: Uuid) -> Result<KnowledgeDocument> {
    let doc = state
        .repo
        .get_document(id)
        .await?
        .ok_or_else(|| PersonaError::not_found(format!("document {id}")))?;
    owned_agent(state, user_id, doc.agent_id).await?;
    Ok(doc)
}

async fn list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DocumentView>>> {
    let user_id = caller(&state, &headers).await?;
    owned_agent(&state, user_id, id).await?;
    let docs = state.repo.list_documents(id).await?;
    Ok(Json(docs.into_iter().map(DocumentView::from).collect()))
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> PersonaError {
    PersonaError::InvalidRequest {
        reason: format!("malformed upload: {e}"),
    }
}

async fn upload_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DocumentView>)> {
    let user_id = caller(&state, &headers).await?;
    let agent = owned_agent(&state, user_id, id).await?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.bin").to_string();
        let mime_type = field.content_type().unwrap_or("").to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some(Upload {
            filename,
            mime_type,
            bytes: bytes.to_vec(),
        });
    }
    let upload = upload.ok_or_else(|| PersonaError::InvalidRequest {
        reason: "missing file field".to_string(),
    })?;

    let doc = state.ingestor.ingest_upload(&agent, upload).await?;
    Ok((StatusCode::CREATED, Json(doc.into())))
}

#[derive(Deserialize)]
struct IngestUrlReq {
    url: String,
}

async fn ingest_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<IngestUrlReq>,
) -> Result<(StatusCode, Json<DocumentView>)> {
    let user_id = caller(&state, &headers).await?;
    let agent = owned_agent(&state, user_id, id).await?;
    let doc = state.ingestor.ingest_url(&agent, &req.url).await?;
    Ok((StatusCode::CREATED, Json(doc.into())))
}

async fn delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let user_id = caller(&state, &headers).await?;
    owned_document(&state, user_id, id).await?;
    state.repo.delete_document(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reprocess_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentView>> {
    let user_id = caller(&state, &headers).await?;
    owned_document(&state, user_id, id).await?;
    let doc = state.ingestor.reprocess(id).await?;
    Ok(Json(doc.into()))
}

// ===============
// Tools
// ===============

#[derive(Deserialize)]
struct CreateToolReq {
    name: String,
    #[serde(default)]
    description: String,
    method: HttpMethod,
    endpoint: String,
    #[serde(default)]
    parameters: Vec<ToolParameter>,
    #[serde(default)]
    headers: ToolHeaders,
}

async fn list_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Tool>>> {
    let user_id = caller(&state, &headers).await?;
    owned_agent(&state, user_id, id).await?;
    Ok(Json(state.repo.list_tools(id).await?))
}

async fn create_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateToolReq>,
) -> Result<(StatusCode, Json<Tool>)> {
    let user_id = caller(&state, &headers).await?;
    owned_agent(&state, user_id, id).await?;

    let mut tool = Tool::new(id, req.name.trim(), req.description, req.method, req.endpoint.trim());
    tool.parameters = req.parameters;
    tool.headers = req.headers;
    tool.validate()?;
    state.repo.insert_tool(&tool).await?;
    tracing::info!(tool_id = %tool.id, agent_id = %id, "Tool created");
    Ok((StatusCode::CREATED, Json(tool)))
}

async fn delete_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let user_id = caller(&state, &headers).await?;
    let tool = state
        .repo
        .get_tool(id)
        .await?
        .ok_or_else(|| PersonaError::not_found(format!("tool {id}")))?;
    owned_agent(&state, user_id, tool.agent_id).await?;
    state.repo.delete_tool(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ===============
// Conversations
// ===============

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Conversation>>> {
    let user_id = caller(&state, &headers).await?;
    owned_agent(&state, user_id, id).await?;
    Ok(Json(state.repo.list_conversations(id).await?))
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Conversation>)> {
    let user_id = caller(&state, &headers).await?;
    owned_agent(&state, user_id, id).await?;
    let conversation = Conversation::new(id, Some(user_id), false);
    state.repo.insert_conversation(&conversation).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>> {
    let user_id = caller(&state, &headers).await?;
    let conversation = state
        .repo
        .get_conversation(id)
        .await?
        .ok_or_else(|| PersonaError::not_found(format!("conversation {id}")))?;
    if conversation.user_id != Some(user_id) {
        owned_agent(&state, user_id, conversation.agent_id).await?;
    }
    Ok(Json(state.repo.list_messages(id, None).await?))
}

#[derive(Deserialize)]
struct SendMessageReq {
    message: String,
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageReq>,
) -> Result<Json<serde_json::Value>> {
    let user_id = caller(&state, &headers).await?;
    let outcome = state
        .pipeline
        .handle_turn(user_id, id, &req.message)
        .await
        .inspect_err(|e| {
            let metadata = ErrorMetadataBuilder::new("chat")
                .operation("send_message")
                .user_id(&user_id.to_string())
                .context("conversation_id", &id.to_string())
                .build(e);
            e.log(&metadata);
        })?;
    Ok(Json(json!({
        "conversation": outcome.conversation,
        "user_message": outcome.user_message,
        "reply": outcome.reply,
    })))
}

#[derive(Deserialize)]
struct PublicChatReq {
    conversation_id: Option<Uuid>,
    message: String,
}

/// Widget endpoint: no identity, the agent is addressed by its public key.
async fn public_chat(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<PublicChatReq>,
) -> Result<Json<serde_json::Value>> {
    let outcome = state
        .pipeline
        .handle_public_turn(&key, req.conversation_id, &req.message)
        .await
        .inspect_err(|e| {
            let metadata = ErrorMetadataBuilder::new("widget_chat")
                .operation("public_chat")
                .context("public_key", &key)
                .build(e);
            e.log(&metadata);
        })?;
    Ok(Json(json!({
        "conversation_id": outcome.conversation.id,
        "reply": outcome.reply.content,
    })))
}
