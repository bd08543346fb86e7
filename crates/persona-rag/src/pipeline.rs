use crate::compose::{Composer, Grounding};
use crate::retrieve::Retriever;
use persona_core::limits::truncate_chars;
use persona_core::{
    Agent, Conversation, Limits, Message, MessageMetadata, Repository, Role, ToolPlan,
};
use persona_error::{PersonaError, Result};
use persona_fetch::HttpFetch;
use persona_llm::{ChatModel, ChatTurn, EmbedModel};
use persona_tools::{clarification_message, ToolExecutor, ToolPlanner};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

/// Conversation titles are cut from the first user message.
pub const TITLE_MAX_CHARS: usize = 60;

/// Result of one chat turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation: Conversation,
    pub user_message: Message,
    pub reply: Message,
}

/// Knowledge-grounded chat turn: retrieve, plan tools, compose, persist.
pub struct ChatPipeline {
    repo: Arc<dyn Repository>,
    retriever: Retriever,
    planner: ToolPlanner,
    executor: ToolExecutor,
    composer: Composer,
    history_window: usize,
}

impl ChatPipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        chat: Arc<dyn ChatModel>,
        embed: Arc<dyn EmbedModel>,
        fetch: Arc<dyn HttpFetch>,
        limits: &Limits,
    ) -> Self {
        Self {
            repo,
            retriever: Retriever::new(embed, limits),
            planner: ToolPlanner::new(chat.clone()),
            executor: ToolExecutor::new(fetch, limits),
            composer: Composer::new(chat, limits),
            history_window: limits.history_window,
        }
    }

    /// Turn in an owner's conversation.
    pub async fn handle_turn(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        text: &str,
    ) -> Result<TurnOutcome> {
        let conversation = self
            .repo
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| PersonaError::not_found(format!("conversation {conversation_id}")))?;
        let agent = self
            .repo
            .get_agent(conversation.agent_id)
            .await?
            .ok_or_else(|| PersonaError::not_found(format!("agent {}", conversation.agent_id)))?;

        let participant = conversation.user_id == Some(user_id);
        if !participant && !agent.is_owned_by(user_id) {
            return Err(PersonaError::Unauthorized {
                operation: "send_message".to_string(),
            });
        }
        self.run_turn(&agent, conversation, text).await
    }

    /// Widget turn addressed by the agent's public key. Without a conversation
    /// id a new widget conversation is started.
    pub async fn handle_public_turn(
        &self,
        public_key: &str,
        conversation_id: Option<Uuid>,
        text: &str,
    ) -> Result<TurnOutcome> {
        let agent = self
            .repo
            .get_agent_by_public_key(public_key)
            .await?
            .filter(|a| a.public)
            .ok_or_else(|| PersonaError::not_found("agent"))?;

        let conversation = match conversation_id {
            Some(id) => self
                .repo
                .get_conversation(id)
                .await?
                .filter(|c| c.agent_id == agent.id && c.via_widget)
                .ok_or_else(|| PersonaError::not_found(format!("conversation {id}")))?,
            None => {
                let conversation = Conversation::new(agent.id, None, true);
                self.repo.insert_conversation(&conversation).await?;
                conversation
            }
        };
        self.run_turn(&agent, conversation, text).await
    }

    #[instrument(skip(self, agent, conversation, text), fields(agent_id = %agent.id, conversation_id = %conversation.id))]
    async fn run_turn(
        &self,
        agent: &Agent,
        mut conversation: Conversation,
        text: &str,
    ) -> Result<TurnOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PersonaError::validation("message must not be empty"));
        }
        let started = Instant::now();

        let history: Vec<ChatTurn> = self
            .repo
            .list_messages(conversation.id, Some(self.history_window))
            .await?
            .into_iter()
            .map(|m| match m.role {
                Role::User => ChatTurn::user(m.content),
                Role::Assistant => ChatTurn::assistant(m.content),
            })
            .collect();

        // persisted before generation; it stays in history if the reply fails
        let user_message = Message::user(conversation.id, text);
        self.repo.append_message(&user_message).await?;

        let title = truncate_chars(text, TITLE_MAX_CHARS);
        if self.repo.set_title_if_empty(conversation.id, title).await? {
            conversation.title = Some(title.to_string());
        }

        let mut metadata = MessageMetadata::default();

        let documents = self.repo.list_processed_documents(agent.id).await?;
        let retrieval = self.retriever.retrieve(text, &documents).await?;
        metadata.retrieval = Some(retrieval.stats.clone());

        let tools = self.repo.list_tools(agent.id).await?;
        let mut execution = None;
        if !tools.is_empty() {
            let plan = self.planner.plan(&tools, &history, text).await;
            metadata.tool_plan = Some(plan.kind().to_string());
            match plan {
                ToolPlan::Ask { tool_id, missing } => {
                    if let Some(tool) = tools.iter().find(|t| t.id == tool_id) {
                        let reply_text = clarification_message(tool, &missing);
                        metadata.latency_ms = Some(started.elapsed().as_millis() as u64);
                        let reply = Message::assistant(conversation.id, reply_text, metadata);
                        self.repo.append_message(&reply).await?;
                        return Ok(TurnOutcome {
                            conversation,
                            user_message,
                            reply,
                        });
                    }
                }
                ToolPlan::Call { tool_id, params } => {
                    if let Some(tool) = tools.iter().find(|t| t.id == tool_id) {
                        let result = self.executor.execute(tool, &params).await;
                        metadata.tool = Some(result.telemetry());
                        execution = Some(result);
                    }
                }
                ToolPlan::None => {}
            }
        }

        let grounding = match &execution {
            Some(result) => Grounding::Tool(result),
            None if !retrieval.is_empty() => Grounding::Knowledge(&retrieval.context),
            None => Grounding::Empty,
        };
        let composed = self
            .composer
            .compose(agent, &history, text, grounding)
            .await?;
        metadata.classification = composed.classification.map(|c| c.as_str().to_string());
        metadata.latency_ms = Some(started.elapsed().as_millis() as u64);

        let reply = Message::assistant(conversation.id, composed.text, metadata);
        self.repo.append_message(&reply).await?;
        tracing::info!(
            latency_ms = reply.metadata.as_ref().and_then(|m| m.latency_ms),
            "Chat turn completed"
        );
        Ok(TurnOutcome {
            conversation,
            user_message,
            reply,
        })
    }
}
