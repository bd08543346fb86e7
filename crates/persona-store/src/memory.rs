use async_trait::async_trait;
use persona_core::{Agent, Conversation, KnowledgeDocument, Message, Repository, Tool, User};
use persona_error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::keep_last;

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    agents: HashMap<Uuid, Agent>,
    documents: HashMap<Uuid, KnowledgeDocument>,
    tools: HashMap<Uuid, Tool>,
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Vec<Message>>,
}

/// 基于内存的存储实现（开发与测试用）
#[derive(Clone, Default)]
pub struct MemoryRepository {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前消息总数
    pub async fn message_count(&self) -> usize {
        let tables = self.tables.read().await;
        tables.messages.values().map(Vec::len).sum()
    }
}

fn sorted_by_created<T, F>(mut items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> chrono::DateTime<chrono::Utc>,
{
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn ensure_user(&self, identity: &str) -> Result<Uuid> {
        let mut tables = self.tables.write().await;
        let user = tables
            .users
            .entry(identity.to_string())
            .or_insert_with(|| User {
                id: Uuid::new_v4(),
                identity: identity.to_string(),
                created_at: chrono::Utc::now(),
            });
        Ok(user.id)
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        Ok(self.tables.read().await.agents.get(&id).cloned())
    }

    async fn get_agent_by_public_key(&self, public_key: &str) -> Result<Option<Agent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .agents
            .values()
            .find(|a| a.public_key == public_key)
            .cloned())
    }

    async fn list_agents(&self, user_id: Uuid) -> Result<Vec<Agent>> {
        let tables = self.tables.read().await;
        let agents: Vec<Agent> = tables
            .agents
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(agents, |a| a.created_at))
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.agents.contains_key(&agent.id) {
            return Err(persona_error::PersonaError::not_found(format!(
                "agent {}",
                agent.id
            )));
        }
        tables.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn delete_agent(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.agents.remove(&id).is_none() {
            return Ok(false);
        }
        tables.documents.retain(|_, d| d.agent_id != id);
        tables.tools.retain(|_, t| t.agent_id != id);
        let conversations: Vec<Uuid> = tables
            .conversations
            .values()
            .filter(|c| c.agent_id == id)
            .map(|c| c.id)
            .collect();
        for cid in conversations {
            tables.conversations.remove(&cid);
            tables.messages.remove(&cid);
        }
        tracing::info!(agent_id = %id, "Removed agent and its dependents");
        Ok(true)
    }

    async fn insert_document(&self, doc: &KnowledgeDocument) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.documents.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn update_document(&self, doc: &KnowledgeDocument) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.documents.contains_key(&doc.id) {
            return Err(persona_error::PersonaError::not_found(format!(
                "document {}",
                doc.id
            )));
        }
        tables.documents.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<KnowledgeDocument>> {
        Ok(self.tables.read().await.documents.get(&id).cloned())
    }

    async fn list_documents(&self, agent_id: Uuid) -> Result<Vec<KnowledgeDocument>> {
        let tables = self.tables.read().await;
        let docs: Vec<KnowledgeDocument> = tables
            .documents
            .values()
            .filter(|d| d.agent_id == agent_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(docs, |d| d.created_at))
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool> {
        Ok(self.tables.write().await.documents.remove(&id).is_some())
    }

    async fn insert_tool(&self, tool: &Tool) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.tools.insert(tool.id, tool.clone());
        Ok(())
    }

    async fn get_tool(&self, id: Uuid) -> Result<Option<Tool>> {
        Ok(self.tables.read().await.tools.get(&id).cloned())
    }

    async fn list_tools(&self, agent_id: Uuid) -> Result<Vec<Tool>> {
        let tables = self.tables.read().await;
        let tools: Vec<Tool> = tables
            .tools
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(tools, |t| t.created_at))
    }

    async fn delete_tool(&self, id: Uuid) -> Result<bool> {
        Ok(self.tables.write().await.tools.remove(&id).is_some())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.tables.read().await.conversations.get(&id).cloned())
    }

    async fn list_conversations(&self, agent_id: Uuid) -> Result<Vec<Conversation>> {
        let tables = self.tables.read().await;
        let conversations: Vec<Conversation> = tables
            .conversations
            .values()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(conversations, |c| c.created_at))
    }

    async fn set_title_if_empty(&self, conversation_id: Uuid, title: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.conversations.get_mut(&conversation_id) {
            Some(c) if c.title.as_deref().map_or(true, str::is_empty) => {
                c.title = Some(title.to_string());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(persona_error::PersonaError::not_found(format!(
                "conversation {conversation_id}"
            ))),
        }
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .messages
            .entry(message.conversation_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        let messages = tables
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        Ok(keep_last(messages, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_core::{HttpMethod, Role};

    #[tokio::test]
    async fn test_ensure_user_is_idempotent() {
        let repo = MemoryRepository::new();
        let a = repo.ensure_user("alice").await.unwrap();
        let b = repo.ensure_user("alice").await.unwrap();
        let c = repo.ensure_user("bob").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_title_compare_and_swap() {
        let repo = MemoryRepository::new();
        let conv = Conversation::new(Uuid::new_v4(), None, true);
        repo.insert_conversation(&conv).await.unwrap();

        assert!(repo.set_title_if_empty(conv.id, "first").await.unwrap());
        assert!(!repo.set_title_if_empty(conv.id, "second").await.unwrap());
        let stored = repo.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_messages_keep_insertion_order() {
        let repo = MemoryRepository::new();
        let cid = Uuid::new_v4();
        for i in 0..5 {
            repo.append_message(&Message::user(cid, format!("m{i}")))
                .await
                .unwrap();
        }
        let recent = repo.list_messages(cid, Some(2)).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m3");
        assert_eq!(recent[1].content, "m4");
        assert_eq!(recent[1].role, Role::User);
        assert_eq!(repo.message_count().await, 5);
    }

    #[tokio::test]
    async fn test_delete_agent_cascades() {
        let repo = MemoryRepository::new();
        let user = repo.ensure_user("owner").await.unwrap();
        let agent = Agent::new(user, "helper", "help");
        repo.insert_agent(&agent).await.unwrap();

        let doc = KnowledgeDocument::new(agent.id, user, "a.txt", "text/plain", "x".into(), 1);
        repo.insert_document(&doc).await.unwrap();
        let tool = Tool::new(agent.id, "t", "d", HttpMethod::Get, "https://example.com");
        repo.insert_tool(&tool).await.unwrap();
        let conv = Conversation::new(agent.id, Some(user), false);
        repo.insert_conversation(&conv).await.unwrap();
        repo.append_message(&Message::user(conv.id, "hi")).await.unwrap();

        assert!(repo.delete_agent(agent.id).await.unwrap());
        assert!(repo.list_documents(agent.id).await.unwrap().is_empty());
        assert!(repo.list_tools(agent.id).await.unwrap().is_empty());
        assert!(repo.get_conversation(conv.id).await.unwrap().is_none());
        assert!(repo.list_messages(conv.id, None).await.unwrap().is_empty());
        assert!(!repo.delete_agent(agent.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_processed_filter() {
        let repo = MemoryRepository::new();
        let agent_id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut done = KnowledgeDocument::new(agent_id, user, "a", "text/plain", "a".into(), 1);
        done.mark_processed(&[1.0]).unwrap();
        let pending = KnowledgeDocument::new(agent_id, user, "b", "text/plain", "b".into(), 1);
        repo.insert_document(&done).await.unwrap();
        repo.insert_document(&pending).await.unwrap();

        let processed = repo.list_processed_documents(agent_id).await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].id, done.id);
    }
}
