use async_trait::async_trait;
use persona_core::{Agent, Conversation, KnowledgeDocument, Message, Repository, Tool, User};
use persona_error::{PersonaError, Result};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::keep_last;

/// 基于 sled 的本地持久化实现，记录以 JSON 存储
#[derive(Clone)]
pub struct SledRepository {
    db: sled::Db,
    users: sled::Tree,
    agents: sled::Tree,
    agent_keys: sled::Tree,
    documents: sled::Tree,
    tools: sled::Tree,
    conversations: sled::Tree,
    messages: sled::Tree,
}

impl SledRepository {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            users: db.open_tree("users")?,
            agents: db.open_tree("agents")?,
            agent_keys: db.open_tree("agent_keys")?,
            documents: db.open_tree("documents")?,
            tools: db.open_tree("tools")?,
            conversations: db.open_tree("conversations")?,
            messages: db.open_tree("messages")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// 消息键：会话 id 前缀 + 单调递增序号，保证按插入顺序扫描
    fn message_key(&self, conversation_id: Uuid) -> Result<Vec<u8>> {
        let seq = self.db.generate_id()?;
        let mut key = conversation_id.as_bytes().to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key)
    }
}

fn put<T: Serialize>(tree: &sled::Tree, key: impl AsRef<[u8]>, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    tree.insert(key.as_ref(), bytes)?;
    Ok(())
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, key: impl AsRef<[u8]>) -> Result<Option<T>> {
    match tree.get(key)? {
        Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
        None => Ok(None),
    }
}

fn scan<T, F>(tree: &sled::Tree, keep: F) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    F: Fn(&T) -> bool,
{
    let mut out = Vec::new();
    for item in tree.iter() {
        let (_, v) = item?;
        let value: T = serde_json::from_slice(&v)?;
        if keep(&value) {
            out.push(value);
        }
    }
    Ok(out)
}

fn remove_where<T, F>(tree: &sled::Tree, matches: F) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    F: Fn(&T) -> bool,
{
    let mut removed = Vec::new();
    for item in tree.iter() {
        let (k, v) = item?;
        let value: T = serde_json::from_slice(&v)?;
        if matches(&value) {
            tree.remove(k)?;
            removed.push(value);
        }
    }
    Ok(removed)
}

#[async_trait]
impl Repository for SledRepository {
    async fn ensure_user(&self, identity: &str) -> Result<Uuid> {
        if let Some(user) = get::<User>(&self.users, identity)? {
            return Ok(user.id);
        }
        let user = User {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            created_at: chrono::Utc::now(),
        };
        let bytes = serde_json::to_vec(&user)?;
        match self
            .users
            .compare_and_swap(identity, None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(user.id),
            // 并发下另一请求先写入，以已存在的记录为准
            Err(_) => get::<User>(&self.users, identity)?
                .map(|u| u.id)
                .ok_or_else(|| PersonaError::store("ensure_user", "user vanished after conflict")),
        }
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        put(&self.agents, agent.id.as_bytes(), agent)?;
        self.agent_keys
            .insert(agent.public_key.as_bytes(), agent.id.as_bytes().to_vec())?;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        get(&self.agents, id.as_bytes())
    }

    async fn get_agent_by_public_key(&self, public_key: &str) -> Result<Option<Agent>> {
        match self.agent_keys.get(public_key.as_bytes())? {
            Some(id) => get(&self.agents, id),
            None => Ok(None),
        }
    }

    async fn list_agents(&self, user_id: Uuid) -> Result<Vec<Agent>> {
        let mut agents = scan(&self.agents, |a: &Agent| a.user_id == user_id)?;
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        let previous: Agent = get(&self.agents, agent.id.as_bytes())?
            .ok_or_else(|| PersonaError::not_found(format!("agent {}", agent.id)))?;
        if previous.public_key != agent.public_key {
            self.agent_keys.remove(previous.public_key.as_bytes())?;
        }
        self.insert_agent(agent).await
    }

    async fn delete_agent(&self, id: Uuid) -> Result<bool> {
        let Some(agent) = get::<Agent>(&self.agents, id.as_bytes())? else {
            return Ok(false);
        };
        self.agents.remove(id.as_bytes())?;
        self.agent_keys.remove(agent.public_key.as_bytes())?;
        remove_where(&self.documents, |d: &KnowledgeDocument| d.agent_id == id)?;
        remove_where(&self.tools, |t: &Tool| t.agent_id == id)?;
        let conversations = remove_where(&self.conversations, |c: &Conversation| c.agent_id == id)?;
        for c in conversations {
            for item in self.messages.scan_prefix(c.id.as_bytes()) {
                let (k, _) = item?;
                self.messages.remove(k)?;
            }
        }
        tracing::info!(agent_id = %id, "Removed agent and its dependents");
        Ok(true)
    }

    async fn insert_document(&self, doc: &KnowledgeDocument) -> Result<()> {
        put(&self.documents, doc.id.as_bytes(), doc)
    }

    async fn update_document(&self, doc: &KnowledgeDocument) -> Result<()> {
        if !self.documents.contains_key(doc.id.as_bytes())? {
            return Err(PersonaError::not_found(format!("document {}", doc.id)));
        }
        put(&self.documents, doc.id.as_bytes(), doc)
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<KnowledgeDocument>> {
        get(&self.documents, id.as_bytes())
    }

    async fn list_documents(&self, agent_id: Uuid) -> Result<Vec<KnowledgeDocument>> {
        let mut docs = scan(&self.documents, |d: &KnowledgeDocument| {
            d.agent_id == agent_id
        })?;
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool> {
        Ok(self.documents.remove(id.as_bytes())?.is_some())
    }

    async fn insert_tool(&self, tool: &Tool) -> Result<()> {
        put(&self.tools, tool.id.as_bytes(), tool)
    }

    async fn get_tool(&self, id: Uuid) -> Result<Option<Tool>> {
        get(&self.tools, id.as_bytes())
    }

    async fn list_tools(&self, agent_id: Uuid) -> Result<Vec<Tool>> {
        let mut tools = scan(&self.tools, |t: &Tool| t.agent_id == agent_id)?;
        tools.sort_by_key(|t| t.created_at);
        Ok(tools)
    }

    async fn delete_tool(&self, id: Uuid) -> Result<bool> {
        Ok(self.tools.remove(id.as_bytes())?.is_some())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        put(&self.conversations, conversation.id.as_bytes(), conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        get(&self.conversations, id.as_bytes())
    }

    async fn list_conversations(&self, agent_id: Uuid) -> Result<Vec<Conversation>> {
        let mut conversations =
            scan(&self.conversations, |c: &Conversation| c.agent_id == agent_id)?;
        conversations.sort_by_key(|c| c.created_at);
        Ok(conversations)
    }

    async fn set_title_if_empty(&self, conversation_id: Uuid, title: &str) -> Result<bool> {
        let key = conversation_id.as_bytes();
        loop {
            let Some(current) = self.conversations.get(key)? else {
                return Err(PersonaError::not_found(format!(
                    "conversation {conversation_id}"
                )));
            };
            let mut conversation: Conversation = serde_json::from_slice(&current)?;
            if conversation.title.as_deref().is_some_and(|t| !t.is_empty()) {
                return Ok(false);
            }
            conversation.title = Some(title.to_string());
            let next = serde_json::to_vec(&conversation)?;
            match self
                .conversations
                .compare_and_swap(key, Some(current), Some(next))?
            {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        let key = self.message_key(message.conversation_id)?;
        put(&self.messages, key, message)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for item in self.messages.scan_prefix(conversation_id.as_bytes()) {
            let (_, v) = item?;
            messages.push(serde_json::from_slice::<Message>(&v)?);
        }
        Ok(keep_last(messages, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_core::MessageMetadata;

    fn open_temp() -> (tempfile::TempDir, SledRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SledRepository::open(dir.path().to_str().unwrap()).unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn test_agent_roundtrip_and_public_key_lookup() {
        let (_dir, repo) = open_temp();
        let user = repo.ensure_user("alice").await.unwrap();
        assert_eq!(repo.ensure_user("alice").await.unwrap(), user);

        let agent = Agent::new(user, "support", "Answer billing questions");
        repo.insert_agent(&agent).await.unwrap();

        let found = repo
            .get_agent_by_public_key(&agent.public_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, agent.id);
        assert_eq!(repo.list_agents(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_messages_ordered_per_conversation() {
        let (_dir, repo) = open_temp();
        let a = Conversation::new(Uuid::new_v4(), None, false);
        let b = Conversation::new(a.agent_id, None, false);
        repo.insert_conversation(&a).await.unwrap();
        repo.insert_conversation(&b).await.unwrap();

        repo.append_message(&Message::user(a.id, "one")).await.unwrap();
        repo.append_message(&Message::user(b.id, "other")).await.unwrap();
        repo.append_message(&Message::assistant(a.id, "two", MessageMetadata::default()))
            .await
            .unwrap();
        repo.append_message(&Message::user(a.id, "three")).await.unwrap();

        let all: Vec<String> = repo
            .list_messages(a.id, None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(all, vec!["one", "two", "three"]);

        let last = repo.list_messages(a.id, Some(1)).await.unwrap();
        assert_eq!(last[0].content, "three");
    }

    #[tokio::test]
    async fn test_title_set_once() {
        let (_dir, repo) = open_temp();
        let conv = Conversation::new(Uuid::new_v4(), None, true);
        repo.insert_conversation(&conv).await.unwrap();
        assert!(repo.set_title_if_empty(conv.id, "hello").await.unwrap());
        assert!(!repo.set_title_if_empty(conv.id, "later").await.unwrap());
        assert!(repo
            .set_title_if_empty(Uuid::new_v4(), "missing")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_agent_removes_messages() {
        let (_dir, repo) = open_temp();
        let user = repo.ensure_user("bob").await.unwrap();
        let agent = Agent::new(user, "a", "b");
        repo.insert_agent(&agent).await.unwrap();
        let conv = Conversation::new(agent.id, Some(user), false);
        repo.insert_conversation(&conv).await.unwrap();
        repo.append_message(&Message::user(conv.id, "hi")).await.unwrap();

        assert!(repo.delete_agent(agent.id).await.unwrap());
        assert!(repo.list_messages(conv.id, None).await.unwrap().is_empty());
        assert!(repo
            .get_agent_by_public_key(&agent.public_key)
            .await
            .unwrap()
            .is_none());
    }
}
