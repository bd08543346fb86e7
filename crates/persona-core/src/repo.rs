use async_trait::async_trait;
use uuid::Uuid;

use crate::{Agent, Conversation, KnowledgeDocument, Message, Result, Tool};

/// 持久化接口：按用户/Agent 作用域的单行 CRUD，不要求跨操作事务
#[async_trait]
pub trait Repository: Send + Sync {
    /// 幂等地为外部身份分配用户 id
    async fn ensure_user(&self, identity: &str) -> Result<Uuid>;

    async fn insert_agent(&self, agent: &Agent) -> Result<()>;
    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>>;
    async fn get_agent_by_public_key(&self, public_key: &str) -> Result<Option<Agent>>;
    async fn list_agents(&self, user_id: Uuid) -> Result<Vec<Agent>>;
    async fn update_agent(&self, agent: &Agent) -> Result<()>;
    /// 同时删除该 Agent 的文档、工具与会话
    async fn delete_agent(&self, id: Uuid) -> Result<bool>;

    async fn insert_document(&self, doc: &KnowledgeDocument) -> Result<()>;
    async fn update_document(&self, doc: &KnowledgeDocument) -> Result<()>;
    async fn get_document(&self, id: Uuid) -> Result<Option<KnowledgeDocument>>;
    async fn list_documents(&self, agent_id: Uuid) -> Result<Vec<KnowledgeDocument>>;
    async fn delete_document(&self, id: Uuid) -> Result<bool>;

    async fn insert_tool(&self, tool: &Tool) -> Result<()>;
    async fn get_tool(&self, id: Uuid) -> Result<Option<Tool>>;
    async fn list_tools(&self, agent_id: Uuid) -> Result<Vec<Tool>>;
    async fn delete_tool(&self, id: Uuid) -> Result<bool>;

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;
    async fn list_conversations(&self, agent_id: Uuid) -> Result<Vec<Conversation>>;
    /// Compare-and-swap：仅当标题仍为空时写入，返回是否写入成功
    async fn set_title_if_empty(&self, conversation_id: Uuid, title: &str) -> Result<bool>;

    async fn append_message(&self, message: &Message) -> Result<()>;
    /// 按插入顺序返回；`limit` 只保留最近的若干条
    async fn list_messages(&self, conversation_id: Uuid, limit: Option<usize>)
        -> Result<Vec<Message>>;

    /// 仅返回已处理（有向量）的文档
    async fn list_processed_documents(&self, agent_id: Uuid) -> Result<Vec<KnowledgeDocument>> {
        Ok(self
            .list_documents(agent_id)
            .await?
            .into_iter()
            .filter(|d| d.processed)
            .collect())
    }
}
