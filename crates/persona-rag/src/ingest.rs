use crate::normalize::{
    decode_text, html_to_text, normalize, resolve_upload_mime, MIME_HTML, MIME_PDF, MIME_TEXT,
};
use crate::summarize::Summarizer;
use persona_core::limits::truncate_chars;
use persona_core::{Agent, KnowledgeDocument, Limits, Repository};
use persona_error::{PersonaError, Result};
use persona_fetch::{HttpFetch, HttpRequest};
use persona_llm::{ChatModel, EmbedModel};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;
use uuid::Uuid;

/// One uploaded file as received from the transport layer.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    /// Declared content type, may be empty
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// 知识文档摄取：规范化、摘要、向量化并持久化
pub struct Ingestor {
    repo: Arc<dyn Repository>,
    embed: Arc<dyn EmbedModel>,
    summarizer: Summarizer,
    fetch: Arc<dyn HttpFetch>,
    limits: Limits,
}

impl Ingestor {
    pub fn new(
        repo: Arc<dyn Repository>,
        chat: Arc<dyn ChatModel>,
        embed: Arc<dyn EmbedModel>,
        fetch: Arc<dyn HttpFetch>,
        limits: Limits,
    ) -> Self {
        Self {
            repo,
            embed,
            summarizer: Summarizer::new(chat, &limits),
            fetch,
            limits,
        }
    }

    /// 上传文件摄取。大小与类型在规范化之前校验。
    #[instrument(skip(self, agent, upload), fields(agent_id = %agent.id, filename = %upload.filename, bytes = upload.bytes.len()))]
    pub async fn ingest_upload(&self, agent: &Agent, upload: Upload) -> Result<KnowledgeDocument> {
        let size = upload.bytes.len();
        if size > self.limits.max_upload_bytes {
            return Err(PersonaError::PayloadTooLarge {
                size,
                limit: self.limits.max_upload_bytes,
            });
        }
        let mime = resolve_upload_mime(&upload.mime_type, &upload.filename).ok_or_else(|| {
            PersonaError::UnsupportedMediaType {
                mime_type: if upload.mime_type.is_empty() {
                    upload.filename.clone()
                } else {
                    upload.mime_type.clone()
                },
            }
        })?;

        let text = normalize(upload.bytes, mime, self.limits.url_text_max_chars).await?;
        self.store(agent, upload.filename, mime, text, size as u64).await
    }

    /// 网页摄取：仅接受 http(s)，非 2xx 视为失败
    #[instrument(skip(self, agent), fields(agent_id = %agent.id))]
    pub async fn ingest_url(&self, agent: &Agent, url: &str) -> Result<KnowledgeDocument> {
        let parsed = Url::parse(url.trim())?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PersonaError::InvalidRequest {
                reason: "only http(s) URLs can be ingested".to_string(),
            });
        }

        let req = HttpRequest::get(parsed.clone())
            .header("Accept", "text/html,application/xhtml+xml,text/plain;q=0.9,*/*;q=0.8")
            .timeout(Duration::from_millis(self.limits.url_fetch_timeout_ms))
            .max_body_bytes(self.limits.max_upload_bytes);
        let resp = self.fetch.fetch(req).await?;
        if !resp.is_success() {
            return Err(PersonaError::Extraction {
                source_kind: "url".to_string(),
                message: format!("The page could not be fetched (HTTP {})", resp.status),
            });
        }

        let content_type = resp
            .content_type
            .as_deref()
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let size = resp.body.len() as u64;
        let cap = self.limits.url_text_max_chars;
        let (mime, text) = match content_type.as_str() {
            MIME_PDF => {
                let text = normalize(resp.body, MIME_PDF, cap).await?;
                (MIME_PDF, truncate_chars(&text, cap).to_string())
            }
            MIME_TEXT => {
                let text = decode_text(&resp.body);
                let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                (MIME_TEXT, truncate_chars(&collapsed, cap).to_string())
            }
            _ => (MIME_HTML, html_to_text(&decode_text(&resp.body), cap)?),
        };

        self.store(agent, parsed.to_string(), mime, text, size).await
    }

    /// 重新生成向量（用于 processed=false 的文档），缺失摘要时一并补齐
    #[instrument(skip(self))]
    pub async fn reprocess(&self, document_id: Uuid) -> Result<KnowledgeDocument> {
        let mut doc = self
            .repo
            .get_document(document_id)
            .await?
            .ok_or_else(|| PersonaError::not_found(format!("document {document_id}")))?;

        if doc.summary.is_none() {
            doc.summary = self.summary_of(&doc.content).await;
        }
        let embedding = self.embed.embed_one(&doc.content).await;
        apply_embedding(&mut doc, embedding);
        self.repo.update_document(&doc).await?;
        tracing::info!(document_id = %doc.id, processed = doc.processed, "Reprocessed document");
        Ok(doc)
    }

    async fn store(
        &self,
        agent: &Agent,
        filename: String,
        mime: &str,
        text: String,
        size_bytes: u64,
    ) -> Result<KnowledgeDocument> {
        if text.trim().is_empty() {
            return Err(PersonaError::Extraction {
                source_kind: mime.to_string(),
                message: "No text could be extracted from this document".to_string(),
            });
        }

        let mut doc = KnowledgeDocument::new(agent.id, agent.user_id, filename, mime, text, size_bytes);
        let (summary, embedding) = tokio::join!(
            self.summary_of(&doc.content),
            self.embed.embed_one(&doc.content)
        );
        doc.summary = summary;
        apply_embedding(&mut doc, embedding);

        self.repo.insert_document(&doc).await?;
        tracing::info!(
            document_id = %doc.id,
            processed = doc.processed,
            chars = doc.content.len(),
            "Stored knowledge document"
        );
        Ok(doc)
    }

    async fn summary_of(&self, content: &str) -> Option<String> {
        match self.summarizer.summarize(content).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::warn!(error = %e, "Summarization failed, storing document without summary");
                None
            }
        }
    }
}

/// Stores the vector on success. Failures and empty vectors leave the document unprocessed.
fn apply_embedding(doc: &mut KnowledgeDocument, embedding: Result<Vec<f32>>) {
    if let Err(e) = embedding.and_then(|vector| doc.mark_processed(&vector)) {
        tracing::warn!(document_id = %doc.id, error = %e, "Embedding failed, document stays unprocessed");
        doc.mark_unprocessed();
    }
}
