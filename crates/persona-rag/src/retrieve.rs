use persona_core::{KnowledgeDocument, Limits, RetrievalStats};
use persona_error::Result;
use persona_llm::EmbedModel;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// 计算余弦相似度
///
/// 维度不一致、零向量或结果非有限值时返回 `None`，调用方将其视为不匹配。
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let similarity = dot_product / (norm_a.sqrt() * norm_b.sqrt());
    similarity.is_finite().then_some(similarity)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedPassage {
    pub document_id: Uuid,
    pub filename: String,
    pub similarity: f32,
}

/// 检索结果：拼接好的上下文与排序信息
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub context: String,
    pub passages: Vec<RankedPassage>,
    pub stats: RetrievalStats,
}

impl Retrieval {
    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
    }
}

pub struct Retriever {
    embed: Arc<dyn EmbedModel>,
    top_k: usize,
    threshold: f32,
}

impl Retriever {
    pub fn new(embed: Arc<dyn EmbedModel>, limits: &Limits) -> Self {
        Self {
            embed,
            top_k: limits.retrieval_top_k.max(1),
            threshold: limits.similarity_threshold,
        }
    }

    /// 语义检索
    ///
    /// 取相似度最高的 `top_k` 篇文档，保留超过阈值的部分；若全部低于阈值，
    /// 仍返回前 `top_k` 篇作为弱上下文。
    #[instrument(skip(self, query, candidates), fields(candidates = candidates.len()))]
    pub async fn retrieve(&self, query: &str, candidates: &[KnowledgeDocument]) -> Result<Retrieval> {
        let vectors: Vec<(&KnowledgeDocument, Vec<f32>)> = candidates
            .iter()
            .filter_map(|d| d.embedding_vector().map(|v| (d, v)))
            .collect();
        if vectors.is_empty() {
            if !candidates.is_empty() {
                tracing::warn!("No candidate carried a usable embedding");
            }
            return Ok(Retrieval {
                stats: RetrievalStats {
                    candidates: candidates.len(),
                    ..RetrievalStats::default()
                },
                ..Retrieval::default()
            });
        }

        let query_vector = self.embed.embed_one(query).await?;

        let mut scored: Vec<(&KnowledgeDocument, f32)> = vectors
            .iter()
            .filter_map(|(d, v)| cosine_similarity(&query_vector, v).map(|s| (*d, s)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(self.top_k);

        let passing: Vec<(&KnowledgeDocument, f32)> = scored
            .iter()
            .copied()
            .filter(|(_, s)| *s > self.threshold)
            .collect();
        let below_threshold_fallback = passing.is_empty() && !scored.is_empty();
        let selected = if below_threshold_fallback {
            scored
        } else {
            passing
        };

        let context = selected
            .iter()
            .map(|(d, _)| d.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let passages: Vec<RankedPassage> = selected
            .iter()
            .map(|(d, s)| RankedPassage {
                document_id: d.id,
                filename: d.filename.clone(),
                similarity: *s,
            })
            .collect();

        let stats = RetrievalStats {
            candidates: candidates.len(),
            passages: passages.len(),
            top_similarity: passages.first().map(|p| p.similarity),
            below_threshold_fallback,
        };
        tracing::info!(
            passages = stats.passages,
            top_similarity = ?stats.top_similarity,
            fallback = below_threshold_fallback,
            "Retrieved knowledge"
        );
        Ok(Retrieval {
            context,
            passages,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_llm::mock::KeyedEmbedModel;

    const QUERY: &str = "when are you open?";

    fn doc(content: &str, similarity: f32) -> KnowledgeDocument {
        let mut d = KnowledgeDocument::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            format!("{content}.txt"),
            "text/plain",
            content.to_string(),
            content.len() as u64,
        );
        // unit vector at the requested angle from the query vector [1, 0]
        d.mark_processed(&[similarity, (1.0 - similarity * similarity).sqrt()])
            .unwrap();
        d
    }

    fn retriever(embed: Arc<KeyedEmbedModel>) -> Retriever {
        Retriever::new(embed, &Limits::default())
    }

    fn query_model() -> Arc<KeyedEmbedModel> {
        Arc::new(KeyedEmbedModel::new().with(QUERY, vec![1.0, 0.0]))
    }

    #[test]
    fn test_cosine_symmetry_and_identity() {
        let a = [0.3, -1.2, 4.0];
        let b = [2.0, 0.5, -0.7];
        let ab = cosine_similarity(&a, &b).unwrap();
        let ba = cosine_similarity(&b, &a).unwrap();
        assert!((ab - ba).abs() < 1e-6);
        assert!((cosine_similarity(&a, &a).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_undefined_cases() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[], &[]), None);
        assert_eq!(cosine_similarity(&[f32::NAN, 1.0], &[1.0, 1.0]), None);
    }

    #[tokio::test]
    async fn test_empty_candidates_skip_embedding() {
        let embed = query_model();
        let r = retriever(embed.clone()).retrieve(QUERY, &[]).await.unwrap();
        assert!(r.is_empty());
        assert_eq!(embed.calls(), 0);
    }

    #[tokio::test]
    async fn test_threshold_filters_ranked() {
        let docs = vec![doc("low", 0.1), doc("high", 0.9), doc("mid", 0.5)];
        let r = retriever(query_model()).retrieve(QUERY, &docs).await.unwrap();
        assert_eq!(r.context, "high\n\nmid");
        assert_eq!(r.passages.len(), 2);
        assert!(!r.stats.below_threshold_fallback);
        assert!((r.stats.top_similarity.unwrap() - 0.9).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_below_threshold_falls_back() {
        let docs = vec![doc("weaker", 0.1), doc("weak", 0.2)];
        let r = retriever(query_model()).retrieve(QUERY, &docs).await.unwrap();
        assert!(r.context.starts_with("weak\n\n"));
        assert!(r.context.contains("weaker"));
        assert!(r.stats.below_threshold_fallback);
    }

    #[tokio::test]
    async fn test_top_k_cap() {
        let docs: Vec<_> = [0.95, 0.9, 0.85, 0.8, 0.75]
            .iter()
            .enumerate()
            .map(|(i, s)| doc(&format!("d{i}"), *s))
            .collect();
        let r = retriever(query_model()).retrieve(QUERY, &docs).await.unwrap();
        assert_eq!(r.context, "d0\n\nd1\n\nd2");
    }

    #[tokio::test]
    async fn test_undeserializable_vectors_dropped() {
        let mut broken = doc("broken", 0.99);
        broken.embedding = Some("{not json".into());
        let mut wrong_dim = doc("wrong_dim", 0.99);
        wrong_dim.embedding = Some("[1.0, 0.0, 0.0]".into());
        let good = doc("good", 0.1);

        let r = retriever(query_model())
            .retrieve(QUERY, &[broken.clone(), wrong_dim, good])
            .await
            .unwrap();
        assert_eq!(r.context, "good");

        let embed = query_model();
        let r = retriever(embed.clone()).retrieve(QUERY, &[broken]).await.unwrap();
        assert!(r.is_empty());
        assert_eq!(embed.calls(), 0);
    }

    #[tokio::test]
    async fn test_embedding_failure_surfaces() {
        let docs = vec![doc("a", 0.5)];
        let r = retriever(Arc::new(KeyedEmbedModel::failing()))
            .retrieve(QUERY, &docs)
            .await;
        assert!(r.is_err());
    }
}
