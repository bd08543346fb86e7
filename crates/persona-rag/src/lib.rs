//! 知识检索与对话编排
//!
//! 文档摄取（规范化、摘要、向量化）、语义检索、工具规划以及最终回答生成。

pub mod compose;
pub mod ingest;
pub mod normalize;
pub mod pipeline;
pub mod retrieve;
pub mod summarize;

pub use compose::{Classification, Composed, Composer, Grounding, INSUFFICIENT_INFORMATION};
pub use ingest::{Ingestor, Upload};
pub use normalize::{normalize, resolve_upload_mime, ACCEPTED_UPLOAD_TYPES};
pub use pipeline::{ChatPipeline, TurnOutcome, TITLE_MAX_CHARS};
pub use retrieve::{cosine_similarity, RankedPassage, Retrieval, Retriever};
pub use summarize::Summarizer;

pub use persona_error::{PersonaError, Result};
