//! Deterministic model doubles for tests and offline runs.

use crate::{ChatModel, ChatTurn, EmbedModel, PersonaError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

enum Scripted {
    Reply(String),
    Fail(String),
}

/// One recorded `chat` invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: String,
    pub turns: Vec<ChatTurn>,
}

impl RecordedCall {
    pub fn last_user(&self) -> Option<&str> {
        self.turns.last().map(|t| t.content.as_str())
    }
}

/// Replays queued responses in order and records every prompt it receives.
/// An exhausted script answers with an `LlmService` error.
#[derive(Default)]
pub struct ScriptedChatModel {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedChatModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::default();
        for r in replies {
            model.push_reply(r);
        }
        model
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Scripted::Reply(reply.into()));
        }
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Scripted::Fail(message.into()));
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn chat(&self, system: &str, turns: &[ChatTurn]) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                system: system.to_string(),
                turns: turns.to_vec(),
            });
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Scripted::Reply(text)) => Ok(text),
            Some(Scripted::Fail(message)) => Err(PersonaError::LlmService {
                provider: "scripted".to_string(),
                message,
                retry_after: None,
            }),
            None => Err(PersonaError::LlmService {
                provider: "scripted".to_string(),
                message: "script exhausted".to_string(),
                retry_after: None,
            }),
        }
    }
}

/// Maps known texts to fixed vectors. Unknown texts get the default vector, or
/// an `EmbeddingService` error when no default is set.
#[derive(Default)]
pub struct KeyedEmbedModel {
    vectors: HashMap<String, Vec<f32>>,
    default: Option<Vec<f32>>,
    failing: bool,
    calls: AtomicUsize,
}

impl KeyedEmbedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails, as an unreachable embedding backend would.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn with(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.into(), vector);
        self
    }

    pub fn with_default(mut self, vector: Vec<f32>) -> Self {
        self.default = Some(vector);
        self
    }

    /// Number of `embed` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbedModel for KeyedEmbedModel {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(PersonaError::EmbeddingService {
                provider: "keyed".to_string(),
                message: "backend unavailable".to_string(),
                retry_after: None,
            });
        }
        texts
            .iter()
            .map(|t| {
                self.vectors
                    .get(t)
                    .or(self.default.as_ref())
                    .cloned()
                    .ok_or_else(|| PersonaError::EmbeddingService {
                        provider: "keyed".to_string(),
                        message: format!("no vector for {t:?}"),
                        retry_after: None,
                    })
            })
            .collect()
    }
}
