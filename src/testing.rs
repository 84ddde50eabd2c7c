//! In-process fakes for the injected collaborators.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::compression::{format_transcript, Summarizer};
use crate::database::Turn;
use crate::llm_client::{CompletionOptions, CompletionProvider, Message, StreamChunk};
use crate::retrieval::{Embedder, RetrievalFilters, RetrievedChunk, VectorIndex};

pub struct UnitEmbedder;

#[async_trait]
impl Embedder for UnitEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0])
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedding service unreachable")
    }
}

/// Returns the same chunks for every query.
pub struct StaticIndex {
    chunks: Vec<RetrievedChunk>,
    delay: Option<Duration>,
}

impl StaticIndex {
    pub fn new(chunks: Vec<RetrievedChunk>) -> Self {
        Self {
            chunks,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl VectorIndex for StaticIndex {
    async fn nearest(
        &self,
        _vector: &[f32],
        _k: usize,
        _filters: &RetrievalFilters,
    ) -> Result<Vec<RetrievedChunk>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.chunks.clone())
    }
}

/// Appends the batch transcript to the old summary.
pub struct JoiningSummarizer;

#[async_trait]
impl Summarizer for JoiningSummarizer {
    async fn merge(&self, old_summary: &str, new_turns: &[Turn]) -> Result<String> {
        let lines = format_transcript(new_turns).replace('\n', "; ");
        if old_summary.is_empty() {
            Ok(lines)
        } else {
            Ok(format!("{}; {}", old_summary, lines))
        }
    }
}

pub struct FailingSummarizer;

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn merge(&self, _old_summary: &str, _new_turns: &[Turn]) -> Result<String> {
        anyhow::bail!("summary model overloaded")
    }
}

/// Completion provider that replays a fixed script and records every request.
pub struct ScriptedProvider {
    reply: String,
    chunks: Vec<StreamChunk>,
    delay: Duration,
    requests: Mutex<Vec<(Option<String>, Vec<Message>)>>,
}

impl ScriptedProvider {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            chunks: vec![StreamChunk::Fragment(reply.to_string()), StreamChunk::Done],
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn streaming(chunks: Vec<StreamChunk>) -> Self {
        let reply = chunks
            .iter()
            .filter_map(|chunk| match chunk {
                StreamChunk::Fragment(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        Self {
            reply,
            chunks,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Pause before every streamed chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<(Option<String>, Vec<Message>)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(&self, messages: &[Message], options: &CompletionOptions) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((options.model.clone(), messages.to_vec()));
        }
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, messages: Vec<Message>, options: &CompletionOptions) -> Result<String> {
        self.record(&messages, options);
        Ok(self.reply.clone())
    }

    async fn stream(
        &self,
        messages: Vec<Message>,
        options: &CompletionOptions,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        self.record(&messages, options);
        let (tx, rx) = mpsc::channel(8);
        let chunks = self.chunks.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
