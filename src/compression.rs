//! Rolling-summary compression of a chat's oldest unsummarized turns.
//!
//! Once the unsummarized window grows past `threshold_high`, the oldest
//! `batch_size` turns are merged into the chat's summary by a [`Summarizer`]
//! and flagged summarized. The summarizer call runs outside the per-chat scope;
//! the commit re-validates the state it was computed from and is skipped when
//! the chat changed in the meantime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::{CompressionMode, MemoryConfig};
use crate::database::{Turn, TurnRole};
use crate::error::{EngineError, EngineResult};
use crate::events::{Component, EngineEvent, EventSink};
use crate::llm_client::{CompletionOptions, CompletionProvider, Message};
use crate::message_log::MessageLog;

const SUMMARY_SYSTEM_PROMPT: &str = "Update the summary with these new lines. Preserve key facts \
such as names, decisions, numbers and open questions. Reply with the updated summary only.";

/// `merge(old_summary, new_turns) -> new_summary`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn merge(&self, old_summary: &str, new_turns: &[Turn]) -> Result<String>;
}

/// Summarizer backed by the fast completion model.
pub struct LlmSummarizer {
    provider: Arc<dyn CompletionProvider>,
    options: CompletionOptions,
}

impl LlmSummarizer {
    pub fn new(provider: Arc<dyn CompletionProvider>, model: Option<String>) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                model,
                temperature: Some(0.2),
                max_tokens: Some(1000),
            },
        }
    }
}

fn speaker(role: TurnRole) -> &'static str {
    match role {
        TurnRole::User => "Human",
        TurnRole::Assistant => "AI",
        TurnRole::System => "System",
    }
}

/// Transcript lines in the form the summary prompt expects.
pub fn format_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| format!("{}: {}", speaker(turn.role), turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn merge(&self, old_summary: &str, new_turns: &[Turn]) -> Result<String> {
        let messages = vec![
            Message::system(SUMMARY_SYSTEM_PROMPT),
            Message::user(format!(
                "Current Summary:\n{}\n\nNew Lines:\n{}",
                old_summary,
                format_transcript(new_turns)
            )),
        ];
        let summary = self.provider.complete(messages, &self.options).await?;
        Ok(summary.trim().to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompressionPlan {
    Idle,
    Compress { batch: Vec<Turn> },
}

/// Decide what to do with an unsummarized window (ascending by sequence).
pub fn plan(unsummarized: &[Turn], config: &MemoryConfig) -> CompressionPlan {
    if unsummarized.len() <= config.threshold_high {
        return CompressionPlan::Idle;
    }
    // Leave at least the newest turn out of the batch.
    let batch_size = config.batch_size.min(unsummarized.len() - 1);
    if batch_size == 0 {
        return CompressionPlan::Idle;
    }
    CompressionPlan::Compress {
        batch: unsummarized[..batch_size].to_vec(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompressionOutcome {
    /// Window at or below the high-water mark.
    Idle,
    Compressed {
        batch_size: usize,
        remaining_unsummarized: usize,
    },
    /// Another compression of this chat is already running.
    Busy,
    /// The chat changed while the summarizer ran; nothing was written.
    Stale,
    /// Summarizer error, timeout or empty result; nothing was written.
    Failed(String),
    /// Handed to a background task.
    Scheduled,
}

pub struct SummaryCompressor {
    log: Arc<MessageLog>,
    summarizer: Arc<dyn Summarizer>,
    config: MemoryConfig,
    events: EventSink,
}

impl SummaryCompressor {
    pub fn new(
        log: Arc<MessageLog>,
        summarizer: Arc<dyn Summarizer>,
        config: MemoryConfig,
        events: EventSink,
    ) -> Self {
        Self {
            log,
            summarizer,
            config,
            events,
        }
    }

    pub fn mode(&self) -> CompressionMode {
        self.config.compression_mode
    }

    /// Run according to the configured mode: inline compression is awaited,
    /// background compression is spawned and reported as `Scheduled`.
    pub async fn run(self: &Arc<Self>, chat_id: &str) -> EngineResult<CompressionOutcome> {
        match self.config.compression_mode {
            CompressionMode::Inline => self.maybe_compress(chat_id).await,
            CompressionMode::Background => {
                let unsummarized = self.log.list_unsummarized(chat_id)?;
                if matches!(plan(&unsummarized, &self.config), CompressionPlan::Idle) {
                    return Ok(CompressionOutcome::Idle);
                }
                self.spawn_background(chat_id.to_string());
                Ok(CompressionOutcome::Scheduled)
            }
        }
    }

    pub fn spawn_background(self: &Arc<Self>, chat_id: String) -> JoinHandle<()> {
        let compressor = Arc::clone(self);
        tokio::spawn(async move {
            match compressor.maybe_compress(&chat_id).await {
                Ok(outcome) => {
                    tracing::debug!("Background compression of chat {}: {:?}", chat_id, outcome)
                }
                Err(error) => {
                    tracing::warn!("Background compression of chat {} aborted: {}", chat_id, error)
                }
            }
        })
    }

    /// Compress one batch if the chat is over its high-water mark.
    ///
    /// Summarizer problems are absorbed into [`CompressionOutcome::Failed`] and
    /// a degradation event; only storage and lookup errors are returned.
    pub async fn maybe_compress(&self, chat_id: &str) -> EngineResult<CompressionOutcome> {
        let Some(_permit) = self.log.try_begin_compression(chat_id) else {
            return Ok(CompressionOutcome::Busy);
        };

        let epoch = self.log.epoch(chat_id);
        let memory = self.log.memory(chat_id)?;
        let unsummarized = self.log.list_unsummarized(chat_id)?;
        let batch = match plan(&unsummarized, &self.config) {
            CompressionPlan::Idle => return Ok(CompressionOutcome::Idle),
            CompressionPlan::Compress { batch } => batch,
        };

        tracing::info!(
            "Compressing {} of {} unsummarized turns in chat {}",
            batch.len(),
            unsummarized.len(),
            chat_id
        );

        let new_summary = match self.summarize(&memory.summary_text, &batch).await {
            Ok(summary) => summary,
            Err(error) => {
                tracing::warn!("Summary compression failed for chat {}: {}", chat_id, error);
                self.events.emit(EngineEvent::Degraded {
                    chat_id: chat_id.to_string(),
                    component: Component::Summarization,
                    reason: error.to_string(),
                });
                return Ok(CompressionOutcome::Failed(error.to_string()));
            }
        };

        let batch_ids: Vec<String> = batch.iter().map(|turn| turn.id.clone()).collect();
        let guard = self.log.lock(chat_id).await?;
        if guard.epoch() != epoch {
            tracing::debug!("Discarding summary for chat {}: history truncated", chat_id);
            return Ok(CompressionOutcome::Stale);
        }
        let current = self.log.memory(chat_id)?;
        if current.summary_text != memory.summary_text {
            tracing::debug!("Discarding summary for chat {}: summary moved on", chat_id);
            return Ok(CompressionOutcome::Stale);
        }
        if !guard.commit_summary(&new_summary, &batch_ids)? {
            tracing::debug!("Discarding summary for chat {}: batch changed", chat_id);
            return Ok(CompressionOutcome::Stale);
        }
        drop(guard);

        let remaining = self.log.memory(chat_id)?.unsummarized_count;
        self.events.emit(EngineEvent::Compressed {
            chat_id: chat_id.to_string(),
            batch_size: batch_ids.len(),
            remaining_unsummarized: remaining,
        });
        Ok(CompressionOutcome::Compressed {
            batch_size: batch_ids.len(),
            remaining_unsummarized: remaining,
        })
    }

    async fn summarize(&self, old_summary: &str, batch: &[Turn]) -> EngineResult<String> {
        let timeout = Duration::from_secs(self.config.summarization_timeout_secs.max(1));
        let summary = tokio::time::timeout(timeout, self.summarizer.merge(old_summary, batch))
            .await
            .map_err(|_| EngineError::SummarizationFailed(format!("timed out after {:?}", timeout)))?
            .map_err(|error| EngineError::SummarizationFailed(format!("{:#}", error)))?;
        if summary.trim().is_empty() {
            return Err(EngineError::SummarizationFailed(
                "summarizer returned an empty summary".to_string(),
            ));
        }
        Ok(summary)
    }
}
