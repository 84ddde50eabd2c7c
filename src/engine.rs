//! Turn pipeline: retrieval, dedupe, compression, prompt assembly and
//! generation for one user turn, plus the edit-and-regenerate entry point.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::compression::{CompressionOutcome, Summarizer, SummaryCompressor};
use crate::config::EngineConfig;
use crate::database::{Chat, ChatMemory, Turn, TurnRole};
use crate::dedupe::Deduplicator;
use crate::edit::EditRegenerateController;
use crate::error::{EngineError, EngineResult};
use crate::events::{Component, EngineEvent, EventSink};
use crate::generation::{GenerationSession, SessionEvent};
use crate::llm_client::{CompletionOptions, CompletionProvider};
use crate::message_log::{MessageLog, PipelineTicket};
use crate::prompt::PromptAssembler;
use crate::retrieval::{Embedder, RetrievalFilters, RetrievedChunk, Retriever, VectorIndex};

const TURN_CHANNEL_CAPACITY: usize = 64;
const TITLE_CHARS: usize = 30;

/// External services the engine talks to.
pub struct Collaborators {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub provider: Arc<dyn CompletionProvider>,
    pub summarizer: Arc<dyn Summarizer>,
}

/// What a caller sees of a running turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Degraded { component: Component, reason: String },
    Fragment(String),
    Completed(Turn),
    Failed(String),
    Cancelled,
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Completed(_) | TurnEvent::Failed(_) | TurnEvent::Cancelled
        )
    }
}

/// Incremental output of one turn. Dropping it cancels the turn.
pub struct TurnStream {
    pub chat_id: String,
    /// The user turn being answered (new or edited).
    pub turn: Turn,
    events: mpsc::Receiver<TurnEvent>,
    cancel: CancellationToken,
}

impl TurnStream {
    pub async fn recv(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream, returning the concatenated fragments and the
    /// terminal event.
    pub async fn finish(mut self) -> (String, TurnEvent) {
        let mut text = String::new();
        while let Some(event) = self.events.recv().await {
            match event {
                TurnEvent::Fragment(fragment) => text.push_str(&fragment),
                TurnEvent::Degraded { .. } => {}
                terminal => return (text, terminal),
            }
        }
        (text, TurnEvent::Failed("pipeline ended without a result".to_string()))
    }
}

// Cancelling after the terminal event is a no-op: the ticket is already released.
impl Drop for TurnStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Per-invocation state handed to the pipeline task.
struct PipelineRun {
    ticket: PipelineTicket,
    turn: Turn,
    /// User turn to remove if the pipeline does not commit a reply.
    rollback: Option<String>,
    tx: mpsc::Sender<TurnEvent>,
}

pub struct ChatEngine {
    log: Arc<MessageLog>,
    retriever: Option<Retriever>,
    retrieval_k: usize,
    retrieval_filters: RetrievalFilters,
    deduplicator: Deduplicator,
    compressor: Arc<SummaryCompressor>,
    assembler: PromptAssembler,
    generator: Arc<GenerationSession>,
    editor: EditRegenerateController,
    conflict_retry_delay: Duration,
    events: EventSink,
}

impl ChatEngine {
    pub fn new(
        config: &EngineConfig,
        log: Arc<MessageLog>,
        collaborators: Collaborators,
        events: EventSink,
    ) -> Self {
        let retriever = config.retrieval.enabled.then(|| {
            Retriever::new(
                collaborators.embedder.clone(),
                collaborators.index.clone(),
                Duration::from_secs(config.retrieval.timeout_secs.max(1)),
            )
        });
        let compressor = Arc::new(SummaryCompressor::new(
            log.clone(),
            collaborators.summarizer,
            config.memory.clone(),
            events.clone(),
        ));
        let assembler = PromptAssembler::new(
            log.clone(),
            Some(config.system_prompt.clone()),
            config.prompt_budget_chars,
        );
        let generator = Arc::new(GenerationSession::new(
            log.clone(),
            collaborators.provider,
            CompletionOptions {
                model: None,
                temperature: Some(config.generation.temperature),
                max_tokens: Some(config.generation.max_tokens),
            },
            Duration::from_secs(config.generation.idle_timeout_secs.max(1)),
            events.clone(),
        ));
        let conflict_retry_delay = Duration::from_millis(config.conflict_retry_delay_ms);
        let editor =
            EditRegenerateController::new(log.clone(), conflict_retry_delay, events.clone());

        Self {
            log,
            retriever,
            retrieval_k: config.retrieval.k,
            retrieval_filters: RetrievalFilters::with_min_score(config.retrieval.min_score),
            deduplicator: Deduplicator::new(config.retrieval.dedupe_threshold),
            compressor,
            assembler,
            generator,
            editor,
            conflict_retry_delay,
            events,
        }
    }

    pub fn log(&self) -> &Arc<MessageLog> {
        &self.log
    }

    // ------------------------------------------------------------------------
    // Chat management
    // ------------------------------------------------------------------------

    pub fn create_chat(&self, title: Option<&str>) -> EngineResult<Chat> {
        Ok(self.log.database().create_chat(title)?)
    }

    pub fn list_chats(&self, limit: usize) -> EngineResult<Vec<Chat>> {
        Ok(self.log.database().list_chats(limit)?)
    }

    pub fn get_chat(&self, chat_id: &str) -> EngineResult<Chat> {
        self.log.require_chat(chat_id)
    }

    pub fn rename_chat(&self, chat_id: &str, title: &str) -> EngineResult<Chat> {
        let title = title.trim();
        if title.is_empty() {
            return Err(EngineError::InvalidInput("title must not be empty".to_string()));
        }
        self.log
            .database()
            .rename_chat(chat_id, title)?
            .ok_or_else(|| EngineError::chat_not_found(chat_id))
    }

    pub async fn delete_chat(&self, chat_id: &str) -> EngineResult<()> {
        if self.log.delete_chat(chat_id).await? {
            Ok(())
        } else {
            Err(EngineError::chat_not_found(chat_id))
        }
    }

    /// Full history, summarized turns included.
    pub fn history(&self, chat_id: &str) -> EngineResult<Vec<Turn>> {
        self.log.list_turns(chat_id)
    }

    pub fn memory(&self, chat_id: &str) -> EngineResult<ChatMemory> {
        self.log.memory(chat_id)
    }

    /// Cancel the chat's running turn. Returns whether one was running.
    pub async fn cancel(&self, chat_id: &str) -> EngineResult<bool> {
        let cancelled = self.log.cancel_active(chat_id).await?;
        if cancelled {
            tracing::info!("Cancelled running turn of chat {}", chat_id);
        }
        Ok(cancelled)
    }

    // ------------------------------------------------------------------------
    // Turns
    // ------------------------------------------------------------------------

    /// Append a user turn and start answering it. Without a `chat_id` a new
    /// chat is created, titled after the message.
    pub async fn submit_turn(
        self: &Arc<Self>,
        chat_id: Option<&str>,
        content: &str,
    ) -> EngineResult<TurnStream> {
        if content.trim().is_empty() {
            return Err(EngineError::InvalidInput("message must not be empty".to_string()));
        }
        let chat_id = match chat_id {
            Some(id) => self.log.require_chat(id)?.id,
            None => {
                let title: String = content.trim().chars().take(TITLE_CHARS).collect();
                self.log.database().create_chat(Some(&title))?.id
            }
        };

        let (ticket, turn) = match self.begin_turn(&chat_id, content).await {
            Err(EngineError::ConcurrentModification { .. }) => {
                tokio::time::sleep(self.conflict_retry_delay).await;
                self.begin_turn(&chat_id, content).await?
            }
            other => other?,
        };
        tracing::debug!(
            "Turn {} (sequence {}) accepted for chat {}",
            turn.id,
            turn.sequence,
            chat_id
        );

        let rollback = Some(turn.id.clone());
        Ok(self.spawn_pipeline(ticket, turn, rollback))
    }

    /// Rewrite a past user turn, drop everything after it and answer again.
    pub async fn edit_turn(
        self: &Arc<Self>,
        chat_id: &str,
        target_turn_id: &str,
        new_content: &str,
    ) -> EngineResult<TurnStream> {
        let prepared = self
            .editor
            .prepare(chat_id, target_turn_id, new_content)
            .await?;
        // The edit itself stays committed even if the replay fails.
        Ok(self.spawn_pipeline(prepared.ticket, prepared.turn, None))
    }

    async fn begin_turn(&self, chat_id: &str, content: &str) -> EngineResult<(PipelineTicket, Turn)> {
        let mut guard = self.log.lock(chat_id).await?;
        let ticket = guard.begin_pipeline()?;
        match guard.append_at_epoch(ticket.epoch, TurnRole::User, content) {
            Ok(turn) => Ok((ticket, turn)),
            Err(error) => {
                guard.finish_pipeline(&ticket);
                Err(error)
            }
        }
    }

    fn spawn_pipeline(
        self: &Arc<Self>,
        ticket: PipelineTicket,
        turn: Turn,
        rollback: Option<String>,
    ) -> TurnStream {
        let (tx, rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
        let stream = TurnStream {
            chat_id: ticket.chat_id.clone(),
            turn: turn.clone(),
            events: rx,
            cancel: ticket.cancel.clone(),
        };
        let engine = Arc::clone(self);
        let run = PipelineRun {
            ticket,
            turn,
            rollback,
            tx,
        };
        tokio::spawn(async move { engine.drive(run).await });
        stream
    }

    async fn drive(&self, run: PipelineRun) {
        let terminal = match self.run_pipeline(&run).await {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(
                    "Turn pipeline for chat {} aborted: {}",
                    run.ticket.chat_id,
                    error
                );
                self.events.emit(EngineEvent::GenerationFailed {
                    chat_id: run.ticket.chat_id.clone(),
                    error: error.to_string(),
                });
                TurnEvent::Failed(error.to_string())
            }
        };

        self.finalize(&run, &terminal).await;
        let _ = run.tx.send(terminal).await;
    }

    async fn run_pipeline(&self, run: &PipelineRun) -> EngineResult<TurnEvent> {
        let chat_id = run.ticket.chat_id.as_str();
        let cancel = &run.ticket.cancel;

        let references = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TurnEvent::Cancelled),
            references = self.retrieve(chat_id, &run.turn.content, &run.tx) => references,
        };
        let references = self.deduplicator.dedupe(references);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TurnEvent::Cancelled),
            outcome = self.compressor.run(chat_id) => outcome?,
        };
        if let CompressionOutcome::Failed(reason) = outcome {
            let _ = run
                .tx
                .send(TurnEvent::Degraded {
                    component: Component::Summarization,
                    reason,
                })
                .await;
        }

        if cancel.is_cancelled() {
            return Ok(TurnEvent::Cancelled);
        }
        let payload = self.assembler.assemble(chat_id, &run.turn, references)?;

        let (_handle, mut session) = self.generator.start(payload, run.ticket.clone());
        while let Some(event) = session.recv().await {
            let forwarded = match event {
                SessionEvent::Fragment(text) => TurnEvent::Fragment(text),
                SessionEvent::Completed(turn) => return Ok(TurnEvent::Completed(turn)),
                SessionEvent::Failed(message) => return Ok(TurnEvent::Failed(message)),
                SessionEvent::Cancelled => return Ok(TurnEvent::Cancelled),
            };
            if run.tx.send(forwarded).await.is_err() {
                cancel.cancel();
            }
        }
        Err(EngineError::GenerationFailed(
            "generation session ended without a result".to_string(),
        ))
    }

    /// Retrieval degrades to no references on any failure.
    async fn retrieve(
        &self,
        chat_id: &str,
        query: &str,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Vec<RetrievedChunk> {
        let Some(retriever) = &self.retriever else {
            return Vec::new();
        };
        match retriever
            .retrieve(query, self.retrieval_k, &self.retrieval_filters)
            .await
        {
            Ok(chunks) => chunks,
            Err(error) => {
                tracing::warn!("Retrieval degraded for chat {}: {}", chat_id, error);
                self.events.emit(EngineEvent::Degraded {
                    chat_id: chat_id.to_string(),
                    component: Component::Retrieval,
                    reason: error.to_string(),
                });
                let _ = tx
                    .send(TurnEvent::Degraded {
                        component: Component::Retrieval,
                        reason: error.to_string(),
                    })
                    .await;
                Vec::new()
            }
        }
    }

    /// Release the pipeline slot and, for an ordinary turn that produced no
    /// reply, remove the user turn it appended.
    async fn finalize(&self, run: &PipelineRun, terminal: &TurnEvent) {
        let mut guard = match self.log.lock(&run.ticket.chat_id).await {
            Ok(guard) => guard,
            Err(error) => {
                tracing::debug!("Chat {} gone before finalize: {}", run.ticket.chat_id, error);
                return;
            }
        };

        if !matches!(terminal, TurnEvent::Completed(_)) {
            // After a truncation the turn is gone or now belongs to an edit.
            if let Some(turn_id) = run.rollback.as_deref() {
                if guard.epoch() == run.ticket.epoch {
                    match guard.rollback_turn(turn_id) {
                        Ok(true) => tracing::debug!("Rolled back user turn {}", turn_id),
                        Ok(false) => {}
                        Err(error) => {
                            tracing::error!("Failed to roll back user turn {}: {}", turn_id, error)
                        }
                    }
                }
            }
        }
        guard.finish_pipeline(&run.ticket);
    }
}
