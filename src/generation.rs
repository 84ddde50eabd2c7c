//! Streaming generation of one assistant reply.
//!
//! A session runs in its own task. It forwards fragments as they arrive and
//! ends with exactly one terminal [`SessionEvent`]. The reply is committed as a
//! single assistant turn, under the per-chat scope, only when the owning
//! pipeline ticket is still current.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::database::{Turn, TurnRole};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventSink};
use crate::llm_client::{CompletionOptions, CompletionProvider, StreamChunk};
use crate::message_log::{MessageLog, PipelineTicket};
use crate::prompt::PromptPayload;

const SESSION_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Fragment(String),
    Completed(Turn),
    Failed(String),
    Cancelled,
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Fragment(_))
    }
}

pub struct GenerationHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl GenerationHandle {
    /// Stop consuming upstream output. Partial output is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) {
        if let Err(error) = self.task.await {
            tracing::error!("Generation task panicked: {}", error);
        }
    }
}

enum StreamEnd {
    Finished(String),
    Cancelled,
}

pub struct GenerationSession {
    log: Arc<MessageLog>,
    provider: Arc<dyn CompletionProvider>,
    options: CompletionOptions,
    idle_timeout: Duration,
    events: EventSink,
}

impl GenerationSession {
    pub fn new(
        log: Arc<MessageLog>,
        provider: Arc<dyn CompletionProvider>,
        options: CompletionOptions,
        idle_timeout: Duration,
        events: EventSink,
    ) -> Self {
        Self {
            log,
            provider,
            options,
            idle_timeout,
            events,
        }
    }

    /// Spawn the session. Cancelling the ticket's token has the same effect as
    /// [`GenerationHandle::cancel`].
    pub fn start(
        self: &Arc<Self>,
        payload: PromptPayload,
        ticket: PipelineTicket,
    ) -> (GenerationHandle, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let cancel = ticket.cancel.clone();
        let session = Arc::clone(self);

        let task = tokio::spawn(async move {
            let chat_id = ticket.chat_id.clone();
            let terminal = match session.run(&payload, &ticket, &tx).await {
                Ok(Some(turn)) => SessionEvent::Completed(turn),
                Ok(None) => {
                    tracing::info!("Generation for chat {} cancelled", chat_id);
                    session
                        .events
                        .emit(EngineEvent::GenerationCancelled { chat_id });
                    SessionEvent::Cancelled
                }
                Err(error) => {
                    tracing::warn!("Generation for chat {} failed: {}", chat_id, error);
                    session.events.emit(EngineEvent::GenerationFailed {
                        chat_id,
                        error: error.to_string(),
                    });
                    SessionEvent::Failed(error.to_string())
                }
            };
            let _ = tx.send(terminal).await;
        });

        (GenerationHandle { cancel, task }, rx)
    }

    /// `Ok(None)` means cancelled.
    async fn run(
        &self,
        payload: &PromptPayload,
        ticket: &PipelineTicket,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> EngineResult<Option<Turn>> {
        let output = match self.stream(payload, ticket, tx).await? {
            StreamEnd::Finished(output) => output,
            StreamEnd::Cancelled => return Ok(None),
        };
        if output.trim().is_empty() {
            return Err(EngineError::GenerationFailed(
                "model produced no output".to_string(),
            ));
        }

        let mut guard = self.log.lock(&ticket.chat_id).await?;
        if !guard.is_current(ticket) {
            return Ok(None);
        }
        let turn = guard.append_at_epoch(ticket.epoch, TurnRole::Assistant, &output)?;
        if !payload.references.is_empty() {
            let references: Vec<(String, f32)> = payload
                .references
                .iter()
                .map(|chunk| (chunk.source_id.clone(), chunk.score))
                .collect();
            // Audit only; a failure here does not undo the reply.
            if let Err(error) = self
                .log
                .database()
                .record_turn_references(&turn.id, &references)
            {
                tracing::warn!("Failed to record references for turn {}: {}", turn.id, error);
            }
        }
        drop(guard);

        self.events.emit(EngineEvent::TurnCommitted {
            chat_id: turn.chat_id.clone(),
            turn_id: turn.id.clone(),
            sequence: turn.sequence,
        });
        Ok(Some(turn))
    }

    async fn stream(
        &self,
        payload: &PromptPayload,
        ticket: &PipelineTicket,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> EngineResult<StreamEnd> {
        let cancel = &ticket.cancel;
        let messages = payload.to_messages();

        let mut upstream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            opened = self.provider.stream(messages, &self.options) => opened
                .map_err(|error| EngineError::GenerationFailed(format!("{:#}", error)))?,
        };

        let mut output = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = tokio::time::timeout(self.idle_timeout, upstream.recv()) => next,
            };

            match next {
                Ok(Some(StreamChunk::Fragment(text))) => {
                    output.push_str(&text);
                    // A stalled consumer must not delay cancellation.
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                        sent = tx.send(SessionEvent::Fragment(text)) => sent,
                    };
                    if sent.is_err() {
                        // Nobody is listening any more; treat as a cancel.
                        cancel.cancel();
                        return Ok(StreamEnd::Cancelled);
                    }
                }
                Ok(Some(StreamChunk::Done)) => return Ok(StreamEnd::Finished(output)),
                Ok(Some(StreamChunk::Error(message))) => {
                    return Err(EngineError::GenerationFailed(message))
                }
                Ok(None) => {
                    return Err(EngineError::GenerationFailed(
                        "stream ended without a completion signal".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(EngineError::GenerationFailed(format!(
                        "no output for {:?}",
                        self.idle_timeout
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ChatDatabase;
    use crate::retrieval::RetrievedChunk;
    use crate::testing::ScriptedProvider;

    struct Fixture {
        log: Arc<MessageLog>,
        chat_id: String,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = ChatDatabase::new(dir.path().join("gen.db")).expect("db init");
        let log = Arc::new(MessageLog::new(Arc::new(db)));
        let chat = log.database().create_chat(None).expect("chat");
        log.append(&chat.id, TurnRole::User, "how do I reset it?")
            .await
            .expect("append");
        Fixture {
            log,
            chat_id: chat.id,
            _dir: dir,
        }
    }

    fn payload(references: Vec<RetrievedChunk>) -> PromptPayload {
        PromptPayload {
            preamble: "P".to_string(),
            summary: String::new(),
            recent: Vec::new(),
            references,
            current_input: "how do I reset it?".to_string(),
        }
    }

    fn session(log: &Arc<MessageLog>, provider: ScriptedProvider, idle: Duration) -> Arc<GenerationSession> {
        Arc::new(GenerationSession::new(
            log.clone(),
            Arc::new(provider),
            CompletionOptions::default(),
            idle,
            EventSink::disabled(),
        ))
    }

    async fn ticket(log: &MessageLog, chat_id: &str) -> PipelineTicket {
        log.lock(chat_id)
            .await
            .expect("lock")
            .begin_pipeline()
            .expect("ticket")
    }

    async fn drain(mut rx: mpsc::Receiver<SessionEvent>) -> (Vec<String>, SessionEvent) {
        let mut fragments = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Fragment(text) => fragments.push(text),
                terminal => return (fragments, terminal),
            }
        }
        panic!("session ended without a terminal event");
    }

    #[tokio::test]
    async fn completed_reply_is_committed_once_with_references() {
        let fx = fixture().await;
        let provider = ScriptedProvider::streaming(vec![
            StreamChunk::Fragment("Hold ".to_string()),
            StreamChunk::Fragment("power.".to_string()),
            StreamChunk::Done,
        ]);
        let session = session(&fx.log, provider, Duration::from_secs(5));
        let ticket = ticket(&fx.log, &fx.chat_id).await;
        let references = vec![RetrievedChunk {
            source_id: "manual#7".to_string(),
            text: "Hold power for ten seconds.".to_string(),
            score: 0.8,
            embedding: None,
        }];

        let (_handle, rx) = session.start(payload(references), ticket);
        let (fragments, terminal) = drain(rx).await;
        assert_eq!(fragments, vec!["Hold ", "power."]);
        let turn = match terminal {
            SessionEvent::Completed(turn) => turn,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(turn.content, "Hold power.");
        assert_eq!(turn.role, TurnRole::Assistant);
        assert_eq!(turn.sequence, 2);

        let turns = fx.log.list_turns(&fx.chat_id).expect("turns");
        assert_eq!(turns.len(), 2);
        let refs = fx
            .log
            .database()
            .list_turn_references(&turn.id)
            .expect("refs");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].source_id, "manual#7");
    }

    #[tokio::test]
    async fn cancel_mid_stream_commits_nothing() {
        let fx = fixture().await;
        let fragments = (0..50)
            .map(|i| StreamChunk::Fragment(format!("w{} ", i)))
            .chain(std::iter::once(StreamChunk::Done))
            .collect();
        let provider =
            ScriptedProvider::streaming(fragments).with_delay(Duration::from_millis(20));
        let session = session(&fx.log, provider, Duration::from_secs(5));
        let ticket = ticket(&fx.log, &fx.chat_id).await;

        let (handle, mut rx) = session.start(payload(Vec::new()), ticket);
        assert!(matches!(rx.recv().await, Some(SessionEvent::Fragment(_))));
        handle.cancel();

        let (_, terminal) = drain(rx).await;
        assert_eq!(terminal, SessionEvent::Cancelled);
        handle.join().await;
        assert_eq!(fx.log.list_turns(&fx.chat_id).expect("turns").len(), 1);
    }

    #[tokio::test]
    async fn cancel_is_seen_while_consumer_is_stalled() {
        let fx = fixture().await;
        let fragments = (0..200)
            .map(|i| StreamChunk::Fragment(format!("w{} ", i)))
            .chain(std::iter::once(StreamChunk::Done))
            .collect();
        let (events_tx, events_rx) = flume::unbounded();
        let session = Arc::new(GenerationSession::new(
            fx.log.clone(),
            Arc::new(ScriptedProvider::streaming(fragments)),
            CompletionOptions::default(),
            Duration::from_secs(5),
            EventSink::new(events_tx),
        ));
        let ticket = ticket(&fx.log, &fx.chat_id).await;

        // Never read: the session fills the channel and parks on a send.
        let (handle, _rx) = session.start(payload(Vec::new()), ticket);
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv_async())
            .await
            .expect("cancellation observed")
            .expect("event");
        assert!(matches!(event, EngineEvent::GenerationCancelled { .. }));
        assert_eq!(fx.log.list_turns(&fx.chat_id).expect("turns").len(), 1);
    }

    #[tokio::test]
    async fn truncation_cancels_session() {
        let fx = fixture().await;
        let provider = ScriptedProvider::streaming(vec![
            StreamChunk::Fragment("late".to_string()),
            StreamChunk::Done,
        ])
        .with_delay(Duration::from_millis(50));
        let session = session(&fx.log, provider, Duration::from_secs(5));
        let ticket = ticket(&fx.log, &fx.chat_id).await;

        let (_handle, rx) = session.start(payload(Vec::new()), ticket);
        fx.log
            .truncate_after(&fx.chat_id, 1, false)
            .await
            .expect("truncate");

        let (_, terminal) = drain(rx).await;
        assert_eq!(terminal, SessionEvent::Cancelled);
        assert_eq!(fx.log.list_turns(&fx.chat_id).expect("turns").len(), 1);
    }

    #[tokio::test]
    async fn upstream_error_fails_without_commit() {
        let fx = fixture().await;
        let provider = ScriptedProvider::streaming(vec![
            StreamChunk::Fragment("partial".to_string()),
            StreamChunk::Error("upstream reset".to_string()),
        ]);
        let session = session(&fx.log, provider, Duration::from_secs(5));
        let ticket = ticket(&fx.log, &fx.chat_id).await;

        let (_handle, rx) = session.start(payload(Vec::new()), ticket);
        let (fragments, terminal) = drain(rx).await;
        assert_eq!(fragments, vec!["partial"]);
        assert!(matches!(terminal, SessionEvent::Failed(msg) if msg.contains("upstream reset")));
        assert_eq!(fx.log.list_turns(&fx.chat_id).expect("turns").len(), 1);
    }

    #[tokio::test]
    async fn idle_timeout_and_empty_output_fail() {
        let fx = fixture().await;
        let slow = ScriptedProvider::streaming(vec![StreamChunk::Fragment("x".to_string())])
            .with_delay(Duration::from_millis(200));
        let session_slow = session(&fx.log, slow, Duration::from_millis(20));
        let ticket_slow = ticket(&fx.log, &fx.chat_id).await;
        let (_handle, rx) = session_slow.start(payload(Vec::new()), ticket_slow.clone());
        let (_, terminal) = drain(rx).await;
        assert!(matches!(terminal, SessionEvent::Failed(msg) if msg.contains("no output")));
        fx.log.finish_pipeline(&ticket_slow).await;

        let empty = ScriptedProvider::streaming(vec![StreamChunk::Done]);
        let session_empty = session(&fx.log, empty, Duration::from_secs(5));
        let ticket_empty = ticket(&fx.log, &fx.chat_id).await;
        let (_handle, rx) = session_empty.start(payload(Vec::new()), ticket_empty);
        let (_, terminal) = drain(rx).await;
        assert!(matches!(terminal, SessionEvent::Failed(msg) if msg.contains("no output")));
        assert_eq!(fx.log.list_turns(&fx.chat_id).expect("turns").len(), 1);
    }
}
