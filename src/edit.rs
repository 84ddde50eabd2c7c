use std::sync::Arc;
use std::time::Duration;

use crate::database::{Turn, TurnRole};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventSink};
use crate::message_log::{MessageLog, PipelineTicket};

/// Result of the locked part of an edit: the rewritten turn and the ticket the
/// replay pipeline runs under.
#[derive(Debug)]
pub struct PreparedEdit {
    pub turn: Turn,
    pub removed: usize,
    pub ticket: PipelineTicket,
}

/// Rewrites a past user turn and discards everything after it.
///
/// Cancel, truncate and replace happen under a single acquisition of the chat
/// scope. The replay itself is run by the caller with the returned ticket.
pub struct EditRegenerateController {
    log: Arc<MessageLog>,
    retry_delay: Duration,
    events: EventSink,
}

impl EditRegenerateController {
    pub fn new(log: Arc<MessageLog>, retry_delay: Duration, events: EventSink) -> Self {
        Self {
            log,
            retry_delay,
            events,
        }
    }

    /// Validate and apply the edit, retrying once if the chat changed between
    /// the unlocked read and the lock.
    pub async fn prepare(
        &self,
        chat_id: &str,
        target_turn_id: &str,
        new_content: &str,
    ) -> EngineResult<PreparedEdit> {
        if new_content.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "edited content must not be empty".to_string(),
            ));
        }
        match self.try_prepare(chat_id, target_turn_id, new_content).await {
            Err(EngineError::ConcurrentModification { reason, .. }) => {
                tracing::debug!(
                    "Edit of turn {} in chat {} raced another change ({}); retrying",
                    target_turn_id,
                    chat_id,
                    reason
                );
                tokio::time::sleep(self.retry_delay).await;
                self.try_prepare(chat_id, target_turn_id, new_content).await
            }
            other => other,
        }
    }

    async fn try_prepare(
        &self,
        chat_id: &str,
        target_turn_id: &str,
        new_content: &str,
    ) -> EngineResult<PreparedEdit> {
        let observed = self.validate(chat_id, target_turn_id)?;
        let epoch = self.log.epoch(chat_id);

        let mut guard = self.log.lock(chat_id).await?;
        if guard.epoch() != epoch {
            return Err(EngineError::conflict(
                chat_id,
                "history was truncated while the edit was being validated",
            ));
        }
        // A compression may have folded the target in since the first read.
        let target = self.validate(chat_id, target_turn_id)?;
        if target.sequence != observed.sequence {
            return Err(EngineError::conflict(chat_id, "target turn moved"));
        }

        guard.cancel_active();
        let removed = guard.truncate_after(target.sequence, false)?;
        let turn = guard.replace_content(&target.id, new_content)?;
        let ticket = guard.begin_pipeline()?;
        drop(guard);

        tracing::info!(
            "Edited turn {} (sequence {}) in chat {}; {} later turn(s) discarded",
            turn.id,
            turn.sequence,
            chat_id,
            removed
        );
        self.events.emit(EngineEvent::HistoryTruncated {
            chat_id: chat_id.to_string(),
            after_sequence: turn.sequence,
            removed,
        });
        Ok(PreparedEdit {
            turn,
            removed,
            ticket,
        })
    }

    fn validate(&self, chat_id: &str, target_turn_id: &str) -> EngineResult<Turn> {
        self.log.require_chat(chat_id)?;
        let target = self.log.get_turn(target_turn_id)?;
        if target.chat_id != chat_id {
            return Err(EngineError::turn_not_found(target_turn_id));
        }
        if target.role != TurnRole::User {
            return Err(EngineError::InvalidInput(format!(
                "turn '{}' is a {} turn; only user turns can be edited",
                target_turn_id,
                target.role.as_str()
            )));
        }
        if target.summarized {
            return Err(EngineError::ImmutableHistory {
                turn_id: target_turn_id.to_string(),
            });
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ChatDatabase;

    async fn ten_turn_chat() -> (Arc<MessageLog>, String, Vec<Turn>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = ChatDatabase::new(dir.path().join("edit.db")).expect("db init");
        let log = Arc::new(MessageLog::new(Arc::new(db)));
        let chat = log.database().create_chat(None).expect("chat");
        let mut turns = Vec::new();
        for seq in 1..=10 {
            // Even sequences are user turns so sequence 4 is editable.
            let role = if seq % 2 == 0 { TurnRole::User } else { TurnRole::Assistant };
            turns.push(
                log.append(&chat.id, role, &format!("turn {}", seq))
                    .await
                    .expect("append"),
            );
        }
        (log, chat.id, turns, dir)
    }

    fn controller(log: &Arc<MessageLog>) -> EditRegenerateController {
        EditRegenerateController::new(log.clone(), Duration::from_millis(1), EventSink::disabled())
    }

    #[tokio::test]
    async fn edit_truncates_later_turns_and_keeps_sequence() {
        let (log, chat_id, turns, _dir) = ten_turn_chat().await;
        let prepared = controller(&log)
            .prepare(&chat_id, &turns[3].id, "turn 4, reworded")
            .await
            .expect("edit");

        assert_eq!(prepared.removed, 6);
        assert_eq!(prepared.turn.sequence, 4);
        assert_eq!(prepared.turn.content, "turn 4, reworded");

        let remaining = log.list_turns(&chat_id).expect("turns");
        assert_eq!(remaining.len(), 4);
        for (before, after) in turns.iter().zip(&remaining).take(3) {
            assert_eq!(before, after);
        }
        assert_eq!(remaining[3].content, "turn 4, reworded");
        assert_eq!(remaining[3].id, turns[3].id);
    }

    #[tokio::test]
    async fn summarized_target_is_immutable_and_log_untouched() {
        let (log, chat_id, turns, _dir) = ten_turn_chat().await;
        let batch: Vec<String> = turns.iter().take(5).map(|t| t.id.clone()).collect();
        log.lock(&chat_id)
            .await
            .expect("lock")
            .commit_summary("early turns", &batch)
            .expect("commit");
        let before = log.list_turns(&chat_id).expect("turns");

        let err = controller(&log)
            .prepare(&chat_id, &turns[3].id, "rewrite history")
            .await
            .expect_err("immutable");
        assert!(matches!(err, EngineError::ImmutableHistory { .. }));
        assert_eq!(log.list_turns(&chat_id).expect("turns"), before);
    }

    #[tokio::test]
    async fn assistant_turns_and_foreign_turns_are_rejected() {
        let (log, chat_id, turns, _dir) = ten_turn_chat().await;
        let err = controller(&log)
            .prepare(&chat_id, &turns[2].id, "nope")
            .await
            .expect_err("assistant turn");
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let other = log.database().create_chat(None).expect("chat");
        let err = controller(&log)
            .prepare(&other.id, &turns[3].id, "nope")
            .await
            .expect_err("wrong chat");
        assert!(matches!(err, EngineError::NotFound { kind: "turn", .. }));

        let err = controller(&log)
            .prepare(&chat_id, &turns[3].id, "   ")
            .await
            .expect_err("empty");
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(log.list_turns(&chat_id).expect("turns").len(), 10);
    }

    #[tokio::test]
    async fn edit_retries_once_after_concurrent_truncation() {
        let (log, chat_id, turns, _dir) = ten_turn_chat().await;
        let controller = Arc::new(EditRegenerateController::new(
            log.clone(),
            Duration::from_millis(100),
            EventSink::disabled(),
        ));

        // Hold the scope so the edit validates, snapshots the epoch and then
        // queues on the lock.
        let mut guard = log.lock(&chat_id).await.expect("lock");
        let target = turns[3].id.clone();
        let pending = {
            let controller = controller.clone();
            let chat_id = chat_id.clone();
            tokio::spawn(async move { controller.prepare(&chat_id, &target, "turn 4, again").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        assert_eq!(guard.truncate_after(8, false).expect("truncate"), 2);
        drop(guard);

        let prepared = pending.await.expect("join").expect("edit after retry");
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(prepared.removed, 4);
        assert_eq!(prepared.turn.sequence, 4);
        let remaining = log.list_turns(&chat_id).expect("turns");
        assert_eq!(remaining.len(), 4);
        assert_eq!(remaining[3].content, "turn 4, again");
    }

    #[tokio::test]
    async fn edit_cancels_in_flight_pipeline() {
        let (log, chat_id, turns, _dir) = ten_turn_chat().await;
        let running = log
            .lock(&chat_id)
            .await
            .expect("lock")
            .begin_pipeline()
            .expect("ticket");

        let prepared = controller(&log)
            .prepare(&chat_id, &turns[9].id, "last turn again")
            .await
            .expect("edit");
        assert!(running.is_cancelled());
        assert_eq!(prepared.removed, 0);
        assert!(!prepared.ticket.is_cancelled());
        assert!(log.lock(&chat_id).await.expect("lock").is_current(&prepared.ticket));
    }
}
