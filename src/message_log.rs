//! Ordered per-chat turn log and the per-chat mutual-exclusion scope.
//!
//! Every mutation of a chat (append, summary commit, truncate, in-place edit)
//! happens through a [`ChatGuard`], which holds that chat's async mutex. The
//! guard also tracks a truncation epoch and the ticket of the one pipeline that
//! may be running for the chat. Long external calls (retrieval, summarization,
//! generation) run without the guard and re-check the epoch when they come back
//! to commit.
//!
//! Slots are created on demand and evicted again once nothing references them
//! and no pipeline is registered. Epochs come from one log-wide clock, so a
//! re-created slot never repeats a value an earlier reader may still hold.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::database::{Chat, ChatDatabase, ChatMemory, Turn, TurnRole};
use crate::error::{EngineError, EngineResult};

/// Handle of the single pipeline allowed to run for a chat at a time.
///
/// A live ticket pins its chat's slot, so the epoch it carries stays
/// comparable until the ticket is dropped.
#[derive(Clone)]
pub struct PipelineTicket {
    pub id: u64,
    pub chat_id: String,
    /// Truncation epoch observed when the pipeline started.
    pub epoch: u64,
    pub cancel: CancellationToken,
    slot: Arc<ChatSlot>,
}

impl fmt::Debug for PipelineTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTicket")
            .field("id", &self.id)
            .field("chat_id", &self.chat_id)
            .field("epoch", &self.epoch)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl PipelineTicket {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Default)]
struct ChatScope {
    active: Option<PipelineTicket>,
}

struct ChatSlot {
    scope: Arc<AsyncMutex<ChatScope>>,
    epoch: AtomicU64,
    compressing: AtomicBool,
}

impl ChatSlot {
    fn starting_at(epoch: u64) -> Self {
        Self {
            scope: Arc::new(AsyncMutex::new(ChatScope::default())),
            epoch: AtomicU64::new(epoch),
            compressing: AtomicBool::new(false),
        }
    }
}

type SlotMap = Arc<Mutex<HashMap<String, Arc<ChatSlot>>>>;

fn lock_slots(slots: &Mutex<HashMap<String, Arc<ChatSlot>>>) -> MutexGuard<'_, HashMap<String, Arc<ChatSlot>>> {
    match slots.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drop `slot` from the map when the caller holds the last outside reference.
/// Waiters, live tickets and compression permits all count as references.
fn evict_if_idle(slots: &Mutex<HashMap<String, Arc<ChatSlot>>>, chat_id: &str, slot: &Arc<ChatSlot>) {
    let mut slots = lock_slots(slots);
    let idle = slots
        .get(chat_id)
        .map(|held| Arc::ptr_eq(held, slot) && Arc::strong_count(slot) == 2)
        .unwrap_or(false);
    if idle {
        slots.remove(chat_id);
    }
}

pub struct MessageLog {
    db: Arc<ChatDatabase>,
    slots: SlotMap,
    epoch_clock: Arc<AtomicU64>,
    next_ticket: Arc<AtomicU64>,
}

impl MessageLog {
    pub fn new(db: Arc<ChatDatabase>) -> Self {
        Self {
            db,
            slots: Arc::new(Mutex::new(HashMap::new())),
            epoch_clock: Arc::new(AtomicU64::new(0)),
            next_ticket: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn database(&self) -> &Arc<ChatDatabase> {
        &self.db
    }

    fn slot(&self, chat_id: &str) -> Arc<ChatSlot> {
        let mut slots = lock_slots(&self.slots);
        slots
            .entry(chat_id.to_string())
            .or_insert_with(|| {
                Arc::new(ChatSlot::starting_at(self.epoch_clock.load(Ordering::SeqCst)))
            })
            .clone()
    }

    pub fn require_chat(&self, chat_id: &str) -> EngineResult<Chat> {
        self.db
            .get_chat(chat_id)?
            .ok_or_else(|| EngineError::chat_not_found(chat_id))
    }

    /// Acquire the per-chat scope. Fails with `NotFound` for unknown chats.
    pub async fn lock(&self, chat_id: &str) -> EngineResult<ChatGuard> {
        self.require_chat(chat_id)?;
        let slot = self.slot(chat_id);
        let scope = slot.scope.clone().lock_owned().await;
        Ok(ChatGuard {
            db: self.db.clone(),
            chat_id: chat_id.to_string(),
            slot,
            scope,
            slots: self.slots.clone(),
            epoch_clock: self.epoch_clock.clone(),
            next_ticket: self.next_ticket.clone(),
        })
    }

    /// Current truncation epoch, readable without the scope.
    pub fn epoch(&self, chat_id: &str) -> u64 {
        match lock_slots(&self.slots).get(chat_id) {
            Some(slot) => slot.epoch.load(Ordering::SeqCst),
            // An evicted chat starts over from the clock.
            None => self.epoch_clock.load(Ordering::SeqCst),
        }
    }

    pub async fn append(&self, chat_id: &str, role: TurnRole, content: &str) -> EngineResult<Turn> {
        let mut guard = self.lock(chat_id).await?;
        guard.append(role, content)
    }

    /// Append only if no truncation happened since `expected_epoch` was observed.
    pub async fn append_at_epoch(
        &self,
        chat_id: &str,
        expected_epoch: u64,
        role: TurnRole,
        content: &str,
    ) -> EngineResult<Turn> {
        let mut guard = self.lock(chat_id).await?;
        guard.append_at_epoch(expected_epoch, role, content)
    }

    pub fn list_unsummarized(&self, chat_id: &str) -> EngineResult<Vec<Turn>> {
        self.require_chat(chat_id)?;
        Ok(self.db.list_unsummarized(chat_id)?)
    }

    pub fn list_turns(&self, chat_id: &str) -> EngineResult<Vec<Turn>> {
        self.require_chat(chat_id)?;
        Ok(self.db.list_turns(chat_id)?)
    }

    pub fn get_turn(&self, turn_id: &str) -> EngineResult<Turn> {
        self.db
            .get_turn(turn_id)?
            .ok_or_else(|| EngineError::turn_not_found(turn_id))
    }

    pub fn memory(&self, chat_id: &str) -> EngineResult<ChatMemory> {
        self.db
            .get_memory(chat_id)?
            .ok_or_else(|| EngineError::chat_not_found(chat_id))
    }

    pub async fn mark_summarized(&self, chat_id: &str, turn_ids: &[String]) -> EngineResult<()> {
        let guard = self.lock(chat_id).await?;
        guard.mark_summarized(turn_ids)
    }

    pub async fn truncate_after(
        &self,
        chat_id: &str,
        sequence: i64,
        include_target: bool,
    ) -> EngineResult<usize> {
        let mut guard = self.lock(chat_id).await?;
        guard.truncate_after(sequence, include_target)
    }

    /// Release the pipeline slot if `ticket` still owns it.
    pub async fn finish_pipeline(&self, ticket: &PipelineTicket) {
        if let Ok(mut guard) = self.lock(&ticket.chat_id).await {
            guard.finish_pipeline(ticket);
        }
    }

    /// Cancel whatever pipeline is running for the chat.
    pub async fn cancel_active(&self, chat_id: &str) -> EngineResult<bool> {
        let mut guard = self.lock(chat_id).await?;
        Ok(guard.cancel_active())
    }

    /// Claim the chat's compression slot; `None` if a compression is running.
    pub fn try_begin_compression(&self, chat_id: &str) -> Option<CompressionPermit> {
        let slot = self.slot(chat_id);
        if slot
            .compressing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        Some(CompressionPermit {
            chat_id: chat_id.to_string(),
            slot,
            slots: self.slots.clone(),
        })
    }

    /// Delete a chat after cancelling its pipeline. The slot goes with the
    /// guard unless someone is still waiting on it.
    pub async fn delete_chat(&self, chat_id: &str) -> EngineResult<bool> {
        let mut guard = self.lock(chat_id).await?;
        guard.cancel_active();
        guard.bump_epoch();
        Ok(self.db.delete_chat(chat_id)?)
    }
}

/// Releases the compression slot on drop.
pub struct CompressionPermit {
    chat_id: String,
    slot: Arc<ChatSlot>,
    slots: SlotMap,
}

impl Drop for CompressionPermit {
    fn drop(&mut self) {
        self.slot.compressing.store(false, Ordering::SeqCst);
        evict_if_idle(&self.slots, &self.chat_id, &self.slot);
    }
}

/// Exclusive access to one chat's mutable state.
pub struct ChatGuard {
    db: Arc<ChatDatabase>,
    chat_id: String,
    slot: Arc<ChatSlot>,
    scope: OwnedMutexGuard<ChatScope>,
    slots: SlotMap,
    epoch_clock: Arc<AtomicU64>,
    next_ticket: Arc<AtomicU64>,
}

impl Drop for ChatGuard {
    fn drop(&mut self) {
        if self.scope.active.is_none() {
            evict_if_idle(&self.slots, &self.chat_id, &self.slot);
        }
    }
}

impl ChatGuard {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn epoch(&self) -> u64 {
        self.slot.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&mut self) -> u64 {
        let next = self.epoch_clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.slot.epoch.store(next, Ordering::SeqCst);
        next
    }

    pub fn append(&mut self, role: TurnRole, content: &str) -> EngineResult<Turn> {
        self.db
            .append_turn(&self.chat_id, role, content)?
            .ok_or_else(|| EngineError::chat_not_found(&self.chat_id))
    }

    pub fn append_at_epoch(
        &mut self,
        expected_epoch: u64,
        role: TurnRole,
        content: &str,
    ) -> EngineResult<Turn> {
        let current = self.epoch();
        if current != expected_epoch {
            return Err(EngineError::conflict(
                &self.chat_id,
                format!(
                    "history was truncated (epoch {} -> {}) before the append could commit",
                    expected_epoch, current
                ),
            ));
        }
        self.append(role, content)
    }

    pub fn mark_summarized(&self, turn_ids: &[String]) -> EngineResult<()> {
        if self.db.mark_summarized(&self.chat_id, turn_ids)? {
            Ok(())
        } else {
            Err(EngineError::conflict(
                &self.chat_id,
                "batch is no longer fully unsummarized",
            ))
        }
    }

    /// Replace the summary and flag the absorbed batch in one transaction.
    pub fn commit_summary(&self, summary_text: &str, turn_ids: &[String]) -> EngineResult<bool> {
        Ok(self.db.commit_summary(&self.chat_id, summary_text, turn_ids)?)
    }

    /// Drop every turn after `sequence` (and the one at `sequence` when
    /// `include_target` is set). The running pipeline, whose prefix is now
    /// invalid, is cancelled first.
    pub fn truncate_after(&mut self, sequence: i64, include_target: bool) -> EngineResult<usize> {
        if self.db.get_turn_at(&self.chat_id, sequence)?.is_none() {
            return Err(EngineError::NotFound {
                kind: "turn sequence",
                id: format!("{}#{}", self.chat_id, sequence),
            });
        }
        // Summarized turns back the rolling summary and cannot be dropped.
        let floor = if include_target { sequence - 1 } else { sequence };
        if let Some(summarized) = self.db.first_summarized_after(&self.chat_id, floor)? {
            return Err(EngineError::ImmutableHistory {
                turn_id: summarized.id,
            });
        }
        if self.cancel_active() {
            tracing::debug!(
                "Cancelled in-flight pipeline of chat {} before truncation",
                self.chat_id
            );
        }
        let removed = self.db.truncate_after(&self.chat_id, sequence, include_target)?;
        let epoch = self.bump_epoch();
        tracing::debug!(
            "Truncated chat {} after sequence {} ({} turn(s) removed, epoch {})",
            self.chat_id,
            sequence,
            removed,
            epoch
        );
        Ok(removed)
    }

    pub fn replace_content(&mut self, turn_id: &str, content: &str) -> EngineResult<Turn> {
        let turn = self
            .db
            .get_turn(turn_id)?
            .filter(|turn| turn.chat_id == self.chat_id)
            .ok_or_else(|| EngineError::turn_not_found(turn_id))?;
        if turn.summarized {
            return Err(EngineError::ImmutableHistory {
                turn_id: turn_id.to_string(),
            });
        }
        if !self.db.replace_turn_content(turn_id, content)? {
            return Err(EngineError::ImmutableHistory {
                turn_id: turn_id.to_string(),
            });
        }
        Ok(Turn {
            content: content.to_string(),
            ..turn
        })
    }

    /// Remove a turn appended by an aborted pipeline.
    pub fn rollback_turn(&mut self, turn_id: &str) -> EngineResult<bool> {
        Ok(self.db.delete_unsummarized_turn(turn_id)?)
    }

    /// Register a new pipeline. Fails if another one is still running.
    pub fn begin_pipeline(&mut self) -> EngineResult<PipelineTicket> {
        if let Some(active) = &self.scope.active {
            if !active.is_cancelled() {
                return Err(EngineError::conflict(
                    &self.chat_id,
                    "another turn is still being generated",
                ));
            }
        }
        let ticket = PipelineTicket {
            id: self.next_ticket.fetch_add(1, Ordering::SeqCst),
            chat_id: self.chat_id.clone(),
            epoch: self.epoch(),
            cancel: CancellationToken::new(),
            slot: self.slot.clone(),
        };
        self.scope.active = Some(ticket.clone());
        Ok(ticket)
    }

    /// Cancel the running pipeline, if any. Returns whether one was running.
    pub fn cancel_active(&mut self) -> bool {
        match self.scope.active.take() {
            Some(active) => {
                let was_running = !active.is_cancelled();
                active.cancel.cancel();
                was_running
            }
            None => false,
        }
    }

    /// Whether `ticket` may still commit: it owns the slot, is not cancelled
    /// and no truncation happened since it started.
    pub fn is_current(&self, ticket: &PipelineTicket) -> bool {
        !ticket.is_cancelled()
            && ticket.epoch == self.epoch()
            && self
                .scope
                .active
                .as_ref()
                .map(|active| active.id == ticket.id)
                .unwrap_or(false)
    }

    pub fn finish_pipeline(&mut self, ticket: &PipelineTicket) {
        let owns = self
            .scope
            .active
            .as_ref()
            .map(|active| active.id == ticket.id)
            .unwrap_or(false);
        if owns {
            self.scope.active = None;
        }
    }
}
