use std::sync::Arc;

use serde::Serialize;

use crate::database::Turn;
use crate::error::EngineResult;
use crate::llm_client::Message;
use crate::message_log::MessageLog;
use crate::retrieval::RetrievedChunk;

pub const DEFAULT_SYSTEM_PREAMBLE: &str = "You are a helpful assistant answering questions about \
product documentation. Use the reference material when it is relevant and say so when it does \
not cover the question.";

const SUMMARY_HEADER: &str = "Summary of the earlier conversation:";
const REFERENCE_HEADER: &str = "Reference material from the knowledge base:";
const NO_REFERENCES: &str = "(no reference material was found for this turn)";

/// Everything sent to the generation service for one turn, in render order.
#[derive(Debug, Clone, Serialize)]
pub struct PromptPayload {
    pub preamble: String,
    pub summary: String,
    pub recent: Vec<Turn>,
    pub references: Vec<RetrievedChunk>,
    pub current_input: String,
}

impl PromptPayload {
    fn summary_block(&self) -> Option<String> {
        if self.summary.trim().is_empty() {
            None
        } else {
            Some(format!("{}\n{}", SUMMARY_HEADER, self.summary))
        }
    }

    fn reference_block(&self) -> String {
        if self.references.is_empty() {
            return format!("{}\n{}", REFERENCE_HEADER, NO_REFERENCES);
        }
        let mut block = String::from(REFERENCE_HEADER);
        for (idx, chunk) in self.references.iter().enumerate() {
            block.push_str(&format!("\n[{}] ({}) {}", idx + 1, chunk.source_id, chunk.text));
        }
        block
    }

    /// Chat-completion messages in the fixed order: preamble, summary, recent
    /// turns, reference material, current input.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.recent.len() + 4);
        messages.push(Message::system(self.preamble.clone()));
        if let Some(summary) = self.summary_block() {
            messages.push(Message::system(summary));
        }
        for turn in &self.recent {
            messages.push(Message::new(turn.role.as_str(), turn.content.clone()));
        }
        messages.push(Message::system(self.reference_block()));
        messages.push(Message::user(self.current_input.clone()));
        messages
    }

    /// Rendered size in characters.
    pub fn size(&self) -> usize {
        self.to_messages()
            .iter()
            .map(|message| message.content.chars().count())
            .sum()
    }
}

pub struct PromptAssembler {
    log: Arc<MessageLog>,
    preamble: String,
    budget_chars: usize,
}

impl PromptAssembler {
    pub fn new(log: Arc<MessageLog>, preamble: Option<String>, budget_chars: usize) -> Self {
        Self {
            log,
            preamble: preamble
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SYSTEM_PREAMBLE.to_string()),
            budget_chars,
        }
    }

    /// Build the payload from a fresh read of the chat's summary and
    /// unsummarized window. Turns at or after `current_turn` are left out.
    pub fn assemble(
        &self,
        chat_id: &str,
        current_turn: &Turn,
        references: Vec<RetrievedChunk>,
    ) -> EngineResult<PromptPayload> {
        let memory = self.log.memory(chat_id)?;
        let recent: Vec<Turn> = self
            .log
            .list_unsummarized(chat_id)?
            .into_iter()
            .filter(|turn| turn.id != current_turn.id && turn.sequence < current_turn.sequence)
            .collect();

        let mut payload = PromptPayload {
            preamble: self.preamble.clone(),
            summary: memory.summary_text,
            recent,
            references,
            current_input: current_turn.content.clone(),
        };
        self.fit_to_budget(&mut payload);
        Ok(payload)
    }

    /// Drop references lowest-score first, then the oldest recent turns, until
    /// the payload fits. The summary and current input are never dropped.
    fn fit_to_budget(&self, payload: &mut PromptPayload) {
        let mut size = payload.size();
        let mut dropped_references = 0;
        let mut dropped_turns = 0;

        while size > self.budget_chars {
            if let Some(lowest) = lowest_scored(&payload.references) {
                payload.references.remove(lowest);
                dropped_references += 1;
            } else if !payload.recent.is_empty() {
                payload.recent.remove(0);
                dropped_turns += 1;
            } else {
                break;
            }
            size = payload.size();
        }

        if dropped_references > 0 || dropped_turns > 0 {
            tracing::debug!(
                "Prompt trimmed to {} chars (budget {}): dropped {} reference(s), {} turn(s)",
                size,
                self.budget_chars,
                dropped_references,
                dropped_turns
            );
        }
        if size > self.budget_chars {
            tracing::warn!(
                "Prompt still exceeds budget after trimming ({} > {} chars)",
                size,
                self.budget_chars
            );
        }
    }
}

// Later index wins a tie so earlier (higher-ranked) chunks survive longer.
fn lowest_scored(references: &[RetrievedChunk]) -> Option<usize> {
    references
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| a.score.total_cmp(&b.score).then(ib.cmp(ia)))
        .map(|(idx, _)| idx)
}
