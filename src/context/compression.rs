//! Compaction
//!
//! Replaces the oldest ordinary messages outside the retention window with a
//! single generated summary. The protected tail (the K most recent ordinary
//! messages) and every important message are never touched.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::tokens::TokenEstimator;
use crate::remote::{ChatModel, ChatRequest};
use crate::session::{Message, MessageId, NewMessage, Role, SessionId};
use crate::store::{MessageQuery, MessageStore, StoreError};

/// Instruction sent with the transcript to be summarized
pub const SUMMARY_PROMPT: &str = "Describe in one sentence the general background of the following \
conversation. Leave out anything already marked as important.";

/// Prefix of every summary message
pub const SUMMARY_PREFIX: &str = "Background summary: ";

/// Result of one compaction attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompactionOutcome {
    /// Nothing outside the retention window; no remote call made
    Skipped,
    #[serde(rename_all = "camelCase")]
    Compacted {
        summary_id: MessageId,
        removed: Vec<MessageId>,
        /// Candidate cost minus summary cost
        freed_tokens: u32,
    },
    /// Summarization failed; the store is unchanged
    Failed { reason: String },
}

impl CompactionOutcome {
    pub fn is_compacted(&self) -> bool {
        matches!(self, CompactionOutcome::Compacted { .. })
    }
}

pub struct Compactor {
    store: Arc<dyn MessageStore>,
    model: Arc<dyn ChatModel>,
    estimator: Arc<dyn TokenEstimator>,
    retention_window: usize,
    batch: usize,
    temperature: f32,
}

impl Compactor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        model: Arc<dyn ChatModel>,
        estimator: Arc<dyn TokenEstimator>,
        retention_window: usize,
        batch: usize,
        temperature: f32,
    ) -> Self {
        Self {
            store,
            model,
            estimator,
            retention_window,
            batch,
            temperature,
        }
    }

    /// Messages the next compaction would summarize, oldest first.
    ///
    /// Summaries are not candidates, and they do not count toward the
    /// protected tail.
    pub fn candidates(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        let mut batch = self.store.list_messages(
            session_id,
            &MessageQuery::ordinary()
                .without_role(Role::System)
                .newest_first()
                .offset(self.retention_window)
                .limit(self.batch),
        )?;
        batch.reverse();
        Ok(batch)
    }

    pub async fn compact(&self, session_id: &SessionId) -> Result<CompactionOutcome, StoreError> {
        let candidates = self.candidates(session_id)?;
        if candidates.is_empty() {
            info!(session = %session_id, "Nothing to compact");
            return Ok(CompactionOutcome::Skipped);
        }

        let request = ChatRequest::instruction(SUMMARY_PROMPT, transcript(&candidates), self.temperature);
        let sentence = match self.model.complete(&request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!(session = %session_id, "Summarizer returned nothing, skipping compaction");
                return Ok(CompactionOutcome::Failed {
                    reason: "empty summary".to_string(),
                });
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "Summarization failed, skipping compaction");
                return Ok(CompactionOutcome::Failed { reason: e.to_string() });
            }
        };

        let content = format!("{}{}", SUMMARY_PREFIX, sentence);
        let summary_tokens = self.estimator.estimate(&content);
        let summary = self
            .store
            .append_message(session_id, NewMessage::new(Role::System, content, summary_tokens))?;

        let removed: Vec<MessageId> = candidates.iter().map(|m| m.id).collect();
        if let Err(e) = self.store.delete_messages(session_id, &removed) {
            error!(session = %session_id, error = %e, "Failed to delete compacted messages, removing summary");
            if let Err(rollback) = self.store.delete_messages(session_id, &[summary.id]) {
                error!(session = %session_id, error = %rollback, "Failed to remove summary");
            }
            return Err(e);
        }

        let candidate_tokens: u32 = candidates.iter().map(|m| self.estimator.estimate(&m.content)).sum();
        let freed_tokens = candidate_tokens.saturating_sub(summary_tokens);
        info!(
            session = %session_id,
            removed = removed.len(),
            summary_id = summary.id,
            freed_tokens,
            "Compacted history"
        );
        Ok(CompactionOutcome::Compacted {
            summary_id: summary.id,
            removed,
            freed_tokens,
        })
    }
}

/// One `role: content` line per message
fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
