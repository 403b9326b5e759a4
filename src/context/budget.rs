//! Token Budget and Context Assembly
//!
//! Selects which stored messages go to the model: every important message,
//! then the newest ordinary messages that still fit.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::tokens::TokenEstimator;
use crate::remote::ChatMessage;
use crate::session::{Message, SessionId};
use crate::store::{MessageQuery, MessageStore, StoreError};

/// Usage percentage at which the budget is reported as near its limit
pub const THRESHOLD_NEAR_LIMIT: u8 = 85;

/// Budget threshold status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatus {
    /// Under 85%
    Normal,
    /// 85-100%
    NearLimit,
    /// Pinned messages alone exceed the budget
    OverBudget,
}

/// Budget status for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub budget: u32,
    pub used: u32,
    pub important_used: u32,
    pub candidate_tokens: u32,
    pub usage_percentage: u8,
    pub threshold_status: ThresholdStatus,
    pub messages: usize,
    pub dropped: usize,
}

/// Result of one assembly pass
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    /// Important block then selected ordinary block, each ascending by id
    pub messages: Vec<Message>,
    pub total_tokens: u32,
    pub important_tokens: u32,
    /// Important plus every fetched ordinary candidate, before greedy selection
    pub candidate_tokens: u32,
    pub budget: u32,
    /// Ordinary candidates left out
    pub dropped: usize,
}

impl AssembledContext {
    /// Pinned content alone is larger than the budget
    pub fn overflow(&self) -> bool {
        self.important_tokens > self.budget
    }

    /// Full history is over budget; compaction should run
    pub fn needs_compaction(&self) -> bool {
        self.candidate_tokens > self.budget
    }

    pub fn usage_percentage(&self) -> u8 {
        if self.budget == 0 {
            return 0;
        }
        ((self.total_tokens as u64 * 100) / self.budget as u64).min(100) as u8
    }

    pub fn threshold_status(&self) -> ThresholdStatus {
        if self.overflow() {
            ThresholdStatus::OverBudget
        } else if self.usage_percentage() >= THRESHOLD_NEAR_LIMIT {
            ThresholdStatus::NearLimit
        } else {
            ThresholdStatus::Normal
        }
    }

    pub fn status(&self) -> BudgetStatus {
        BudgetStatus {
            budget: self.budget,
            used: self.total_tokens,
            important_used: self.important_tokens,
            candidate_tokens: self.candidate_tokens,
            usage_percentage: self.usage_percentage(),
            threshold_status: self.threshold_status(),
            messages: self.messages.len(),
            dropped: self.dropped,
        }
    }

    /// Request messages in assembly order
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(ChatMessage::from).collect()
    }
}

/// Builds the per-turn context under a token budget
pub struct ContextAssembler {
    store: Arc<dyn MessageStore>,
    estimator: Arc<dyn TokenEstimator>,
    retrieval_cap: usize,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn MessageStore>, estimator: Arc<dyn TokenEstimator>, retrieval_cap: usize) -> Self {
        Self {
            store,
            estimator,
            retrieval_cap,
        }
    }

    /// Assemble the context for `session_id`.
    ///
    /// Output cost is at most `budget` unless the important messages alone
    /// reach it, in which case only they are returned.
    pub fn assemble(&self, session_id: &SessionId, budget: u32) -> Result<AssembledContext, StoreError> {
        let important = self.store.list_messages(session_id, &MessageQuery::important())?;
        let important_tokens = important
            .iter()
            .fold(0u32, |acc, m| acc.saturating_add(self.estimator.estimate(&m.content)));

        let ordinary = self.store.list_messages(
            session_id,
            &MessageQuery::ordinary().newest_first().limit(self.retrieval_cap),
        )?;
        let costs: Vec<u32> = ordinary.iter().map(|m| self.estimator.estimate(&m.content)).collect();
        let candidate_tokens = costs.iter().fold(important_tokens, |acc, c| acc.saturating_add(*c));

        let mut used = important_tokens;
        let mut selected = Vec::new();
        if used < budget {
            for (message, cost) in ordinary.iter().zip(&costs) {
                if used.saturating_add(*cost) > budget {
                    break;
                }
                used += cost;
                selected.push(message.clone());
            }
        }
        selected.reverse();

        let dropped = ordinary.len() - selected.len();
        let mut messages = important;
        messages.extend(selected);

        let context = AssembledContext {
            messages,
            total_tokens: used,
            important_tokens,
            candidate_tokens,
            budget,
            dropped,
        };

        if context.overflow() {
            info!(
                session = %session_id,
                important_tokens,
                budget,
                "Pinned messages exceed budget, sending them all"
            );
        }
        debug!(
            session = %session_id,
            messages = context.messages.len(),
            total_tokens = context.total_tokens,
            candidate_tokens,
            dropped,
            "Assembled context"
        );
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokens::WhitespaceEstimator;
    use crate::session::{NewMessage, Role};
    use crate::store::InMemoryStore;

    fn words(n: usize) -> String {
        vec!["w"; n].join(" ")
    }

    fn setup() -> (Arc<InMemoryStore>, SessionId, ContextAssembler) {
        let store = Arc::new(InMemoryStore::new());
        let session = store.create_session("budget").unwrap();
        let assembler = ContextAssembler::new(store.clone(), Arc::new(WhitespaceEstimator), 100);
        (store, session.id, assembler)
    }

    fn append(store: &InMemoryStore, session: &SessionId, n_words: usize, important: bool) -> Message {
        store
            .append_message(
                session,
                NewMessage::new(Role::User, words(n_words), n_words as u32).important(important),
            )
            .unwrap()
    }

    #[test]
    fn test_important_plus_newest_five_fit_exactly() {
        let (store, session, assembler) = setup();
        let pinned = append(&store, &session, 10, true);
        let ordinary: Vec<Message> = (0..10).map(|_| append(&store, &session, 8, false)).collect();

        let context = assembler.assemble(&session, 50).unwrap();

        let ids: Vec<_> = context.messages.iter().map(|m| m.id).collect();
        let mut expected = vec![pinned.id];
        expected.extend(ordinary[5..].iter().map(|m| m.id));
        assert_eq!(ids, expected);
        assert_eq!(context.total_tokens, 50);
        assert_eq!(context.dropped, 5);
        assert!(!context.overflow());
        assert!(context.needs_compaction());
    }

    #[test]
    fn test_important_block_precedes_ordinary_even_if_newer() {
        let (store, session, assembler) = setup();
        let old = append(&store, &session, 1, false);
        let pinned = append(&store, &session, 1, true);

        let context = assembler.assemble(&session, 10).unwrap();
        let ids: Vec<_> = context.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![pinned.id, old.id]);
    }

    #[test]
    fn test_pinned_overflow_returns_only_pinned() {
        let (store, session, assembler) = setup();
        append(&store, &session, 1, false);
        append(&store, &session, 30, true);
        append(&store, &session, 30, true);

        let context = assembler.assemble(&session, 40).unwrap();
        assert_eq!(context.messages.len(), 2);
        assert!(context.messages.iter().all(|m| m.is_important));
        assert_eq!(context.total_tokens, 60);
        assert!(context.overflow());
        assert_eq!(context.threshold_status(), ThresholdStatus::OverBudget);
    }

    #[test]
    fn test_pinned_exactly_at_budget_excludes_ordinary() {
        let (store, session, assembler) = setup();
        append(&store, &session, 5, true);
        append(&store, &session, 0, false);

        let context = assembler.assemble(&session, 5).unwrap();
        assert_eq!(context.messages.len(), 1);
        assert!(!context.overflow());
    }

    #[test]
    fn test_greedy_stops_at_first_misfit() {
        let (store, session, assembler) = setup();
        let cheap_old = append(&store, &session, 1, false);
        append(&store, &session, 20, false);
        let newest = append(&store, &session, 5, false);

        let context = assembler.assemble(&session, 10).unwrap();
        let ids: Vec<_> = context.messages.iter().map(|m| m.id).collect();
        // The cheap older message would fit, but selection stops at the 20-word one
        assert_eq!(ids, vec![newest.id]);
        assert!(!ids.contains(&cheap_old.id));
    }

    #[test]
    fn test_retrieval_cap_limits_candidates() {
        let store = Arc::new(InMemoryStore::new());
        let session = store.create_session("cap").unwrap().id;
        for _ in 0..5 {
            append(&store, &session, 1, false);
        }
        let assembler = ContextAssembler::new(store.clone(), Arc::new(WhitespaceEstimator), 3);

        let context = assembler.assemble(&session, 100).unwrap();
        assert_eq!(context.messages.len(), 3);
        assert_eq!(context.candidate_tokens, 3);
        assert_eq!(context.messages.last().unwrap().id, 5);
    }

    #[test]
    fn test_assembly_is_idempotent() {
        let (store, session, assembler) = setup();
        for i in 0..12 {
            append(&store, &session, 3 + i % 4, i % 5 == 0);
        }
        let first = assembler.assemble(&session, 25).unwrap();
        let second = assembler.assemble(&session, 25).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_budget_bound_and_greedy_property_across_budgets() {
        let (store, session, assembler) = setup();
        let sizes = [3usize, 9, 1, 4, 7, 2, 6, 5, 8, 2, 3, 1];
        for (i, n) in sizes.iter().enumerate() {
            append(&store, &session, *n, i == 4);
        }

        for budget in 0..70u32 {
            let context = assembler.assemble(&session, budget).unwrap();
            assert!(context.total_tokens <= budget || context.important_tokens >= budget);

            // Selected ordinary messages form a contiguous newest suffix
            let ordinary_ids: Vec<_> = context.messages.iter().filter(|m| !m.is_important).map(|m| m.id).collect();
            let all_ordinary = store.list_messages(&session, &MessageQuery::ordinary()).unwrap();
            let suffix: Vec<_> = all_ordinary[all_ordinary.len() - ordinary_ids.len()..]
                .iter()
                .map(|m| m.id)
                .collect();
            assert_eq!(ordinary_ids, suffix);
        }
    }

    #[test]
    fn test_empty_session() {
        let (_store, session, assembler) = setup();
        let context = assembler.assemble(&session, 100).unwrap();
        assert!(context.messages.is_empty());
        assert_eq!(context.status().threshold_status, ThresholdStatus::Normal);
    }

    #[test]
    fn test_unknown_session_propagates() {
        let (_store, _session, assembler) = setup();
        assert!(assembler.assemble(&SessionId::generate(), 10).is_err());
    }
}
