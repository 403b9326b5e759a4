//! Session Controller
//!
//! Drives one turn at a time per session:
//! persist user message, style analysis, periodic classification, assembly
//! (with compaction while the history is over budget), completion,
//! persistence of the reply and knowledge extraction from it.

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;
use crate::context::{
    AssembledContext, BudgetStatus, ClassificationReport, CompactionOutcome, Compactor, ContextAssembler,
    ImportanceClassifier, KeywordRule, KnowledgeExtractor, KnowledgeOutcome, StyleAnalyzer, StyleOutcome,
    TokenEstimator,
};
use crate::remote::{ChatModel, ChatRequest, RemoteError};
use crate::session::{Message, NewMessage, Role, Session, SessionId};
use crate::store::{MessageQuery, MessageStore, StoreError};

#[derive(Error, Debug)]
pub enum TurnError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Completion failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("Session not active: {0}")]
    SessionNotActive(SessionId),
    #[error("Message is empty")]
    EmptyInput,
}

/// Where a turn currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    AwaitingInput,
    Classifying,
    Assembling,
    Compacting,
    Completing,
    Persisting,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnPhase::AwaitingInput => "awaiting_input",
            TurnPhase::Classifying => "classifying",
            TurnPhase::Assembling => "assembling",
            TurnPhase::Compacting => "compacting",
            TurnPhase::Completing => "completing",
            TurnPhase::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

/// Everything that happened during one turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user_message: Message,
    pub assistant_message: Message,
    /// Status of the context the reply was generated from
    pub context: BudgetStatus,
    pub classification: Option<ClassificationReport>,
    pub compactions: Vec<CompactionOutcome>,
    pub style: Option<StyleOutcome>,
    pub knowledge: Option<KnowledgeOutcome>,
    /// Phases entered, in order
    pub phases: Vec<TurnPhase>,
}

impl TurnOutcome {
    pub fn reply(&self) -> &str {
        &self.assistant_message.content
    }
}

/// JSON-friendly view of an assembled context
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPreview {
    pub session_id: SessionId,
    pub status: BudgetStatus,
    pub overflow: bool,
    pub needs_compaction: bool,
    pub messages: Vec<Message>,
}

impl ContextPreview {
    pub fn new(session_id: SessionId, context: AssembledContext) -> Self {
        Self {
            session_id,
            status: context.status(),
            overflow: context.overflow(),
            needs_compaction: context.needs_compaction(),
            messages: context.messages,
        }
    }
}

#[derive(Debug, Default)]
struct TurnState {
    /// User messages stored in this session, driving the classification cadence
    user_turns: u32,
}

struct ActiveSession {
    turn: tokio::sync::Mutex<TurnState>,
}

pub struct SessionController {
    store: Arc<dyn MessageStore>,
    model: Arc<dyn ChatModel>,
    estimator: Arc<dyn TokenEstimator>,
    config: MemoryConfig,
    assembler: ContextAssembler,
    classifier: ImportanceClassifier,
    /// User-only pin requests, checked at append time
    manual_marks: KeywordRule,
    compactor: Compactor,
    style: Option<StyleAnalyzer>,
    knowledge: Option<KnowledgeExtractor>,
    active: Mutex<HashMap<SessionId, Arc<ActiveSession>>>,
}

impl SessionController {
    pub fn new(
        config: MemoryConfig,
        store: Arc<dyn MessageStore>,
        model: Arc<dyn ChatModel>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        let assembler = ContextAssembler::new(store.clone(), estimator.clone(), config.retrieval_cap);
        let classifier = ImportanceClassifier::new(
            store.clone(),
            model.clone(),
            KeywordRule::new(&config.sensitive_keywords),
            config.judge_temperature,
        );
        let compactor = Compactor::new(
            store.clone(),
            model.clone(),
            estimator.clone(),
            config.retention_window,
            config.compaction_batch,
            config.summary_temperature,
        );
        let style = config
            .style_analysis
            .then(|| StyleAnalyzer::new(store.clone(), model.clone(), config.style_temperature));
        let knowledge = config
            .knowledge_extraction
            .then(|| KnowledgeExtractor::new(store.clone(), model.clone(), config.knowledge_temperature));
        let manual_marks = KeywordRule::new(&config.manual_mark_keywords);

        Self {
            store,
            model,
            estimator,
            config,
            assembler,
            classifier,
            manual_marks,
            compactor,
            style,
            knowledge,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn start_session(&self, title: &str) -> Result<SessionId, TurnError> {
        let session = self.store.create_session(title)?;
        self.activate(&session.id, 0);
        info!(session = %session.id, title = %session.title, "Started session");
        Ok(session.id)
    }

    /// Reactivate a stored session; the classification cadence continues
    /// from the number of user messages still stored.
    pub fn resume_session(&self, session_id: &SessionId) -> Result<Session, TurnError> {
        let session = self.store.get_session(session_id)?;
        let user_turns = self
            .store
            .count_messages(session_id, &MessageQuery::all().with_role(Role::User))?;
        self.activate(session_id, user_turns as u32);
        info!(session = %session_id, user_turns, "Resumed session");
        Ok(session)
    }

    pub fn end_session(&self, session_id: &SessionId) -> Result<(), TurnError> {
        match self.active.lock().remove(session_id) {
            Some(_) => {
                info!(session = %session_id, "Ended session");
                Ok(())
            }
            None => Err(TurnError::SessionNotActive(session_id.clone())),
        }
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.active.lock().contains_key(session_id)
    }

    fn activate(&self, session_id: &SessionId, user_turns: u32) {
        let state = Arc::new(ActiveSession {
            turn: tokio::sync::Mutex::new(TurnState { user_turns }),
        });
        self.active.lock().insert(session_id.clone(), state);
    }

    fn session_state(&self, session_id: &SessionId) -> Result<Arc<ActiveSession>, TurnError> {
        self.active
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| TurnError::SessionNotActive(session_id.clone()))
    }

    pub async fn submit_turn(&self, session_id: &SessionId, text: &str) -> Result<TurnOutcome, TurnError> {
        self.run_turn(session_id, text, None::<fn(&str)>).await
    }

    /// Like [`submit_turn`](Self::submit_turn) but streams the reply through
    /// `on_delta`. Nothing is persisted for the reply unless the stream
    /// completes.
    pub async fn submit_turn_streaming<F>(
        &self,
        session_id: &SessionId,
        text: &str,
        on_delta: F,
    ) -> Result<TurnOutcome, TurnError>
    where
        F: FnMut(&str) + Send,
    {
        self.run_turn(session_id, text, Some(on_delta)).await
    }

    /// Assemble without side effects
    pub fn preview_context(&self, session_id: &SessionId, budget: Option<u32>) -> Result<AssembledContext, StoreError> {
        self.assembler
            .assemble(session_id, budget.unwrap_or(self.config.budget))
    }

    /// What the next compaction would summarize
    pub fn compaction_candidates(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.compactor.candidates(session_id)
    }

    /// Run one compaction round outside the turn flow
    pub async fn compact_now(&self, session_id: &SessionId) -> Result<CompactionOutcome, TurnError> {
        let state = self.session_state(session_id)?;
        let _turn = state.turn.lock().await;
        Ok(self.compactor.compact(session_id).await?)
    }

    async fn run_turn<F>(&self, session_id: &SessionId, text: &str, on_delta: Option<F>) -> Result<TurnOutcome, TurnError>
    where
        F: FnMut(&str) + Send,
    {
        let text = text.trim();
        if text.is_empty() {
            return Err(TurnError::EmptyInput);
        }
        let state = self.session_state(session_id)?;
        let mut turn = state.turn.lock().await;

        let flagged = self.classifier.keyword_match(text).is_some() || self.manual_marks.matches(text).is_some();
        let user_message = self.store.append_message(
            session_id,
            NewMessage::new(Role::User, text, self.estimator.estimate(text)).important(flagged),
        )?;
        turn.user_turns += 1;
        debug!(session = %session_id, message_id = user_message.id, flagged, "Stored user message");

        let mut phases = Vec::new();
        let due = turn.user_turns % self.config.classify_every == 0;
        enter(&mut phases, session_id, TurnPhase::Classifying);
        debug!(session = %session_id, due, "Classification due");
        let style = match &self.style {
            Some(analyzer) => Some(analyzer.analyze(&user_message).await?),
            None => None,
        };

        let classification = if due {
            Some(
                self.classifier
                    .classify(session_id, self.config.classify_window)
                    .await?,
            )
        } else {
            None
        };

        enter(&mut phases, session_id, TurnPhase::Assembling);
        let mut context = self.assembler.assemble(session_id, self.config.budget)?;
        let mut compactions = Vec::new();
        while context.needs_compaction() && (compactions.len() as u32) < self.config.max_compaction_rounds {
            enter(&mut phases, session_id, TurnPhase::Compacting);
            debug!(session = %session_id, candidate_tokens = context.candidate_tokens, "Over budget");
            let outcome = self.compactor.compact(session_id).await?;
            let compacted = outcome.is_compacted();
            compactions.push(outcome);
            if !compacted {
                break;
            }
            context = self.assembler.assemble(session_id, self.config.budget)?;
        }

        enter(&mut phases, session_id, TurnPhase::Completing);
        let request = ChatRequest::new(context.chat_messages(), self.config.chat_temperature);
        let reply = match on_delta {
            Some(on_delta) => self.stream_reply(&request, on_delta).await,
            None => self.model.complete(&request).await,
        }
        .map_err(|e| {
            error!(session = %session_id, error = %e, "Completion failed, turn aborted");
            e
        })?;

        enter(&mut phases, session_id, TurnPhase::Persisting);
        let tokens = self.estimator.estimate(&reply);
        let assistant_message = self
            .store
            .append_message(session_id, NewMessage::new(Role::Assistant, reply, tokens))?;

        // The reply is already stored, so a store failure here only costs the extraction
        let knowledge = match &self.knowledge {
            Some(extractor) => match extractor.extract(&assistant_message).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(session = %session_id, error = %e, "Failed to store knowledge");
                    None
                }
            },
            None => None,
        };

        info!(
            session = %session_id,
            user_message = user_message.id,
            assistant_message = assistant_message.id,
            context_tokens = context.total_tokens,
            compactions = compactions.len(),
            "Turn complete"
        );
        enter(&mut phases, session_id, TurnPhase::AwaitingInput);

        Ok(TurnOutcome {
            user_message,
            assistant_message,
            context: context.status(),
            classification,
            compactions,
            style,
            knowledge,
            phases,
        })
    }

    async fn stream_reply<F>(&self, request: &ChatRequest, mut on_delta: F) -> Result<String, RemoteError>
    where
        F: FnMut(&str) + Send,
    {
        let mut stream = self.model.stream(request).await?;
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            on_delta(&chunk);
            reply.push_str(&chunk);
        }
        Ok(reply)
    }
}

fn enter(phases: &mut Vec<TurnPhase>, session_id: &SessionId, phase: TurnPhase) {
    debug!(session = %session_id, phase = %phase, "Turn phase");
    phases.push(phase);
}
