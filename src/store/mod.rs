//! Message Store
//!
//! Append-only, per-session message log with importance flags, plus the
//! auxiliary style and knowledge records. Two engines share the same in-memory log type:
//! [`InMemoryStore`] and the flat-file [`JsonFileStore`].

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::InMemoryStore;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::session::{KnowledgeRecord, Message, MessageId, NewMessage, Role, Session, SessionId, StyleRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Message {message_id} not found in session {session_id}")]
    MessageNotFound {
        session_id: SessionId,
        message_id: MessageId,
    },
    #[error("Invalid session ID: {0:?}")]
    InvalidSessionId(String),
    #[error("Data directory not found")]
    NoDataDir,
}

impl StoreError {
    /// True for errors that indicate a broken store invariant rather than an I/O fault.
    pub fn is_inconsistency(&self) -> bool {
        matches!(self, StoreError::SessionNotFound(_) | StoreError::MessageNotFound { .. })
    }
}

/// Ordering of a message listing (always by id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Filter/order/window for [`MessageStore::list_messages`]
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub importance: Option<bool>,
    pub role: Option<Role>,
    pub exclude_role: Option<Role>,
    pub order: Order,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn important() -> Self {
        Self {
            importance: Some(true),
            ..Self::default()
        }
    }

    pub fn ordinary() -> Self {
        Self {
            importance: Some(false),
            ..Self::default()
        }
    }

    pub fn newest_first(mut self) -> Self {
        self.order = Order::NewestFirst;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn without_role(mut self, role: Role) -> Self {
        self.exclude_role = Some(role);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, message: &Message) -> bool {
        self.importance.map_or(true, |flag| message.is_important == flag)
            && self.role.map_or(true, |role| message.role == role)
            && self.exclude_role.map_or(true, |role| message.role != role)
    }
}

/// Persistence collaborator for sessions, messages, style and knowledge records.
///
/// Every operation is scoped by session id; implementations serialize writes
/// internally so sessions may be driven from separate tasks.
pub trait MessageStore: Send + Sync {
    fn create_session(&self, title: &str) -> Result<Session, StoreError>;

    fn get_session(&self, session_id: &SessionId) -> Result<Session, StoreError>;

    /// All sessions, most recently created first
    fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    fn rename_session(&self, session_id: &SessionId, title: &str) -> Result<Session, StoreError>;

    /// Append at the tail; the assigned id is greater than every id ever issued in the session.
    fn append_message(&self, session_id: &SessionId, message: NewMessage) -> Result<Message, StoreError>;

    fn list_messages(&self, session_id: &SessionId, query: &MessageQuery) -> Result<Vec<Message>, StoreError>;

    fn count_messages(&self, session_id: &SessionId, query: &MessageQuery) -> Result<usize, StoreError> {
        Ok(self.list_messages(session_id, query)?.len())
    }

    /// Set the importance flag on the given messages. Returns how many changed.
    fn mark_important(&self, session_id: &SessionId, ids: &[MessageId]) -> Result<usize, StoreError>;

    /// Delete exactly the given messages. All-or-nothing: a missing id fails the whole call.
    fn delete_messages(&self, session_id: &SessionId, ids: &[MessageId]) -> Result<usize, StoreError>;

    /// Insert or replace the style record for `record.message_id`.
    fn upsert_style(&self, record: StyleRecord) -> Result<(), StoreError>;

    fn get_style(&self, session_id: &SessionId, message_id: MessageId) -> Result<Option<StyleRecord>, StoreError>;

    /// Replace the session's knowledge record.
    fn put_knowledge(&self, record: KnowledgeRecord) -> Result<(), StoreError>;

    fn get_knowledge(&self, session_id: &SessionId) -> Result<Option<KnowledgeRecord>, StoreError>;
}

/// In-memory state of one session, shared by both engines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionLog {
    pub session: Session,
    pub next_id: MessageId,
    /// Sorted ascending by id
    pub messages: Vec<Message>,
    pub styles: BTreeMap<MessageId, StyleRecord>,
    pub knowledge: Option<KnowledgeRecord>,
}

impl SessionLog {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            next_id: 1,
            messages: Vec::new(),
            styles: BTreeMap::new(),
            knowledge: None,
        }
    }

    pub fn append(&mut self, message: NewMessage) -> Message {
        let stored = Message {
            id: self.next_id,
            session_id: self.session.id.clone(),
            role: message.role,
            content: message.content,
            is_important: message.is_important,
            tokens: message.tokens,
            created_at: Utc::now(),
        };
        self.next_id += 1;
        self.messages.push(stored.clone());
        stored
    }

    pub fn query(&self, query: &MessageQuery) -> Vec<Message> {
        let filtered = self.messages.iter().filter(|m| query.matches(m));
        let windowed: Vec<&Message> = match query.order {
            Order::OldestFirst => filtered.skip(query.offset).take(query.limit.unwrap_or(usize::MAX)).collect(),
            Order::NewestFirst => filtered
                .rev()
                .skip(query.offset)
                .take(query.limit.unwrap_or(usize::MAX))
                .collect(),
        };
        windowed.into_iter().cloned().collect()
    }

    fn require_all(&self, ids: &[MessageId]) -> Result<(), StoreError> {
        for id in ids {
            if self.messages.binary_search_by_key(id, |m| m.id).is_err() {
                return Err(StoreError::MessageNotFound {
                    session_id: self.session.id.clone(),
                    message_id: *id,
                });
            }
        }
        Ok(())
    }

    pub fn mark_important(&mut self, ids: &[MessageId]) -> Result<usize, StoreError> {
        self.require_all(ids)?;
        let wanted: HashSet<MessageId> = ids.iter().copied().collect();
        let mut changed = 0;
        for message in self.messages.iter_mut().filter(|m| wanted.contains(&m.id)) {
            if !message.is_important {
                message.is_important = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub fn delete(&mut self, ids: &[MessageId]) -> Result<usize, StoreError> {
        self.require_all(ids)?;
        let doomed: HashSet<MessageId> = ids.iter().copied().collect();
        let before = self.messages.len();
        self.messages.retain(|m| !doomed.contains(&m.id));
        Ok(before - self.messages.len())
    }

    pub fn upsert_style(&mut self, record: StyleRecord) {
        self.styles.insert(record.message_id, record);
    }
}
