//! In-memory store, used by tests and ephemeral sessions.

use parking_lot::RwLock;
use std::collections::HashMap;

use super::{MessageQuery, MessageStore, SessionLog, StoreError};
use crate::session::{KnowledgeRecord, Message, MessageId, NewMessage, Session, SessionId, StyleRecord};

#[derive(Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<SessionId, SessionLog>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&SessionLog) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let sessions = self.sessions.read();
        let log = sessions
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;
        f(log)
    }

    fn with_log_mut<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut SessionLog) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut sessions = self.sessions.write();
        let log = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;
        f(log)
    }
}

impl MessageStore for InMemoryStore {
    fn create_session(&self, title: &str) -> Result<Session, StoreError> {
        let session = Session::new(title);
        self.sessions
            .write()
            .insert(session.id.clone(), SessionLog::new(session.clone()));
        Ok(session)
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Session, StoreError> {
        self.with_log(session_id, |log| Ok(log.session.clone()))
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self.sessions.read().values().map(|l| l.session.clone()).collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    fn rename_session(&self, session_id: &SessionId, title: &str) -> Result<Session, StoreError> {
        self.with_log_mut(session_id, |log| {
            log.session.title = title.to_string();
            Ok(log.session.clone())
        })
    }

    fn append_message(&self, session_id: &SessionId, message: NewMessage) -> Result<Message, StoreError> {
        self.with_log_mut(session_id, |log| Ok(log.append(message)))
    }

    fn list_messages(&self, session_id: &SessionId, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        self.with_log(session_id, |log| Ok(log.query(query)))
    }

    fn mark_important(&self, session_id: &SessionId, ids: &[MessageId]) -> Result<usize, StoreError> {
        self.with_log_mut(session_id, |log| log.mark_important(ids))
    }

    fn delete_messages(&self, session_id: &SessionId, ids: &[MessageId]) -> Result<usize, StoreError> {
        self.with_log_mut(session_id, |log| log.delete(ids))
    }

    fn upsert_style(&self, record: StyleRecord) -> Result<(), StoreError> {
        let session_id = record.session_id.clone();
        self.with_log_mut(&session_id, |log| {
            log.upsert_style(record);
            Ok(())
        })
    }

    fn get_style(&self, session_id: &SessionId, message_id: MessageId) -> Result<Option<StyleRecord>, StoreError> {
        self.with_log(session_id, |log| Ok(log.styles.get(&message_id).cloned()))
    }

    fn put_knowledge(&self, record: KnowledgeRecord) -> Result<(), StoreError> {
        let session_id = record.session_id.clone();
        self.with_log_mut(&session_id, |log| {
            log.knowledge = Some(record);
            Ok(())
        })
    }

    fn get_knowledge(&self, session_id: &SessionId) -> Result<Option<KnowledgeRecord>, StoreError> {
        self.with_log(session_id, |log| Ok(log.knowledge.clone()))
    }
}
