//! Flat-file store
//!
//! One directory per session under `<root>/sessions/sess_<id>/`:
//! `session.json`, `messages.json`, `styles.json` and `knowledge.json`.
//! Every write is atomic.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{MessageQuery, MessageStore, SessionLog, StoreError};
use crate::session::{KnowledgeRecord, Message, MessageId, NewMessage, Session, SessionId, StyleRecord};

const SESSION_FILE: &str = "session.json";
const MESSAGES_FILE: &str = "messages.json";
const STYLES_FILE: &str = "styles.json";
const KNOWLEDGE_FILE: &str = "knowledge.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesFile {
    next_id: MessageId,
    messages: Vec<Message>,
}

/// Which files of a session need rewriting after a mutation
#[derive(Debug, Clone, Copy)]
enum Part {
    Session,
    Messages,
    Styles,
    Knowledge,
}

pub struct JsonFileStore {
    root: PathBuf,
    /// Sessions loaded so far. The lock also serializes writes.
    cache: Mutex<HashMap<SessionId, SessionLog>>,
}

/// Atomic write: write to a .tmp sibling then rename into place.
/// Prevents corruption if the process crashes mid-write.
fn atomic_write(path: &Path, contents: &str) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("sessions"))?;
        Ok(Self {
            root,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir().join(session_id.dir_name())
    }

    fn read_log(&self, session_id: &SessionId) -> Result<SessionLog, StoreError> {
        let dir = self.session_dir(session_id);
        let session_path = dir.join(SESSION_FILE);
        if !session_path.exists() {
            return Err(StoreError::SessionNotFound(session_id.clone()));
        }

        let session: Session = serde_json::from_str(&fs::read_to_string(&session_path)?)?;
        let mut log = SessionLog::new(session);

        let messages_path = dir.join(MESSAGES_FILE);
        if messages_path.exists() {
            let file: MessagesFile = serde_json::from_str(&fs::read_to_string(&messages_path)?)?;
            log.next_id = file.next_id;
            log.messages = file.messages;
            log.messages.sort_by_key(|m| m.id);
        }

        let styles_path = dir.join(STYLES_FILE);
        if styles_path.exists() {
            let styles: Vec<StyleRecord> = serde_json::from_str(&fs::read_to_string(&styles_path)?)?;
            log.styles = styles.into_iter().map(|s| (s.message_id, s)).collect();
        }

        let knowledge_path = dir.join(KNOWLEDGE_FILE);
        if knowledge_path.exists() {
            log.knowledge = Some(serde_json::from_str(&fs::read_to_string(&knowledge_path)?)?);
        }

        debug!(session = %session_id, messages = log.messages.len(), "Loaded session from disk");
        Ok(log)
    }

    fn write_part(&self, log: &SessionLog, part: Part) -> Result<(), StoreError> {
        let dir = self.session_dir(&log.session.id);
        match part {
            Part::Session => {
                fs::create_dir_all(&dir)?;
                atomic_write(&dir.join(SESSION_FILE), &serde_json::to_string_pretty(&log.session)?)
            }
            Part::Messages => {
                let file = MessagesFile {
                    next_id: log.next_id,
                    messages: log.messages.clone(),
                };
                atomic_write(&dir.join(MESSAGES_FILE), &serde_json::to_string_pretty(&file)?)
            }
            Part::Styles => {
                let styles: Vec<&StyleRecord> = log.styles.values().collect();
                atomic_write(&dir.join(STYLES_FILE), &serde_json::to_string_pretty(&styles)?)
            }
            Part::Knowledge => match &log.knowledge {
                Some(record) => atomic_write(&dir.join(KNOWLEDGE_FILE), &serde_json::to_string_pretty(record)?),
                None => Ok(()),
            },
        }
    }

    /// Run `f` against the session log and persist `part` on success.
    ///
    /// The mutation is applied to a copy first so a failed write leaves the
    /// cache matching the disk.
    fn mutate<T>(
        &self,
        session_id: &SessionId,
        part: Part,
        f: impl FnOnce(&mut SessionLog) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut cache = self.cache.lock();
        if !cache.contains_key(session_id) {
            let log = self.read_log(session_id)?;
            cache.insert(session_id.clone(), log);
        }
        let current = cache
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;

        let mut updated = current.clone();
        let value = f(&mut updated)?;
        self.write_part(&updated, part)?;
        cache.insert(session_id.clone(), updated);
        Ok(value)
    }

    fn read<T>(&self, session_id: &SessionId, f: impl FnOnce(&SessionLog) -> T) -> Result<T, StoreError> {
        let mut cache = self.cache.lock();
        if let Some(log) = cache.get(session_id) {
            return Ok(f(log));
        }
        let log = self.read_log(session_id)?;
        let value = f(&log);
        cache.insert(session_id.clone(), log);
        Ok(value)
    }
}

impl MessageStore for JsonFileStore {
    fn create_session(&self, title: &str) -> Result<Session, StoreError> {
        let session = Session::new(title);
        let log = SessionLog::new(session.clone());
        self.write_part(&log, Part::Session)?;
        self.write_part(&log, Part::Messages)?;
        self.cache.lock().insert(session.id.clone(), log);
        Ok(session)
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Session, StoreError> {
        self.read(session_id, |log| log.session.clone())
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let sessions_dir = self.sessions_dir();
        if !sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in fs::read_dir(&sessions_dir)? {
            let path = entry?.path();
            let session_json = path.join(SESSION_FILE);
            if !path.is_dir() || !session_json.exists() {
                continue;
            }
            match fs::read_to_string(&session_json) {
                Ok(content) => match serde_json::from_str::<Session>(&content) {
                    Ok(session) => sessions.push(session),
                    Err(e) => warn!(path = ?session_json, error = %e, "Failed to parse session"),
                },
                Err(e) => warn!(path = ?session_json, error = %e, "Failed to read session"),
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    fn rename_session(&self, session_id: &SessionId, title: &str) -> Result<Session, StoreError> {
        self.mutate(session_id, Part::Session, |log| {
            log.session.title = title.to_string();
            Ok(log.session.clone())
        })
    }

    fn append_message(&self, session_id: &SessionId, message: NewMessage) -> Result<Message, StoreError> {
        self.mutate(session_id, Part::Messages, |log| Ok(log.append(message)))
    }

    fn list_messages(&self, session_id: &SessionId, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        self.read(session_id, |log| log.query(query))
    }

    fn mark_important(&self, session_id: &SessionId, ids: &[MessageId]) -> Result<usize, StoreError> {
        self.mutate(session_id, Part::Messages, |log| log.mark_important(ids))
    }

    fn delete_messages(&self, session_id: &SessionId, ids: &[MessageId]) -> Result<usize, StoreError> {
        self.mutate(session_id, Part::Messages, |log| log.delete(ids))
    }

    fn upsert_style(&self, record: StyleRecord) -> Result<(), StoreError> {
        let session_id = record.session_id.clone();
        self.mutate(&session_id, Part::Styles, |log| {
            log.upsert_style(record);
            Ok(())
        })
    }

    fn get_style(&self, session_id: &SessionId, message_id: MessageId) -> Result<Option<StyleRecord>, StoreError> {
        self.read(session_id, |log| log.styles.get(&message_id).cloned())
    }

    fn put_knowledge(&self, record: KnowledgeRecord) -> Result<(), StoreError> {
        let session_id = record.session_id.clone();
        self.mutate(&session_id, Part::Knowledge, |log| {
            log.knowledge = Some(record);
            Ok(())
        })
    }

    fn get_knowledge(&self, session_id: &SessionId) -> Result<Option<KnowledgeRecord>, StoreError> {
        self.read(session_id, |log| log.knowledge.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Role, Sentiment, Tone};
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_messages_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let session_id = {
            let store = JsonFileStore::open(dir.path()).unwrap();
            let session = store.create_session("persisted").unwrap();
            store.append_message(&session.id, NewMessage::new(Role::User, "first", 1)).unwrap();
            store
                .append_message(&session.id, NewMessage::new(Role::Assistant, "second", 1).important(true))
                .unwrap();
            session.id
        };

        let store = JsonFileStore::open(dir.path()).unwrap();
        let messages = store.list_messages(&session_id, &MessageQuery::all()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert!(messages[1].is_important);
        assert_eq!(store.get_session(&session_id).unwrap().title, "persisted");
    }

    #[test]
    fn test_next_id_survives_tail_delete_and_reopen() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let session = store.create_session("ids").unwrap();
        store.append_message(&session.id, NewMessage::new(Role::User, "a", 1)).unwrap();
        let last = store.append_message(&session.id, NewMessage::new(Role::User, "b", 1)).unwrap();
        store.delete_messages(&session.id, &[last.id]).unwrap();
        drop(store);

        let store = JsonFileStore::open(dir.path()).unwrap();
        let next = store.append_message(&session.id, NewMessage::new(Role::User, "c", 1)).unwrap();
        assert!(next.id > last.id);
    }

    #[test]
    fn test_failed_delete_leaves_disk_untouched() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let session = store.create_session("atomic").unwrap();
        let kept = store.append_message(&session.id, NewMessage::new(Role::User, "keep", 1)).unwrap();

        assert!(store.delete_messages(&session.id, &[kept.id, 42]).is_err());

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.count_messages(&session.id, &MessageQuery::all()).unwrap(), 1);
    }

    #[test]
    fn test_list_sessions_skips_corrupt_entries() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.create_session("good").unwrap();

        let bad = dir.path().join("sessions").join("sess_BAD");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join(SESSION_FILE), "not json").unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "good");
    }

    #[test]
    fn test_styles_persist() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let session = store.create_session("style").unwrap();
        store
            .upsert_style(StyleRecord {
                message_id: 7,
                session_id: session.id.clone(),
                tone: Tone::Enthusiastic,
                sentiment: Sentiment::Positive,
                complexity: 3,
                created_at: Utc::now(),
            })
            .unwrap();

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        let style = reopened.get_style(&session.id, 7).unwrap().unwrap();
        assert_eq!(style.tone, Tone::Enthusiastic);
    }

    #[test]
    fn test_knowledge_persists() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let session = store.create_session("facts").unwrap();
        assert_eq!(store.get_knowledge(&session.id).unwrap(), None);

        let mut record = KnowledgeRecord::empty(session.id.clone());
        record.merge(vec!["Oslo".to_string()], vec!["travel".to_string()], "Planning a trip.");
        store.put_knowledge(record.clone()).unwrap();

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_knowledge(&session.id).unwrap(), Some(record));
    }

    #[test]
    fn test_missing_session() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let err = store.get_session(&SessionId::generate()).unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
    }
}
