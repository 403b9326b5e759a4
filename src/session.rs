//! Sessions, messages and the per-message/per-session analysis records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use ulid::Ulid;

use crate::store::StoreError;

/// Application identifier used for the data directory
pub const APP_IDENTIFIER: &str = "com.memoria.dev";

/// Title given to sessions created without one
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// Session identifier (ULID string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(Ulid::new().to_string())
    }

    /// Parse a user-supplied id, accepting an optional `sess_` prefix.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let normalized = raw.trim().trim_start_matches("sess_");
        validate_session_id(normalized)?;
        Ok(SessionId(normalized.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name for this session under `sessions/`
    pub fn dir_name(&self) -> String {
        format!("sess_{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate that a session ID contains only safe characters (alphanumeric, dash, underscore).
/// Rejects any path traversal attempts (/, \, ..).
pub fn validate_session_id(session_id: &str) -> Result<(), StoreError> {
    if session_id.is_empty() {
        return Err(StoreError::InvalidSessionId(session_id.to_string()));
    }
    if session_id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(session_id.to_string()))
    }
}

/// One conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: SessionId::generate(),
            title: if title.trim().is_empty() {
                DEFAULT_SESSION_TITLE.to_string()
            } else {
                title
            },
            created_at: Utc::now(),
        }
    }
}

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message identifier, strictly increasing within a session
pub type MessageId = u64;

/// One turn in a session's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub is_important: bool,
    /// Estimated cost at write time
    pub tokens: u32,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by callers when appending; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub is_important: bool,
    pub tokens: u32,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>, tokens: u32) -> Self {
        Self {
            role,
            content: content.into(),
            is_important: false,
            tokens,
        }
    }

    pub fn important(mut self, is_important: bool) -> Self {
        self.is_important = is_important;
        self
    }
}

/// Tone category of a user message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Formal,
    Casual,
    Technical,
    Enthusiastic,
}

impl Tone {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "formal" => Some(Tone::Formal),
            "casual" => Some(Tone::Casual),
            "technical" => Some(Tone::Technical),
            "enthusiastic" => Some(Tone::Enthusiastic),
            _ => None,
        }
    }
}

/// Sentiment category of a user message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "positive" => Some(Sentiment::Positive),
            "neutral" => Some(Sentiment::Neutral),
            "negative" => Some(Sentiment::Negative),
            _ => None,
        }
    }
}

pub const COMPLEXITY_MIN: u8 = 1;
pub const COMPLEXITY_MAX: u8 = 10;
pub const COMPLEXITY_NEUTRAL: u8 = 5;

/// Style analysis of a single message, keyed by message id.
///
/// Not removed when the message is compacted away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleRecord {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub tone: Tone,
    pub sentiment: Sentiment,
    pub complexity: u8,
    pub created_at: DateTime<Utc>,
}

/// Longest summary kept in a knowledge record, in characters
pub const KNOWLEDGE_SUMMARY_MAX_CHARS: usize = 1000;

/// Core facts accumulated across a session's replies.
///
/// One per session. Entities and keywords keep their first-seen order with
/// exact duplicates dropped; the summary keeps its newest lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeRecord {
    pub session_id: SessionId,
    pub entities: Vec<String>,
    pub keywords: Vec<String>,
    pub summary: String,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeRecord {
    pub fn empty(session_id: SessionId) -> Self {
        Self {
            session_id,
            entities: Vec::new(),
            keywords: Vec::new(),
            summary: String::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.keywords.is_empty() && self.summary.is_empty()
    }

    /// Fold one extraction into the record.
    pub fn merge(&mut self, entities: Vec<String>, keywords: Vec<String>, summary: &str) {
        merge_unique(&mut self.entities, entities);
        merge_unique(&mut self.keywords, keywords);

        let summary = summary.trim();
        if !summary.is_empty() {
            if !self.summary.is_empty() {
                self.summary.push('\n');
            }
            self.summary.push_str(summary);
        }
        self.summary = keep_tail(&self.summary, KNOWLEDGE_SUMMARY_MAX_CHARS);
        self.updated_at = Utc::now();
    }
}

fn merge_unique(existing: &mut Vec<String>, incoming: Vec<String>) {
    for item in incoming {
        let item = item.trim();
        if !item.is_empty() && !existing.iter().any(|e| e == item) {
            existing.push(item.to_string());
        }
    }
}

/// Drop whole leading lines until `text` fits in `max_chars`; a single line
/// that is still too long keeps its last `max_chars` characters.
fn keep_tail(text: &str, max_chars: usize) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    while lines.len() > 1 && lines.join("\n").chars().count() > max_chars {
        lines.remove(0);
    }
    let joined = lines.join("\n");
    let count = joined.chars().count();
    if count <= max_chars {
        return joined;
    }
    joined.chars().skip(count - max_chars).collect()
}

/// Get the default data directory (`<platform data dir>/com.memoria.dev`)
pub fn default_data_dir() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::NoDataDir)?;
    Ok(base.join(APP_IDENTIFIER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_parse_strips_prefix() {
        let id = SessionId::parse("sess_01HZX3").unwrap();
        assert_eq!(id.as_str(), "01HZX3");
        assert_eq!(id.dir_name(), "sess_01HZX3");
    }

    #[test]
    fn test_session_id_rejects_traversal() {
        assert!(SessionId::parse("../etc").is_err());
        assert!(SessionId::parse("a/b").is_err());
        assert!(SessionId::parse("").is_err());
    }

    #[test]
    fn test_blank_title_defaults() {
        let session = Session::new("  ");
        assert_eq!(session.title, DEFAULT_SESSION_TITLE);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }

    #[test]
    fn test_knowledge_merge_drops_duplicates() {
        let mut record = KnowledgeRecord::empty(SessionId::generate());
        record.merge(vec!["Rust".into(), "Oslo".into()], vec!["borrowing".into()], "Talked about Rust.");
        record.merge(vec!["Oslo".into(), " ".into(), "Cargo".into()], vec!["borrowing".into()], "");

        assert_eq!(record.entities, vec!["Rust", "Oslo", "Cargo"]);
        assert_eq!(record.keywords, vec!["borrowing"]);
        assert_eq!(record.summary, "Talked about Rust.");
    }

    #[test]
    fn test_knowledge_summary_keeps_newest_lines() {
        let mut record = KnowledgeRecord::empty(SessionId::generate());
        let line = "x".repeat(995);
        record.merge(Vec::new(), Vec::new(), &line);
        record.merge(Vec::new(), Vec::new(), "latest");

        assert_eq!(record.summary, "latest");
        assert_eq!(keep_tail("abcdef", 3), "def");
    }

    #[test]
    fn test_style_parsing_is_case_insensitive() {
        assert_eq!(Tone::parse("Technical"), Some(Tone::Technical));
        assert_eq!(Sentiment::parse("NEGATIVE"), Some(Sentiment::Negative));
        assert_eq!(Tone::parse("sarcastic"), None);
    }
}
