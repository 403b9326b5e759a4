//! Knowledge extraction
//!
//! Pulls entities, keywords and a short summary out of each assistant reply
//! and folds them into the session's knowledge record. Best-effort: a failed
//! extraction leaves the record as it was.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::style::extract_json;
use crate::remote::{ChatModel, ChatRequest};
use crate::session::{KnowledgeRecord, Message};
use crate::store::{MessageStore, StoreError};

pub const KNOWLEDGE_PROMPT: &str = "Extract the key information from the following text and reply \
with JSON only, in the form {\"entities\": [], \"keywords\": [], \"summary\": \"\"}. entities: every \
proper noun or objective fact (people, places, organizations, technical terms). keywords: the five most \
representative keywords. summary: at most 100 words.";

const KNOWLEDGE_MAX_TOKENS: u32 = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnowledgeSource {
    Extracted,
    /// Nothing was merged
    Defaulted { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeOutcome {
    /// The session's record after this extraction
    pub record: KnowledgeRecord,
    pub source: KnowledgeSource,
}

#[derive(Debug, Deserialize)]
struct RawKnowledge {
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    summary: String,
}

fn parse_knowledge(reply: &str) -> Result<RawKnowledge, String> {
    let json = extract_json(reply).ok_or_else(|| "no JSON object in reply".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("invalid knowledge JSON: {}", e))
}

pub struct KnowledgeExtractor {
    store: Arc<dyn MessageStore>,
    model: Arc<dyn ChatModel>,
    temperature: f32,
}

impl KnowledgeExtractor {
    pub fn new(store: Arc<dyn MessageStore>, model: Arc<dyn ChatModel>, temperature: f32) -> Self {
        Self {
            store,
            model,
            temperature,
        }
    }

    pub async fn extract(&self, message: &Message) -> Result<KnowledgeOutcome, StoreError> {
        let current = self
            .store
            .get_knowledge(&message.session_id)?
            .unwrap_or_else(|| KnowledgeRecord::empty(message.session_id.clone()));

        let request = ChatRequest::instruction(KNOWLEDGE_PROMPT, message.content.as_str(), self.temperature)
            .with_max_tokens(KNOWLEDGE_MAX_TOKENS);
        let parsed = match self.model.complete(&request).await {
            Ok(reply) => parse_knowledge(&reply),
            Err(e) => Err(e.to_string()),
        };

        let raw = match parsed {
            Ok(raw) => raw,
            Err(reason) => {
                warn!(session = %message.session_id, message_id = message.id, reason = %reason, "Knowledge extraction failed");
                return Ok(KnowledgeOutcome {
                    record: current,
                    source: KnowledgeSource::Defaulted { reason },
                });
            }
        };

        let mut record = current;
        record.merge(raw.entities, raw.keywords, &raw.summary);
        self.store.put_knowledge(record.clone())?;
        debug!(
            session = %message.session_id,
            message_id = message.id,
            entities = record.entities.len(),
            keywords = record.keywords.len(),
            "Merged knowledge"
        );

        Ok(KnowledgeOutcome {
            record,
            source: KnowledgeSource::Extracted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{Kind, ScriptedModel};
    use crate::remote::RemoteError;
    use crate::session::{NewMessage, Role, SessionId};
    use crate::store::InMemoryStore;

    fn setup(model: ScriptedModel) -> (Arc<InMemoryStore>, Arc<ScriptedModel>, SessionId, KnowledgeExtractor) {
        let store = Arc::new(InMemoryStore::new());
        let model = Arc::new(model);
        let session = store.create_session("knowledge").unwrap().id;
        let extractor = KnowledgeExtractor::new(store.clone(), model.clone(), 0.3);
        (store, model, session, extractor)
    }

    fn reply(store: &InMemoryStore, session: &SessionId, text: &str) -> Message {
        store
            .append_message(session, NewMessage::new(Role::Assistant, text, 1))
            .unwrap()
    }

    #[tokio::test]
    async fn test_extractions_accumulate() {
        let model = ScriptedModel::new().reply(
            Kind::Knowledge,
            Ok("```json\n{\"entities\": [\"Oslo\"], \"keywords\": [\"travel\"], \"summary\": \"A trip.\"}\n```"),
        );
        let (store, model, session, extractor) = setup(model);

        extractor.extract(&reply(&store, &session, "Oslo is lovely")).await.unwrap();
        let outcome = extractor.extract(&reply(&store, &session, "Oslo in May")).await.unwrap();

        assert_eq!(outcome.source, KnowledgeSource::Extracted);
        assert_eq!(outcome.record.entities, vec!["Oslo"]);
        assert_eq!(outcome.record.summary, "A trip.\nA trip.");
        assert_eq!(store.get_knowledge(&session).unwrap(), Some(outcome.record));
        let request = &model.requests(Kind::Knowledge)[1];
        assert_eq!(request.max_tokens, Some(400));
        assert_eq!(request.messages[1].content, "Oslo in May");
    }

    #[tokio::test]
    async fn test_missing_fields_default_to_empty() {
        let model = ScriptedModel::new().reply(Kind::Knowledge, Ok(r#"{"keywords": ["rust"]}"#));
        let (store, _model, session, extractor) = setup(model);
        let message = reply(&store, &session, "Rust");

        let outcome = extractor.extract(&message).await.unwrap();
        assert_eq!(outcome.record.keywords, vec!["rust"]);
        assert!(outcome.record.entities.is_empty());
    }

    #[tokio::test]
    async fn test_failure_leaves_record_unchanged() {
        let model = ScriptedModel::new().reply(Kind::Knowledge, Err(RemoteError::Http("timeout".to_string())));
        let (store, _model, session, extractor) = setup(model);

        let outcome = extractor.extract(&reply(&store, &session, "anything")).await.unwrap();

        assert!(matches!(outcome.source, KnowledgeSource::Defaulted { .. }));
        assert!(outcome.record.is_empty());
        assert_eq!(store.get_knowledge(&session).unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert_eq!(parse_knowledge("no idea").unwrap_err(), "no JSON object in reply");
        assert!(parse_knowledge(r#"{"entities": "Oslo"}"#).is_err());
    }
}
