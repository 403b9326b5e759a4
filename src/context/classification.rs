//! Importance Classification
//!
//! Decides which messages are pinned. The policy is evaluated in a fixed
//! order: the keyword rule first, the model judge only when no keyword
//! matched. Judge failures leave the message ordinary.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::remote::{ChatModel, ChatRequest};
use crate::session::{MessageId, Role, SessionId};
use crate::store::{MessageQuery, MessageStore, StoreError};

/// Instruction sent to the model judge
pub const JUDGE_PROMPT: &str = "If the following content contains key information that should be \
remembered long-term (such as personal information or important facts), answer YES; otherwise answer NO.";

/// Outcome of evaluating one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Matched a configured keyword; no remote call made
    Keyword(String),
    /// Model answered yes
    ModelYes,
    /// Model answered anything other than yes
    ModelNo,
    /// Judge call failed; treated as ordinary
    RemoteFailed(String),
}

impl Verdict {
    pub fn is_important(&self) -> bool {
        matches!(self, Verdict::Keyword(_) | Verdict::ModelYes)
    }
}

/// Result of one classification pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationReport {
    pub verdicts: Vec<(MessageId, Verdict)>,
    /// Messages whose flag was set by this pass
    pub flagged: usize,
}

impl ClassificationReport {
    pub fn failures(&self) -> usize {
        self.verdicts
            .iter()
            .filter(|(_, v)| matches!(v, Verdict::RemoteFailed(_)))
            .count()
    }
}

/// Case-insensitive substring match against a fixed keyword list
#[derive(Debug, Clone)]
pub struct KeywordRule {
    keywords: Vec<String>,
}

impl KeywordRule {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Self {
        Self {
            keywords: keywords
                .iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// First keyword contained in `text`
    pub fn matches(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        self.keywords
            .iter()
            .find(|k| lowered.contains(k.as_str()))
            .map(String::as_str)
    }
}

/// Interpret the judge's answer. Only an explicit yes counts.
fn is_yes(answer: &str) -> bool {
    answer
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation() || c == '。' || c == '！')
        .eq_ignore_ascii_case("yes")
}

pub struct ImportanceClassifier {
    store: Arc<dyn MessageStore>,
    model: Arc<dyn ChatModel>,
    rule: KeywordRule,
    temperature: f32,
}

impl ImportanceClassifier {
    pub fn new(store: Arc<dyn MessageStore>, model: Arc<dyn ChatModel>, rule: KeywordRule, temperature: f32) -> Self {
        Self {
            store,
            model,
            rule,
            temperature,
        }
    }

    /// Keyword rule alone, used when a message is first stored
    pub fn keyword_match(&self, text: &str) -> Option<&str> {
        self.rule.matches(text)
    }

    /// Evaluate the two-step policy for one piece of content.
    pub async fn evaluate(&self, content: &str) -> Verdict {
        if let Some(keyword) = self.rule.matches(content) {
            return Verdict::Keyword(keyword.to_string());
        }

        let request = ChatRequest::instruction(JUDGE_PROMPT, content, self.temperature);
        match self.model.complete(&request).await {
            Ok(answer) if is_yes(&answer) => Verdict::ModelYes,
            Ok(answer) => {
                debug!(answer = %answer.trim(), "Judge declined");
                Verdict::ModelNo
            }
            Err(e) => {
                warn!(error = %e, "Importance judge failed, leaving message unflagged");
                Verdict::RemoteFailed(e.to_string())
            }
        }
    }

    /// Classify the `recent_window` most recent unflagged messages and pin
    /// those judged important. Summaries are never considered.
    pub async fn classify(
        &self,
        session_id: &SessionId,
        recent_window: usize,
    ) -> Result<ClassificationReport, StoreError> {
        let candidates = self.store.list_messages(
            session_id,
            &MessageQuery::ordinary()
                .without_role(Role::System)
                .newest_first()
                .limit(recent_window),
        )?;

        let mut report = ClassificationReport::default();
        for message in candidates {
            let verdict = self.evaluate(&message.content).await;
            report.verdicts.push((message.id, verdict));
        }

        let pinned: Vec<MessageId> = report
            .verdicts
            .iter()
            .filter(|(_, v)| v.is_important())
            .map(|(id, _)| *id)
            .collect();
        if !pinned.is_empty() {
            report.flagged = self.store.mark_important(session_id, &pinned)?;
        }

        info!(
            session = %session_id,
            evaluated = report.verdicts.len(),
            flagged = report.flagged,
            failures = report.failures(),
            "Classified recent messages"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{Kind, ScriptedModel};
    use crate::remote::RemoteError;
    use crate::session::NewMessage;
    use crate::store::InMemoryStore;

    fn keywords() -> KeywordRule {
        KeywordRule::new(&["password", "密码", "allergic"])
    }

    fn setup(model: ScriptedModel) -> (Arc<InMemoryStore>, Arc<ScriptedModel>, SessionId, ImportanceClassifier) {
        let store = Arc::new(InMemoryStore::new());
        let model = Arc::new(model);
        let session = store.create_session("classify").unwrap().id;
        let classifier = ImportanceClassifier::new(store.clone(), model.clone(), keywords(), 0.0);
        (store, model, session, classifier)
    }

    fn append(store: &InMemoryStore, session: &SessionId, role: Role, text: &str) -> MessageId {
        store
            .append_message(session, NewMessage::new(role, text, 1))
            .unwrap()
            .id
    }

    #[test]
    fn test_keyword_rule_case_insensitive() {
        let rule = keywords();
        assert_eq!(rule.matches("My PASSWORD is hunter2"), Some("password"));
        assert_eq!(rule.matches("我的密码是123"), Some("密码"));
        assert_eq!(rule.matches("nothing here"), None);
    }

    #[test]
    fn test_blank_keywords_ignored() {
        let rule = KeywordRule::new(&["", "  "]);
        assert_eq!(rule.matches("anything"), None);
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("YES"));
        assert!(is_yes(" yes.\n"));
        assert!(is_yes("Yes!"));
        assert!(!is_yes("NO"));
        assert!(!is_yes("yes, but"));
        assert!(!is_yes(""));
    }

    #[tokio::test]
    async fn test_keyword_match_makes_no_remote_call() {
        let (store, model, session, classifier) = setup(ScriptedModel::new());
        let id = append(&store, &session, Role::User, "I am allergic to peanuts");

        let report = classifier.classify(&session, 3).await.unwrap();

        assert_eq!(model.total_calls(), 0);
        assert_eq!(report.verdicts, vec![(id, Verdict::Keyword("allergic".to_string()))]);
        assert_eq!(report.flagged, 1);
        assert_eq!(store.list_messages(&session, &MessageQuery::important()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_model_yes_flags_message() {
        let (store, model, session, classifier) = setup(ScriptedModel::new().reply(Kind::Judge, Ok("YES")));
        let id = append(&store, &session, Role::User, "My daughter's name is Ada");

        let report = classifier.classify(&session, 3).await.unwrap();

        assert_eq!(model.calls(Kind::Judge), 1);
        assert_eq!(report.verdicts, vec![(id, Verdict::ModelYes)]);
        let judged = &model.requests(Kind::Judge)[0];
        assert_eq!(judged.temperature, 0.0);
        assert_eq!(judged.messages[1].content, "My daughter's name is Ada");
    }

    #[tokio::test]
    async fn test_remote_failure_leaves_unflagged() {
        let model = ScriptedModel::new().reply(Kind::Judge, Err(RemoteError::Http("connection reset".to_string())));
        let (store, _model, session, classifier) = setup(model);
        let id = append(&store, &session, Role::User, "something");

        let report = classifier.classify(&session, 3).await.unwrap();

        assert_eq!(report.flagged, 0);
        assert_eq!(report.failures(), 1);
        assert!(matches!(report.verdicts[0], (mid, Verdict::RemoteFailed(_)) if mid == id));
        assert!(store.list_messages(&session, &MessageQuery::important()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_window_covers_most_recent_unflagged_only() {
        let (store, model, session, classifier) = setup(ScriptedModel::new());
        for i in 0..5 {
            append(&store, &session, Role::User, &format!("turn {}", i));
        }
        append(&store, &session, Role::System, "Background summary: earlier chat");

        let report = classifier.classify(&session, 3).await.unwrap();

        let ids: Vec<_> = report.verdicts.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(model.calls(Kind::Judge), 3);
    }

    #[tokio::test]
    async fn test_flags_never_revert() {
        let (store, _model, session, classifier) = setup(ScriptedModel::new().reply(Kind::Judge, Ok("NO")));
        let pinned = append(&store, &session, Role::User, "my password is swordfish");
        classifier.classify(&session, 3).await.unwrap();

        for _ in 0..3 {
            append(&store, &session, Role::Assistant, "ok");
            classifier.classify(&session, 3).await.unwrap();
        }

        let important = store.list_messages(&session, &MessageQuery::important()).unwrap();
        assert_eq!(important.iter().map(|m| m.id).collect::<Vec<_>>(), vec![pinned]);
    }
}
