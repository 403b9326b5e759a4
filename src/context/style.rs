//! Style analysis of user messages
//!
//! Best-effort: any failure of the remote call or of the reply's shape is
//! recorded as the neutral default instead.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::remote::{ChatModel, ChatRequest};
use crate::session::{Message, Sentiment, StyleRecord, Tone, COMPLEXITY_MAX, COMPLEXITY_MIN, COMPLEXITY_NEUTRAL};
use crate::store::{MessageStore, StoreError};

pub const STYLE_PROMPT: &str = "Analyze the style of the following text and reply with JSON only, \
in the form {\"tone\": \"formal|casual|technical|enthusiastic\", \"sentiment\": \"positive|neutral|negative\", \
\"complexity\": 1-10}.";

const STYLE_MAX_TOKENS: u32 = 200;

/// Where a stored style record came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StyleSource {
    Analyzed,
    Defaulted { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StyleOutcome {
    pub record: StyleRecord,
    pub source: StyleSource,
}

#[derive(Debug, Deserialize)]
struct RawStyle {
    tone: String,
    sentiment: String,
    complexity: serde_json::Value,
}

/// Parsed style fields
type Style = (Tone, Sentiment, u8);

/// Pull the outermost JSON object out of a reply that may carry prose or
/// code fences around it.
pub(crate) fn extract_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (start < end).then(|| &reply[start..=end])
}

fn parse_style(reply: &str) -> Result<Style, String> {
    let json = extract_json(reply).ok_or_else(|| "no JSON object in reply".to_string())?;
    let raw: RawStyle = serde_json::from_str(json).map_err(|e| format!("invalid style JSON: {}", e))?;

    let tone = Tone::parse(&raw.tone).ok_or_else(|| format!("unknown tone {:?}", raw.tone))?;
    let sentiment =
        Sentiment::parse(&raw.sentiment).ok_or_else(|| format!("unknown sentiment {:?}", raw.sentiment))?;
    let complexity = match &raw.complexity {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("invalid complexity {}", raw.complexity))?;
    let complexity = complexity.round().clamp(COMPLEXITY_MIN as f64, COMPLEXITY_MAX as f64) as u8;

    Ok((tone, sentiment, complexity))
}

pub struct StyleAnalyzer {
    store: Arc<dyn MessageStore>,
    model: Arc<dyn ChatModel>,
    temperature: f32,
}

impl StyleAnalyzer {
    pub fn new(store: Arc<dyn MessageStore>, model: Arc<dyn ChatModel>, temperature: f32) -> Self {
        Self {
            store,
            model,
            temperature,
        }
    }

    /// Analyze `message` and upsert its style record.
    ///
    /// Only store errors are returned; analysis failures produce a
    /// defaulted record.
    pub async fn analyze(&self, message: &Message) -> Result<StyleOutcome, StoreError> {
        let request = ChatRequest::instruction(STYLE_PROMPT, message.content.as_str(), self.temperature)
            .with_max_tokens(STYLE_MAX_TOKENS);

        let parsed = match self.model.complete(&request).await {
            Ok(reply) => parse_style(&reply),
            Err(e) => Err(e.to_string()),
        };
        let ((tone, sentiment, complexity), source) = match parsed {
            Ok(style) => (style, StyleSource::Analyzed),
            Err(reason) => {
                warn!(session = %message.session_id, message_id = message.id, reason = %reason, "Style analysis failed, using defaults");
                (
                    (Tone::default(), Sentiment::default(), COMPLEXITY_NEUTRAL),
                    StyleSource::Defaulted { reason },
                )
            }
        };

        let record = StyleRecord {
            message_id: message.id,
            session_id: message.session_id.clone(),
            tone,
            sentiment,
            complexity,
            created_at: Utc::now(),
        };
        self.store.upsert_style(record.clone())?;
        debug!(session = %message.session_id, message_id = message.id, ?tone, ?sentiment, complexity, "Stored style");

        Ok(StyleOutcome { record, source })
    }
}
