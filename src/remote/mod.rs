//! Remote chat completion
//!
//! The [`ChatModel`] trait is the only seam through which the memory manager
//! talks to a language model. [`client::ChatClient`] implements it for
//! OpenAI-compatible endpoints.

pub mod client;

pub use client::ChatClient;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;

use crate::session::{Message, Role};

/// Recoverable failure talking to the model provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        RemoteError::Http(e.to_string())
    }
}

/// One entry of the request's message list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Chat completion request. The model identifier is supplied by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self {
            messages,
            temperature,
            max_tokens: None,
        }
    }

    /// A system instruction followed by a single user message
    pub fn instruction(system: &str, user: impl Into<String>, temperature: f32) -> Self {
        Self::new(vec![ChatMessage::system(system), ChatMessage::user(user)], temperature)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Incremental completion text. Ends when the provider sends its terminator.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, RemoteError>> + Send>>;

/// A remote language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Single non-streaming completion.
    async fn complete(&self, request: &ChatRequest) -> Result<String, RemoteError>;

    /// Streaming completion. The default delivers the whole completion as one chunk.
    async fn stream(&self, request: &ChatRequest) -> Result<CompletionStream, RemoteError> {
        let text = self.complete(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(text)])))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted model for tests: answers by recognizing which prompt it was sent.

    use super::*;
    use crate::context::classification::JUDGE_PROMPT;
    use crate::context::compression::SUMMARY_PROMPT;
    use crate::context::knowledge::KNOWLEDGE_PROMPT;
    use crate::context::style::STYLE_PROMPT;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Kind {
        Judge,
        Summary,
        Style,
        Knowledge,
        Chat,
    }

    fn kind_of(request: &ChatRequest) -> Kind {
        match request.messages.first() {
            Some(m) if m.role == Role::System && m.content == JUDGE_PROMPT => Kind::Judge,
            Some(m) if m.role == Role::System && m.content == SUMMARY_PROMPT => Kind::Summary,
            Some(m) if m.role == Role::System && m.content == STYLE_PROMPT => Kind::Style,
            Some(m) if m.role == Role::System && m.content == KNOWLEDGE_PROMPT => Kind::Knowledge,
            _ => Kind::Chat,
        }
    }

    pub struct ScriptedModel {
        replies: Mutex<HashMap<Kind, Result<String, RemoteError>>>,
        calls: Mutex<HashMap<Kind, usize>>,
        requests: Mutex<Vec<ChatRequest>>,
        chunks: Option<Vec<Result<String, RemoteError>>>,
    }

    impl ScriptedModel {
        pub fn new() -> Self {
            let mut replies = HashMap::new();
            replies.insert(Kind::Judge, Ok("NO".to_string()));
            replies.insert(Kind::Summary, Ok("They chatted about the weather.".to_string()));
            replies.insert(
                Kind::Style,
                Ok(r#"{"tone": "casual", "sentiment": "positive", "complexity": 3}"#.to_string()),
            );
            replies.insert(
                Kind::Knowledge,
                Ok(r#"{"entities": [], "keywords": ["chat"], "summary": "Small talk."}"#.to_string()),
            );
            replies.insert(Kind::Chat, Ok("assistant reply".to_string()));
            Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
                chunks: None,
            }
        }

        pub fn reply(self, kind: Kind, reply: Result<&str, RemoteError>) -> Self {
            self.replies.lock().insert(kind, reply.map(str::to_string));
            self
        }

        /// Chat streams yield these chunks instead of the single reply.
        pub fn chunks(mut self, chunks: Vec<Result<&str, RemoteError>>) -> Self {
            self.chunks = Some(chunks.into_iter().map(|c| c.map(str::to_string)).collect());
            self
        }

        pub fn calls(&self, kind: Kind) -> usize {
            self.calls.lock().get(&kind).copied().unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            self.calls.lock().values().sum()
        }

        pub fn requests(&self, kind: Kind) -> Vec<ChatRequest> {
            self.requests
                .lock()
                .iter()
                .filter(|r| kind_of(r) == kind)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, request: &ChatRequest) -> Result<String, RemoteError> {
            let kind = kind_of(request);
            *self.calls.lock().entry(kind).or_insert(0) += 1;
            self.requests.lock().push(request.clone());
            self.replies
                .lock()
                .get(&kind)
                .cloned()
                .unwrap_or_else(|| Err(RemoteError::Malformed("no scripted reply".to_string())))
        }

        async fn stream(&self, request: &ChatRequest) -> Result<CompletionStream, RemoteError> {
            match (&self.chunks, kind_of(request)) {
                (Some(chunks), Kind::Chat) => {
                    *self.calls.lock().entry(Kind::Chat).or_insert(0) += 1;
                    self.requests.lock().push(request.clone());
                    Ok(Box::pin(stream::iter(chunks.clone())))
                }
                _ => {
                    let text = self.complete(request).await?;
                    Ok(Box::pin(stream::iter(vec![Ok(text)])))
                }
            }
        }
    }
}
