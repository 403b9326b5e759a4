//! Chat Completions HTTP Client
//!
//! Direct reqwest client for OpenAI-compatible `/chat/completions`
//! endpoints (DeepSeek by default), with SSE streaming.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{ChatMessage, ChatModel, ChatRequest, CompletionStream, RemoteError};
use crate::config::RemoteConfig;

/// Terminator sent as the final SSE data frame
const STREAM_DONE: &str = "[DONE]";

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireContent,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    choices: Vec<WireDelta>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    delta: WireContent,
}

/// OpenAI-compatible chat client
#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| RemoteError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, RemoteError> {
        let body = WireRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        };

        debug!(model = %self.model, messages = request.messages.len(), stream, "Sending chat completion");
        let mut builder = self.http.post(format!("{}/chat/completions", self.base_url)).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "Chat completion failed");
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, RemoteError> {
        let resp = self.send(request, false).await?;
        let text = resp.text().await?;
        let parsed: WireResponse =
            serde_json::from_str(&text).map_err(|e| RemoteError::Malformed(format!("{}: {}", e, text)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RemoteError::Malformed("No choices in response".to_string()))
    }

    /// Deltas until the `[DONE]` frame. A body that ends without it is an
    /// error, so a dropped connection never looks like a finished reply.
    async fn stream(&self, request: &ChatRequest) -> Result<CompletionStream, RemoteError> {
        let resp = self.send(request, true).await?;
        let events = Box::pin(resp.bytes_stream().eventsource());

        let deltas = stream::unfold(Some(events), |state| async move {
            let mut events = state?;
            loop {
                let event = match events.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => return Some((Err(RemoteError::Stream(e.to_string())), None)),
                    None => {
                        warn!("SSE body ended before {}", STREAM_DONE);
                        let err = RemoteError::Stream(format!("stream ended before {}", STREAM_DONE));
                        return Some((Err(err), None));
                    }
                };

                let data = event.data.trim();
                if data == STREAM_DONE {
                    return None;
                }
                if data.is_empty() {
                    continue;
                }
                match parse_delta(data) {
                    Ok(Some(text)) => return Some((Ok(text), Some(events))),
                    Ok(None) => continue,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        });

        Ok(Box::pin(deltas))
    }
}

/// Content of one streamed chunk, if it carries any
fn parse_delta(data: &str) -> Result<Option<String>, RemoteError> {
    let chunk: WireChunk = serde_json::from_str(data).map_err(|e| {
        warn!(error = %e, "Failed to parse SSE chunk");
        RemoteError::Malformed(e.to_string())
    })?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty()))
}
