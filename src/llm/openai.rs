//! OpenAI-compatible streaming backend.
//!
//! Posts `stream: true` chat completions and pumps the Server-Sent Events
//! body into a [`StreamChunk`] channel from a background task.

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{ChatBackend, ChatRequest, StreamChunk};
use crate::error::LlmError;

const PROVIDER: &str = "openai";

/// Chunk channel capacity. The reader is a single consumer that never blocks
/// for long, so a small buffer is enough.
const STREAM_BUFFER: usize = 64;

/// Error code for transport failures after the stream was opened.
pub const STREAM_READ_FAILED: &str = "stream_read_failed";

/// Chat backend speaking the OpenAI `/chat/completions` protocol.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, LlmError> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
        });

        let resp = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("{status}: {text}"),
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(pump_events(resp, tx));
        Ok(rx)
    }
}

/// Forward SSE events from `resp` into `tx` until `[DONE]`, an error, or the
/// receiver goes away.
async fn pump_events(resp: reqwest::Response, tx: mpsc::Sender<StreamChunk>) {
    let mut body = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        // A stalled upstream must not keep the connection open once the
        // reader has given up on the reply.
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Chat stream receiver dropped, closing connection");
                return;
            }
            next = body.next() => next,
        };
        let Some(next) = next else {
            return;
        };
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Chat stream read failed");
                let _ = tx
                    .send(StreamChunk::failed(STREAM_READ_FAILED, e.to_string()))
                    .await;
                return;
            }
        };
        buf.extend_from_slice(&bytes);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            match parse_event_line(&line) {
                Some(SseEvent::Chunk(chunk)) => {
                    let terminal = chunk.is_error();
                    if tx.send(chunk).await.is_err() || terminal {
                        return;
                    }
                }
                Some(SseEvent::Done) => return,
                None => {}
            }
        }
    }
}

/// A decoded `data:` line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseEvent {
    Chunk(StreamChunk),
    Done,
}

#[derive(Deserialize)]
struct CompletionEvent {
    #[serde(default)]
    choices: Vec<EventChoice>,
    error: Option<EventError>,
}

#[derive(Deserialize)]
struct EventChoice {
    #[serde(default)]
    delta: EventDelta,
}

#[derive(Default, Deserialize)]
struct EventDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct EventError {
    #[serde(default)]
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<serde_json::Value>,
}

/// Decode one SSE line. Comments, blank lines and non-data fields yield `None`.
pub(crate) fn parse_event_line(line: &str) -> Option<SseEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let event: CompletionEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            return Some(SseEvent::Chunk(StreamChunk::failed(
                "invalid_response",
                format!("undecodable stream event: {e}"),
            )));
        }
    };

    if let Some(err) = event.error {
        let code = match err.code {
            Some(serde_json::Value::String(code)) => code,
            Some(serde_json::Value::Number(code)) => code.to_string(),
            _ => err.kind.unwrap_or_else(|| "upstream_error".to_string()),
        };
        return Some(SseEvent::Chunk(StreamChunk::failed(code, err.message)));
    }

    let text = event
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .unwrap_or_default();
    Some(SseEvent::Chunk(StreamChunk::text(text)))
}
