//! OpenAI Chat Completions API provider.
//!
//! Streams chat completions via `/v1/chat/completions`. Also serves
//! OpenRouter and Ollama, which speak the same protocol.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use tutor_relay_core::error::{Service, UpstreamError};

use crate::sse::{parse_sse_stream, SseEvent};
use crate::{ChunkStream, ChunkUsage, CompletionChunk, CompletionRequest, Credentials, LlmProvider};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// API style; determines minor behavior differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    fn with_style(base_url: Option<&str>, default_url: &str, api_style: ApiStyle, id: &str) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(default_url)
                .trim_end_matches('/')
                .to_string(),
            api_style,
            provider_id: id.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: Option<&str>) -> Self {
        Self::with_style(base_url, OPENAI_BASE_URL, ApiStyle::OpenAi, "openai")
    }

    pub fn openrouter(base_url: Option<&str>) -> Self {
        Self::with_style(base_url, OPENROUTER_BASE_URL, ApiStyle::OpenRouter, "openrouter")
    }

    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::with_style(base_url, OLLAMA_BASE_URL, ApiStyle::Ollama, "ollama")
    }

    /// Rebuild the HTTP client so connecting fails after `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> anyhow::Result<Self> {
        self.client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(self)
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Map a non-success HTTP status onto the upstream error taxonomy.
fn status_error(status: reqwest::StatusCode, body: &str) -> UpstreamError {
    let message = format!("OpenAI API error {status}: {body}");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        UpstreamError::rate_limited(Service::Generation, message)
    } else if status.is_server_error() {
        UpstreamError::transport(Service::Generation, message)
    } else {
        UpstreamError::protocol(Service::Generation, message)
    }
}

/// What one SSE event means for the chunk stream.
#[derive(Debug)]
enum Decoded {
    Chunk(CompletionChunk),
    Skip,
    Done,
}

fn decode_event(event: &SseEvent) -> Decoded {
    let data = event.data.trim();

    // OpenAI terminates with "data: [DONE]"
    if data == "[DONE]" {
        return Decoded::Done;
    }

    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            trace!(%e, data, "Failed to parse OpenAI chunk");
            return Decoded::Skip;
        }
    };

    // Usage (sent with stream_options.include_usage)
    if let Some(usage) = chunk.usage {
        return Decoded::Chunk(CompletionChunk {
            usage: Some(ChunkUsage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
            }),
            ..CompletionChunk::default()
        });
    }

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Decoded::Skip;
    };

    let delta = choice.delta.content.filter(|c| !c.is_empty());
    if delta.is_none() && choice.finish_reason.is_none() {
        return Decoded::Skip;
    }

    Decoded::Chunk(CompletionChunk {
        delta,
        usage: None,
        stop_reason: choice.finish_reason,
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream> {
        let api_key = match credentials {
            Credentials::ApiKey { api_key } => Some(api_key.clone()),
            Credentials::Anonymous if self.api_style == ApiStyle::Ollama => None,
            Credentials::Anonymous => {
                anyhow::bail!("{} requires an API key", self.provider_id)
            }
        };

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(request.messages.iter().cloned());

        let body = OpenAiRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            stream_options: (self.api_style != ApiStyle::Ollama).then_some(StreamOptions {
                include_usage: true,
            }),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(api_key) = api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("HTTP-Referer", "https://github.com/Clemens865/tutor-relay");
        }

        let response = req_builder
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(Service::Generation, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body).into());
        }

        let sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>> =
            Box::pin(parse_sse_stream(response));

        let chunk_stream = futures::stream::unfold(sse, |mut sse| async move {
            loop {
                match sse.next().await {
                    Some(Ok(event)) => match decode_event(&event) {
                        Decoded::Chunk(chunk) => return Some((Ok(chunk), sse)),
                        Decoded::Skip => continue,
                        Decoded::Done => return None,
                    },
                    Some(Err(e)) => {
                        let err = UpstreamError::transport(Service::Generation, e.to_string());
                        return Some((Err(anyhow::Error::from(err)), sse));
                    }
                    None => return None,
                }
            }
        });

        Ok(Box::pin(chunk_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.into(),
            id: None,
        }
    }

    #[test]
    fn test_openai_provider_creation() {
        let provider = OpenAiProvider::openai(None);
        assert_eq!(provider.id(), "openai");
        assert_eq!(provider.base_url, OPENAI_BASE_URL);
    }

    #[test]
    fn test_openrouter_and_ollama_creation() {
        assert_eq!(OpenAiProvider::openrouter(None).base_url, OPENROUTER_BASE_URL);
        let ollama = OpenAiProvider::ollama(None);
        assert_eq!(ollama.id(), "ollama");
        assert_eq!(ollama.api_style, ApiStyle::Ollama);
    }

    #[test]
    fn test_custom_base_url() {
        let provider = OpenAiProvider::openai(Some("https://my-proxy.example.com/"));
        assert_eq!(provider.base_url, "https://my-proxy.example.com");
    }

    #[test]
    fn test_decode_text_delta() {
        let Decoded::Chunk(chunk) = decode_event(&event(
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"content":"Hola"},"finish_reason":null}]}"#,
        )) else {
            panic!("Expected a chunk");
        };
        assert_eq!(chunk.delta.as_deref(), Some("Hola"));
        assert!(chunk.stop_reason.is_none());
    }

    #[test]
    fn test_decode_finish_reason_and_done() {
        let Decoded::Chunk(chunk) = decode_event(&event(
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        )) else {
            panic!("Expected a chunk");
        };
        assert_eq!(chunk.stop_reason.as_deref(), Some("stop"));
        assert!(matches!(decode_event(&event("[DONE]")), Decoded::Done));
    }

    #[test]
    fn test_decode_skips_malformed_and_empty() {
        assert!(matches!(decode_event(&event("{not json")), Decoded::Skip));
        assert!(matches!(decode_event(&event(r#"{"choices":[]}"#)), Decoded::Skip));
        assert!(matches!(
            decode_event(&event(r#"{"choices":[{"delta":{"content":""},"finish_reason":null}]}"#)),
            Decoded::Skip
        ));
    }

    #[test]
    fn test_decode_usage() {
        let Decoded::Chunk(chunk) = decode_event(&event(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34}}"#,
        )) else {
            panic!("Expected a usage chunk");
        };
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(34));
    }

    #[test]
    fn test_status_error_classification() {
        assert!(matches!(
            status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            UpstreamError::RateLimited { .. }
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::BAD_GATEWAY, ""),
            UpstreamError::Transport { .. }
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::UNAUTHORIZED, ""),
            UpstreamError::Protocol { .. }
        ));
    }
}
