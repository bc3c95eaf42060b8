//! LLM provider abstraction.
//!
//! Each provider implements the [`LlmProvider`] trait to stream chat
//! completions. The relay speaks to one OpenAI-compatible endpoint
//! (OpenAI, OpenRouter, or a local Ollama).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use tutor_relay_core::config::LlmConfig;

pub mod openai;
pub mod sse;

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    /// Local providers that need no key.
    #[serde(rename = "none")]
    Anonymous,
}

/// A request to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub system: Option<String>,
}

/// A streamed chunk from the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub delta: Option<String>,
    pub usage: Option<ChunkUsage>,
    pub stop_reason: Option<String>,
}

impl CompletionChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<CompletionChunk>> + Send>>;

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "openai", "ollama").
    fn id(&self) -> &str;

    /// Stream a chat completion.
    ///
    /// Errors that can be classified are returned as
    /// [`tutor_relay_core::error::UpstreamError`] inside the `anyhow::Error`.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream>;
}

/// Build the configured provider and its credentials.
pub fn from_config(config: &LlmConfig) -> anyhow::Result<(Arc<dyn LlmProvider>, Credentials)> {
    let base_url = config.base_url.as_deref();
    let provider = match config.provider.as_str() {
        "openai" => openai::OpenAiProvider::openai(base_url),
        "openrouter" => openai::OpenAiProvider::openrouter(base_url),
        "ollama" => openai::OpenAiProvider::ollama(base_url),
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    };
    let provider: Arc<dyn LlmProvider> = Arc::new(
        provider.with_connect_timeout(std::time::Duration::from_secs(config.timeout_secs))?,
    );

    let credentials = match config.resolve_api_key() {
        Some(api_key) => Credentials::ApiKey { api_key },
        None => Credentials::Anonymous,
    };

    Ok((provider, credentials))
}
