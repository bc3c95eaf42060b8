//! Gateway shared state and the registry of live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tutor_relay_agent::LlmStreamer;
use tutor_relay_core::config::Config;
use tutor_relay_providers::{Credentials, LlmProvider};

/// A live client session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub conn_id: String,
    pub connected_at: DateTime<Utc>,
    /// Cancelling this ends the session and closes its upstreams.
    pub shutdown: CancellationToken,
}

/// Shared state for the gateway server.
pub struct GatewayState {
    pub config: Arc<Config>,
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    pub sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl GatewayState {
    pub fn new(config: Config, provider: Arc<dyn LlmProvider>, credentials: Credentials) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            credentials,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Build state with the LLM provider named in the config.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let (provider, credentials) = tutor_relay_providers::from_config(&config.llm())?;
        info!(provider = provider.id(), model = %config.llm().model, "LLM provider ready");
        Ok(Self::new(config, provider, credentials))
    }

    /// A streamer sharing this gateway's provider.
    pub fn streamer(&self) -> LlmStreamer {
        LlmStreamer::new(
            self.provider.clone(),
            self.credentials.clone(),
            self.config.llm(),
            self.config.tutor(),
        )
    }

    pub async fn register(&self, conn_id: &str, shutdown: CancellationToken) {
        let entry = SessionEntry {
            conn_id: conn_id.to_string(),
            connected_at: Utc::now(),
            shutdown,
        };
        self.sessions.write().await.insert(conn_id.to_string(), entry);
    }

    pub async fn unregister(&self, conn_id: &str) -> Option<SessionEntry> {
        self.sessions.write().await.remove(conn_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// End every live session.
    pub async fn close_all(&self) {
        let sessions = self.sessions.read().await;
        for entry in sessions.values() {
            entry.shutdown.cancel();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Closing live sessions");
        }
    }
}
