//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level relay configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<SttConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tutor: Option<TutorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// How long a session may take to get its recognition upstream ready.
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            setup_timeout_secs: default_setup_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    8787
}

fn default_setup_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "tutor_relay_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Streaming speech-recognition upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_url")]
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_stt_model")]
    pub model: String,

    /// Recognition language code (e.g. "es").
    #[serde(default = "default_language")]
    pub language: String,

    /// Sample rate of the client's microphone PCM.
    #[serde(default = "default_stt_sample_rate")]
    pub sample_rate: u32,

    /// How much audio to hold while reconnecting, in milliseconds.
    #[serde(default = "default_buffer_ms")]
    pub buffer_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: default_stt_url(),
            api_key: None,
            api_key_env: Some("ELEVENLABS_API_KEY".into()),
            model: default_stt_model(),
            language: default_language(),
            sample_rate: default_stt_sample_rate(),
            buffer_ms: default_buffer_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl SttConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

fn default_stt_url() -> String {
    "wss://api.elevenlabs.io/v1/speech-to-text/realtime".into()
}

fn default_stt_model() -> String {
    "scribe_v2_realtime".into()
}

fn default_language() -> String {
    "es".into()
}

fn default_stt_sample_rate() -> u32 {
    16_000
}

fn default_buffer_ms() -> u64 {
    2_000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Streaming language-model upstream (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "openai" (default), "openrouter", or "ollama".
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Bound on connecting, on the first response, and on each gap between
    /// streamed chunks.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: None,
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            temperature: Some(0.7),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

fn default_llm_provider() -> String {
    "openai".into()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}

fn default_llm_timeout_secs() -> u64 {
    10
}

fn default_max_tokens() -> u32 {
    400
}

/// Streaming speech-synthesis upstream (multi-context WebSocket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Base WebSocket URL; the voice path is appended.
    #[serde(default = "default_tts_url")]
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_voice_id")]
    pub voice_id: String,

    #[serde(default = "default_tts_model")]
    pub model: String,

    /// Sample rate of the PCM the upstream returns.
    #[serde(default = "default_tts_sample_rate")]
    pub sample_rate: u32,

    /// Connection attempts per turn before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear backoff step between attempts, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            api_key: None,
            api_key_env: Some("ELEVENLABS_API_KEY".into()),
            voice_id: default_voice_id(),
            model: default_tts_model(),
            sample_rate: default_tts_sample_rate(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

fn default_tts_url() -> String {
    "wss://api.elevenlabs.io/v1/text-to-speech".into()
}

fn default_voice_id() -> String {
    "21m00Tcm4TlvDq8ikWAM".into()
}

fn default_tts_model() -> String {
    "eleven_flash_v2_5".into()
}

fn default_tts_sample_rate() -> u32 {
    24_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

/// Tutoring behaviour shared by every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TutorConfig {
    /// Token separating spoken text from the trailing metadata object.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Said when generation produces no spoken text.
    #[serde(default = "default_fallback_utterance")]
    pub fallback_utterance: String,

    #[serde(default = "default_target_language")]
    pub target_language: String,

    #[serde(default = "default_native_language")]
    pub native_language: String,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            fallback_utterance: default_fallback_utterance(),
            target_language: default_target_language(),
            native_language: default_native_language(),
        }
    }
}

fn default_delimiter() -> String {
    "|||".into()
}

fn default_fallback_utterance() -> String {
    "Perdona, no te he entendido bien. ¿Puedes repetirlo?".into()
}

fn default_target_language() -> String {
    "Spanish".into()
}

fn default_native_language() -> String {
    "English".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    static ENV_REF: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ENV_REF.get_or_init(|| {
        regex::Regex::new(r"\$\{([^}]+)\}").expect("env reference pattern is valid")
    });
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))
    }

    /// Default config file path: `~/.tutor_relay/config.json`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway(&self) -> GatewayConfig {
        self.gateway.clone().unwrap_or_default()
    }

    pub fn stt(&self) -> SttConfig {
        self.stt.clone().unwrap_or_default()
    }

    pub fn llm(&self) -> LlmConfig {
        self.llm.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn tutor(&self) -> TutorConfig {
        self.tutor.clone().unwrap_or_default()
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn bind_address(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.stt().resolve_api_key().is_none() {
            warnings.push("Speech recognition has no API key configured".to_string());
        }
        let llm = self.llm();
        if llm.provider != "ollama" && llm.resolve_api_key().is_none() {
            warnings.push(format!("LLM provider '{}' has no API key configured", llm.provider));
        }
        if !matches!(llm.provider.as_str(), "openai" | "openrouter" | "ollama") {
            errors.push(format!("Unknown LLM provider: {}", llm.provider));
        }
        if llm.timeout_secs == 0 {
            errors.push("llm.timeout_secs must be positive".to_string());
        }

        let tts = self.tts();
        if tts.resolve_api_key().is_none() {
            warnings.push("Speech synthesis has no API key configured".to_string());
        }
        if tts.max_attempts == 0 {
            errors.push("tts.max_attempts must be at least 1".to_string());
        }

        if self.tutor().delimiter.trim().is_empty() {
            errors.push("tutor.delimiter cannot be empty".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if gw.setup_timeout_secs == 0 {
                errors.push("gateway.setup_timeout_secs must be positive".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for relay data: `~/.tutor_relay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tutor_relay")
}
