//! Streaming speech recognition over a realtime WebSocket.
//!
//! One [`SttWorker`] task per session owns the upstream socket. Audio is sent
//! through an [`SttHandle`]; transcripts come back through the event sink.
//! After an unexpected close the worker stays disconnected until the next
//! audio frame arrives, buffering audio while the new connection opens.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::OptionFuture;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tutor_relay_core::config::SttConfig;
use tutor_relay_core::error::{Service, UpstreamError};
use tutor_relay_core::types::ProficiencyTier;

use crate::ws::{self, WsStream};

/// Voice-activity commit tuning for one proficiency tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadProfile {
    /// Silence after speech before the utterance is committed.
    pub silence_threshold_secs: f32,
    pub vad_threshold: f32,
    pub min_speech_duration_ms: u32,
    pub min_silence_duration_ms: u32,
}

impl VadProfile {
    /// Beginners get a long silence window to think; advanced speakers a
    /// short one so natural pauses in fast speech still commit promptly.
    pub fn for_tier(tier: ProficiencyTier) -> Self {
        let (silence_threshold_secs, min_speech_duration_ms) = match tier {
            ProficiencyTier::A1 => (2.0, 150),
            ProficiencyTier::A2 => (1.6, 150),
            ProficiencyTier::B1 => (1.2, 100),
            ProficiencyTier::B2 => (1.0, 100),
            ProficiencyTier::C1 => (0.8, 100),
            ProficiencyTier::C2 => (0.6, 100),
        };
        Self {
            silence_threshold_secs,
            vad_threshold: 0.4,
            min_speech_duration_ms,
            min_silence_duration_ms: 100,
        }
    }
}

/// Build the upstream URL with codec, language, and commit parameters.
pub fn build_stt_url(config: &SttConfig, profile: &VadProfile) -> String {
    format!(
        "{base}?model_id={model}&language_code={lang}&audio_format=pcm_{rate}\
         &commit_strategy=vad&vad_silence_threshold_secs={silence}&vad_threshold={threshold}\
         &min_speech_duration_ms={speech}&min_silence_duration_ms={min_silence}",
        base = config.url.trim_end_matches('/'),
        model = config.model,
        lang = config.language,
        rate = config.sample_rate,
        silence = profile.silence_threshold_secs,
        threshold = profile.vad_threshold,
        speech = profile.min_speech_duration_ms,
        min_silence = profile.min_silence_duration_ms,
    )
}

/// Recognition events, in upstream order.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// The upstream connection is open (first connect or reconnect).
    Connected,
    /// Provisional text, superseded by the next partial.
    Partial(String),
    /// Finalized utterance.
    Committed(String),
    /// The connection closed unexpectedly. The next audio frame reconnects.
    Disconnected { message: String },
    /// A connection attempt failed or the upstream reported an error.
    Error(UpstreamError),
}

/// Audio queued while no connection is open, bounded by byte count.
/// When full, the oldest frames are dropped first.
#[derive(Debug)]
pub struct AudioBuffer {
    frames: VecDeque<Vec<u8>>,
    bytes: usize,
    capacity: usize,
}

impl AudioBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            bytes: 0,
            capacity,
        }
    }

    /// Capacity for `buffer_ms` of 16-bit mono audio at `sample_rate`.
    pub fn for_duration(sample_rate: u32, buffer_ms: u64) -> Self {
        Self::new((sample_rate as u64 * 2 * buffer_ms / 1000) as usize)
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        self.bytes += frame.len();
        self.frames.push_back(frame);
        self.evict();
    }

    /// Put frames back at the front, ahead of anything queued since.
    pub fn restore(&mut self, frames: Vec<Vec<u8>>) {
        for frame in frames.into_iter().rev() {
            self.bytes += frame.len();
            self.frames.push_front(frame);
        }
        self.evict();
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.bytes = 0;
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn evict(&mut self) {
        let mut dropped = 0usize;
        while self.bytes > self.capacity {
            match self.frames.pop_front() {
                Some(frame) => {
                    self.bytes -= frame.len();
                    dropped += frame.len();
                }
                None => break,
            }
        }
        if dropped > 0 {
            debug!(dropped, "Audio buffer full; dropped oldest audio");
        }
    }
}

/// Handle for feeding audio to a running recognition worker.
///
/// Dropping the handle stops the worker and closes the upstream socket.
pub struct SttHandle {
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl SttHandle {
    /// Queue an audio frame. Returns false if the worker has stopped.
    pub fn send_audio(&self, frame: Vec<u8>) -> bool {
        self.audio_tx.send(frame).is_ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SttHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Deserialize)]
struct Incoming {
    message_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

type Connecting = Pin<Box<dyn Future<Output = Result<WsStream, UpstreamError>> + Send>>;

pub struct SttWorker<S> {
    config: SttConfig,
    url: String,
    api_key: Option<String>,
    buffer: AudioBuffer,
    last_partial: String,
    sink: S,
}

impl<S> SttWorker<S>
where
    S: Fn(SttEvent) + Send + Sync + 'static,
{
    /// Spawn a worker and start connecting immediately. `sink` receives
    /// every event; the first is `Connected` or `Error`.
    pub fn start(config: SttConfig, tier: ProficiencyTier, sink: S) -> SttHandle {
        let (audio_tx, audio_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let cancel = CancellationToken::new();

        let profile = VadProfile::for_tier(tier);
        let worker = Self {
            url: build_stt_url(&config, &profile),
            api_key: config.resolve_api_key(),
            buffer: AudioBuffer::for_duration(config.sample_rate, config.buffer_ms),
            last_partial: String::new(),
            config,
            sink,
        };

        let token = cancel.clone();
        tokio::spawn(async move {
            info!(%tier, silence_secs = profile.silence_threshold_secs, "Recognition worker started");
            worker.run(audio_rx, token).await;
            info!("Recognition worker ended");
        });

        SttHandle { audio_tx, cancel }
    }

    fn connect(&self) -> Connecting {
        let url = self.url.clone();
        let api_key = self.api_key.clone();
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        Box::pin(async move {
            ws::connect(Service::Recognition, &url, api_key.as_deref(), timeout).await
        })
    }

    async fn run(mut self, mut audio_rx: mpsc::UnboundedReceiver<Vec<u8>>, cancel: CancellationToken) {
        let mut socket: Option<WsStream> = None;
        let mut connecting: Option<Connecting> = Some(self.connect());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                frame = audio_rx.recv() => {
                    let Some(frame) = frame else { break };
                    match socket.as_mut() {
                        Some(ws) => {
                            if let Err(e) = self.send_frame(ws, &frame).await {
                                warn!(%e, "Recognition send failed");
                                socket = None;
                                self.buffer.push(frame);
                                (self.sink)(SttEvent::Disconnected { message: e.to_string() });
                                connecting = Some(self.connect());
                            }
                        }
                        None => {
                            self.buffer.push(frame);
                            if connecting.is_none() {
                                debug!(buffered = self.buffer.len_bytes(), "Audio arrived while disconnected; reconnecting");
                                connecting = Some(self.connect());
                            }
                        }
                    }
                }

                Some(result) = OptionFuture::from(connecting.as_mut()), if connecting.is_some() => {
                    connecting = None;
                    match result {
                        Ok(mut ws) => {
                            match self.flush(&mut ws).await {
                                Ok(flushed) => {
                                    info!(flushed, "Recognition connected");
                                    socket = Some(ws);
                                    (self.sink)(SttEvent::Connected);
                                }
                                Err(e) => {
                                    warn!(%e, "Recognition closed while flushing buffered audio");
                                    (self.sink)(SttEvent::Disconnected { message: e.to_string() });
                                }
                            }
                        }
                        Err(error) => {
                            warn!(%error, "Recognition connect failed");
                            self.buffer.clear();
                            (self.sink)(SttEvent::Error(error));
                        }
                    }
                }

                Some(message) = OptionFuture::from(socket.as_mut().map(|ws| ws.next())), if socket.is_some() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by upstream ({}): {}", f.code, f.reason))
                                .unwrap_or_else(|| "closed by upstream".into());
                            info!(%reason, "Recognition disconnected");
                            socket = None;
                            (self.sink)(SttEvent::Disconnected { message: reason });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%e, "Recognition socket error");
                            socket = None;
                            (self.sink)(SttEvent::Disconnected { message: e.to_string() });
                        }
                        None => {
                            socket = None;
                            (self.sink)(SttEvent::Disconnected { message: "connection ended".into() });
                        }
                    }
                }
            }
        }

        if let Some(mut ws) = socket {
            let _ = ws.close(None).await;
        }
    }

    async fn send_frame(&self, ws: &mut WsStream, frame: &[u8]) -> Result<(), UpstreamError> {
        let msg = json!({
            "message_type": "input_audio_chunk",
            "audio_base_64": BASE64.encode(frame),
            "commit": false,
            "sample_rate": self.config.sample_rate,
        });
        ws.send(Message::Text(msg.to_string().into()))
            .await
            .map_err(|e| UpstreamError::transport(Service::Recognition, e.to_string()))
    }

    /// Send buffered audio in arrival order. On failure the unsent frames go
    /// back into the buffer.
    async fn flush(&mut self, ws: &mut WsStream) -> Result<usize, UpstreamError> {
        let frames = self.buffer.drain();
        let total = frames.len();
        for (i, frame) in frames.iter().enumerate() {
            if let Err(e) = self.send_frame(ws, frame).await {
                self.buffer.restore(frames[i..].to_vec());
                return Err(e);
            }
        }
        Ok(total)
    }

    fn handle_text(&mut self, text: &str) {
        let incoming: Incoming = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                // Malformed upstream messages are skipped
                trace!(%e, "Unparseable recognition message");
                return;
            }
        };

        match incoming.message_type.as_str() {
            "partial_transcript" => {
                let partial = incoming.text.trim();
                if !partial.is_empty() {
                    self.last_partial = partial.to_string();
                    (self.sink)(SttEvent::Partial(partial.to_string()));
                }
            }
            "committed_transcript" | "committed_transcript_with_timestamps" => {
                let committed = incoming.text.trim();
                let text = if committed.is_empty() {
                    std::mem::take(&mut self.last_partial)
                } else {
                    self.last_partial.clear();
                    committed.to_string()
                };
                if text.is_empty() {
                    trace!("Empty commit with no partial; ignoring");
                } else {
                    if committed.is_empty() {
                        debug!(%text, "Empty commit; using last partial");
                    }
                    (self.sink)(SttEvent::Committed(text));
                }
            }
            "session_started" => debug!("Recognition session started"),
            other => {
                let detail = incoming
                    .error
                    .or(incoming.message)
                    .unwrap_or_else(|| other.to_string());
                let error = match other {
                    "quota_exceeded" | "rate_limited" | "queue_overflow" => {
                        UpstreamError::rate_limited(Service::Recognition, detail)
                    }
                    t if t.contains("error") => UpstreamError::protocol(Service::Recognition, detail),
                    _ => {
                        trace!(message_type = other, "Ignoring recognition message");
                        return;
                    }
                };
                warn!(%error, "Recognition upstream error");
                (self.sink)(SttEvent::Error(error));
            }
        }
    }
}
