//! Streaming speech synthesis over a multi-context WebSocket.
//!
//! Each text segment is synthesized in its own context so segments play back
//! independently and the first audio arrives while later text is still being
//! generated. The connection opens on demand and is retried with
//! [`RetryPolicy`]; once retries are exhausted for a turn, later segments of
//! that turn fail immediately.

use std::collections::HashSet;
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

use tutor_relay_core::config::TtsConfig;
use tutor_relay_core::error::{Service, UpstreamError};

use crate::retry::RetryPolicy;
use crate::ws::{self, WsStream};

/// A fresh synthesis context id.
pub fn new_context_id() -> String {
    format!("ctx-{}", uuid::Uuid::new_v4().simple())
}

/// Build the multi-context synthesis URL for the configured voice.
pub fn build_tts_url(config: &TtsConfig) -> String {
    format!(
        "{base}/{voice}/multi-stream-input?model_id={model}&output_format=pcm_{rate}",
        base = config.url.trim_end_matches('/'),
        voice = config.voice_id,
        model = config.model,
        rate = config.sample_rate,
    )
}

#[derive(Debug)]
pub enum TtsCommand {
    /// Synthesize one segment in its own context.
    Speak {
        turn: u64,
        context_id: String,
        text: String,
        is_final: bool,
    },
    /// Stop every open context.
    Cancel,
}

/// Synthesis events. Audio within one context arrives in upstream order.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    /// Raw 16-bit PCM at the configured sample rate.
    Audio { context_id: String, pcm: Vec<u8> },
    /// The upstream finished this context.
    ContextDone { context_id: String },
    /// These contexts will produce no (further) audio.
    Failed {
        context_ids: Vec<String>,
        error: UpstreamError,
    },
}

/// Handle for a running synthesis worker. Dropping it closes the socket.
pub struct TtsHandle {
    cmd_tx: mpsc::UnboundedSender<TtsCommand>,
    cancel: CancellationToken,
}

impl TtsHandle {
    pub fn speak(&self, turn: u64, context_id: String, text: String, is_final: bool) -> bool {
        self.cmd_tx
            .send(TtsCommand::Speak {
                turn,
                context_id,
                text,
                is_final,
            })
            .is_ok()
    }

    pub fn cancel_all(&self) {
        let _ = self.cmd_tx.send(TtsCommand::Cancel);
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TtsHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Incoming {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default, alias = "context_id")]
    context_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct TtsWorker<S> {
    config: TtsConfig,
    url: String,
    api_key: Option<String>,
    policy: RetryPolicy,
    /// Contexts sent upstream and not yet finished.
    open: HashSet<String>,
    /// Turn whose connection retries were exhausted.
    failed_turn: Option<(u64, UpstreamError)>,
    sink: S,
}

impl<S> TtsWorker<S>
where
    S: Fn(TtsEvent) + Send + Sync + 'static,
{
    pub fn start(config: TtsConfig, sink: S) -> TtsHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<TtsCommand>();
        let cancel = CancellationToken::new();

        let worker = Self {
            url: build_tts_url(&config),
            api_key: config.resolve_api_key(),
            policy: RetryPolicy::from_config(&config),
            open: HashSet::new(),
            failed_turn: None,
            config,
            sink,
        };

        let token = cancel.clone();
        tokio::spawn(async move {
            debug!(voice = %worker.config.voice_id, "Synthesis worker started");
            worker.run(cmd_rx, token).await;
            debug!("Synthesis worker ended");
        });

        TtsHandle { cmd_tx, cancel }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<TtsCommand>, cancel: CancellationToken) {
        let mut socket: Option<WsStream> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                cmd = cmd_rx.recv() => match cmd {
                    None => break,
                    Some(TtsCommand::Speak { turn, context_id, text, is_final }) => {
                        if socket.is_none() {
                            socket = tokio::select! {
                                _ = cancel.cancelled() => break,
                                ws = self.open_socket(turn) => ws,
                            };
                        }
                        let Some(ws) = socket.as_mut() else {
                            self.fail_turn_segment(turn, context_id);
                            continue;
                        };
                        if let Err(error) = self.send_segment(ws, &context_id, &text).await {
                            warn!(%error, %context_id, "Synthesis send failed");
                            socket = None;
                            let mut ids: Vec<String> = self.open.drain().collect();
                            ids.push(context_id);
                            (self.sink)(TtsEvent::Failed { context_ids: ids, error });
                            continue;
                        }
                        debug!(%context_id, turn, is_final, chars = text.chars().count(), "Synthesis context opened");
                        self.open.insert(context_id);
                    }
                    Some(TtsCommand::Cancel) => {
                        if let Some(ws) = socket.as_mut() {
                            self.close_contexts(ws).await;
                        } else {
                            self.open.clear();
                        }
                    }
                },

                Some(message) = OptionFuture::from(socket.as_mut().map(|ws| ws.next())), if socket.is_some() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Close(_))) | None => {
                            info!(open = self.open.len(), "Synthesis connection closed");
                            socket = None;
                            self.fail_open("connection closed by upstream");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%e, "Synthesis socket error");
                            socket = None;
                            self.fail_open(&e.to_string());
                        }
                    }
                }
            }
        }

        if let Some(mut ws) = socket {
            let _ = ws
                .send(Message::Text(json!({ "close_socket": true }).to_string().into()))
                .await;
            let _ = ws.close(None).await;
        }
    }

    /// Connect with retries, unless this turn has already given up.
    async fn open_socket(&mut self, turn: u64) -> Option<WsStream> {
        if matches!(&self.failed_turn, Some((t, _)) if *t == turn) {
            return None;
        }

        let url = self.url.clone();
        let api_key = self.api_key.clone();
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let result = self
            .policy
            .run(|attempt| {
                let url = url.clone();
                let api_key = api_key.clone();
                async move {
                    debug!(attempt, "Opening synthesis connection");
                    ws::connect(Service::Synthesis, &url, api_key.as_deref(), timeout).await
                }
            })
            .await;

        match result {
            Ok(ws) => {
                self.failed_turn = None;
                Some(ws)
            }
            Err(error) => {
                warn!(turn, %error, "Synthesis unavailable for the rest of this turn");
                self.failed_turn = Some((turn, error));
                None
            }
        }
    }

    fn fail_turn_segment(&self, turn: u64, context_id: String) {
        let error = match &self.failed_turn {
            Some((t, error)) if *t == turn => error.clone(),
            _ => UpstreamError::transport(Service::Synthesis, "no connection"),
        };
        (self.sink)(TtsEvent::Failed {
            context_ids: vec![context_id],
            error,
        });
    }

    fn fail_open(&mut self, reason: &str) {
        if self.open.is_empty() {
            return;
        }
        let context_ids: Vec<String> = self.open.drain().collect();
        (self.sink)(TtsEvent::Failed {
            context_ids,
            error: UpstreamError::transport(Service::Synthesis, reason),
        });
    }

    async fn send_segment(&self, ws: &mut WsStream, context_id: &str, text: &str) -> Result<(), UpstreamError> {
        // Trailing space lets the upstream treat the text as complete words
        let segment = json!({
            "text": format!("{} ", text.trim()),
            "context_id": context_id,
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0.8,
            },
        });
        let flush = json!({ "context_id": context_id, "flush": true });

        for msg in [segment, flush] {
            ws.send(Message::Text(msg.to_string().into()))
                .await
                .map_err(|e| UpstreamError::transport(Service::Synthesis, e.to_string()))?;
        }
        Ok(())
    }

    async fn close_contexts(&mut self, ws: &mut WsStream) {
        let ids: Vec<String> = self.open.drain().collect();
        for context_id in &ids {
            let msg = json!({ "context_id": context_id, "close_context": true });
            if let Err(e) = ws.send(Message::Text(msg.to_string().into())).await {
                warn!(%e, %context_id, "Failed to close synthesis context");
                break;
            }
        }
        if !ids.is_empty() {
            info!(closed = ids.len(), "Cancelled synthesis contexts");
        }
    }

    fn handle_text(&mut self, text: &str) {
        let incoming: Incoming = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                trace!(%e, "Unparseable synthesis message");
                return;
            }
        };

        let Some(context_id) = incoming.context_id else {
            if let Some(error) = incoming.error {
                warn!(%error, "Synthesis upstream error without context");
            }
            return;
        };

        // Late messages for cancelled contexts are dropped
        if !self.open.contains(&context_id) {
            trace!(%context_id, "Message for unknown synthesis context");
            return;
        }

        if let Some(error) = incoming.error {
            self.open.remove(&context_id);
            (self.sink)(TtsEvent::Failed {
                context_ids: vec![context_id],
                error: UpstreamError::protocol(Service::Synthesis, error),
            });
            return;
        }

        if let Some(audio) = incoming.audio.filter(|a| !a.is_empty()) {
            match BASE64.decode(audio.as_bytes()) {
                Ok(pcm) => (self.sink)(TtsEvent::Audio {
                    context_id: context_id.clone(),
                    pcm,
                }),
                Err(e) => warn!(%e, %context_id, "Undecodable synthesis audio"),
            }
        }

        if incoming.is_final == Some(true) {
            self.open.remove(&context_id);
            (self.sink)(TtsEvent::ContextDone { context_id });
        }
    }
}

/// Per-turn bookkeeping of in-flight synthesis contexts.
///
/// "All delivered" fires exactly once per turn: when generation has finished
/// and every context that was begun has finished, failed, or been abandoned.
#[derive(Debug, Default)]
pub struct SynthesisTracker {
    turn: u64,
    active: HashSet<String>,
    issued: u32,
    generation_done: bool,
    delivered: bool,
}

impl SynthesisTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new turn.
    pub fn start_turn(&mut self, turn: u64) {
        self.turn = turn;
        self.active.clear();
        self.issued = 0;
        self.generation_done = false;
        self.delivered = false;
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// A context was handed to synthesis. Returns its ordinal in the turn.
    pub fn begin(&mut self, context_id: impl Into<String>) -> u32 {
        self.active.insert(context_id.into());
        self.issued += 1;
        self.issued - 1
    }

    pub fn is_tracking(&self, context_id: &str) -> bool {
        self.active.contains(context_id)
    }

    /// A context finished or failed. Returns true if this completes the turn.
    pub fn finish(&mut self, context_id: &str) -> bool {
        if !self.active.remove(context_id) {
            return false;
        }
        self.check_delivered()
    }

    /// Generation produced its last segment. Returns true if nothing is
    /// still in flight, which completes the turn.
    pub fn generation_complete(&mut self) -> bool {
        self.generation_done = true;
        self.check_delivered()
    }

    /// Drop all bookkeeping for this turn without firing "all delivered".
    /// Returns the contexts that were still active.
    pub fn abandon(&mut self) -> Vec<String> {
        self.generation_done = true;
        self.delivered = true;
        self.active.drain().collect()
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Contexts still in flight, sorted.
    pub fn active_contexts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn issued(&self) -> u32 {
        self.issued
    }

    fn check_delivered(&mut self) -> bool {
        if self.generation_done && self.active.is_empty() && !self.delivered {
            self.delivered = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_shape() {
        let config = TtsConfig::default();
        let url = build_tts_url(&config);
        assert!(url.contains(&format!("/{}/multi-stream-input", config.voice_id)));
        assert!(url.ends_with("output_format=pcm_24000"));
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = new_context_id();
        let b = new_context_id();
        assert_ne!(a, b);
        assert!(a.starts_with("ctx-"));
    }

    #[test]
    fn test_tracker_fires_once_after_generation_and_last_context() {
        let mut tracker = SynthesisTracker::new();
        tracker.start_turn(1);
        assert_eq!(tracker.begin("a"), 0);
        assert_eq!(tracker.begin("b"), 1);

        assert!(!tracker.finish("a"));
        assert!(!tracker.generation_complete());
        assert!(tracker.finish("b"));
        assert_eq!(tracker.active(), 0);

        // Duplicate or unknown completions never fire again
        assert!(!tracker.finish("b"));
        assert!(!tracker.finish("zzz"));
        assert!(!tracker.generation_complete());
    }

    #[test]
    fn test_tracker_contexts_done_before_generation() {
        let mut tracker = SynthesisTracker::new();
        tracker.start_turn(7);
        tracker.begin("a");
        assert!(!tracker.finish("a"));
        assert!(tracker.generation_complete());
        assert_eq!(tracker.turn(), 7);
    }

    #[test]
    fn test_tracker_abandon_never_fires() {
        let mut tracker = SynthesisTracker::new();
        tracker.start_turn(2);
        tracker.begin("a");
        tracker.begin("b");
        let mut abandoned = tracker.abandon();
        abandoned.sort();
        assert_eq!(abandoned, vec!["a", "b"]);
        assert!(!tracker.is_tracking("a"));
        assert!(!tracker.finish("a"));
        assert!(!tracker.generation_complete());

        // Next turn starts clean
        tracker.start_turn(3);
        tracker.begin("c");
        assert!(tracker.is_tracking("c"));
        assert!(!tracker.generation_complete());
        assert!(tracker.finish("c"));
    }

    fn worker() -> (TtsWorker<impl Fn(TtsEvent) + Send + Sync + 'static>, std::sync::mpsc::Receiver<TtsEvent>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let config = TtsConfig::default();
        let worker = TtsWorker {
            url: String::new(),
            api_key: None,
            policy: RetryPolicy::default(),
            open: HashSet::new(),
            failed_turn: None,
            config,
            sink: move |event| {
                let _ = tx.send(event);
            },
        };
        (worker, rx)
    }

    #[test]
    fn test_audio_and_final_for_open_context() {
        let (mut worker, rx) = worker();
        worker.open.insert("ctx-1".into());
        let audio = BASE64.encode([1u8, 2, 3, 4]);

        worker.handle_text(&json!({"audio": audio, "contextId": "ctx-1"}).to_string());
        worker.handle_text(&json!({"isFinal": true, "contextId": "ctx-1"}).to_string());
        // Late message after completion is dropped
        worker.handle_text(&json!({"audio": audio, "contextId": "ctx-1"}).to_string());

        let events: Vec<TtsEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                TtsEvent::Audio {
                    context_id: "ctx-1".into(),
                    pcm: vec![1, 2, 3, 4]
                },
                TtsEvent::ContextDone {
                    context_id: "ctx-1".into()
                },
            ]
        );
        assert!(worker.open.is_empty());
    }

    #[test]
    fn test_snake_case_context_and_noise() {
        let (mut worker, rx) = worker();
        worker.open.insert("ctx-2".into());
        worker.handle_text("garbage");
        worker.handle_text(&json!({"audio": "", "context_id": "ctx-2"}).to_string());
        worker.handle_text(&json!({"isFinal": true, "context_id": "ctx-2"}).to_string());
        let events: Vec<TtsEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![TtsEvent::ContextDone {
                context_id: "ctx-2".into()
            }]
        );
    }

    #[test]
    fn test_failed_turn_fails_segment_immediately() {
        let (mut worker, rx) = worker();
        let error = UpstreamError::rate_limited(Service::Synthesis, "429");
        worker.failed_turn = Some((4, error.clone()));
        worker.fail_turn_segment(4, "ctx-9".into());
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![TtsEvent::Failed {
                context_ids: vec!["ctx-9".into()],
                error
            }]
        );
        worker.open.insert("x".into());
        worker.fail_open("closed");
        assert!(worker.open.is_empty());
    }
}
