//! Per-connection tutoring session.
//!
//! A session owns its recognition and synthesis workers and at most one
//! generation task. Client messages, microphone audio, and upstream events all
//! arrive on a single queue and are handled in order by one task, so session
//! state has exactly one writer.
//!
//! ```text
//! Idle --setup--> Configuring --ready--> Listening --commit--> Generating
//!                                           ^                      |
//!                                           +--- audio_done --- Speaking
//! ```
//!
//! `pause` moves any ready phase to `Paused` and cancels the turn in flight;
//! `resume` returns to `Listening`. Microphone audio reaches recognition only
//! while `Listening`, which keeps the tutor's own voice out of the transcript.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::OptionFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tutor_relay_agent::{GenerationEvent, LlmStreamer, Turn};
use tutor_relay_core::config::{Config, SttConfig};
use tutor_relay_core::error::{Service, UpstreamError};
use tutor_relay_core::protocol::{ClientMessage, ScenarioSpec, ServerEvent};
use tutor_relay_core::types::{HistoryEntry, ProficiencyTier, Scenario};
use tutor_relay_media::stt::{SttEvent, SttHandle, SttWorker};
use tutor_relay_media::tts::{SynthesisTracker, TtsEvent, TtsHandle, TtsWorker, new_context_id};
use tutor_relay_media::wav;

const MIN_SPEECH_RATE: f32 = 0.5;
const MAX_SPEECH_RATE: f32 = 2.0;

/// Everything a session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Client(ClientMessage),
    /// Raw microphone PCM.
    Audio(Vec<u8>),
    /// Recognition event from the worker started by setup number `epoch`.
    Stt { epoch: u64, event: SttEvent },
    Tts(TtsEvent),
    Generation { turn: u64, event: GenerationEvent },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No scenario yet.
    Idle,
    /// Waiting for recognition to connect after setup.
    Configuring,
    Listening,
    Generating,
    /// Generation finished; synthesis contexts still in flight.
    Speaking,
    Paused,
}

impl Phase {
    /// Whether a turn is in progress.
    pub fn in_turn(self) -> bool {
        matches!(self, Phase::Generating | Phase::Speaking)
    }
}

/// Handle for a running session. Dropping it ends the session.
pub struct SessionHandle {
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// Queue an event. Returns false once the session has ended.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.events_tx.send(event).is_ok()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resolves when the session ends, whichever side ended it.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bookkeeping for the turn in progress.
#[derive(Debug)]
struct TurnState {
    user_text: String,
    started: Instant,
    transcript_ms: u64,
    first_text_ms: Option<u64>,
    first_audio_ms: Option<u64>,
    synthesis_failed: bool,
}

impl TurnState {
    fn new(user_text: String, transcript_ms: u64) -> Self {
        Self {
            user_text,
            started: Instant::now(),
            transcript_ms,
            first_text_ms: None,
            first_audio_ms: None,
            synthesis_failed: false,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

pub struct Session {
    conn_id: String,
    stt_config: SttConfig,
    tts_sample_rate: u32,
    setup_timeout: Duration,
    streamer: LlmStreamer,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    out: mpsc::UnboundedSender<ServerEvent>,

    phase: Phase,
    tier: ProficiencyTier,
    scenario: Option<Scenario>,
    history: Vec<HistoryEntry>,
    speech_rate: f32,

    stt: Option<SttHandle>,
    stt_epoch: u64,
    setup_deadline: Option<tokio::time::Instant>,
    listening_since: Instant,

    tts: TtsHandle,
    tracker: SynthesisTracker,
    turn: u64,
    turn_state: Option<TurnState>,
    generation: Option<JoinHandle<()>>,
}

impl Session {
    /// Start a session. Server events for the client are written to `out`;
    /// when the session ends, `out` is dropped.
    pub fn spawn(
        conn_id: String,
        config: &Config,
        streamer: LlmStreamer,
        out: mpsc::UnboundedSender<ServerEvent>,
    ) -> SessionHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let session = Self::new(conn_id, config, streamer, events_tx.clone(), out);
        let token = shutdown.clone();
        tokio::spawn(async move {
            session.run(events_rx, token).await;
        });

        SessionHandle {
            events_tx,
            shutdown,
        }
    }

    fn new(
        conn_id: String,
        config: &Config,
        streamer: LlmStreamer,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        out: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        let tts_config = config.tts();
        let tts_sample_rate = tts_config.sample_rate;
        let tts_tx = events_tx.clone();
        let tts = TtsWorker::start(tts_config, move |event| {
            let _ = tts_tx.send(SessionEvent::Tts(event));
        });

        Self {
            conn_id,
            stt_config: config.stt(),
            tts_sample_rate,
            setup_timeout: Duration::from_secs(config.gateway().setup_timeout_secs),
            streamer,
            events_tx,
            out,
            phase: Phase::Idle,
            tier: ProficiencyTier::default(),
            scenario: None,
            history: Vec::new(),
            speech_rate: 1.0,
            stt: None,
            stt_epoch: 0,
            setup_deadline: None,
            listening_since: Instant::now(),
            tts,
            tracker: SynthesisTracker::new(),
            turn: 0,
            turn_state: None,
            generation: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<SessionEvent>, shutdown: CancellationToken) {
        // The connection watches this token to learn that the session ended
        let _guard = shutdown.clone().drop_guard();
        info!(conn_id = %self.conn_id, "Session started");

        loop {
            let deadline = OptionFuture::from(self.setup_deadline.map(tokio::time::sleep_until));

            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = deadline, if self.setup_deadline.is_some() => {
                    warn!(conn_id = %self.conn_id, timeout_secs = self.setup_timeout.as_secs(), "Setup timed out");
                    self.send(ServerEvent::error("Speech recognition did not become ready in time"));
                    break;
                }

                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    if self.handle(event).is_break() {
                        break;
                    }
                }
            }
        }

        self.teardown();
        info!(conn_id = %self.conn_id, turns = self.turn, "Session ended");
    }

    /// Handle one event. `Break` ends the session.
    pub fn handle(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::Client(message) => self.on_client(message),
            SessionEvent::Audio(frame) => self.forward_audio(frame),
            SessionEvent::Stt { epoch, event } => return self.on_recognition(epoch, event),
            SessionEvent::Tts(event) => self.on_synthesis(event),
            SessionEvent::Generation { turn, event } => self.on_generation(turn, event),
        }
        ControlFlow::Continue(())
    }

    fn send(&self, event: ServerEvent) {
        trace!(conn_id = %self.conn_id, event = event.name(), "Sending event");
        let _ = self.out.send(event);
    }

    // -- Client --

    fn on_client(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Setup {
                scenario,
                proficiency_tier,
            } => self.setup(scenario, proficiency_tier),
            ClientMessage::Config { speech_rate } => {
                self.speech_rate = clamp_speech_rate(speech_rate, self.speech_rate);
                debug!(conn_id = %self.conn_id, speech_rate = self.speech_rate, "Speech rate updated");
            }
            ClientMessage::Pause => self.pause(),
            ClientMessage::Resume => self.resume(),
        }
    }

    fn setup(&mut self, scenario: ScenarioSpec, tier: ProficiencyTier) {
        if self.phase.in_turn() {
            self.cancel_turn();
        }

        let scenario = Scenario::from(scenario);
        info!(conn_id = %self.conn_id, scenario = %scenario.kind, %tier, "Session setup");

        self.history.clear();
        self.scenario = Some(scenario);
        self.tier = tier;

        // Replacing the handle stops the previous worker; its late events
        // carry the old epoch and are ignored.
        self.stt_epoch += 1;
        let epoch = self.stt_epoch;
        let tx = self.events_tx.clone();
        self.stt = Some(SttWorker::start(self.stt_config.clone(), tier, move |event| {
            let _ = tx.send(SessionEvent::Stt { epoch, event });
        }));

        self.phase = Phase::Configuring;
        self.setup_deadline = Some(tokio::time::Instant::now() + self.setup_timeout);
    }

    fn pause(&mut self) {
        match self.phase {
            Phase::Listening | Phase::Generating | Phase::Speaking => {
                if self.phase.in_turn() {
                    self.cancel_turn();
                }
                self.phase = Phase::Paused;
                info!(conn_id = %self.conn_id, "Session paused");
            }
            Phase::Paused => debug!(conn_id = %self.conn_id, "Already paused"),
            Phase::Idle | Phase::Configuring => {
                debug!(conn_id = %self.conn_id, phase = ?self.phase, "Pause before ready ignored")
            }
        }
    }

    fn resume(&mut self) {
        if self.phase == Phase::Paused {
            self.enter_listening();
            info!(conn_id = %self.conn_id, "Session resumed");
        } else {
            debug!(conn_id = %self.conn_id, phase = ?self.phase, "Resume ignored");
        }
    }

    fn forward_audio(&mut self, frame: Vec<u8>) {
        if frame.is_empty() {
            return;
        }
        if self.phase != Phase::Listening {
            trace!(conn_id = %self.conn_id, phase = ?self.phase, bytes = frame.len(), "Dropping audio");
            return;
        }
        if let Some(stt) = &self.stt {
            if !stt.send_audio(frame) {
                warn!(conn_id = %self.conn_id, "Recognition worker has stopped");
            }
        }
    }

    // -- Recognition --

    fn on_recognition(&mut self, epoch: u64, event: SttEvent) -> ControlFlow<()> {
        if epoch != self.stt_epoch {
            trace!(conn_id = %self.conn_id, epoch, "Ignoring event from replaced recognition worker");
            return ControlFlow::Continue(());
        }

        match event {
            SttEvent::Connected => {
                if self.phase == Phase::Configuring {
                    self.setup_deadline = None;
                    self.enter_listening();
                    self.send(ServerEvent::Ready);
                    info!(conn_id = %self.conn_id, "Session ready");
                } else {
                    debug!(conn_id = %self.conn_id, "Recognition reconnected");
                }
            }
            SttEvent::Partial(text) => {
                if self.phase == Phase::Listening && !text.is_empty() {
                    self.send(ServerEvent::Transcript {
                        text,
                        is_final: false,
                    });
                }
            }
            SttEvent::Committed(text) => self.on_committed(text),
            SttEvent::Disconnected { message } => {
                self.send(ServerEvent::SttDisconnected { message });
            }
            SttEvent::Error(error) => {
                record_upstream_error(&error);
                if self.phase == Phase::Configuring {
                    warn!(conn_id = %self.conn_id, %error, "Recognition setup failed");
                    self.send(ServerEvent::error(client_message(&error)));
                    return ControlFlow::Break(());
                }
                warn!(conn_id = %self.conn_id, %error, "Recognition error");
                self.send(ServerEvent::error(client_message(&error)));
                // A turn in flight gets back to Listening when it completes
                if self.phase == Phase::Paused {
                    self.enter_listening();
                    info!(conn_id = %self.conn_id, "Session resumed after recognition error");
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn on_committed(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if self.phase != Phase::Listening {
            debug!(conn_id = %self.conn_id, phase = ?self.phase, "Ignoring transcript while not listening");
            return;
        }
        let Some(scenario) = self.scenario.clone() else {
            return;
        };

        self.send(ServerEvent::Transcript {
            text: text.clone(),
            is_final: true,
        });

        // Stop listening before generation so the tutor never hears itself
        self.phase = Phase::Generating;
        self.turn += 1;
        self.tracker.start_turn(self.turn);
        let transcript_ms = self.listening_since.elapsed().as_millis() as u64;
        self.turn_state = Some(TurnState::new(text.clone(), transcript_ms));

        #[cfg(feature = "metrics")]
        crate::metrics::record_turn();

        info!(conn_id = %self.conn_id, turn = self.turn, chars = text.chars().count(), "Turn started");

        let turn = Turn {
            scenario,
            tier: self.tier,
            history: self.history.clone(),
            user_text: text,
        };
        let streamer = self.streamer.clone();
        let tx = self.events_tx.clone();
        let turn_id = self.turn;
        self.generation = Some(tokio::spawn(async move {
            streamer
                .run(turn, move |event| {
                    let _ = tx.send(SessionEvent::Generation { turn: turn_id, event });
                })
                .await;
        }));
    }

    // -- Generation --

    fn on_generation(&mut self, turn: u64, event: GenerationEvent) {
        if turn != self.turn || !self.phase.in_turn() {
            trace!(conn_id = %self.conn_id, turn, "Ignoring stale generation event");
            return;
        }

        match event {
            GenerationEvent::Fragment { text, full_text } => {
                if let Some(state) = self.turn_state.as_mut() {
                    if state.first_text_ms.is_none() {
                        state.first_text_ms = Some(state.elapsed_ms());
                    }
                }
                self.send(ServerEvent::TutorText { text, full_text });
            }
            GenerationEvent::Segment {
                text,
                ordinal,
                is_final,
            } => {
                let context_id = new_context_id();
                self.tracker.begin(context_id.clone());
                debug!(conn_id = %self.conn_id, turn, %context_id, ordinal, is_final, "Synthesizing segment");
                if !self.tts.speak(turn, context_id.clone(), text, is_final) {
                    warn!(conn_id = %self.conn_id, %context_id, "Synthesis worker has stopped");
                    self.tracker.finish(&context_id);
                }
            }
            GenerationEvent::Finished { response, fallback } => {
                self.generation = None;
                if let Some(state) = &self.turn_state {
                    self.history.push(HistoryEntry::user(state.user_text.clone()));
                }
                self.history.push(HistoryEntry::assistant(response.text.clone()));
                debug!(conn_id = %self.conn_id, turn, fallback, history = self.history.len(), "Generation complete");

                self.send(ServerEvent::TutorResponse { response });
                self.phase = Phase::Speaking;
                if self.tracker.generation_complete() {
                    self.complete_turn();
                }
            }
            GenerationEvent::Failed { error } => {
                self.generation = None;
                record_upstream_error(&error);
                warn!(conn_id = %self.conn_id, turn, %error, "Generation failed");
                self.send(ServerEvent::error(client_message(&error)));

                let issued = self.tracker.issued() > 0;
                self.tts.cancel_all();
                self.tracker.abandon();
                if issued {
                    self.send(ServerEvent::AudioDone);
                }
                self.turn_state = None;
                self.enter_listening();
            }
        }
    }

    // -- Synthesis --

    fn on_synthesis(&mut self, event: TtsEvent) {
        match event {
            TtsEvent::Audio { context_id, pcm } => {
                if !self.tracker.is_tracking(&context_id) {
                    trace!(conn_id = %self.conn_id, %context_id, "Dropping audio for finished context");
                    return;
                }
                if let Some(state) = self.turn_state.as_mut() {
                    if state.first_audio_ms.is_none() {
                        let ms = state.elapsed_ms();
                        state.first_audio_ms = Some(ms);
                        #[cfg(feature = "metrics")]
                        crate::metrics::record_first_audio(ms as f64 / 1000.0);
                    }
                }
                let data = BASE64.encode(wav::frame_pcm(&pcm, self.tts_sample_rate, 1));
                self.send(ServerEvent::Audio { data, context_id });
            }
            TtsEvent::ContextDone { context_id } => {
                if self.tracker.finish(&context_id) {
                    self.complete_turn();
                }
            }
            TtsEvent::Failed { context_ids, error } => {
                let failed: Vec<String> = context_ids
                    .into_iter()
                    .filter(|id| self.tracker.is_tracking(id))
                    .collect();
                if failed.is_empty() {
                    return;
                }

                record_upstream_error(&error);
                warn!(conn_id = %self.conn_id, turn = self.turn, contexts = failed.len(), %error, "Synthesis failed");

                // One error per turn, however many segments it takes down
                let first_failure = self
                    .turn_state
                    .as_mut()
                    .map(|state| !std::mem::replace(&mut state.synthesis_failed, true))
                    .unwrap_or(false);
                if first_failure {
                    self.send(ServerEvent::error(client_message(&error)));
                }

                let mut delivered = false;
                for id in &failed {
                    delivered |= self.tracker.finish(id);
                }
                if delivered {
                    self.complete_turn();
                }
            }
        }
    }

    // -- Transitions --

    fn enter_listening(&mut self) {
        self.phase = Phase::Listening;
        self.listening_since = Instant::now();
    }

    /// All audio for the turn has been delivered (or has failed).
    fn complete_turn(&mut self) {
        self.send(ServerEvent::AudioDone);
        if let Some(state) = self.turn_state.take() {
            info!(
                conn_id = %self.conn_id,
                turn = self.turn,
                segments = self.tracker.issued(),
                transcript_ms = state.transcript_ms,
                first_text_ms = state.first_text_ms,
                first_audio_ms = state.first_audio_ms,
                total_ms = state.elapsed_ms(),
                synthesis_failed = state.synthesis_failed,
                "Turn complete"
            );
        }
        self.enter_listening();
    }

    /// Abort the turn in flight without reporting completion.
    fn cancel_turn(&mut self) {
        if let Some(task) = self.generation.take() {
            task.abort();
        }
        self.tts.cancel_all();
        let abandoned = self.tracker.abandon();
        debug!(conn_id = %self.conn_id, turn = self.turn, contexts = abandoned.len(), "Turn cancelled");
        self.turn_state = None;
    }

    fn teardown(&mut self) {
        if let Some(task) = self.generation.take() {
            task.abort();
        }
        if let Some(stt) = self.stt.take() {
            stt.close();
        }
        self.tts.close();
    }
}

/// Keep the advisory speech rate within playable bounds.
fn clamp_speech_rate(requested: f32, current: f32) -> f32 {
    if requested.is_finite() {
        requested.clamp(MIN_SPEECH_RATE, MAX_SPEECH_RATE)
    } else {
        current
    }
}

/// The text shown to the learner for an upstream failure.
fn client_message(error: &UpstreamError) -> String {
    let what = match error.service() {
        Service::Recognition => "Speech recognition",
        Service::Generation => "The tutor",
        Service::Synthesis => "The tutor's voice",
    };
    match error {
        UpstreamError::RateLimited { .. } => {
            format!("{what} is busy right now. Please try again in a moment.")
        }
        UpstreamError::Timeout { .. } => format!("{what} took too long to respond."),
        _ => format!("{what} is unavailable right now."),
    }
}

fn record_upstream_error(error: &UpstreamError) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_upstream_error(&error.service().to_string(), error.kind());
    #[cfg(not(feature = "metrics"))]
    let _ = error;
}
