//! One generation turn: request, stream, segment, finish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use tutor_relay_core::config::{LlmConfig, TutorConfig};
use tutor_relay_core::error::{Service, UpstreamError};
use tutor_relay_core::types::{HistoryEntry, ProficiencyTier, Scenario, TutorResponse};
use tutor_relay_providers::{CompletionRequest, Credentials, LlmProvider};

use crate::prompt::build_tutor_instructions;
use crate::segmenter::{SentenceChunker, TextSegmenter};
use crate::transcript::history_to_messages;

/// Everything one generation turn needs, owned so it can move into a task.
#[derive(Debug, Clone)]
pub struct Turn {
    pub scenario: Scenario,
    pub tier: ProficiencyTier,
    pub history: Vec<HistoryEntry>,
    pub user_text: String,
}

/// Progress of a generation turn, in the order it happens.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// New spoken text; `full_text` is everything spoken so far.
    Fragment { text: String, full_text: String },

    /// A sentence ready for synthesis.
    Segment {
        text: String,
        ordinal: u32,
        is_final: bool,
    },

    /// The reply is complete.
    Finished {
        response: TutorResponse,
        /// The model produced no speech and the fallback utterance was used.
        fallback: bool,
    },

    /// The turn failed; nothing further follows.
    Failed { error: UpstreamError },
}

/// Streams tutor replies from the configured LLM.
#[derive(Clone)]
pub struct LlmStreamer {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    llm: LlmConfig,
    tutor: TutorConfig,
}

impl LlmStreamer {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        credentials: Credentials,
        llm: LlmConfig,
        tutor: TutorConfig,
    ) -> Self {
        Self {
            provider,
            credentials,
            llm,
            tutor,
        }
    }

    pub fn build_request(&self, turn: &Turn) -> CompletionRequest {
        CompletionRequest {
            model: self.llm.model.clone(),
            messages: history_to_messages(&turn.history, &turn.user_text),
            max_tokens: self.llm.max_tokens,
            temperature: self.llm.temperature,
            system: Some(build_tutor_instructions(&turn.scenario, turn.tier, &self.tutor)),
        }
    }

    /// Run one turn, reporting progress through `emit`. Always ends with
    /// exactly one `Finished` or `Failed`.
    pub async fn run<F>(&self, turn: Turn, mut emit: F)
    where
        F: FnMut(GenerationEvent) + Send,
    {
        let start = Instant::now();
        let request = self.build_request(&turn);
        let limit = Duration::from_secs(self.llm.timeout_secs);

        let stream = match tokio::time::timeout(limit, self.provider.stream(&request, &self.credentials)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                let error = classify(e);
                warn!(provider = self.provider.id(), %error, "Generation request failed");
                emit(GenerationEvent::Failed { error });
                return;
            }
            Err(_) => {
                let error = self.timed_out();
                warn!(provider = self.provider.id(), %error, "Generation request stalled");
                emit(GenerationEvent::Failed { error });
                return;
            }
        };

        let mut stream = std::pin::pin!(stream);
        let mut segmenter = TextSegmenter::new(self.tutor.delimiter.as_str());
        let mut chunker = SentenceChunker::new();
        let mut full_text = String::new();
        let mut ordinal = 0u32;
        let mut first_text_ms = None;

        loop {
            let chunk_result = match tokio::time::timeout(limit, stream.next()).await {
                Ok(Some(result)) => result,
                Ok(None) => break,
                Err(_) => {
                    let error = self.timed_out();
                    warn!(%error, spoken = full_text.len(), "Generation stream stalled");
                    emit(GenerationEvent::Failed { error });
                    return;
                }
            };
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(e) => {
                    let error = classify(e);
                    warn!(%error, spoken = full_text.len(), "Generation stream failed");
                    emit(GenerationEvent::Failed { error });
                    return;
                }
            };

            if let Some(usage) = chunk.usage {
                debug!(
                    input_tokens = ?usage.input_tokens,
                    output_tokens = ?usage.output_tokens,
                    "Generation usage"
                );
            }

            let Some(delta) = chunk.delta.filter(|d| !d.is_empty()) else {
                continue;
            };
            let Some(fragment) = segmenter.push(&delta) else {
                continue;
            };

            if first_text_ms.is_none() {
                first_text_ms = Some(start.elapsed().as_millis() as u64);
                debug!(ms = first_text_ms, "First spoken text");
            }
            full_text.push_str(&fragment);
            emit_sentences(&mut emit, &mut ordinal, chunker.push(&fragment));
            emit(GenerationEvent::Fragment {
                text: fragment,
                full_text: full_text.clone(),
            });
        }

        let segmented = segmenter.finish();

        // Text held back as a possible delimiter turned out to be speech
        if let Some(rest) = segmented.spoken.strip_prefix(full_text.as_str()) {
            if !rest.is_empty() {
                full_text.push_str(rest);
                emit_sentences(&mut emit, &mut ordinal, chunker.push(rest));
                emit(GenerationEvent::Fragment {
                    text: rest.to_string(),
                    full_text: full_text.clone(),
                });
            }
        }

        let fallback = segmented.spoken.is_empty();
        let spoken = if fallback {
            let empty = UpstreamError::EmptyResult {
                service: Service::Generation,
            };
            warn!(%empty, "Substituting fallback utterance");
            let utterance = self.tutor.fallback_utterance.clone();
            emit(GenerationEvent::Fragment {
                text: utterance.clone(),
                full_text: utterance.clone(),
            });
            emit_sentences(&mut emit, &mut ordinal, chunker.push(&utterance));
            utterance
        } else {
            segmented.spoken
        };

        if let Some(text) = chunker.finish() {
            emit(GenerationEvent::Segment {
                text,
                ordinal,
                is_final: true,
            });
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            first_text_ms,
            delimited = segmented.delimited,
            fallback,
            "Generation finished"
        );

        let response = TutorResponse::from_metadata(spoken, &segmented.metadata);
        emit(GenerationEvent::Finished { response, fallback });
    }

    fn timed_out(&self) -> UpstreamError {
        UpstreamError::Timeout {
            service: Service::Generation,
            secs: self.llm.timeout_secs,
        }
    }
}

fn emit_sentences<F>(emit: &mut F, ordinal: &mut u32, sentences: Vec<String>)
where
    F: FnMut(GenerationEvent),
{
    for text in sentences {
        emit(GenerationEvent::Segment {
            text,
            ordinal: *ordinal,
            is_final: false,
        });
        *ordinal += 1;
    }
}

/// Recover the upstream classification from a provider error.
fn classify(err: anyhow::Error) -> UpstreamError {
    match err.downcast::<UpstreamError>() {
        Ok(upstream) => upstream,
        Err(other) => UpstreamError::transport(Service::Generation, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tutor_relay_providers::{ChunkStream, CompletionChunk};

    /// Replays a fixed list of deltas, optionally failing partway.
    struct Scripted {
        deltas: Vec<&'static str>,
        fail_after: Option<usize>,
        refuse: bool,
    }

    /// Accepts the request, then never answers or yields after the given
    /// deltas.
    struct Stalled {
        deltas: Vec<&'static str>,
        answer: bool,
    }

    #[async_trait]
    impl LlmProvider for Stalled {
        fn id(&self) -> &str {
            "stalled"
        }

        async fn stream(
            &self,
            _request: &CompletionRequest,
            _credentials: &Credentials,
        ) -> anyhow::Result<ChunkStream> {
            if !self.answer {
                futures::future::pending::<()>().await;
            }
            let items: Vec<anyhow::Result<CompletionChunk>> = self
                .deltas
                .iter()
                .map(|d| Ok(CompletionChunk::text(*d)))
                .collect();
            Ok(Box::pin(futures::stream::iter(items).chain(futures::stream::pending())))
        }
    }

    async fn collect_stalled(provider: Stalled) -> Vec<GenerationEvent> {
        let streamer = LlmStreamer::new(
            Arc::new(provider),
            Credentials::Anonymous,
            LlmConfig::default(),
            TutorConfig::default(),
        );
        let mut events = Vec::new();
        streamer.run(turn(), |e| events.push(e)).await;
        events
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn stream(
            &self,
            _request: &CompletionRequest,
            _credentials: &Credentials,
        ) -> anyhow::Result<ChunkStream> {
            if self.refuse {
                return Err(UpstreamError::rate_limited(Service::Generation, "429").into());
            }
            let mut items: Vec<anyhow::Result<CompletionChunk>> = self
                .deltas
                .iter()
                .map(|d| Ok(CompletionChunk::text(*d)))
                .collect();
            if let Some(n) = self.fail_after {
                items.truncate(n);
                items.push(Err(anyhow::anyhow!("connection reset")));
            }
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn streamer(provider: Scripted) -> LlmStreamer {
        LlmStreamer::new(
            Arc::new(provider),
            Credentials::Anonymous,
            LlmConfig::default(),
            TutorConfig::default(),
        )
    }

    fn turn() -> Turn {
        Turn {
            scenario: Scenario::preset("restaurant"),
            tier: ProficiencyTier::A1,
            history: vec![HistoryEntry::user("Hola"), HistoryEntry::assistant("¡Hola!")],
            user_text: "Quiero un café".into(),
        }
    }

    async fn collect(provider: Scripted) -> Vec<GenerationEvent> {
        let mut events = Vec::new();
        streamer(provider).run(turn(), |e| events.push(e)).await;
        events
    }

    #[test]
    fn test_request_carries_history_and_instructions() {
        let s = streamer(Scripted {
            deltas: vec![],
            fail_after: None,
            refuse: false,
        });
        let request = s.build_request(&turn());
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[2]["content"], "Quiero un café");
        assert!(request.system.unwrap().contains("At the restaurant"));
        assert_eq!(request.model, LlmConfig::default().model);
    }

    #[tokio::test]
    async fn test_fragments_segments_and_response() {
        let events = collect(Scripted {
            deltas: vec!["¡Claro! ", "Un café ", "ahora mismo.|", "||{\"translation\":", "\"Sure!\"}"],
            fail_after: None,
            refuse: false,
        })
        .await;

        let fragments: String = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Fragment { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, "¡Claro! Un café ahora mismo.");

        let segments: Vec<(&str, u32, bool)> = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Segment {
                    text,
                    ordinal,
                    is_final,
                } => Some((text.as_str(), *ordinal, *is_final)),
                _ => None,
            })
            .collect();
        assert_eq!(
            segments,
            vec![("¡Claro!", 0, false), ("Un café ahora mismo.", 1, true)]
        );

        match events.last() {
            Some(GenerationEvent::Finished { response, fallback }) => {
                assert!(!fallback);
                assert_eq!(response.text, "¡Claro! Un café ahora mismo.");
                assert_eq!(response.translation.as_deref(), Some("Sure!"));
            }
            other => panic!("Expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_reply_uses_fallback() {
        let events = collect(Scripted {
            deltas: vec!["|||{\"translation\":\"\"}"],
            fail_after: None,
            refuse: false,
        })
        .await;

        let fallback_text = TutorConfig::default().fallback_utterance;
        let segments: Vec<(&str, bool)> = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Segment { text, is_final, .. } => Some((text.as_str(), *is_final)),
                _ => None,
            })
            .collect();
        assert_eq!(
            segments,
            vec![
                ("Perdona, no te he entendido bien.", false),
                ("¿Puedes repetirlo?", true)
            ]
        );
        match events.last() {
            Some(GenerationEvent::Finished { response, fallback }) => {
                assert!(fallback);
                assert_eq!(response.text, fallback_text);
            }
            other => panic!("Expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plain_reply_without_delimiter() {
        let events = collect(Scripted {
            deltas: vec!["Buenas ", "tardes"],
            fail_after: None,
            refuse: false,
        })
        .await;
        match events.last() {
            Some(GenerationEvent::Finished { response, fallback }) => {
                assert!(!fallback);
                assert_eq!(response.text, "Buenas tardes");
                assert!(response.translation.is_none());
            }
            other => panic!("Expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_reported_once() {
        let events = collect(Scripted {
            deltas: vec!["Hola. ", "¿Qué ", "tal?"],
            fail_after: Some(1),
            refuse: false,
        })
        .await;
        let terminal: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, GenerationEvent::Finished { .. } | GenerationEvent::Failed { .. }))
            .collect();
        assert_eq!(terminal.len(), 1);
        match terminal[0] {
            GenerationEvent::Failed { error } => {
                assert!(matches!(error, UpstreamError::Transport { .. }));
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let events = collect_stalled(Stalled {
            deltas: vec![],
            answer: false,
        })
        .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            GenerationEvent::Failed {
                error: UpstreamError::Timeout {
                    service: Service::Generation,
                    secs: 10
                }
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_that_stops_yielding_times_out() {
        let events = collect_stalled(Stalled {
            deltas: vec!["Hola. ", "¿Qué "],
            answer: true,
        })
        .await;

        assert!(events.iter().any(|e| matches!(e, GenerationEvent::Fragment { .. })));
        let terminal: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, GenerationEvent::Finished { .. } | GenerationEvent::Failed { .. }))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(
            terminal[0],
            GenerationEvent::Failed {
                error: UpstreamError::Timeout { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_silent_http_upstream_times_out() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let llm = LlmConfig {
            base_url: Some(format!("http://{addr}")),
            api_key: Some("sk-test".into()),
            timeout_secs: 1,
            ..LlmConfig::default()
        };
        let (provider, credentials) = tutor_relay_providers::from_config(&llm).unwrap();
        let streamer = LlmStreamer::new(provider, credentials, llm, TutorConfig::default());

        let mut events = Vec::new();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            streamer.run(turn(), |e| events.push(e)),
        )
        .await;
        assert!(outcome.is_ok(), "generation did not give up");
        assert!(matches!(
            events.as_slice(),
            [GenerationEvent::Failed {
                error: UpstreamError::Timeout { secs: 1, .. }
            }]
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_classification_survives() {
        let events = collect(Scripted {
            deltas: vec![],
            fail_after: None,
            refuse: true,
        })
        .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            GenerationEvent::Failed {
                error: UpstreamError::RateLimited { .. }
            }
        ));
    }
}
