//! Client wire protocol.
//!
//! Control messages travel as JSON text frames discriminated by `type`.
//! Microphone audio travels as binary frames. Anything that fails to parse as
//! a control message is treated as audio.

use serde::{Deserialize, Serialize};

use crate::types::{ProficiencyTier, Scenario, TutorResponse};

/// Client -> server control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Configure the session and (re)connect recognition.
    Setup {
        scenario: ScenarioSpec,
        #[serde(
            rename = "proficiencyTier",
            alias = "tier",
            alias = "proficiency_tier",
            default
        )]
        proficiency_tier: ProficiencyTier,
    },

    /// Advisory playback-rate hint.
    Config {
        #[serde(rename = "speechRate", alias = "speech_rate")]
        speech_rate: f32,
    },

    Pause,

    Resume,
}

/// A scenario given either as a preset name or in full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioSpec {
    Preset(String),
    Custom(Scenario),
}

impl From<ScenarioSpec> for Scenario {
    fn from(spec: ScenarioSpec) -> Self {
        match spec {
            ScenarioSpec::Preset(name) => Scenario::preset(&name),
            ScenarioSpec::Custom(scenario) => scenario,
        }
    }
}

/// Server -> client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Upstreams are configured; the session is listening.
    Ready,

    Transcript {
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },

    /// Streaming spoken text: the newly available fragment and everything so far.
    TutorText {
        text: String,
        #[serde(rename = "fullText")]
        full_text: String,
    },

    TutorResponse { response: TutorResponse },

    /// Base64 WAV chunk belonging to one synthesis context.
    Audio { data: String, context_id: String },

    /// All audio for the current turn has been delivered.
    AudioDone,

    Error { message: String },

    SttDisconnected { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Event name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Transcript { .. } => "transcript",
            Self::TutorText { .. } => "tutor_text",
            Self::TutorResponse { .. } => "tutor_response",
            Self::Audio { .. } => "audio",
            Self::AudioDone => "audio_done",
            Self::Error { .. } => "error",
            Self::SttDisconnected { .. } => "stt_disconnected",
        }
    }
}

/// Parse a text frame as a control message. `None` means the frame is not a
/// control message and should be handled as audio.
pub fn parse_control(text: &str) -> Option<ClientMessage> {
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_with_preset_name_and_tier_alias() {
        let msg = parse_control(r#"{"type":"setup","scenario":"restaurant","tier":"A1"}"#).unwrap();
        match msg {
            ClientMessage::Setup {
                scenario,
                proficiency_tier,
            } => {
                let scenario: Scenario = scenario.into();
                assert_eq!(scenario.kind, "restaurant");
                assert_eq!(proficiency_tier, ProficiencyTier::A1);
            }
            other => panic!("Expected setup, got {other:?}"),
        }
    }

    #[test]
    fn test_setup_with_full_scenario() {
        let text = json!({
            "type": "setup",
            "scenario": {
                "type": "custom",
                "title": "Job interview",
                "setting": "An office",
                "tutorRole": "interviewer",
                "objectives": ["Introduce yourself"]
            },
            "proficiencyTier": "C1"
        })
        .to_string();
        let Some(ClientMessage::Setup {
            scenario,
            proficiency_tier,
        }) = parse_control(&text)
        else {
            panic!("Expected setup");
        };
        let scenario: Scenario = scenario.into();
        assert_eq!(scenario.title, "Job interview");
        assert_eq!(scenario.tutor_role, "interviewer");
        assert_eq!(proficiency_tier, ProficiencyTier::C1);
    }

    #[test]
    fn test_unit_commands() {
        assert_eq!(parse_control(r#"{"type":"pause"}"#), Some(ClientMessage::Pause));
        assert_eq!(parse_control(r#"{"type":"resume"}"#), Some(ClientMessage::Resume));
        assert_eq!(
            parse_control(r#"{"type":"config","speechRate":0.8}"#),
            Some(ClientMessage::Config { speech_rate: 0.8 })
        );
    }

    #[test]
    fn test_non_control_frames() {
        assert_eq!(parse_control("not json at all"), None);
        assert_eq!(parse_control(r#"{"type":"dance"}"#), None);
        assert_eq!(parse_control(r#"{"scenario":"restaurant"}"#), None);
    }

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::Transcript {
            text: "hola".into(),
            is_final: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "transcript", "text": "hola", "isFinal": true}));

        let audio = ServerEvent::Audio {
            data: "AAA=".into(),
            context_id: "ctx-1".into(),
        };
        let value = serde_json::to_value(&audio).unwrap();
        assert_eq!(value["type"], "audio");
        assert_eq!(value["context_id"], "ctx-1");

        let done = serde_json::to_value(ServerEvent::AudioDone).unwrap();
        assert_eq!(done, json!({"type": "audio_done"}));

        let text = serde_json::to_value(ServerEvent::TutorText {
            text: "Ho".into(),
            full_text: "Ho".into(),
        })
        .unwrap();
        assert_eq!(text["fullText"], "Ho");
        assert_eq!(ServerEvent::SttDisconnected { message: String::new() }.name(), "stt_disconnected");
    }
}
