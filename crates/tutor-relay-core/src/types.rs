use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// CEFR proficiency tier of the learner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProficiencyTier {
    #[default]
    #[serde(alias = "a1")]
    A1,
    #[serde(alias = "a2")]
    A2,
    #[serde(alias = "b1")]
    B1,
    #[serde(alias = "b2")]
    B2,
    #[serde(alias = "c1")]
    C1,
    #[serde(alias = "c2")]
    C2,
}

impl ProficiencyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A1 => "A1",
            Self::A2 => "A2",
            Self::B1 => "B1",
            Self::B2 => "B2",
            Self::C1 => "C1",
            Self::C2 => "C2",
        }
    }

    /// Plain-language band used in tutor instructions.
    pub fn band(&self) -> &'static str {
        match self {
            Self::A1 | Self::A2 => "beginner",
            Self::B1 | Self::B2 => "intermediate",
            Self::C1 | Self::C2 => "advanced",
        }
    }
}

impl std::fmt::Display for ProficiencyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role-play scenario the tutor conducts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub setting: String,
    #[serde(default)]
    pub tutor_role: String,
    #[serde(default)]
    pub objectives: Vec<String>,
}

impl Scenario {
    /// Build a scenario from a preset name. Unknown names get a generic
    /// free-conversation scenario titled after the name.
    pub fn preset(name: &str) -> Self {
        let kind = name.trim().to_lowercase();
        let (title, setting, tutor_role, objectives): (&str, &str, &str, &[&str]) =
            match kind.as_str() {
                "restaurant" => (
                    "At the restaurant",
                    "A busy neighbourhood restaurant at dinner time",
                    "a friendly waiter",
                    &["Order a drink", "Order a main course", "Ask for the bill"],
                ),
                "directions" => (
                    "Asking for directions",
                    "A street corner in the city centre",
                    "a helpful local",
                    &["Ask where a place is", "Understand the directions", "Say thanks"],
                ),
                "shopping" => (
                    "Shopping for clothes",
                    "A small clothing shop",
                    "a shop assistant",
                    &["Ask for a size", "Ask the price", "Pay for the item"],
                ),
                "hotel" => (
                    "Checking into a hotel",
                    "The front desk of a hotel",
                    "a receptionist",
                    &["Give your name", "Ask about breakfast", "Ask for the wifi password"],
                ),
                "doctor" => (
                    "At the doctor's",
                    "A family doctor's consultation room",
                    "a doctor",
                    &["Describe how you feel", "Say how long it has lasted", "Understand the advice"],
                ),
                _ => (
                    "",
                    "An informal chat between two people",
                    "a conversation partner",
                    &["Keep the conversation going"],
                ),
            };

        let title = if title.is_empty() {
            name.trim().to_string()
        } else {
            title.to_string()
        };

        Self {
            kind,
            title,
            setting: setting.to_string(),
            tutor_role: tutor_role.to_string(),
            objectives: objectives.iter().map(|o| o.to_string()).collect(),
        }
    }
}

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn in a session's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Final structured tutor turn delivered to the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TutorResponse {
    /// What the tutor said out loud.
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl TutorResponse {
    /// Assemble a response from the spoken text and the metadata object that
    /// followed it. Missing or oddly-shaped fields are skipped.
    pub fn from_metadata(text: String, metadata: &Map<String, Value>) -> Self {
        let translation = string_field(metadata, &["translation", "english"]);

        let (correction, nested_explanation) = match metadata.get("correction") {
            Some(Value::String(s)) if !s.trim().is_empty() => (Some(s.trim().to_string()), None),
            Some(Value::Object(obj)) => (
                string_field(obj, &["corrected", "text", "correction"]),
                string_field(obj, &["explanation", "reason"]),
            ),
            _ => (None, None),
        };

        let explanation = string_field(metadata, &["explanation"]).or(nested_explanation);

        let suggestions = ["suggestions", "suggestedReplies", "suggested_replies"]
            .iter()
            .find_map(|key| metadata.get(*key).and_then(Value::as_array))
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(obj) => string_field(obj, &["text", "reply"]),
                        _ => None,
                    })
                    .filter(|s| !s.trim().is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            text,
            translation,
            correction,
            explanation,
            suggestions,
        }
    }
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        map.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
