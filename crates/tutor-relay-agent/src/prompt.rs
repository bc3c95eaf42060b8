//! Tutor instructions for a scenario and proficiency tier.

use tutor_relay_core::config::TutorConfig;
use tutor_relay_core::types::{ProficiencyTier, Scenario};

/// Build the system prompt for one tutoring session.
pub fn build_tutor_instructions(
    scenario: &Scenario,
    tier: ProficiencyTier,
    tutor: &TutorConfig,
) -> String {
    let mut parts = Vec::new();

    parts.push(format!(
        "You are a {target} tutor running a spoken role-play with a {tier} ({band}) learner \
         whose native language is {native}. Stay in character as {role}.",
        target = tutor.target_language,
        tier = tier,
        band = tier.band(),
        native = tutor.native_language,
        role = if scenario.tutor_role.is_empty() {
            "a conversation partner"
        } else {
            scenario.tutor_role.as_str()
        },
    ));

    let mut scene = format!("Scenario: {}", scenario.title);
    if !scenario.setting.is_empty() {
        scene.push_str(&format!("\nSetting: {}", scenario.setting));
    }
    if !scenario.objectives.is_empty() {
        scene.push_str("\nLearner objectives:");
        for objective in &scenario.objectives {
            scene.push_str(&format!("\n- {objective}"));
        }
    }
    parts.push(scene);

    parts.push(tier_guidance(tier).to_string());

    parts.push(format!(
        "Everything you write before the delimiter is read aloud, so write only natural \
         spoken {target}: no markdown, no lists, no stage directions, at most three short \
         sentences. After the spoken text write the delimiter {delim} followed by a single \
         JSON object with these keys:\n\
         - \"translation\": the spoken text in {native}\n\
         - \"correction\": a corrected version of the learner's last sentence, or null if it was fine\n\
         - \"explanation\": one short sentence in {native} explaining the correction, or null\n\
         - \"suggestions\": two or three short replies the learner could say next, in {target}\n\
         Example: ¡Hola! ¿Qué desea tomar?{delim}{{\"translation\":\"Hi! What would you like?\",\
         \"correction\":null,\"explanation\":null,\"suggestions\":[\"Un café, por favor\"]}}",
        target = tutor.target_language,
        native = tutor.native_language,
        delim = tutor.delimiter,
    ));

    parts.join("\n\n")
}

fn tier_guidance(tier: ProficiencyTier) -> &'static str {
    match tier {
        ProficiencyTier::A1 => {
            "Use very simple present-tense sentences and common words. Speak slowly and repeat key words."
        }
        ProficiencyTier::A2 => {
            "Use simple sentences and everyday vocabulary. Introduce the past tense only occasionally."
        }
        ProficiencyTier::B1 => {
            "Use everyday language with some variety of tenses. Ask open questions to keep the learner talking."
        }
        ProficiencyTier::B2 => {
            "Speak naturally with varied tenses and some idioms. Correct only errors that matter."
        }
        ProficiencyTier::C1 | ProficiencyTier::C2 => {
            "Speak as you would to a native speaker, at natural speed, with idiomatic language. \
             Point out subtle errors of register or nuance."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instructions_carry_scenario_and_delimiter() {
        let scenario = Scenario::preset("restaurant");
        let prompt = build_tutor_instructions(&scenario, ProficiencyTier::A1, &TutorConfig::default());

        assert!(prompt.contains("At the restaurant"));
        assert!(prompt.contains("a friendly waiter"));
        assert!(prompt.contains("- Ask for the bill"));
        assert!(prompt.contains("A1 (beginner)"));
        assert!(prompt.contains("|||"));
        assert!(prompt.contains("Spanish"));
    }

    #[test]
    fn test_custom_delimiter_and_languages() {
        let tutor = TutorConfig {
            delimiter: "###".into(),
            target_language: "French".into(),
            native_language: "German".into(),
            ..TutorConfig::default()
        };
        let prompt = build_tutor_instructions(&Scenario::preset("hotel"), ProficiencyTier::C2, &tutor);
        assert!(prompt.contains("###"));
        assert!(!prompt.contains("|||"));
        assert!(prompt.contains("French tutor"));
        assert!(prompt.contains("in German"));
        assert!(prompt.contains("advanced"));
    }
}
