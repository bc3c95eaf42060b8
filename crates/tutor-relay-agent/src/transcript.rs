//! Convert session history to chat-completion messages.

use serde_json::json;

use tutor_relay_core::types::{HistoryEntry, Role};

/// History plus the new learner turn, in OpenAI message format.
pub fn history_to_messages(history: &[HistoryEntry], user_text: &str) -> Vec<serde_json::Value> {
    let mut messages: Vec<serde_json::Value> = history
        .iter()
        .filter(|entry| !entry.text.trim().is_empty())
        .map(|entry| {
            let role = match entry.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({ "role": role, "content": entry.text })
        })
        .collect();

    messages.push(json!({ "role": "user", "content": user_text }));
    messages
}
