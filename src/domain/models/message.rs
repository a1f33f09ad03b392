#[cfg(test)]
#[path = "message_test.rs"]
mod tests;

use chrono::DateTime;
use chrono::Utc;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Normalized chat message. `parts` is opaque content (text, rich-text state,
/// tool invocations) and is never re-validated here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, text: &str) -> ChatMessage {
        return ChatMessage {
            id: Uuid::new_v4().to_string(),
            role,
            parts: vec![text_part(text)],
            metadata: None,
            created_at: Utc::now(),
        };
    }

    /// Concatenated text of every `{"type": "text"}` part.
    pub fn text(&self) -> String {
        return self
            .parts
            .iter()
            .filter(|part| return part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| return part.get("text").and_then(Value::as_str))
            .collect::<Vec<&str>>()
            .join("");
    }

    /// Appends streamed text to the trailing text part, creating one if the
    /// message doesn't end with text.
    pub fn append_text(&mut self, text: &str) {
        if let Some(Value::Object(last)) = self.parts.last_mut() {
            if last.get("type").and_then(Value::as_str) == Some("text") {
                let current = last
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                last.insert("text".to_string(), Value::String(current + text));
                return;
            }
        }

        self.parts.push(text_part(text));
    }
}

pub fn text_part(text: &str) -> Value {
    return json!({ "type": "text", "text": text });
}
