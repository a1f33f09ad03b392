#[cfg(test)]
#[path = "backend_test.rs"]
mod tests;

use anyhow::Result;
use async_trait::async_trait;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use strum::EnumIter;
use strum::EnumVariantNames;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;

use super::ChatMessage;
use super::Role;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, EnumVariantNames, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BackendName {
    Ollama,
    OpenAI,
}

impl BackendName {
    pub fn parse(text: String) -> Option<BackendName> {
        return BackendName::iter().find(|e| return e.to_string() == text);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendPrompt {
    pub model: String,
    pub messages: Vec<PromptMessage>,
}

impl BackendPrompt {
    pub fn from_messages(model: &str, messages: &[ChatMessage]) -> BackendPrompt {
        let messages = messages
            .iter()
            .map(|message| {
                return PromptMessage {
                    role: message.role.to_string(),
                    content: message.text(),
                };
            })
            .collect();

        return BackendPrompt {
            model: model.to_string(),
            messages,
        };
    }

    /// Prompt asking the model to name a conversation from its opening
    /// exchange.
    pub fn title_request(model: &str, user: &ChatMessage, assistant: &ChatMessage) -> BackendPrompt {
        let text = format!(
            "Write a short title of at most six words for the following conversation. Reply with the title only, no quotes or punctuation at the end.\n\nUser: {}\n\nAssistant: {}",
            user.text(),
            assistant.text()
        );

        return BackendPrompt {
            model: model.to_string(),
            messages: vec![PromptMessage {
                role: Role::User.to_string(),
                content: text,
            }],
        };
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendResponse {
    pub text: String,
    pub done: bool,
}

#[async_trait]
pub trait Backend {
    fn name(&self) -> BackendName;

    /// Used at startup to verify all configurations are available to work with
    /// the backend.
    async fn health_check(&self) -> Result<()>;

    async fn list_models(&self) -> Result<Vec<String>>;

    /// Requests completions from the backend. Completion results are streamed
    /// back by passing each chunk through the channel, with a final `done`
    /// response once the backend has finished.
    async fn get_completion<'a>(
        &self,
        prompt: BackendPrompt,
        tx: &'a mpsc::UnboundedSender<BackendResponse>,
    ) -> Result<()>;
}

pub type BackendBox = Box<dyn Backend + Send + Sync>;
