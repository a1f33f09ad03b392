use anyhow::Result;
use async_trait::async_trait;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use super::ChatMessage;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChatStatus {
    #[default]
    Ready,
    Submitted,
    Streaming,
    Error,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamingState {
    pub messages: Vec<ChatMessage>,
    pub status: ChatStatus,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Overrides the configured model for this exchange only.
    pub model: Option<String>,
}

/// Imperative state contract a streaming engine drives while it runs an
/// exchange.
pub trait ChatState {
    fn messages(&self) -> Vec<ChatMessage>;
    fn set_messages(&self, messages: Vec<ChatMessage>);
    fn push_message(&self, message: ChatMessage);
    fn pop_message(&self) -> Option<ChatMessage>;
    fn replace_message(&self, index: usize, message: &ChatMessage) -> Result<()>;
    fn status(&self) -> ChatStatus;
    fn set_status(&self, status: ChatStatus);
    fn error(&self) -> Option<String>;
    fn set_error(&self, error: Option<String>);
    fn snapshot(&self) -> StreamingState;

    /// Called once an assistant message has finished streaming normally.
    fn on_finish(&self, message: &ChatMessage);
}

#[async_trait]
pub trait ChatEngine {
    async fn send_message(
        &self,
        state: &(dyn ChatState + Send + Sync),
        message: ChatMessage,
        options: SendOptions,
    ) -> Result<()>;

    async fn regenerate(
        &self,
        state: &(dyn ChatState + Send + Sync),
        message_id: &str,
    ) -> Result<()>;

    /// Aborts the in-flight exchange, if any.
    fn stop(&self);

    async fn resume_stream(&self, state: &(dyn ChatState + Send + Sync)) -> Result<()>;
}

#[async_trait]
pub trait TitleGenerator {
    async fn generate_title(&self, user: &ChatMessage, assistant: &ChatMessage) -> Result<String>;
}
