use anyhow::Result;
use async_trait::async_trait;

use super::ChatMessage;
use super::ChatSession;
use super::SessionSeed;

/// Local persistent store for chat sessions and their messages.
#[async_trait]
pub trait ChatStore {
    /// Creates the session if absent. An existing row is left as it is.
    async fn ensure_session(&self, chat_id: &str, seed: SessionSeed) -> Result<()>;

    /// Creates the session if absent, otherwise refreshes its metadata with the
    /// seed. Messages are left untouched.
    async fn upsert_session(&self, chat_id: &str, seed: SessionSeed) -> Result<()>;

    async fn get_chat_session(&self, chat_id: &str) -> Result<Option<ChatSession>>;

    /// All persisted sessions, most recently updated first.
    async fn get_chat_sessions(&self) -> Result<Vec<ChatSession>>;

    async fn has_persisted_messages(&self, chat_id: &str) -> Result<bool>;

    /// Inserts or overwrites messages by id, keeping the stored list in
    /// chronological order.
    async fn upsert_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()>;

    /// Replaces every message of the session with `messages`.
    async fn replace_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()>;

    async fn load_ui_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>>;

    async fn update_session_title(&self, chat_id: &str, title: &str) -> Result<()>;

    async fn delete_session(&self, chat_id: &str) -> Result<()>;
}
