#[cfg(test)]
#[path = "titles_test.rs"]
mod tests;

use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::domain::models::BackendBox;
use crate::domain::models::BackendPrompt;
use crate::domain::models::BackendResponse;
use crate::domain::models::ChatMessage;
use crate::domain::models::ChatStore;
use crate::domain::models::RemoteSessionApi;
use crate::domain::models::SessionSeed;
use crate::domain::models::TitleGenerator;

const MAX_TITLE_CHARS: usize = 80;

fn clean_title(raw: &str) -> String {
    let line = raw
        .lines()
        .map(|line| return line.trim())
        .find(|line| return !line.is_empty())
        .unwrap_or_default();

    let unquoted = line
        .trim_matches(|c: char| return c == '"' || c == '\'' || c == '`')
        .trim_end_matches('.')
        .trim();

    return unquoted.chars().take(MAX_TITLE_CHARS).collect();
}

/// Names a conversation by asking the chat backend for a one-line summary.
pub struct BackendTitleGenerator {
    backend: Arc<BackendBox>,
    model: String,
}

impl BackendTitleGenerator {
    pub fn new(backend: Arc<BackendBox>, model: &str) -> BackendTitleGenerator {
        return BackendTitleGenerator {
            backend,
            model: model.to_string(),
        };
    }
}

#[async_trait]
impl TitleGenerator for BackendTitleGenerator {
    #[allow(clippy::implicit_return)]
    async fn generate_title(&self, user: &ChatMessage, assistant: &ChatMessage) -> Result<String> {
        let prompt = BackendPrompt::title_request(&self.model, user, assistant);
        let (tx, mut rx) = mpsc::unbounded_channel::<BackendResponse>();
        self.backend.get_completion(prompt, &tx).await?;
        drop(tx);

        let mut text = String::new();
        while let Some(chunk) = rx.recv().await {
            text += &chunk.text;
        }

        let title = clean_title(&text);
        if title.is_empty() {
            bail!("Backend returned an empty title");
        }

        return Ok(title);
    }
}

/// Generates and persists session titles. Remote updates are only attempted
/// for sessions that exist on the service.
pub struct TitleService {
    generator: Arc<dyn TitleGenerator + Send + Sync>,
    store: Arc<dyn ChatStore + Send + Sync>,
    remote: Option<Arc<dyn RemoteSessionApi + Send + Sync>>,
}

impl TitleService {
    pub fn new(
        generator: Arc<dyn TitleGenerator + Send + Sync>,
        store: Arc<dyn ChatStore + Send + Sync>,
        remote: Option<Arc<dyn RemoteSessionApi + Send + Sync>>,
    ) -> TitleService {
        return TitleService {
            generator,
            store,
            remote,
        };
    }

    pub async fn generate_and_persist(
        &self,
        chat_id: &str,
        user: &ChatMessage,
        assistant: &ChatMessage,
    ) -> Result<String> {
        let title = self.generator.generate_title(user, assistant).await?;

        let session = match self.store.get_chat_session(chat_id).await? {
            Some(session) => session,
            None => {
                self.store
                    .ensure_session(chat_id, SessionSeed::local(Utc::now()))
                    .await?;
                match self.store.get_chat_session(chat_id).await? {
                    Some(session) => session,
                    None => bail!(format!("Session {chat_id} vanished while saving its title")),
                }
            }
        };

        self.store.update_session_title(chat_id, &title).await?;

        if !session.is_local {
            if let Some(remote) = &self.remote {
                if let Err(err) = remote.update_session(chat_id, &title).await {
                    tracing::warn!(chat_id, error = ?err, "Failed to push session title to remote");
                }
            }
        }

        tracing::debug!(chat_id, title = %title, "Session title saved");
        return Ok(title);
    }
}
