#[cfg(test)]
#[path = "yaml_test.rs"]
mod tests;

use std::path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::ChatMessage;
use crate::domain::models::ChatSession;
use crate::domain::models::ChatStore;
use crate::domain::models::SessionSeed;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct SessionFile {
    version: String,
    session: ChatSession,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

/// Stores every session as one YAML document under `sessions_dir`.
pub struct YamlChatStore {
    pub sessions_dir: path::PathBuf,
    write_lock: Mutex<()>,
}

impl Default for YamlChatStore {
    fn default() -> YamlChatStore {
        let sessions_dir = path::PathBuf::from(Config::get(ConfigKey::DataDir)).join("sessions");

        return YamlChatStore::new(sessions_dir);
    }
}

impl YamlChatStore {
    pub fn new(sessions_dir: path::PathBuf) -> YamlChatStore {
        return YamlChatStore {
            sessions_dir,
            write_lock: Mutex::new(()),
        };
    }

    fn get_file_path(&self, chat_id: &str) -> Result<path::PathBuf> {
        if chat_id.is_empty()
            || chat_id.contains(['/', '\\'])
            || chat_id.starts_with('.')
        {
            bail!(format!("Invalid session id {chat_id:?}"));
        }

        return Ok(self.sessions_dir.join(format!("{chat_id}.yaml")));
    }

    async fn read(&self, chat_id: &str) -> Result<Option<SessionFile>> {
        let file_path = self.get_file_path(chat_id)?;
        if !file_path.exists() {
            return Ok(None);
        }

        let payload = fs::read_to_string(&file_path).await?;
        let file: SessionFile = serde_yaml::from_str(&payload)
            .with_context(|| return format!("Failed to parse {}", file_path.display()))?;

        return Ok(Some(file));
    }

    async fn write(&self, file: &SessionFile) -> Result<()> {
        let file_path = self.get_file_path(&file.session.chat_id)?;
        let payload = serde_yaml::to_string(file)?;

        if !self.sessions_dir.exists() {
            fs::create_dir_all(&self.sessions_dir).await?;
        }

        let mut handle = fs::File::create(file_path).await?;
        handle.write_all(payload.as_bytes()).await?;
        handle.flush().await?;

        return Ok(());
    }

    /// Runs a read-modify-write cycle against an existing session file.
    async fn modify<F: FnOnce(&mut SessionFile)>(&self, chat_id: &str, modify: F) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let Some(mut file) = self.read(chat_id).await? else {
            bail!(format!("No session found for id {chat_id}"));
        };

        modify(&mut file);
        return self.write(&file).await;
    }
}

#[async_trait]
impl ChatStore for YamlChatStore {
    #[allow(clippy::implicit_return)]
    async fn ensure_session(&self, chat_id: &str, seed: SessionSeed) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        if self.read(chat_id).await?.is_some() {
            return Ok(());
        }

        return self
            .write(&SessionFile {
                version: env!("CARGO_PKG_VERSION").to_string(),
                session: ChatSession::from_seed(chat_id, &seed),
                messages: vec![],
            })
            .await;
    }

    #[allow(clippy::implicit_return)]
    async fn upsert_session(&self, chat_id: &str, seed: SessionSeed) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let file = match self.read(chat_id).await? {
            Some(mut file) => {
                file.session.apply_seed(&seed);
                file
            }
            None => SessionFile {
                version: env!("CARGO_PKG_VERSION").to_string(),
                session: ChatSession::from_seed(chat_id, &seed),
                messages: vec![],
            },
        };

        return self.write(&file).await;
    }

    #[allow(clippy::implicit_return)]
    async fn get_chat_session(&self, chat_id: &str) -> Result<Option<ChatSession>> {
        let file = self.read(chat_id).await?;
        return Ok(file.map(|e| return e.session));
    }

    #[allow(clippy::implicit_return)]
    async fn get_chat_sessions(&self) -> Result<Vec<ChatSession>> {
        let mut sessions: Vec<ChatSession> = vec![];
        if !self.sessions_dir.exists() {
            return Ok(sessions);
        }

        let mut dir = fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_path = entry.path();
            if file_path.extension().and_then(|e| return e.to_str()) != Some("yaml") {
                continue;
            }

            let payload = fs::read_to_string(&file_path).await?;
            match serde_yaml::from_str::<SessionFile>(&payload) {
                Ok(file) => sessions.push(file.session),
                Err(err) => {
                    tracing::warn!(path = ?file_path, error = ?err, "Skipping unreadable session file");
                }
            }
        }

        sessions.sort_by(|a, b| return b.updated_at.cmp(&a.updated_at));

        return Ok(sessions);
    }

    #[allow(clippy::implicit_return)]
    async fn has_persisted_messages(&self, chat_id: &str) -> Result<bool> {
        let file = self.read(chat_id).await?;
        return Ok(file.map(|e| return !e.messages.is_empty()).unwrap_or(false));
    }

    #[allow(clippy::implicit_return)]
    async fn upsert_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()> {
        return self
            .modify(chat_id, |file| {
                for message in messages {
                    match file.messages.iter_mut().find(|e| return e.id == message.id) {
                        Some(existing) => *existing = message.clone(),
                        None => file.messages.push(message.clone()),
                    }
                }
                file.messages.sort_by_key(|e| return e.created_at);
            })
            .await;
    }

    #[allow(clippy::implicit_return)]
    async fn replace_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()> {
        return self
            .modify(chat_id, |file| {
                file.messages = messages.to_vec();
            })
            .await;
    }

    #[allow(clippy::implicit_return)]
    async fn load_ui_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let file = self.read(chat_id).await?;
        return Ok(file.map(|e| return e.messages).unwrap_or_default());
    }

    #[allow(clippy::implicit_return)]
    async fn update_session_title(&self, chat_id: &str, title: &str) -> Result<()> {
        return self
            .modify(chat_id, |file| {
                file.session.title = Some(title.to_string());
            })
            .await;
    }

    #[allow(clippy::implicit_return)]
    async fn delete_session(&self, chat_id: &str) -> Result<()> {
        let _lock = self.write_lock.lock().await;
        let file_path = self.get_file_path(chat_id)?;
        if !file_path.exists() {
            return Ok(());
        }

        fs::remove_file(file_path).await?;
        return Ok(());
    }
}
