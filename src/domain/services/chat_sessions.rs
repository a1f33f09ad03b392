#[cfg(test)]
#[path = "chat_sessions_test.rs"]
mod tests;

use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use super::BridgeDeps;
use super::ChatBridge;
use super::ChatViewStore;
use crate::domain::models::ChatState;
use crate::domain::models::ChatStore;
use crate::domain::models::SessionSeed;

/// Holds the active chat and swaps it when the user starts or opens another
/// conversation.
pub struct ChatSessions {
    active: RwLock<Arc<ChatBridge>>,
    deps: BridgeDeps,
    store: Arc<dyn ChatStore + Send + Sync>,
}

impl ChatSessions {
    pub fn new(deps: BridgeDeps, store: Arc<dyn ChatStore + Send + Sync>) -> ChatSessions {
        let chat_id = ChatSessions::create_id();
        let bridge = Arc::new(ChatBridge::new(&chat_id, vec![], deps.clone()));
        deps.view.reset(&chat_id, vec![], None);

        return ChatSessions {
            active: RwLock::new(bridge),
            deps,
            store,
        };
    }

    pub fn create_id() -> String {
        return Uuid::new_v4()
            .to_string()
            .split('-')
            .enumerate()
            .filter_map(|(idx, str)| {
                if idx > 1 {
                    return None;
                }
                return Some(str);
            })
            .collect::<Vec<&str>>()
            .join("-");
    }

    pub fn view(&self) -> ChatViewStore {
        return self.deps.view.clone();
    }

    pub fn active(&self) -> Arc<ChatBridge> {
        return self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
    }

    fn swap(&self, bridge: ChatBridge, title: Option<String>) -> Arc<ChatBridge> {
        let bridge = Arc::new(bridge);
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = bridge.clone();
        self.deps
            .view
            .reset(bridge.chat_id(), bridge.messages(), title);
        drop(active);

        tracing::debug!(chat_id = bridge.chat_id(), "Active chat swapped");
        return bridge;
    }

    /// Starts a conversation under a freshly allocated id. Whatever was already
    /// persisted for the previous chat stays as it is.
    pub fn new_chat(&self) -> Arc<ChatBridge> {
        let chat_id = ChatSessions::create_id();
        return self.swap(ChatBridge::new(&chat_id, vec![], self.deps.clone()), None);
    }

    /// Makes a persisted session the active chat.
    pub async fn open_chat(&self, chat_id: &str) -> Result<Arc<ChatBridge>> {
        let messages = self.store.load_ui_messages(chat_id).await?;
        let title = self
            .store
            .get_chat_session(chat_id)
            .await?
            .and_then(|session| return session.title);

        return Ok(self.swap(
            ChatBridge::new(chat_id, messages, self.deps.clone()),
            title,
        ));
    }

    /// Replaces the stored messages of the active chat with the live ones.
    /// Returns `false` without writing while a reply is still streaming.
    pub async fn persist_active(&self) -> Result<bool> {
        if self.deps.view.is_streaming() {
            tracing::debug!("Skipping persist while streaming");
            return Ok(false);
        }

        let bridge = self.active();
        let chat_id = bridge.chat_id();
        let now = Utc::now();

        match self.store.get_chat_session(chat_id).await? {
            None => {
                self.store
                    .ensure_session(chat_id, SessionSeed::local(now))
                    .await?;
            }
            Some(session) if session.is_local => {
                self.store
                    .upsert_session(
                        chat_id,
                        SessionSeed {
                            title: None,
                            created_at: session.created_at,
                            updated_at: now,
                            is_local: true,
                        },
                    )
                    .await?;
            }
            Some(_) => {}
        }

        self.store
            .replace_messages(chat_id, &bridge.messages())
            .await?;

        return Ok(true);
    }
}
