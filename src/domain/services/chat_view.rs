use std::sync::Arc;

use tokio::sync::watch;

use crate::domain::models::ChatMessage;
use crate::domain::models::ChatStatus;

/// Read-only projection of the active chat, mirrored from the bridge after
/// every mutation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatViewState {
    pub chat_id: String,
    pub messages: Vec<ChatMessage>,
    pub status: ChatStatus,
    pub is_streaming: bool,
    pub error: Option<String>,
    pub title: Option<String>,
}

#[derive(Clone)]
pub struct ChatViewStore {
    tx: Arc<watch::Sender<ChatViewState>>,
}

impl Default for ChatViewStore {
    fn default() -> ChatViewStore {
        let (tx, _rx) = watch::channel(ChatViewState::default());
        return ChatViewStore { tx: Arc::new(tx) };
    }
}

impl ChatViewStore {
    pub fn subscribe(&self) -> watch::Receiver<ChatViewState> {
        return self.tx.subscribe();
    }

    pub fn get(&self) -> ChatViewState {
        return self.tx.borrow().clone();
    }

    pub fn is_streaming(&self) -> bool {
        return self.tx.borrow().is_streaming;
    }

    pub(crate) fn update<F: FnOnce(&mut ChatViewState)>(&self, modify: F) {
        self.tx.send_modify(modify);
    }

    /// Rebinds the view to `chat_id` with the given messages and every other
    /// field cleared.
    pub(crate) fn reset(&self, chat_id: &str, messages: Vec<ChatMessage>, title: Option<String>) {
        self.tx.send_replace(ChatViewState {
            chat_id: chat_id.to_string(),
            messages,
            status: ChatStatus::Ready,
            is_streaming: false,
            error: None,
            title,
        });
    }
}
