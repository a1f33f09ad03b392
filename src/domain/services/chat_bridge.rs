#[cfg(test)]
#[path = "chat_bridge_test.rs"]
mod tests;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::observer::lock;
use super::observer::Listener;
use super::observer::Subject;
use super::observer::Subscription;
use super::ChatViewState;
use super::ChatViewStore;
use super::TitleService;
use crate::domain::models::ChatEngine;
use crate::domain::models::ChatMessage;
use crate::domain::models::ChatState;
use crate::domain::models::ChatStatus;
use crate::domain::models::Role;
use crate::domain::models::SendOptions;
use crate::domain::models::StreamingState;

/// Collaborators shared by every bridge the application creates.
#[derive(Clone)]
pub struct BridgeDeps {
    pub engine: Arc<dyn ChatEngine + Send + Sync>,
    pub titles: Arc<TitleService>,
    pub view: ChatViewStore,
}

/// Owns the live message array of one chat. The engine writes through the
/// [`ChatState`] contract, and every mutation is mirrored into the
/// [`ChatViewStore`] before the state lock is released.
pub struct ChatBridge {
    chat_id: String,
    state: Mutex<StreamingState>,
    deps: BridgeDeps,
    message_listeners: Subject<Vec<ChatMessage>>,
    status_listeners: Subject<ChatStatus>,
    error_listeners: Subject<Option<String>>,
    title_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatBridge {
    pub fn new(chat_id: &str, messages: Vec<ChatMessage>, deps: BridgeDeps) -> ChatBridge {
        return ChatBridge {
            chat_id: chat_id.to_string(),
            state: Mutex::new(StreamingState {
                messages,
                status: ChatStatus::Ready,
                error: None,
            }),
            deps,
            message_listeners: Subject::default(),
            status_listeners: Subject::default(),
            error_listeners: Subject::default(),
            title_task: Mutex::new(None),
        };
    }

    pub fn chat_id(&self) -> &str {
        return &self.chat_id;
    }

    /// Writes into the view only while it is still bound to this chat, so a
    /// bridge that was swapped out can't clobber its successor.
    fn mirror<F: FnOnce(&mut ChatViewState)>(&self, modify: F) {
        let chat_id = self.chat_id.as_str();
        self.deps.view.update(|view| {
            if view.chat_id == chat_id {
                modify(view);
            }
        });
    }

    fn write_messages<F: FnOnce(&mut Vec<ChatMessage>)>(&self, modify: F) -> Vec<ChatMessage> {
        let mut state = lock(&self.state);
        modify(&mut state.messages);
        let snapshot = state.messages.clone();
        self.mirror(|view| {
            view.messages = snapshot.clone();
        });
        drop(state);

        return snapshot;
    }

    pub fn on_messages_change(
        &self,
        listener: Listener<Vec<ChatMessage>>,
        throttle_interval: Option<Duration>,
    ) -> Subscription {
        match throttle_interval {
            Some(interval) => return self.message_listeners.subscribe_throttled(interval, listener),
            None => return self.message_listeners.subscribe(listener),
        }
    }

    pub fn on_status_change(&self, listener: Listener<ChatStatus>) -> Subscription {
        return self.status_listeners.subscribe(listener);
    }

    pub fn on_error_change(&self, listener: Listener<Option<String>>) -> Subscription {
        return self.error_listeners.subscribe(listener);
    }

    fn capture(&self, res: Result<()>) -> Result<()> {
        if let Err(err) = &res {
            tracing::error!(chat_id = %self.chat_id, error = ?err, "Chat exchange failed");
            self.set_error(Some(format!("{err:#}")));
            self.set_status(ChatStatus::Error);
        }

        return res;
    }

    pub async fn send_message(&self, message: ChatMessage, options: SendOptions) -> Result<()> {
        let res = self.deps.engine.send_message(self, message, options).await;
        return self.capture(res);
    }

    pub async fn regenerate(&self, message_id: &str) -> Result<()> {
        let res = self.deps.engine.regenerate(self, message_id).await;
        return self.capture(res);
    }

    pub fn stop(&self) {
        self.deps.engine.stop();
    }

    pub async fn resume_stream(&self) -> Result<()> {
        let res = self.deps.engine.resume_stream(self).await;
        return self.capture(res);
    }

    /// Clears the conversation but keeps the chat id.
    pub fn reset_chat(&self) {
        let mut state = lock(&self.state);
        state.messages.clear();
        state.error = None;
        state.status = ChatStatus::Ready;
        self.mirror(|view| {
            view.messages = vec![];
            view.error = None;
            view.status = ChatStatus::Ready;
            view.is_streaming = false;
            view.title = None;
        });
        drop(state);

        self.message_listeners.notify(&vec![]);
        self.status_listeners.notify(&ChatStatus::Ready);
        self.error_listeners.notify(&None);
    }

    /// Waits for a pending title generation, if one was started.
    pub async fn wait_for_title(&self) {
        let task = lock(&self.title_task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(chat_id = %self.chat_id, error = ?err, "Title task did not complete");
            }
        }
    }

    fn spawn_title(&self, user: ChatMessage, assistant: ChatMessage) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(chat_id = %self.chat_id, "No runtime available for title generation");
            return;
        };

        let chat_id = self.chat_id.to_string();
        let titles = self.deps.titles.clone();
        let view = self.deps.view.clone();
        let task = runtime.spawn(async move {
            match titles.generate_and_persist(&chat_id, &user, &assistant).await {
                Ok(title) => {
                    view.update(|state| {
                        if state.chat_id == chat_id {
                            state.title = Some(title);
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(chat_id = %chat_id, error = ?err, "Failed to generate session title");
                }
            }
        });

        *lock(&self.title_task) = Some(task);
    }
}

impl ChatState for ChatBridge {
    fn messages(&self) -> Vec<ChatMessage> {
        return lock(&self.state).messages.clone();
    }

    fn set_messages(&self, messages: Vec<ChatMessage>) {
        let snapshot = self.write_messages(|current| {
            *current = messages;
        });
        self.message_listeners.notify(&snapshot);
    }

    fn push_message(&self, message: ChatMessage) {
        let snapshot = self.write_messages(|current| {
            current.push(message);
        });
        self.message_listeners.notify(&snapshot);
    }

    fn pop_message(&self) -> Option<ChatMessage> {
        let mut popped = None;
        let snapshot = self.write_messages(|current| {
            popped = current.pop();
        });
        self.message_listeners.notify(&snapshot);

        return popped;
    }

    /// Stores a copy of `message` so the slot holds a fresh value even when it
    /// is field-for-field equal to what was there.
    fn replace_message(&self, index: usize, message: &ChatMessage) -> Result<()> {
        let mut state = lock(&self.state);
        let len = state.messages.len();
        let Some(slot) = state.messages.get_mut(index) else {
            bail!(format!("Cannot replace message {index}, chat only has {len}"));
        };
        *slot = message.clone();

        let snapshot = state.messages.clone();
        self.mirror(|view| {
            view.messages = snapshot.clone();
        });
        drop(state);
        self.message_listeners.notify(&snapshot);

        return Ok(());
    }

    fn status(&self) -> ChatStatus {
        return lock(&self.state).status;
    }

    fn set_status(&self, status: ChatStatus) {
        let mut state = lock(&self.state);
        state.status = status;
        self.mirror(|view| {
            view.status = status;
            view.is_streaming = status == ChatStatus::Streaming;
        });
        drop(state);

        self.status_listeners.notify(&status);
    }

    fn error(&self) -> Option<String> {
        return lock(&self.state).error.clone();
    }

    fn set_error(&self, error: Option<String>) {
        let mut state = lock(&self.state);
        state.error = error.clone();
        self.mirror(|view| {
            view.error = error.clone();
        });
        drop(state);

        self.error_listeners.notify(&error);
    }

    fn snapshot(&self) -> StreamingState {
        return lock(&self.state).clone();
    }

    fn on_finish(&self, message: &ChatMessage) {
        let messages = self.messages();
        let assistant_count = messages
            .iter()
            .filter(|e| return e.role == Role::Assistant)
            .count();
        if assistant_count != 1 || messages.len() < 2 {
            return;
        }

        let Some(user) = messages.iter().find(|e| return e.role == Role::User) else {
            return;
        };

        tracing::debug!(chat_id = %self.chat_id, message_id = %message.id, "First reply finished, naming session");
        self.spawn_title(user.clone(), message.clone());
    }
}
