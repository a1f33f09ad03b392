#[cfg(test)]
#[path = "chat_engine_test.rs"]
mod tests;

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::observer::lock;
use crate::domain::models::Backend;
use crate::domain::models::BackendBox;
use crate::domain::models::BackendPrompt;
use crate::domain::models::BackendResponse;
use crate::domain::models::ChatEngine;
use crate::domain::models::ChatMessage;
use crate::domain::models::ChatState;
use crate::domain::models::ChatStatus;
use crate::domain::models::Role;
use crate::domain::models::SendOptions;

/// Drives one exchange at a time against a streaming backend, writing every
/// step through the [`ChatState`] it is handed.
pub struct StreamingChatEngine {
    backend: Arc<BackendBox>,
    model: String,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl StreamingChatEngine {
    pub fn new(backend: Arc<BackendBox>, model: &str) -> StreamingChatEngine {
        return StreamingChatEngine {
            backend,
            model: model.to_string(),
            in_flight: Mutex::new(None),
        };
    }

    async fn stream_reply(&self, state: &(dyn ChatState + Send + Sync), model: String) -> Result<()> {
        let token = CancellationToken::new();
        *lock(&self.in_flight) = Some(token.clone());

        let res = self.run_stream(state, model, &token).await;
        lock(&self.in_flight).take();

        return res;
    }

    async fn run_stream(
        &self,
        state: &(dyn ChatState + Send + Sync),
        model: String,
        token: &CancellationToken,
    ) -> Result<()> {
        let prompt = BackendPrompt::from_messages(&model, &state.messages());
        state.set_status(ChatStatus::Submitted);

        let (tx, mut rx) = mpsc::unbounded_channel::<BackendResponse>();
        let backend = self.backend.clone();
        let completion = tokio::spawn(async move {
            return backend.get_completion(prompt, &tx).await;
        });

        let mut reply: Option<(usize, ChatMessage)> = None;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    completion.abort();
                    state.set_status(ChatStatus::Ready);
                    tracing::debug!(backend = %self.backend.name(), model = %model, "Stream aborted");
                    return Ok(());
                }
                chunk = rx.recv() => chunk,
            };

            let Some(chunk) = chunk else {
                break;
            };

            if reply.is_none() {
                if chunk.text.is_empty() {
                    continue;
                }

                let message = ChatMessage::new(Role::Assistant, "");
                state.push_message(message.clone());
                state.set_status(ChatStatus::Streaming);
                reply = Some((state.messages().len() - 1, message));
            }

            if let Some((index, message)) = &mut reply {
                if !chunk.text.is_empty() {
                    message.append_text(&chunk.text);
                    if let Err(err) = state.replace_message(*index, message) {
                        completion.abort();
                        return Err(err);
                    }
                }
            }
        }

        let outcome = match completion.await {
            Ok(res) => res,
            Err(err) => Err(anyhow!(err)),
        };

        if let Err(err) = outcome {
            if let Some((_, message)) = &reply {
                let last_id = state.messages().last().map(|e| return e.id.to_string());
                if last_id.as_deref() == Some(message.id.as_str()) {
                    state.pop_message();
                }
            }
            return Err(err);
        }

        let Some((_, message)) = reply else {
            bail!("Backend finished without returning a response");
        };

        state.set_status(ChatStatus::Ready);
        state.on_finish(&message);

        return Ok(());
    }
}

#[async_trait]
impl ChatEngine for StreamingChatEngine {
    #[allow(clippy::implicit_return)]
    async fn send_message(
        &self,
        state: &(dyn ChatState + Send + Sync),
        message: ChatMessage,
        options: SendOptions,
    ) -> Result<()> {
        state.set_error(None);
        state.push_message(message);

        let model = options.model.unwrap_or_else(|| return self.model.to_string());
        return self.stream_reply(state, model).await;
    }

    #[allow(clippy::implicit_return)]
    async fn regenerate(
        &self,
        state: &(dyn ChatState + Send + Sync),
        message_id: &str,
    ) -> Result<()> {
        let mut messages = state.messages();
        let Some(index) = messages.iter().position(|e| return e.id == message_id) else {
            bail!(format!("No message found for id {message_id}"));
        };

        if messages[index].role == Role::Assistant {
            messages.truncate(index);
        } else {
            messages.truncate(index + 1);
        }

        state.set_error(None);
        state.set_messages(messages);

        return self.stream_reply(state, self.model.to_string()).await;
    }

    fn stop(&self) {
        if let Some(token) = lock(&self.in_flight).take() {
            token.cancel();
        }
    }

    #[allow(clippy::implicit_return)]
    async fn resume_stream(&self, state: &(dyn ChatState + Send + Sync)) -> Result<()> {
        let needs_reply = state
            .messages()
            .last()
            .map(|e| return e.role == Role::User)
            .unwrap_or(false);

        if !needs_reply {
            tracing::debug!("Nothing to resume");
            return Ok(());
        }

        state.set_error(None);
        return self.stream_reply(state, self.model.to_string()).await;
    }
}
