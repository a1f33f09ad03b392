#[cfg(test)]
#[path = "http_test.rs"]
mod tests;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::MessagesPage;
use crate::domain::models::RemoteSession;
use crate::domain::models::RemoteSessionApi;
use crate::domain::models::SessionFilters;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct UpdateSessionRequest<'a> {
    title: &'a str,
}

/// Client for the feed service's `/ai/sessions` endpoints.
pub struct HttpSessionApi {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl Default for HttpSessionApi {
    fn default() -> HttpSessionApi {
        return HttpSessionApi::new(Config::get(ConfigKey::ApiURL), Config::get(ConfigKey::ApiToken));
    }
}

impl HttpSessionApi {
    pub fn new(url: String, token: String) -> HttpSessionApi {
        return HttpSessionApi {
            url: url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        };
    }

    /// Appends each segment to the base URL, percent-encoding it so ids can't
    /// escape their path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        {
            let Ok(mut path) = url.path_segments_mut() else {
                bail!(format!("Session API URL {} cannot be used as a base", self.url));
            };
            path.pop_if_empty().extend(segments);
        }

        return Ok(url);
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        if self.token.is_empty() {
            return req;
        }

        return req.bearer_auth(&self.token);
    }

    async fn send(&self, req: RequestBuilder, action: &str) -> Result<Response> {
        let res = self.authorize(req).send().await?;
        if !res.status().is_success() {
            tracing::error!(
                status = res.status().as_u16(),
                action = action,
                "Session API request failed"
            );
            bail!(format!(
                "Failed to {action}, session API returned {status}",
                status = res.status().as_u16()
            ));
        }

        return Ok(res);
    }

    async fn data<T: DeserializeOwned>(&self, req: RequestBuilder, action: &str) -> Result<Option<T>> {
        let res = self.send(req, action).await?;
        let envelope = res.json::<Envelope<T>>().await?;

        return Ok(envelope.data);
    }
}

#[async_trait]
impl RemoteSessionApi for HttpSessionApi {
    #[allow(clippy::implicit_return)]
    async fn list_sessions(&self, filters: &SessionFilters) -> Result<Vec<RemoteSession>> {
        let req = self
            .client
            .get(self.endpoint(&["ai", "sessions"])?)
            .query(&filters.to_query());

        let sessions = self
            .data::<Vec<RemoteSession>>(req, "list sessions")
            .await?
            .unwrap_or_default();
        tracing::debug!(count = sessions.len(), "Listed remote sessions");

        return Ok(sessions);
    }

    #[allow(clippy::implicit_return)]
    async fn get_session(&self, chat_id: &str) -> Result<Option<RemoteSession>> {
        let res = self
            .authorize(self.client.get(self.endpoint(&["ai", "sessions", chat_id])?))
            .send()
            .await?;

        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            tracing::error!(
                status = res.status().as_u16(),
                chat_id = chat_id,
                "Session API request failed"
            );
            bail!(format!(
                "Failed to get session, session API returned {status}",
                status = res.status().as_u16()
            ));
        }

        let envelope = res.json::<Envelope<RemoteSession>>().await?;
        return Ok(envelope.data);
    }

    #[allow(clippy::implicit_return)]
    async fn get_messages(&self, chat_id: &str, before: Option<&str>) -> Result<MessagesPage> {
        let mut req = self
            .client
            .get(self.endpoint(&["ai", "sessions", chat_id, "messages"])?);
        if let Some(before) = before {
            req = req.query(&[("before", before)]);
        }

        let page = self
            .data::<MessagesPage>(req, "get messages")
            .await?
            .unwrap_or_default();

        return Ok(page);
    }

    #[allow(clippy::implicit_return)]
    async fn update_session(&self, chat_id: &str, title: &str) -> Result<()> {
        let req = self
            .client
            .patch(self.endpoint(&["ai", "sessions", chat_id])?)
            .json(&UpdateSessionRequest { title });
        self.send(req, "update session").await?;

        return Ok(());
    }

    #[allow(clippy::implicit_return)]
    async fn delete_session(&self, chat_id: &str) -> Result<()> {
        let req = self.client.delete(self.endpoint(&["ai", "sessions", chat_id])?);
        self.send(req, "delete session").await?;

        return Ok(());
    }

    #[allow(clippy::implicit_return)]
    async fn mark_seen(&self, chat_id: &str) -> Result<()> {
        let req = self
            .client
            .post(self.endpoint(&["ai", "sessions", chat_id, "seen"])?);
        self.send(req, "mark session seen").await?;

        return Ok(());
    }
}
