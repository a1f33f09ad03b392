use anyhow::Result;
use async_trait::async_trait;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use serde_json::Value;

use super::Role;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPage {
    pub messages: Vec<RemoteMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_before: Option<String>,
}

/// Optional narrowing of the remote session list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionFilters {
    pub unread_only: bool,
    pub limit: Option<u32>,
}

impl SessionFilters {
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query = vec![];
        if self.unread_only {
            query.push(("unread".to_string(), "true".to_string()));
        }
        if let Some(limit) = self.limit {
            query.push(("limit".to_string(), limit.to_string()));
        }

        return query;
    }
}

#[async_trait]
pub trait RemoteSessionApi {
    async fn list_sessions(&self, filters: &SessionFilters) -> Result<Vec<RemoteSession>>;

    /// Returns `None` when the service has no session with the given id.
    async fn get_session(&self, chat_id: &str) -> Result<Option<RemoteSession>>;

    /// Keyset-paginated message fetch. `before` is omitted on the first page and
    /// set to the previous page's `next_before` afterwards.
    async fn get_messages(&self, chat_id: &str, before: Option<&str>) -> Result<MessagesPage>;

    async fn update_session(&self, chat_id: &str, title: &str) -> Result<()>;

    async fn delete_session(&self, chat_id: &str) -> Result<()>;

    async fn mark_seen(&self, chat_id: &str) -> Result<()>;
}
