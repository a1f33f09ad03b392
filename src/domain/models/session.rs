#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

use chrono::DateTime;
use chrono::Utc;
use serde_derive::Deserialize;
use serde_derive::Serialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncStatus {
    Local,
    Synced,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub chat_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_local: bool,
    pub sync_status: SyncStatus,
}

impl ChatSession {
    pub fn from_seed(chat_id: &str, seed: &SessionSeed) -> ChatSession {
        return ChatSession {
            chat_id: chat_id.to_string(),
            title: seed.title.clone(),
            created_at: seed.created_at,
            updated_at: seed.updated_at,
            is_local: seed.is_local,
            sync_status: SyncStatus::from_is_local(seed.is_local),
        };
    }

    /// Folds seed metadata into an existing row. A missing seed title never
    /// clears a known one.
    pub fn apply_seed(&mut self, seed: &SessionSeed) {
        if seed.title.is_some() {
            self.title = seed.title.clone();
        }
        self.created_at = seed.created_at;
        self.updated_at = seed.updated_at;
        self.is_local = seed.is_local;
        self.sync_status = SyncStatus::from_is_local(seed.is_local);
    }
}

impl SyncStatus {
    pub fn from_is_local(is_local: bool) -> SyncStatus {
        if is_local {
            return SyncStatus::Local;
        }

        return SyncStatus::Synced;
    }
}

/// Metadata used to create or refresh a persisted session row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSeed {
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_local: bool,
}

impl SessionSeed {
    pub fn local(now: DateTime<Utc>) -> SessionSeed {
        return SessionSeed {
            title: None,
            created_at: now,
            updated_at: now,
            is_local: true,
        };
    }
}

/// Summary of the most recent bulk sync. Never persisted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub sessions: usize,
    pub messages: usize,
    pub failures: usize,
}
