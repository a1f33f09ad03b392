#[cfg(test)]
#[path = "session_sync_test.rs"]
mod tests;

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use dashmap::DashSet;
use serde_json::Value;

use super::SessionListStore;
use crate::domain::models::parse_timestamp;
use crate::domain::models::ChatMessage;
use crate::domain::models::ChatSession;
use crate::domain::models::ChatStore;
use crate::domain::models::QueryCache;
use crate::domain::models::QueryKey;
use crate::domain::models::RemoteMessage;
use crate::domain::models::RemoteSession;
use crate::domain::models::RemoteSessionApi;
use crate::domain::models::SessionFilters;
use crate::domain::models::SessionSeed;
use crate::domain::models::SyncStats;

/// Upper bound on pages walked per unseen-message fetch. A session with deeper
/// unseen history needs another pass.
pub const MAX_MESSAGE_PAGES: usize = 10;

pub fn normalize_remote_message(message: &RemoteMessage) -> Result<ChatMessage> {
    let metadata = match &message.metadata {
        Value::Object(map) => Some(map.clone()),
        _ => None,
    };

    return Ok(ChatMessage {
        id: message.id.to_string(),
        role: message.role,
        parts: message.content.clone(),
        metadata,
        created_at: parse_timestamp(&message.created_at)?,
    });
}

/// Holds the bulk-sync flag for as long as a sync runs and releases it on
/// every exit path.
struct SyncGuard<'a> {
    syncing: &'a AtomicBool,
    sessions: &'a SessionListStore,
}

impl<'a> SyncGuard<'a> {
    fn acquire(syncing: &'a AtomicBool, sessions: &'a SessionListStore) -> Option<SyncGuard<'a>> {
        if syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        sessions.begin_sync();
        return Some(SyncGuard { syncing, sessions });
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.sessions.end_sync();
        self.syncing.store(false, Ordering::Release);
    }
}

struct FetchGuard<'a> {
    chat_id: String,
    in_flight: &'a DashSet<String>,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.chat_id);
    }
}

/// Reconciles locally persisted sessions with the remote session service.
pub struct SessionSyncService {
    remote: Arc<dyn RemoteSessionApi + Send + Sync>,
    store: Arc<dyn ChatStore + Send + Sync>,
    cache: Arc<dyn QueryCache + Send + Sync>,
    sessions: SessionListStore,
    syncing: AtomicBool,
    fetching: DashSet<String>,
}

impl SessionSyncService {
    pub fn new(
        remote: Arc<dyn RemoteSessionApi + Send + Sync>,
        store: Arc<dyn ChatStore + Send + Sync>,
        cache: Arc<dyn QueryCache + Send + Sync>,
        sessions: SessionListStore,
    ) -> SessionSyncService {
        return SessionSyncService {
            remote,
            store,
            cache,
            sessions,
            syncing: AtomicBool::new(false),
            fetching: DashSet::new(),
        };
    }

    pub fn sessions(&self) -> SessionListStore {
        return self.sessions.clone();
    }

    pub fn is_syncing(&self) -> bool {
        return self.syncing.load(Ordering::Acquire);
    }

    /// Republishes every persisted session into the session list.
    pub async fn load_sessions_from_db(&self) -> Result<Vec<ChatSession>> {
        let sessions = self.store.get_chat_sessions().await?;
        self.sessions.set_sessions(sessions.clone());

        return Ok(sessions);
    }

    /// Makes sure every remote session exists locally. Messages are not
    /// fetched here, so `stats.messages` stays at zero.
    ///
    /// Returns an empty list without doing anything when another bulk sync is
    /// already running.
    pub async fn sync_sessions_and_messages_from_server(
        &self,
        filters: &SessionFilters,
    ) -> Result<Vec<ChatSession>> {
        let Some(_guard) = SyncGuard::acquire(&self.syncing, &self.sessions) else {
            tracing::debug!("Session sync already running");
            return Ok(vec![]);
        };

        let res = self.sync_sessions(filters).await;
        if let Err(err) = &res {
            tracing::error!(error = ?err, "Session sync failed");
            self.sessions.fail_sync(format!("{err:#}"));
        }

        return res;
    }

    async fn sync_sessions(&self, filters: &SessionFilters) -> Result<Vec<ChatSession>> {
        let remote_sessions = self.remote.list_sessions(filters).await?;

        for remote in remote_sessions.iter() {
            let created_at = parse_timestamp(&remote.created_at)?;
            self.store
                .ensure_session(
                    &remote.chat_id,
                    SessionSeed {
                        title: remote.title.clone(),
                        created_at,
                        updated_at: created_at,
                        is_local: false,
                    },
                )
                .await?;
        }

        let sessions = self.load_sessions_from_db().await?;
        let stats = SyncStats {
            sessions: remote_sessions.len(),
            messages: 0,
            failures: 0,
        };
        self.sessions.finish_sync(stats, Utc::now());

        tracing::info!(sessions = remote_sessions.len(), "Sessions synced from server");
        return Ok(sessions);
    }

    /// Walks message pages backwards from the newest until the cursor passes
    /// `last_seen_at`, at most [`MAX_MESSAGE_PAGES`] pages. The result is
    /// deduplicated by id and sorted oldest first.
    pub async fn fetch_unseen_remote_messages(
        &self,
        chat_id: &str,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteMessage>> {
        let mut collected: Vec<RemoteMessage> = vec![];
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut before: Option<String> = None;

        for page_idx in 0..MAX_MESSAGE_PAGES {
            let page = self.remote.get_messages(chat_id, before.as_deref()).await?;
            tracing::debug!(
                chat_id,
                page = page_idx,
                count = page.messages.len(),
                next_before = ?page.next_before,
                "Fetched message page"
            );

            for message in page.messages {
                if seen_ids.insert(message.id.to_string()) {
                    collected.push(message);
                }
            }

            let Some(next_before) = page.next_before else {
                break;
            };

            if let (Ok(cursor), Some(last_seen)) = (parse_timestamp(&next_before), last_seen_at) {
                if cursor <= last_seen {
                    break;
                }
            }

            before = Some(next_before);
        }

        let mut keyed = collected
            .into_iter()
            .map(|message| {
                let created_at = parse_timestamp(&message.created_at).ok();
                return (created_at, message);
            })
            .collect::<Vec<(Option<DateTime<Utc>>, RemoteMessage)>>();
        keyed.sort_by_key(|(created_at, _)| return *created_at);

        return Ok(keyed.into_iter().map(|(_, message)| return message).collect());
    }

    /// Pulls unseen messages for `session` into the local store. Returns
    /// `false` when the local copy is already fresh (and `force` is unset) or
    /// when another fetch for the same session is in flight.
    pub async fn fetch_and_persist_messages(
        &self,
        session: &RemoteSession,
        force: bool,
    ) -> Result<bool> {
        let chat_id = session.chat_id.as_str();
        if !self.fetching.insert(chat_id.to_string()) {
            tracing::debug!(chat_id, "Message fetch already in flight");
            return Ok(false);
        }
        let _guard = FetchGuard {
            chat_id: chat_id.to_string(),
            in_flight: &self.fetching,
        };

        let remote_updated_at = parse_timestamp(&session.updated_at)?;
        if !force {
            if let Some(local) = self.store.get_chat_session(chat_id).await? {
                if local.updated_at >= remote_updated_at
                    && self.store.has_persisted_messages(chat_id).await?
                {
                    tracing::debug!(chat_id, "Local messages are fresh");
                    return Ok(false);
                }
            }
        }

        let last_seen_at = match (&session.last_seen_at, force) {
            (Some(last_seen), false) => Some(parse_timestamp(last_seen)?),
            _ => None,
        };

        let remote_messages = self
            .fetch_unseen_remote_messages(chat_id, last_seen_at)
            .await?;
        let messages = remote_messages
            .iter()
            .map(normalize_remote_message)
            .collect::<Result<Vec<ChatMessage>>>()?;

        let created_at = parse_timestamp(&session.created_at)?;
        self.store
            .upsert_session(
                chat_id,
                SessionSeed {
                    title: session.title.clone(),
                    created_at,
                    updated_at: created_at,
                    is_local: false,
                },
            )
            .await?;
        self.store.upsert_messages(chat_id, &messages).await?;

        self.load_sessions_from_db().await?;
        self.cache
            .invalidate(&QueryKey::SessionDetail(chat_id.to_string()));
        self.cache.invalidate(&QueryKey::SessionList);
        self.cache.invalidate(&QueryKey::UnreadCount);

        tracing::info!(chat_id, messages = messages.len(), "Session messages persisted");
        return Ok(true);
    }

    /// Brings one session's messages up to date and returns them. Local-only
    /// sessions never touch the network.
    pub async fn sync_session_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        if let Some(local) = self.store.get_chat_session(chat_id).await? {
            if local.is_local {
                return self.store.load_ui_messages(chat_id).await;
            }
        }

        let Some(remote) = self.remote.get_session(chat_id).await? else {
            tracing::debug!(chat_id, "Session not found on server, using local copy");
            return self.store.load_ui_messages(chat_id).await;
        };

        self.fetch_and_persist_messages(&remote, false).await?;
        return self.store.load_ui_messages(chat_id).await;
    }

    /// Re-downloads every message of a remote session regardless of freshness
    /// or `last_seen_at`.
    pub async fn refetch_session_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        if self.is_local(chat_id).await? {
            bail!(format!("Session {chat_id} only exists locally"));
        }

        let Some(remote) = self.remote.get_session(chat_id).await? else {
            bail!(format!("Session {chat_id} was not found on the server"));
        };

        self.fetch_and_persist_messages(&remote, true).await?;
        return self.store.load_ui_messages(chat_id).await;
    }

    pub async fn mark_session_seen(&self, chat_id: &str) -> Result<()> {
        if self.is_local(chat_id).await? {
            return Ok(());
        }

        self.remote.mark_seen(chat_id).await?;
        self.cache.invalidate(&QueryKey::UnreadCount);

        return Ok(());
    }

    /// Explicit user deletion. The sync paths never call this.
    pub async fn delete_session(&self, chat_id: &str) -> Result<()> {
        if !self.is_local(chat_id).await? {
            self.remote.delete_session(chat_id).await?;
        }

        self.store.delete_session(chat_id).await?;
        self.load_sessions_from_db().await?;
        self.cache
            .invalidate(&QueryKey::SessionDetail(chat_id.to_string()));
        self.cache.invalidate(&QueryKey::SessionList);
        self.cache.invalidate(&QueryKey::UnreadCount);

        tracing::info!(chat_id, "Session deleted");
        return Ok(());
    }

    async fn is_local(&self, chat_id: &str) -> Result<bool> {
        let local = self.store.get_chat_session(chat_id).await?;
        return Ok(local.map(|e| return e.is_local).unwrap_or(false));
    }
}
