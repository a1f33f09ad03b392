use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::watch;

use crate::domain::models::ChatSession;
use crate::domain::models::SyncStats;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionListState {
    pub sessions: Vec<ChatSession>,
    pub is_syncing: bool,
    pub stats: SyncStats,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Reactive session list plus bulk-sync bookkeeping. Written only by the sync
/// service.
#[derive(Clone)]
pub struct SessionListStore {
    tx: Arc<watch::Sender<SessionListState>>,
}

impl Default for SessionListStore {
    fn default() -> SessionListStore {
        let (tx, _rx) = watch::channel(SessionListState::default());
        return SessionListStore { tx: Arc::new(tx) };
    }
}

impl SessionListStore {
    pub fn subscribe(&self) -> watch::Receiver<SessionListState> {
        return self.tx.subscribe();
    }

    pub fn get(&self) -> SessionListState {
        return self.tx.borrow().clone();
    }

    pub(crate) fn set_sessions(&self, sessions: Vec<ChatSession>) {
        self.tx.send_modify(|state| {
            state.sessions = sessions;
        });
    }

    pub(crate) fn begin_sync(&self) {
        self.tx.send_modify(|state| {
            state.is_syncing = true;
            state.error = None;
            state.stats = SyncStats::default();
        });
    }

    pub(crate) fn finish_sync(&self, stats: SyncStats, at: DateTime<Utc>) {
        self.tx.send_modify(|state| {
            state.stats = stats;
            state.last_synced_at = Some(at);
        });
    }

    pub(crate) fn fail_sync(&self, error: String) {
        self.tx.send_modify(|state| {
            state.error = Some(error);
        });
    }

    pub(crate) fn end_sync(&self) {
        self.tx.send_modify(|state| {
            state.is_syncing = false;
        });
    }
}
