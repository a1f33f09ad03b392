//! In-memory doubles for the store, remote, cache, backend and title seams.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use super::observer::lock;
use super::BridgeDeps;
use super::ChatViewStore;
use super::TitleService;
use crate::domain::models::Backend;
use crate::domain::models::BackendBox;
use crate::domain::models::BackendName;
use crate::domain::models::BackendPrompt;
use crate::domain::models::BackendResponse;
use crate::domain::models::ChatMessage;
use crate::domain::models::ChatSession;
use crate::domain::models::ChatStore;
use crate::domain::models::MessagesPage;
use crate::domain::models::QueryCache;
use crate::domain::models::QueryKey;
use crate::domain::models::RemoteMessage;
use crate::domain::models::RemoteSession;
use crate::domain::models::RemoteSessionApi;
use crate::domain::models::Role;
use crate::domain::models::SessionFilters;
use crate::domain::models::SessionSeed;
use crate::domain::models::TitleGenerator;

pub fn ts(value: &str) -> DateTime<Utc> {
    return crate::domain::models::parse_timestamp(value).unwrap();
}

pub fn remote_session(chat_id: &str, updated_at: &str, last_seen_at: Option<&str>) -> RemoteSession {
    return RemoteSession {
        chat_id: chat_id.to_string(),
        title: Some(format!("Remote {chat_id}")),
        created_at: "2024-01-01T00:00:00Z".to_string(),
        updated_at: updated_at.to_string(),
        last_seen_at: last_seen_at.map(|e| return e.to_string()),
    };
}

pub fn remote_message(id: &str, role: Role, text: &str, created_at: &str) -> RemoteMessage {
    return RemoteMessage {
        id: id.to_string(),
        role,
        content: vec![crate::domain::models::text_part(text)],
        metadata: serde_json::Value::Null,
        created_at: created_at.to_string(),
    };
}

/// Blocks a fake call until the test releases it.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

#[derive(Default)]
pub struct FakeStore {
    pub rows: Mutex<BTreeMap<String, (ChatSession, Vec<ChatMessage>)>>,
    pub writes: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeStore {
    pub fn insert(&self, session: ChatSession, messages: Vec<ChatMessage>) {
        lock(&self.rows).insert(session.chat_id.to_string(), (session, messages));
    }

    pub fn session(&self, chat_id: &str) -> Option<ChatSession> {
        return lock(&self.rows).get(chat_id).map(|(session, _)| return session.clone());
    }

    pub fn messages(&self, chat_id: &str) -> Vec<ChatMessage> {
        return lock(&self.rows)
            .get(chat_id)
            .map(|(_, messages)| return messages.clone())
            .unwrap_or_default();
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }

        return Ok(());
    }

    fn write<F: FnOnce(&mut (ChatSession, Vec<ChatMessage>))>(&self, chat_id: &str, modify: F) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = lock(&self.rows);
        let Some(row) = rows.get_mut(chat_id) else {
            bail!(format!("No session {chat_id}"));
        };
        modify(row);

        return Ok(());
    }
}

#[async_trait]
impl ChatStore for FakeStore {
    async fn ensure_session(&self, chat_id: &str, seed: SessionSeed) -> Result<()> {
        self.check()?;
        let mut rows = lock(&self.rows);
        if !rows.contains_key(chat_id) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            rows.insert(chat_id.to_string(), (ChatSession::from_seed(chat_id, &seed), vec![]));
        }

        return Ok(());
    }

    async fn upsert_session(&self, chat_id: &str, seed: SessionSeed) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = lock(&self.rows);
        match rows.get_mut(chat_id) {
            Some((session, _)) => session.apply_seed(&seed),
            None => {
                rows.insert(chat_id.to_string(), (ChatSession::from_seed(chat_id, &seed), vec![]));
            }
        }

        return Ok(());
    }

    async fn get_chat_session(&self, chat_id: &str) -> Result<Option<ChatSession>> {
        self.check()?;
        return Ok(self.session(chat_id));
    }

    async fn get_chat_sessions(&self) -> Result<Vec<ChatSession>> {
        self.check()?;
        let mut sessions = lock(&self.rows)
            .values()
            .map(|(session, _)| return session.clone())
            .collect::<Vec<ChatSession>>();
        sessions.sort_by(|a, b| return b.updated_at.cmp(&a.updated_at));

        return Ok(sessions);
    }

    async fn has_persisted_messages(&self, chat_id: &str) -> Result<bool> {
        self.check()?;
        return Ok(!self.messages(chat_id).is_empty());
    }

    async fn upsert_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()> {
        return self.write(chat_id, |(_, stored)| {
            for message in messages {
                match stored.iter_mut().find(|e| return e.id == message.id) {
                    Some(existing) => *existing = message.clone(),
                    None => stored.push(message.clone()),
                }
            }
            stored.sort_by_key(|e| return e.created_at);
        });
    }

    async fn replace_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()> {
        return self.write(chat_id, |(_, stored)| {
            *stored = messages.to_vec();
        });
    }

    async fn load_ui_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        self.check()?;
        return Ok(self.messages(chat_id));
    }

    async fn update_session_title(&self, chat_id: &str, title: &str) -> Result<()> {
        return self.write(chat_id, |(session, _)| {
            session.title = Some(title.to_string());
        });
    }

    async fn delete_session(&self, chat_id: &str) -> Result<()> {
        self.check()?;
        lock(&self.rows).remove(chat_id);
        return Ok(());
    }
}

#[derive(Default)]
pub struct FakeRemote {
    pub sessions: Mutex<Vec<RemoteSession>>,
    /// Message pages keyed by `(chat_id, before)`.
    pub pages: Mutex<HashMap<(String, Option<String>), MessagesPage>>,
    pub list_calls: AtomicUsize,
    pub get_session_calls: AtomicUsize,
    pub page_requests: Mutex<Vec<Option<String>>>,
    pub title_updates: Mutex<Vec<(String, String)>>,
    pub deleted: Mutex<Vec<String>>,
    pub seen: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    pub list_gate: Option<Arc<Gate>>,
    pub messages_gate: Option<Arc<Gate>>,
}

impl FakeRemote {
    pub fn add_page(&self, chat_id: &str, before: Option<&str>, page: MessagesPage) {
        lock(&self.pages).insert(
            (chat_id.to_string(), before.map(|e| return e.to_string())),
            page,
        );
    }

    pub fn network_calls(&self) -> usize {
        return self.list_calls.load(Ordering::SeqCst)
            + self.get_session_calls.load(Ordering::SeqCst)
            + lock(&self.page_requests).len();
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("remote unavailable");
        }

        return Ok(());
    }
}

#[async_trait]
impl RemoteSessionApi for FakeRemote {
    async fn list_sessions(&self, _filters: &SessionFilters) -> Result<Vec<RemoteSession>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.list_gate {
            gate.pass().await;
        }
        self.check()?;

        return Ok(lock(&self.sessions).clone());
    }

    async fn get_session(&self, chat_id: &str) -> Result<Option<RemoteSession>> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        return Ok(lock(&self.sessions)
            .iter()
            .find(|e| return e.chat_id == chat_id)
            .cloned());
    }

    async fn get_messages(&self, chat_id: &str, before: Option<&str>) -> Result<MessagesPage> {
        lock(&self.page_requests).push(before.map(|e| return e.to_string()));
        if let Some(gate) = &self.messages_gate {
            gate.pass().await;
        }
        self.check()?;

        let key = (chat_id.to_string(), before.map(|e| return e.to_string()));
        return Ok(lock(&self.pages).get(&key).cloned().unwrap_or_default());
    }

    async fn update_session(&self, chat_id: &str, title: &str) -> Result<()> {
        self.check()?;
        lock(&self.title_updates).push((chat_id.to_string(), title.to_string()));
        return Ok(());
    }

    async fn delete_session(&self, chat_id: &str) -> Result<()> {
        self.check()?;
        lock(&self.deleted).push(chat_id.to_string());
        return Ok(());
    }

    async fn mark_seen(&self, chat_id: &str) -> Result<()> {
        self.check()?;
        lock(&self.seen).push(chat_id.to_string());
        return Ok(());
    }
}

#[derive(Default)]
pub struct RecordingCache {
    pub invalidated: Mutex<Vec<QueryKey>>,
}

impl RecordingCache {
    pub fn keys(&self) -> Vec<String> {
        return lock(&self.invalidated)
            .iter()
            .map(|e| return e.to_string())
            .collect();
    }
}

impl QueryCache for RecordingCache {
    fn invalidate(&self, key: &QueryKey) {
        lock(&self.invalidated).push(key.clone());
    }
}

/// Streams `chunks`, then either finishes, fails, or never finishes.
#[derive(Default)]
pub struct FakeBackend {
    pub chunks: Vec<String>,
    pub fail: bool,
    pub hang: bool,
    pub prompts: Arc<Mutex<Vec<BackendPrompt>>>,
}

impl FakeBackend {
    pub fn replying(chunks: &[&str]) -> FakeBackend {
        return FakeBackend {
            chunks: chunks.iter().map(|e| return e.to_string()).collect(),
            ..FakeBackend::default()
        };
    }

    pub fn boxed(self) -> Arc<BackendBox> {
        return Arc::new(Box::new(self));
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> BackendName {
        return BackendName::Ollama;
    }

    #[allow(clippy::implicit_return)]
    async fn health_check(&self) -> Result<()> {
        return Ok(());
    }

    #[allow(clippy::implicit_return)]
    async fn list_models(&self) -> Result<Vec<String>> {
        return Ok(vec!["fake".to_string()]);
    }

    #[allow(clippy::implicit_return)]
    async fn get_completion<'a>(
        &self,
        prompt: BackendPrompt,
        tx: &'a mpsc::UnboundedSender<BackendResponse>,
    ) -> Result<()> {
        lock(&self.prompts).push(prompt);

        for chunk in self.chunks.iter() {
            tx.send(BackendResponse {
                text: chunk.to_string(),
                done: false,
            })?;
            tokio::task::yield_now().await;
        }

        if self.hang {
            futures::future::pending::<()>().await;
        }

        if self.fail {
            bail!("backend exploded");
        }

        tx.send(BackendResponse {
            text: "".to_string(),
            done: true,
        })?;

        return Ok(());
    }
}

pub struct FakeTitleGenerator {
    pub title: Option<String>,
    pub calls: AtomicUsize,
}

impl FakeTitleGenerator {
    pub fn new(title: Option<&str>) -> FakeTitleGenerator {
        return FakeTitleGenerator {
            title: title.map(|e| return e.to_string()),
            calls: AtomicUsize::new(0),
        };
    }
}

#[async_trait]
impl TitleGenerator for FakeTitleGenerator {
    #[allow(clippy::implicit_return)]
    async fn generate_title(&self, _user: &ChatMessage, _assistant: &ChatMessage) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.title {
            Some(title) => return Ok(title.to_string()),
            None => bail!("title model unavailable"),
        }
    }
}

pub struct Harness {
    pub store: Arc<FakeStore>,
    pub remote: Arc<FakeRemote>,
    pub titles: Arc<FakeTitleGenerator>,
    pub deps: BridgeDeps,
}

impl Harness {
    pub fn new(backend: FakeBackend, title: Option<&str>) -> Harness {
        let store = Arc::new(FakeStore::default());
        let remote = Arc::new(FakeRemote::default());
        let titles = Arc::new(FakeTitleGenerator::new(title));
        let engine = Arc::new(super::StreamingChatEngine::new(backend.boxed(), "fake"));
        let deps = BridgeDeps {
            engine,
            titles: Arc::new(TitleService::new(
                titles.clone(),
                store.clone(),
                Some(remote.clone()),
            )),
            view: ChatViewStore::default(),
        };

        return Harness {
            store,
            remote,
            titles,
            deps,
        };
    }
}
