use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use super::normalize_remote_message;
use super::SessionSyncService;
use super::MAX_MESSAGE_PAGES;
use crate::domain::models::ChatMessage;
use crate::domain::models::ChatSession;
use crate::domain::models::MessagesPage;
use crate::domain::models::RemoteMessage;
use crate::domain::models::RemoteSession;
use crate::domain::models::Role;
use crate::domain::models::SessionFilters;
use crate::domain::models::SessionSeed;
use crate::domain::models::SyncStats;
use crate::domain::services::observer::lock;
use crate::domain::services::testing::remote_message;
use crate::domain::services::testing::remote_session;
use crate::domain::services::testing::ts;
use crate::domain::services::testing::FakeRemote;
use crate::domain::services::testing::FakeStore;
use crate::domain::services::testing::Gate;
use crate::domain::services::testing::RecordingCache;
use crate::domain::services::SessionListStore;

struct Fixture {
    store: Arc<FakeStore>,
    remote: Arc<FakeRemote>,
    cache: Arc<RecordingCache>,
    service: SessionSyncService,
}

fn fixture(remote: FakeRemote) -> Fixture {
    let store = Arc::new(FakeStore::default());
    let remote = Arc::new(remote);
    let cache = Arc::new(RecordingCache::default());
    let service = SessionSyncService::new(
        remote.clone(),
        store.clone(),
        cache.clone(),
        SessionListStore::default(),
    );

    return Fixture {
        store,
        remote,
        cache,
        service,
    };
}

fn seeded(chat_id: &str, updated_at: &str, is_local: bool) -> ChatSession {
    return ChatSession::from_seed(
        chat_id,
        &SessionSeed {
            title: None,
            created_at: ts("2024-01-01"),
            updated_at: ts(updated_at),
            is_local,
        },
    );
}

mod normalize {
    use super::*;

    #[test]
    fn it_drops_non_object_metadata() -> Result<()> {
        let remote = RemoteMessage {
            metadata: json!("not-an-object"),
            ..remote_message("m1", Role::Assistant, "hello", "2024-01-02T03:04:05Z")
        };

        let message = normalize_remote_message(&remote)?;

        assert_eq!(message.id, "m1");
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.parts, remote.content);
        assert_eq!(message.created_at, ts("2024-01-02T03:04:05Z"));
        assert_eq!(message.metadata, None);

        return Ok(());
    }

    #[test]
    fn it_keeps_object_metadata() -> Result<()> {
        let remote = RemoteMessage {
            metadata: json!({ "model": "fake" }),
            ..remote_message("m1", Role::User, "hello", "2024-01-02")
        };

        let message = normalize_remote_message(&remote)?;

        assert_eq!(
            serde_json::to_value(message.metadata)?,
            json!({ "model": "fake" })
        );

        return Ok(());
    }

    #[test]
    fn it_rejects_unparseable_timestamps() {
        let remote = remote_message("m1", Role::User, "hello", "yesterday");
        assert!(normalize_remote_message(&remote).is_err());
    }
}

mod sync_sessions_and_messages_from_server {
    use super::*;

    #[tokio::test]
    async fn it_materializes_remote_sessions() -> Result<()> {
        let remote = FakeRemote::default();
        lock(&remote.sessions).push(remote_session("a", "2024-01-02", None));
        let fixture = fixture(remote);

        let sessions = fixture
            .service
            .sync_sessions_and_messages_from_server(&SessionFilters::default())
            .await?;

        assert_eq!(sessions.len(), 1);
        let state = fixture.service.sessions().get();
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.sessions[0].chat_id, "a");
        assert!(!state.sessions[0].is_local);
        assert_eq!(state.sessions[0].updated_at, ts("2024-01-01"));
        assert_eq!(
            state.stats,
            SyncStats {
                sessions: 1,
                messages: 0,
                failures: 0,
            }
        );
        assert!(state.last_synced_at.is_some());
        assert!(!state.is_syncing);
        assert!(fixture.store.messages("a").is_empty());

        return Ok(());
    }

    #[tokio::test]
    async fn it_ignores_a_concurrent_sync() -> Result<()> {
        let gate = Arc::new(Gate::default());
        let remote = FakeRemote {
            list_gate: Some(gate.clone()),
            ..FakeRemote::default()
        };
        lock(&remote.sessions).push(remote_session("a", "2024-01-02", None));
        let fixture = fixture(remote);
        let filters = SessionFilters::default();

        let first = fixture.service.sync_sessions_and_messages_from_server(&filters);
        let second = async {
            gate.entered.notified().await;
            assert!(fixture.service.is_syncing());
            assert!(fixture.service.sessions().get().is_syncing);
            let res = fixture
                .service
                .sync_sessions_and_messages_from_server(&filters)
                .await;
            gate.release.notify_one();
            return res;
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first?.len(), 1);
        assert!(second?.is_empty());
        assert_eq!(fixture.remote.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.service.sessions().get().sessions.len(), 1);
        assert!(!fixture.service.is_syncing());

        return Ok(());
    }

    #[tokio::test]
    async fn it_records_failures_and_returns_to_idle() {
        let fixture = fixture(FakeRemote {
            fail: AtomicBool::new(true),
            ..FakeRemote::default()
        });

        let res = fixture
            .service
            .sync_sessions_and_messages_from_server(&SessionFilters::default())
            .await;

        assert!(res.is_err());
        let state = fixture.service.sessions().get();
        assert_eq!(state.error, Some("remote unavailable".to_string()));
        assert!(!state.is_syncing);
        assert!(!fixture.service.is_syncing());
    }

    #[tokio::test]
    async fn it_clears_the_previous_error() -> Result<()> {
        let fixture = fixture(FakeRemote {
            fail: AtomicBool::new(true),
            ..FakeRemote::default()
        });
        let filters = SessionFilters::default();
        let _ = fixture
            .service
            .sync_sessions_and_messages_from_server(&filters)
            .await;

        fixture.remote.fail.store(false, Ordering::SeqCst);
        fixture
            .service
            .sync_sessions_and_messages_from_server(&filters)
            .await?;

        assert_eq!(fixture.service.sessions().get().error, None);

        return Ok(());
    }

    #[tokio::test]
    async fn it_keeps_local_titles_when_remote_has_none() -> Result<()> {
        let remote = FakeRemote::default();
        lock(&remote.sessions).push(RemoteSession {
            title: None,
            ..remote_session("a", "2024-01-02", None)
        });
        let fixture = fixture(remote);
        let mut existing = seeded("a", "2024-01-01", false);
        existing.title = Some("Known".to_string());
        fixture.store.insert(existing, vec![]);

        fixture
            .service
            .sync_sessions_and_messages_from_server(&SessionFilters::default())
            .await?;

        assert_eq!(
            fixture.store.session("a").and_then(|e| return e.title),
            Some("Known".to_string())
        );

        return Ok(());
    }

    #[tokio::test]
    async fn it_publishes_progress_to_subscribers() -> Result<()> {
        let gate = Arc::new(Gate::default());
        let remote = FakeRemote {
            list_gate: Some(gate.clone()),
            ..FakeRemote::default()
        };
        lock(&remote.sessions).push(remote_session("a", "2024-01-02", None));
        let fixture = fixture(remote);
        let mut updates = fixture.service.sessions().subscribe();

        let filters = SessionFilters::default();
        let sync = fixture
            .service
            .sync_sessions_and_messages_from_server(&filters);
        let watcher = async {
            gate.entered.notified().await;
            updates.changed().await?;
            let during = updates.borrow_and_update().clone();
            gate.release.notify_one();
            let after = updates.wait_for(|e| return !e.is_syncing).await?.clone();
            return anyhow::Ok((during, after));
        };
        let (synced, watched) = tokio::join!(sync, watcher);
        synced?;
        let (during, after) = watched?;

        assert!(during.is_syncing);
        assert!(during.sessions.is_empty());
        assert_eq!(during.error, None);

        assert_eq!(after.sessions.len(), 1);
        assert_eq!(after.sessions[0].chat_id, "a");
        assert_eq!(after.stats.sessions, 1);
        assert!(after.last_synced_at.is_some());

        return Ok(());
    }

    #[tokio::test]
    async fn it_publishes_errors_to_subscribers() -> Result<()> {
        let fixture = fixture(FakeRemote {
            fail: AtomicBool::new(true),
            ..FakeRemote::default()
        });
        let mut updates = fixture.service.sessions().subscribe();

        let res = fixture
            .service
            .sync_sessions_and_messages_from_server(&SessionFilters::default())
            .await;

        assert!(res.is_err());
        assert!(updates.has_changed()?);
        let state = updates.borrow_and_update().clone();
        assert!(!state.is_syncing);
        assert_eq!(state.error, Some("remote unavailable".to_string()));

        return Ok(());
    }

    #[tokio::test]
    async fn it_only_creates_missing_sessions() -> Result<()> {
        let remote = FakeRemote::default();
        lock(&remote.sessions).push(remote_session("mine", "2024-03-01", None));
        lock(&remote.sessions).push(remote_session("new", "2024-03-01", None));
        let fixture = fixture(remote);
        let mut existing = seeded("mine", "2024-02-01", true);
        existing.title = Some("Draft".to_string());
        fixture.store.insert(existing.clone(), vec![]);

        fixture
            .service
            .sync_sessions_and_messages_from_server(&SessionFilters::default())
            .await?;

        assert_eq!(fixture.store.session("mine"), Some(existing));
        assert!(fixture.store.session("new").is_some());

        return Ok(());
    }
}

mod fetch_unseen_remote_messages {
    use super::*;

    #[tokio::test]
    async fn it_stops_at_last_seen() -> Result<()> {
        let remote = FakeRemote::default();
        remote.add_page(
            "a",
            None,
            MessagesPage {
                messages: vec![remote_message("m2", Role::User, "two", "2024-01-07")],
                next_before: Some("2024-01-05".to_string()),
            },
        );
        remote.add_page(
            "a",
            Some("2024-01-05"),
            MessagesPage {
                messages: vec![remote_message("m1", Role::User, "one", "2024-01-04")],
                next_before: None,
            },
        );
        let fixture = fixture(remote);

        let messages = fixture
            .service
            .fetch_unseen_remote_messages("a", Some(ts("2024-01-06")))
            .await?;

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m2");
        assert_eq!(*lock(&fixture.remote.page_requests), vec![None]);

        return Ok(());
    }

    #[tokio::test]
    async fn it_caps_pages_and_sorts_ascending() -> Result<()> {
        let remote = FakeRemote::default();
        for idx in 0..15 {
            let before = match idx {
                0 => None,
                _ => Some(format!("cursor-{idx}")),
            };
            // Pages arrive newest first, but each page is shuffled.
            let day = 28 - idx;
            remote.add_page(
                "a",
                before.as_deref(),
                MessagesPage {
                    messages: vec![
                        remote_message(&format!("b{idx}"), Role::Assistant, "b", &format!("2024-02-{day:02}T12:00:00Z")),
                        remote_message(&format!("a{idx}"), Role::User, "a", &format!("2024-02-{day:02}T08:00:00Z")),
                    ],
                    next_before: Some(format!("cursor-{}", idx + 1)),
                },
            );
        }
        let fixture = fixture(remote);

        let messages = fixture
            .service
            .fetch_unseen_remote_messages("a", Some(ts("2024-01-01")))
            .await?;

        assert_eq!(lock(&fixture.remote.page_requests).len(), MAX_MESSAGE_PAGES);
        assert_eq!(messages.len(), MAX_MESSAGE_PAGES * 2);
        let stamps = messages
            .iter()
            .map(|e| return ts(&e.created_at))
            .collect::<Vec<_>>();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);

        return Ok(());
    }

    #[tokio::test]
    async fn it_dedupes_messages_repeated_across_pages() -> Result<()> {
        let remote = FakeRemote::default();
        remote.add_page(
            "a",
            None,
            MessagesPage {
                messages: vec![
                    remote_message("m2", Role::Assistant, "two", "2024-01-03"),
                    remote_message("m3", Role::User, "three", "2024-01-04"),
                ],
                next_before: Some("2024-01-03".to_string()),
            },
        );
        remote.add_page(
            "a",
            Some("2024-01-03"),
            MessagesPage {
                messages: vec![
                    remote_message("m1", Role::User, "one", "2024-01-02"),
                    remote_message("m2", Role::Assistant, "two", "2024-01-03"),
                ],
                next_before: None,
            },
        );
        let fixture = fixture(remote);

        let messages = fixture.service.fetch_unseen_remote_messages("a", None).await?;

        let ids = messages
            .iter()
            .map(|e| return e.id.as_str())
            .collect::<Vec<&str>>();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        return Ok(());
    }
}

mod fetch_and_persist_messages {
    use super::*;

    #[tokio::test]
    async fn it_skips_fresh_sessions_without_network() -> Result<()> {
        let fixture = fixture(FakeRemote::default());
        fixture.store.insert(
            seeded("a", "2024-01-02", false),
            vec![ChatMessage::new(Role::User, "kept")],
        );

        let fetched = fixture
            .service
            .fetch_and_persist_messages(&remote_session("a", "2024-01-02", None), false)
            .await?;

        assert!(!fetched);
        assert_eq!(fixture.remote.network_calls(), 0);
        assert!(fixture.cache.keys().is_empty());

        return Ok(());
    }

    #[tokio::test]
    async fn it_refetches_when_forced() -> Result<()> {
        let remote = FakeRemote::default();
        remote.add_page(
            "a",
            None,
            MessagesPage {
                messages: vec![remote_message("m1", Role::User, "one", "2024-01-01")],
                next_before: None,
            },
        );
        let fixture = fixture(remote);
        fixture.store.insert(
            seeded("a", "2024-01-02", false),
            vec![ChatMessage::new(Role::User, "kept")],
        );

        let fetched = fixture
            .service
            .fetch_and_persist_messages(&remote_session("a", "2024-01-02", Some("2024-01-02")), true)
            .await?;

        assert!(fetched);
        assert_eq!(fixture.store.messages("a").len(), 2);

        return Ok(());
    }

    #[tokio::test]
    async fn it_persists_and_invalidates() -> Result<()> {
        let remote = FakeRemote::default();
        remote.add_page(
            "a",
            None,
            MessagesPage {
                messages: vec![
                    remote_message("m2", Role::Assistant, "two", "2024-01-03"),
                    remote_message("m1", Role::User, "one", "2024-01-02"),
                ],
                next_before: None,
            },
        );
        let fixture = fixture(remote);

        let fetched = fixture
            .service
            .fetch_and_persist_messages(&remote_session("a", "2024-01-03", None), false)
            .await?;

        assert!(fetched);
        let stored = fixture
            .store
            .messages("a")
            .iter()
            .map(|e| return e.text())
            .collect::<Vec<String>>();
        assert_eq!(stored, vec!["one".to_string(), "two".to_string()]);
        let session = fixture.store.session("a").unwrap();
        assert!(!session.is_local);
        assert_eq!(session.created_at, session.updated_at);
        assert_eq!(fixture.service.sessions().get().sessions.len(), 1);
        insta::assert_debug_snapshot!(fixture.cache.keys(), @r###"
        [
            "ai-session:a",
            "ai-sessions",
            "ai-sessions:unread-count",
        ]
        "###);

        return Ok(());
    }

    #[tokio::test]
    async fn it_upserts_messages_by_id() -> Result<()> {
        let remote = FakeRemote::default();
        remote.add_page(
            "a",
            None,
            MessagesPage {
                messages: vec![remote_message("m1", Role::User, "edited", "2024-01-02")],
                next_before: None,
            },
        );
        let fixture = fixture(remote);
        let mut existing = ChatMessage::new(Role::User, "original");
        existing.id = "m1".to_string();
        existing.created_at = ts("2024-01-02");
        fixture.store.insert(seeded("a", "2024-01-01", false), vec![existing]);

        fixture
            .service
            .fetch_and_persist_messages(&remote_session("a", "2024-01-03", None), false)
            .await?;

        let stored = fixture.store.messages("a");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text(), "edited");

        return Ok(());
    }

    #[tokio::test]
    async fn it_ignores_a_concurrent_fetch_of_the_same_session() -> Result<()> {
        let gate = Arc::new(Gate::default());
        let remote = FakeRemote {
            messages_gate: Some(gate.clone()),
            ..FakeRemote::default()
        };
        remote.add_page(
            "a",
            None,
            MessagesPage {
                messages: vec![remote_message("m1", Role::User, "one", "2024-01-02")],
                next_before: None,
            },
        );
        let fixture = fixture(remote);
        let session = remote_session("a", "2024-01-03", None);

        let first = fixture.service.fetch_and_persist_messages(&session, false);
        let second = async {
            gate.entered.notified().await;
            let res = fixture.service.fetch_and_persist_messages(&session, false).await;
            gate.release.notify_one();
            return res;
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first?);
        assert!(!second?);
        assert_eq!(lock(&fixture.remote.page_requests).len(), 1);

        return Ok(());
    }

    #[tokio::test]
    async fn it_propagates_remote_errors() {
        let fixture = fixture(FakeRemote {
            fail: AtomicBool::new(true),
            ..FakeRemote::default()
        });

        let res = fixture
            .service
            .fetch_and_persist_messages(&remote_session("a", "2024-01-03", None), false)
            .await;

        assert!(res.is_err());
        assert!(fixture.store.session("a").is_none());
        assert_eq!(fixture.service.sessions().get().error, None);
    }
}

mod sync_session_messages {
    use super::*;

    #[tokio::test]
    async fn it_never_calls_remote_for_local_sessions() -> Result<()> {
        let fixture = fixture(FakeRemote::default());
        let messages = vec![ChatMessage::new(Role::User, "offline")];
        fixture.store.insert(seeded("x", "2024-01-01", true), messages.clone());

        let loaded = fixture.service.sync_session_messages("x").await?;

        assert_eq!(loaded, messages);
        assert_eq!(fixture.remote.network_calls(), 0);

        return Ok(());
    }

    #[tokio::test]
    async fn it_falls_back_to_local_messages_when_remote_is_missing() -> Result<()> {
        let fixture = fixture(FakeRemote::default());
        let messages = vec![ChatMessage::new(Role::User, "cached")];
        fixture.store.insert(seeded("x", "2024-01-01", false), messages.clone());

        let loaded = fixture.service.sync_session_messages("x").await?;

        assert_eq!(loaded, messages);
        assert_eq!(fixture.remote.get_session_calls.load(Ordering::SeqCst), 1);
        assert!(lock(&fixture.remote.page_requests).is_empty());

        return Ok(());
    }

    #[tokio::test]
    async fn it_fetches_then_returns_local_messages() -> Result<()> {
        let remote = FakeRemote::default();
        lock(&remote.sessions).push(remote_session("x", "2024-01-03", None));
        remote.add_page(
            "x",
            None,
            MessagesPage {
                messages: vec![remote_message("m1", Role::User, "remote", "2024-01-02")],
                next_before: None,
            },
        );
        let fixture = fixture(remote);

        let loaded = fixture.service.sync_session_messages("x").await?;

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].text(), "remote");

        return Ok(());
    }
}

mod refetch_session_messages {
    use super::*;

    #[tokio::test]
    async fn it_ignores_freshness_and_last_seen() -> Result<()> {
        let remote = FakeRemote::default();
        lock(&remote.sessions).push(remote_session("x", "2024-01-02", Some("2024-01-05")));
        remote.add_page(
            "x",
            None,
            MessagesPage {
                messages: vec![remote_message("m2", Role::Assistant, "two", "2024-01-02")],
                next_before: Some("2024-01-02T00:00:00Z".to_string()),
            },
        );
        remote.add_page(
            "x",
            Some("2024-01-02T00:00:00Z"),
            MessagesPage {
                messages: vec![remote_message("m1", Role::User, "one", "2024-01-01")],
                next_before: None,
            },
        );
        let fixture = fixture(remote);
        fixture.store.insert(
            seeded("x", "2024-01-03", false),
            vec![ChatMessage::new(Role::User, "stale")],
        );

        let loaded = fixture.service.refetch_session_messages("x").await?;

        assert_eq!(lock(&fixture.remote.page_requests).len(), 2);
        assert_eq!(loaded.len(), 3);

        return Ok(());
    }

    #[tokio::test]
    async fn it_refuses_local_sessions() {
        let fixture = fixture(FakeRemote::default());
        fixture.store.insert(seeded("x", "2024-01-01", true), vec![]);

        let res = fixture.service.refetch_session_messages("x").await;

        insta::assert_snapshot!(res.unwrap_err().to_string(), @"Session x only exists locally");
        assert_eq!(fixture.remote.network_calls(), 0);
    }

    #[tokio::test]
    async fn it_fails_for_unknown_sessions() {
        let fixture = fixture(FakeRemote::default());

        let res = fixture.service.refetch_session_messages("missing").await;

        insta::assert_snapshot!(res.unwrap_err().to_string(), @"Session missing was not found on the server");
    }
}

mod explicit_operations {
    use super::*;

    #[tokio::test]
    async fn it_marks_remote_sessions_seen() -> Result<()> {
        let fixture = fixture(FakeRemote::default());
        fixture.store.insert(seeded("a", "2024-01-01", false), vec![]);
        fixture.store.insert(seeded("b", "2024-01-01", true), vec![]);

        fixture.service.mark_session_seen("a").await?;
        fixture.service.mark_session_seen("b").await?;

        assert_eq!(*lock(&fixture.remote.seen), vec!["a".to_string()]);
        assert_eq!(fixture.cache.keys(), vec!["ai-sessions:unread-count".to_string()]);

        return Ok(());
    }

    #[tokio::test]
    async fn it_deletes_sessions() -> Result<()> {
        let fixture = fixture(FakeRemote::default());
        fixture.store.insert(seeded("a", "2024-01-01", false), vec![]);
        fixture.store.insert(seeded("b", "2024-01-01", true), vec![]);

        fixture.service.delete_session("a").await?;
        fixture.service.delete_session("b").await?;

        assert_eq!(*lock(&fixture.remote.deleted), vec!["a".to_string()]);
        assert!(fixture.store.session("a").is_none());
        assert!(fixture.store.session("b").is_none());
        assert!(fixture.service.sessions().get().sessions.is_empty());

        return Ok(());
    }
}
