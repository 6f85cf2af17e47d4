use super::*;
use crate::event::{ContentChange, CursorMove, JoinDocument, LeaveDocument};
use crate::state::test_helpers::{MemoryDocumentStore, TEST_SAVE_DEBOUNCE};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

struct Client {
    id: ConnectionId,
    rx: mpsc::Receiver<ServerEvent>,
}

fn setup() -> (SessionManager, Arc<MemoryDocumentStore>) {
    let store = Arc::new(
        MemoryDocumentStore::new()
            .with_document("doc1", "Doc One", "hello")
            .with_document("doc2", "Doc Two", "second"),
    );
    (SessionManager::new(store.clone(), TEST_SAVE_DEBOUNCE), store)
}

fn connect(sessions: &SessionManager) -> Client {
    connect_with_capacity(sessions, 32)
}

fn connect_with_capacity(sessions: &SessionManager, capacity: usize) -> Client {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(capacity);
    sessions.hub().register(id, tx);
    Client { id, rx }
}

fn join_req(document_id: &str, user_id: &str, user_name: &str) -> JoinDocument {
    JoinDocument { document_id: document_id.into(), user_id: user_id.into(), user_name: user_name.into() }
}

fn edit(document_id: &str, user_id: &str, content: &str) -> ContentChange {
    ContentChange {
        document_id: document_id.into(),
        user_id: user_id.into(),
        content: content.into(),
        cursor_position: None,
    }
}

async fn recv(client: &mut Client) -> ServerEvent {
    timeout(Duration::from_millis(200), client.rx.recv())
        .await
        .expect("event receive timed out")
        .expect("client channel closed")
}

async fn assert_silent(client: &mut Client) {
    assert!(
        timeout(Duration::from_millis(80), client.rx.recv()).await.is_err(),
        "expected no event"
    );
}

async fn recv_active_users(client: &mut Client) -> Vec<String> {
    match recv(client).await {
        ServerEvent::ActiveUsers(active) => active.users.into_iter().map(|u| u.user_id).collect(),
        other => panic!("expected active-users, got {}", other.name()),
    }
}

async fn recv_loaded(client: &mut Client) -> DocumentLoaded {
    match recv(client).await {
        ServerEvent::DocumentLoaded(loaded) => loaded,
        other => panic!("expected document-loaded, got {}", other.name()),
    }
}

// =============================================================================
// JOIN
// =============================================================================

#[tokio::test]
async fn join_sends_document_then_presence() {
    let (sessions, _store) = setup();
    let mut a = connect(&sessions);

    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join");

    let loaded = recv_loaded(&mut a).await;
    assert_eq!(loaded.id, "doc1");
    assert_eq!(loaded.title, "Doc One");
    assert_eq!(loaded.content, "hello");
    assert_eq!(recv_active_users(&mut a).await, vec!["A"]);
}

#[tokio::test]
async fn second_join_announces_presence_to_whole_room() {
    let (sessions, _store) = setup();
    let mut a = connect(&sessions);
    let mut b = connect(&sessions);

    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join a");
    recv_loaded(&mut a).await;
    recv_active_users(&mut a).await;

    sessions.join(b.id, join_req("doc1", "B", "Bob")).await.expect("join b");

    assert_eq!(recv_loaded(&mut b).await.content, "hello");
    assert_eq!(recv_active_users(&mut b).await, vec!["A", "B"]);
    assert_eq!(recv_active_users(&mut a).await, vec!["A", "B"]);
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn join_unknown_document_fails_without_binding_or_broadcast() {
    let (sessions, _store) = setup();
    let mut a = connect(&sessions);
    let mut b = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join a");
    recv_loaded(&mut a).await;
    recv_active_users(&mut a).await;

    let err = sessions
        .join(b.id, join_req("missing", "B", "Bob"))
        .await
        .expect_err("unknown document");

    assert_eq!(err.error_code(), "E_DOCUMENT_NOT_FOUND");
    assert_eq!(sessions.registry().bound_document(b.id), None);
    assert!(sessions.active_users("missing").is_empty());
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn join_rejects_empty_document_id() {
    let (sessions, _store) = setup();
    let a = connect(&sessions);

    let err = sessions
        .join(a.id, join_req("", "A", "Alice"))
        .await
        .expect_err("empty id");

    assert!(matches!(err, SessionError::InvalidDocumentId));
    assert_eq!(err.error_code(), "E_INVALID_DOCUMENT_ID");
}

#[tokio::test]
async fn joiner_receives_unsaved_content() {
    let (sessions, store) = setup();
    let mut a = connect(&sessions);
    let mut b = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join a");
    sessions.change_content(a.id, edit("doc1", "A", "hello there"));

    sessions.join(b.id, join_req("doc1", "B", "Bob")).await.expect("join b");

    assert_eq!(recv_loaded(&mut b).await.content, "hello there");
    assert_eq!(store.content("doc1").as_deref(), Some("hello"), "not yet persisted");
    drain(&mut a);
}

#[tokio::test]
async fn joining_another_document_leaves_the_first() {
    let (sessions, _store) = setup();
    let mut a = connect(&sessions);
    let mut b = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join a");
    sessions.join(b.id, join_req("doc1", "B", "Bob")).await.expect("join b");
    drain(&mut a);
    drain(&mut b);

    sessions.join(b.id, join_req("doc2", "B", "Bob")).await.expect("switch");

    assert_eq!(recv_active_users(&mut a).await, vec!["A"]);
    assert_eq!(recv_loaded(&mut b).await.id, "doc2");
    assert_eq!(recv_active_users(&mut b).await, vec!["B"]);
    assert_eq!(sessions.registry().bound_document(b.id).as_deref(), Some("doc2"));
}

#[tokio::test]
async fn slow_join_does_not_stall_other_traffic() {
    let (sessions, store) = setup();
    let mut a = connect(&sessions);
    let mut b = connect(&sessions);
    let c = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join a");
    sessions.join(b.id, join_req("doc1", "B", "Bob")).await.expect("join b");
    drain(&mut a);
    drain(&mut b);

    store.set_load_delay(Duration::from_millis(500));
    let slow = {
        let sessions = sessions.clone();
        let id = c.id;
        tokio::spawn(async move { sessions.join(id, join_req("doc2", "C", "Carol")).await })
    };
    sleep(Duration::from_millis(20)).await;

    sessions.change_content(a.id, edit("doc1", "A", "still live"));
    match recv(&mut b).await {
        ServerEvent::ContentUpdated(update) => assert_eq!(update.content, "still live"),
        other => panic!("expected content-updated, got {}", other.name()),
    }
    assert!(!slow.is_finished());
    slow.await.expect("join task").expect("slow join succeeds");
}

// =============================================================================
// PRESENCE
// =============================================================================

#[tokio::test]
async fn presence_tracks_every_join_leave_and_disconnect() {
    let (sessions, _store) = setup();
    let mut a = connect(&sessions);
    let mut b = connect(&sessions);
    let mut c = connect(&sessions);

    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join a");
    recv_loaded(&mut a).await;
    assert_eq!(recv_active_users(&mut a).await, vec!["A"]);

    sessions.join(b.id, join_req("doc1", "B", "Bob")).await.expect("join b");
    recv_loaded(&mut b).await;
    assert_eq!(recv_active_users(&mut a).await, vec!["A", "B"]);
    assert_eq!(recv_active_users(&mut b).await, vec!["A", "B"]);

    sessions.join(c.id, join_req("doc1", "C", "Carol")).await.expect("join c");
    recv_loaded(&mut c).await;
    for client in [&mut a, &mut b, &mut c] {
        assert_eq!(recv_active_users(client).await, vec!["A", "B", "C"]);
    }

    sessions.leave(b.id, LeaveDocument { document_id: "doc1".into(), user_id: "B".into() });
    assert_eq!(recv_active_users(&mut a).await, vec!["A", "C"]);
    assert_eq!(recv_active_users(&mut c).await, vec!["A", "C"]);
    assert_silent(&mut b).await;

    sessions.disconnect(c.id);
    assert_eq!(recv_active_users(&mut a).await, vec!["A"]);
    assert_eq!(sessions.active_users("doc1").len(), 1);
}

#[tokio::test]
async fn reconnect_replaces_entry_and_stale_disconnect_is_silent() {
    let (sessions, _store) = setup();
    let mut old = connect(&sessions);
    let mut new = connect(&sessions);
    let mut peer = connect(&sessions);
    sessions.join(peer.id, join_req("doc1", "P", "Pat")).await.expect("join peer");
    sessions.join(old.id, join_req("doc1", "u1", "Alice")).await.expect("join old");
    sessions.join(new.id, join_req("doc1", "u1", "Alice")).await.expect("join new");
    drain(&mut old);
    drain(&mut new);
    drain(&mut peer);

    assert_eq!(sessions.active_users("doc1").len(), 2);

    sessions.disconnect(old.id);
    assert_silent(&mut peer).await;
    assert_eq!(sessions.active_users("doc1").len(), 2);

    sessions.disconnect(new.id);
    assert_eq!(recv_active_users(&mut peer).await, vec!["P"]);
}

#[tokio::test]
async fn rejoin_under_new_user_id_leaves_no_stale_presence() {
    let (sessions, _store) = setup();
    let mut a = connect(&sessions);
    let mut peer = connect(&sessions);
    sessions.join(peer.id, join_req("doc1", "P", "Pat")).await.expect("join peer");
    sessions.join(a.id, join_req("doc1", "u1", "Alice")).await.expect("join u1");
    drain(&mut a);
    drain(&mut peer);

    sessions.join(a.id, join_req("doc1", "u2", "Alice")).await.expect("join u2");
    assert_eq!(recv_active_users(&mut peer).await, vec!["P", "u2"]);
    drain(&mut a);

    sessions.change_content(peer.id, edit("doc1", "P", "once"));
    assert!(matches!(recv(&mut a).await, ServerEvent::ContentUpdated(_)));
    assert_silent(&mut a).await;

    sessions.disconnect(a.id);
    assert_eq!(recv_active_users(&mut peer).await, vec!["P"]);
    sessions.disconnect(peer.id);
    assert_eq!(sessions.registry().room_count(), 0);
}

#[tokio::test]
async fn superseded_connection_cannot_edit_after_takeover_leaves() {
    let (sessions, store) = setup();
    let old = connect(&sessions);
    let new = connect(&sessions);
    let mut peer = connect(&sessions);
    sessions.join(peer.id, join_req("doc1", "P", "Pat")).await.expect("join peer");
    sessions.join(old.id, join_req("doc1", "u1", "Alice")).await.expect("join old");
    sessions.join(new.id, join_req("doc1", "u1", "Alice")).await.expect("join new");
    sessions.leave(new.id, LeaveDocument { document_id: "doc1".into(), user_id: "u1".into() });
    drain(&mut peer);

    sessions.change_content(old.id, edit("doc1", "u1", "from a ghost"));

    assert_silent(&mut peer).await;
    sleep(TEST_SAVE_DEBOUNCE * 3).await;
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn broadcasts_reach_one_connection_per_participant() {
    let (sessions, _store) = setup();
    let mut old = connect(&sessions);
    let mut new = connect(&sessions);
    let peer = connect(&sessions);
    sessions.join(old.id, join_req("doc1", "u1", "Alice")).await.expect("join old");
    sessions.join(new.id, join_req("doc1", "u1", "Alice")).await.expect("join new");
    sessions.join(peer.id, join_req("doc1", "P", "Pat")).await.expect("join peer");
    drain(&mut old);
    drain(&mut new);

    sessions.change_content(peer.id, edit("doc1", "P", "from pat"));

    assert!(matches!(recv(&mut new).await, ServerEvent::ContentUpdated(_)));
    assert_silent(&mut old).await;
}

#[tokio::test]
async fn duplicate_disconnect_broadcasts_once() {
    let (sessions, _store) = setup();
    let mut a = connect(&sessions);
    let b = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join a");
    sessions.join(b.id, join_req("doc1", "B", "Bob")).await.expect("join b");
    drain(&mut a);

    sessions.disconnect(b.id);
    sessions.disconnect(b.id);

    assert_eq!(recv_active_users(&mut a).await, vec!["A"]);
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn disconnect_without_join_is_noop() {
    let (sessions, _store) = setup();
    let a = connect(&sessions);
    sessions.disconnect(a.id);
    assert_eq!(sessions.registry().room_count(), 0);
}

// =============================================================================
// EDITS / CURSORS
// =============================================================================

#[tokio::test]
async fn content_change_reaches_peers_but_never_echoes() {
    let (sessions, store) = setup();
    let mut a = connect(&sessions);
    let mut b = connect(&sessions);
    let mut c = connect(&sessions);
    for (client, user) in [(&a, "A"), (&b, "B"), (&c, "C")] {
        sessions.join(client.id, join_req("doc1", user, user)).await.expect("join");
    }
    drain(&mut a);
    drain(&mut b);
    drain(&mut c);

    sessions.change_content(
        a.id,
        ContentChange {
            document_id: "doc1".into(),
            user_id: "A".into(),
            content: "hello world".into(),
            cursor_position: Some(json!(11)),
        },
    );

    for peer in [&mut b, &mut c] {
        match recv(peer).await {
            ServerEvent::ContentUpdated(update) => {
                assert_eq!(update.user_id, "A");
                assert_eq!(update.content, "hello world");
                assert_eq!(update.cursor_position, Some(json!(11)));
            }
            other => panic!("expected content-updated, got {}", other.name()),
        }
    }
    assert_silent(&mut a).await;

    sleep(TEST_SAVE_DEBOUNCE * 4).await;
    assert_eq!(store.writes(), vec![("doc1".to_string(), "hello world".to_string())]);
}

#[tokio::test]
async fn rapid_edits_persist_once_with_last_content() {
    let (sessions, store) = setup();
    let a = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join");

    for text in ["h", "he", "hel", "hell", "hello!"] {
        sessions.change_content(a.id, edit("doc1", "A", text));
    }
    sleep(TEST_SAVE_DEBOUNCE * 4).await;

    assert_eq!(store.writes(), vec![("doc1".to_string(), "hello!".to_string())]);
}

#[tokio::test]
async fn pending_save_survives_room_emptying() {
    let (sessions, store) = setup();
    let a = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join");

    sessions.change_content(a.id, edit("doc1", "A", "last words"));
    sessions.disconnect(a.id);
    assert_eq!(sessions.registry().room_count(), 0);

    sleep(TEST_SAVE_DEBOUNCE * 4).await;
    assert_eq!(store.content("doc1").as_deref(), Some("last words"));
}

#[tokio::test]
async fn storage_failure_is_invisible_to_clients() {
    let (sessions, store) = setup();
    store.set_fail_writes(true);
    let mut a = connect(&sessions);
    let mut b = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join a");
    sessions.join(b.id, join_req("doc1", "B", "Bob")).await.expect("join b");
    drain(&mut a);
    drain(&mut b);

    sessions.change_content(a.id, edit("doc1", "A", "unsaved"));
    assert!(matches!(recv(&mut b).await, ServerEvent::ContentUpdated(_)));

    sleep(TEST_SAVE_DEBOUNCE * 4).await;
    assert_eq!(store.writes().len(), 1);
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn edits_and_cursors_from_unbound_connection_are_ignored() {
    let (sessions, store) = setup();
    let mut a = connect(&sessions);
    let stranger = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join");
    drain(&mut a);

    sessions.change_content(stranger.id, edit("doc1", "X", "vandalism"));
    sessions.move_cursor(
        stranger.id,
        CursorMove {
            document_id: "doc1".into(),
            user_id: "X".into(),
            user_name: "Mallory".into(),
            position: json!(0),
            selection: None,
        },
    );

    assert_silent(&mut a).await;
    sleep(TEST_SAVE_DEBOUNCE * 3).await;
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn cursor_move_relays_to_peers_only() {
    let (sessions, store) = setup();
    let mut a = connect(&sessions);
    let mut b = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join a");
    sessions.join(b.id, join_req("doc1", "B", "Bob")).await.expect("join b");
    drain(&mut a);
    drain(&mut b);

    sessions.move_cursor(
        a.id,
        CursorMove {
            document_id: "doc1".into(),
            user_id: "A".into(),
            user_name: "Alice".into(),
            position: json!(5),
            selection: Some(json!({"start": 2, "end": 5})),
        },
    );

    match recv(&mut b).await {
        ServerEvent::CursorMoved(moved) => {
            assert_eq!(moved.user_id, "A");
            assert_eq!(moved.user_name, "Alice");
            assert_eq!(moved.position, json!(5));
            assert_eq!(moved.selection, Some(json!({"start": 2, "end": 5})));
        }
        other => panic!("expected cursor-moved, got {}", other.name()),
    }
    assert_silent(&mut a).await;
    sleep(TEST_SAVE_DEBOUNCE * 2).await;
    assert!(store.writes().is_empty(), "cursor moves are never persisted");
}

#[tokio::test]
async fn flush_pending_persists_before_quiet_period() {
    let store = Arc::new(MemoryDocumentStore::new().with_document("doc1", "Doc One", "hello"));
    let sessions = SessionManager::new(store.clone(), Duration::from_secs(30));
    let a = connect(&sessions);
    sessions.join(a.id, join_req("doc1", "A", "Alice")).await.expect("join");
    sessions.change_content(a.id, edit("doc1", "A", "shutdown-safe"));

    sessions.flush_pending().await;

    assert_eq!(store.content("doc1").as_deref(), Some("shutdown-safe"));
}

// =============================================================================
// ORDERING
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_joins_leave_observer_with_final_presence() {
    for _ in 0..50 {
        let (sessions, _store) = setup();
        let mut observer = connect_with_capacity(&sessions, 64);
        sessions.join(observer.id, join_req("doc1", "obs", "Observer")).await.expect("join observer");

        let joiners: Vec<Client> = (0..6).map(|_| connect(&sessions)).collect();
        let joins: Vec<_> = joiners
            .iter()
            .enumerate()
            .map(|(i, joiner)| {
                let sessions = sessions.clone();
                let id = joiner.id;
                tokio::spawn(async move { sessions.join(id, join_req("doc1", &format!("u{i}"), "User")).await })
            })
            .collect();
        for join in joins {
            join.await.expect("join task").expect("join");
        }

        let mut last = None;
        while let Ok(event) = observer.rx.try_recv() {
            if let ServerEvent::ActiveUsers(active) = event {
                last = Some(active.users.len());
            }
        }
        assert_eq!(last, Some(7), "observer's last presence must be the final room");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_edits_relay_and_store_the_same_last_content() {
    for _ in 0..10 {
        let (sessions, store) = setup();
        let mut observer = connect_with_capacity(&sessions, 256);
        sessions.join(observer.id, join_req("doc1", "obs", "Observer")).await.expect("join observer");

        let mut editors = Vec::new();
        for i in 0..4 {
            let client = connect_with_capacity(&sessions, 64);
            sessions.join(client.id, join_req("doc1", &format!("u{i}"), "User")).await.expect("join editor");
            editors.push(client);
        }

        let tasks: Vec<_> = editors
            .iter()
            .enumerate()
            .map(|(i, editor)| {
                let sessions = sessions.clone();
                let id = editor.id;
                tokio::spawn(async move {
                    for n in 0..10 {
                        sessions.change_content(id, edit("doc1", &format!("u{i}"), &format!("u{i}-{n}")));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("edit task");
        }

        let mut last_relayed = None;
        while let Ok(event) = observer.rx.try_recv() {
            if let ServerEvent::ContentUpdated(update) = event {
                last_relayed = Some(update.content);
            }
        }

        sleep(TEST_SAVE_DEBOUNCE * 4).await;
        assert_eq!(store.content("doc1"), last_relayed);
    }
}

fn drain(client: &mut Client) {
    while client.rx.try_recv().is_ok() {}
}
