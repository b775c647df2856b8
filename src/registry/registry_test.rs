use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::engine::memory::MemoryEngine;
use crate::engine::Feed;
use crate::engine::MockDatabaseEngine;
use crate::subscription::spawn_pump;
use crate::EngineError;

/// Mock engine that opens real memory databases and expects `times` opens.
fn counting_engine(times: usize) -> MockDatabaseEngine {
    let memory = MemoryEngine::default();
    let mut engine = MockDatabaseEngine::new();
    engine
        .expect_open()
        .times(times)
        .returning(move |name| memory.open(name));
    engine
}

/// A subscription over a feed that never emits; returns its token too.
fn idle_subscription() -> (Subscription, CancellationToken) {
    let (_events_tx, events_rx) = mpsc::channel(1);
    let token = CancellationToken::new();
    let subscription = spawn_pump(Feed::new(events_rx, token.clone()), Default::default(), false);
    (subscription, token)
}

#[test]
fn test_resolve_opens_once_and_returns_the_same_handle() {
    let registry = HandleRegistry::new(Arc::new(counting_engine(1)));
    let db = DbRef::from("todos");

    let first = registry.resolve(&db).unwrap();
    let second = registry.resolve(&db).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
    assert!(registry.contains("todos"));
}

#[test]
fn test_concurrent_first_use_yields_one_handle() {
    let registry = HandleRegistry::new(Arc::new(counting_engine(1)));

    let handles: Vec<DbHandle> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| registry.resolve(&DbRef::from("shared")).unwrap()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    for handle in &handles[1..] {
        assert!(Arc::ptr_eq(&handles[0], handle));
    }
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_distinct_names_get_distinct_handles() {
    let registry = HandleRegistry::new(Arc::new(counting_engine(2)));

    let a = registry.resolve(&DbRef::from("a")).unwrap();
    let b = registry.resolve(&DbRef::from("b")).unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_open_failure_is_unresolved_db() {
    let mut engine = MockDatabaseEngine::new();
    engine
        .expect_open()
        .times(1)
        .returning(|_| Err(EngineError::bad_request("bad name")));
    let registry = HandleRegistry::new(Arc::new(engine));

    let err = registry.resolve(&DbRef::from("bad")).err().unwrap();

    assert!(matches!(err, DispatchError::UnresolvedDb { ref name, .. } if name == "bad"));
    assert!(registry.is_empty());
}

#[test]
fn test_handle_reference_passes_through_without_opening() {
    let handle = MemoryEngine::default().open("direct").unwrap();
    let registry = HandleRegistry::new(Arc::new(counting_engine(0)));

    let resolved = registry.resolve(&DbRef::from(handle.clone())).unwrap();

    assert!(Arc::ptr_eq(&resolved, &handle));
    assert!(registry.is_empty());
}

#[test]
fn test_evict_only_removes_the_matching_handle() {
    let registry = HandleRegistry::new(Arc::new(counting_engine(1)));
    let handle = registry.resolve(&DbRef::from("todos")).unwrap();
    let stranger = MemoryEngine::default().open("todos").unwrap();
    let name = DbName::from("todos");

    assert!(!registry.evict(&name, &stranger));
    assert!(registry.contains("todos"));

    assert!(registry.evict(&name, &handle));
    assert!(!registry.contains("todos"));
}

#[tokio::test]
async fn test_replacing_a_subscription_cancels_the_previous_one() {
    let registry = HandleRegistry::new(Arc::new(counting_engine(1)));
    let db = DbRef::from("todos");
    let (first, first_token) = idle_subscription();
    let (second, second_token) = idle_subscription();

    registry
        .replace_subscription(&db, SubscriptionKind::ChangeWatcher, |_| Ok(first))
        .unwrap();
    registry
        .replace_subscription(&db, SubscriptionKind::ChangeWatcher, |_| Ok(second))
        .unwrap();

    assert!(first_token.is_cancelled());
    assert!(!second_token.is_cancelled());
    assert!(registry.has_subscription("todos", SubscriptionKind::ChangeWatcher));
    assert!(!registry.has_subscription("todos", SubscriptionKind::SyncSession));
}

#[tokio::test]
async fn test_failed_open_leaves_slot_empty() {
    let registry = HandleRegistry::new(Arc::new(counting_engine(1)));
    let db = DbRef::from("todos");

    let result = registry.replace_subscription(&db, SubscriptionKind::SyncSession, |handle| {
        Err(DispatchError::subscription(
            "sync",
            handle.name(),
            EngineError::not_found("no target"),
        ))
    });

    assert!(result.is_err());
    assert!(registry.contains("todos"));
    assert!(!registry.has_subscription("todos", SubscriptionKind::SyncSession));
}

#[tokio::test]
async fn test_cancel_subscription_is_a_no_op_when_absent() {
    let registry = HandleRegistry::new(Arc::new(counting_engine(1)));
    let name = DbName::from("todos");

    assert!(!registry.cancel_subscription(&name, SubscriptionKind::ChangeWatcher));

    let (subscription, token) = idle_subscription();
    registry
        .replace_subscription(&DbRef::from("todos"), SubscriptionKind::ChangeWatcher, |_| {
            Ok(subscription)
        })
        .unwrap();
    assert!(registry.cancel_subscription(&name, SubscriptionKind::ChangeWatcher));
    assert!(token.is_cancelled());
    assert!(!registry.cancel_subscription(&name, SubscriptionKind::ChangeWatcher));
}

#[tokio::test]
async fn test_clear_cancels_everything() {
    let registry = HandleRegistry::new(Arc::new(counting_engine(2)));
    let (watcher, watcher_token) = idle_subscription();
    let (session, session_token) = idle_subscription();
    registry
        .replace_subscription(&DbRef::from("a"), SubscriptionKind::ChangeWatcher, |_| Ok(watcher))
        .unwrap();
    registry
        .replace_subscription(&DbRef::from("b"), SubscriptionKind::SyncSession, |_| Ok(session))
        .unwrap();

    registry.clear();

    assert!(registry.is_empty());
    assert!(watcher_token.is_cancelled());
    assert!(session_token.is_cancelled());
}

#[test]
fn test_db_name_round_trips_as_a_plain_string() {
    let name: DbName = serde_json::from_value(Value::from("todos")).unwrap();

    assert_eq!(name.as_str(), "todos");
    assert_eq!(DbRef::from(name.clone()).name(), name);
    assert_eq!(format!("{:?}", DbRef::from("x")), "DbRef::Name(DbName(\"x\"))");
}
