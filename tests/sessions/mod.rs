use std::time::Duration;

use serde_json::json;

use docfx::DbRef;
use docfx::Dispatched;
use docfx::Receiver;
use docfx::Request;
use docfx::Settings;
use docfx::SubscriptionConfig;
use docfx::SubscriptionKind;

use crate::common::wait_until;
use crate::common::Host;

#[tokio::test]
async fn test_watcher_follows_writes_until_cancelled() {
    let host = Host::default();
    host.dispatcher
        .dispatch(
            Request::new("attach-change-watcher")
                .db("todos")
                .options(json!({"since": "now", "include_docs": true}))
                .handler(Receiver::event("changed")),
        )
        .unwrap();

    host.run(Request::new("put").db("todos").doc(json!({"_id": "a", "n": 1})))
        .await;
    assert!(wait_until(|| host.log.count("changed") == 1).await);
    assert_eq!(host.log.first("changed")["doc"]["n"], json!(1));

    host.dispatcher.cancel_watcher(&DbRef::from("todos"));
    host.run(Request::new("put").db("todos").doc(json!({"_id": "b"}))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.log.count("changed"), 1);
}

#[tokio::test]
async fn test_non_live_watcher_replays_existing_changes_once() {
    let settings = Settings {
        subscription: SubscriptionConfig {
            default_live: false,
            ..SubscriptionConfig::default()
        },
        ..Settings::default()
    };
    let host = Host::new(settings);
    host.run(Request::new("put").db("todos").doc(json!({"_id": "a"}))).await;
    host.run(Request::new("put").db("todos").doc(json!({"_id": "b"}))).await;

    host.dispatcher
        .dispatch(
            Request::new("attach-change-watcher")
                .db("todos")
                .handler(Receiver::event("changed")),
        )
        .unwrap();
    assert!(wait_until(|| host.log.count("changed") == 2).await);

    host.run(Request::new("put").db("todos").doc(json!({"_id": "c"}))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.log.count("changed"), 2);
}

#[tokio::test]
async fn test_sync_keeps_both_sides_converged() {
    let host = Host::default();
    let dispatched = host
        .dispatcher
        .dispatch(
            Request::new("sync")
                .db("phone")
                .target("server")
                .on("change", Receiver::event("synced"))
                .on("error", Receiver::event("sync-error")),
        )
        .unwrap();
    assert!(matches!(dispatched, Dispatched::Subscribed));

    host.run(Request::new("put").db("phone").doc(json!({"_id": "from-phone"})))
        .await;
    host.run(Request::new("put").db("server").doc(json!({"_id": "from-server"})))
        .await;

    for (db, id) in [("server", "from-phone"), ("phone", "from-server")] {
        let tag = format!("{}-{}", db, id);
        let arrived = wait_until(|| {
            host.dispatcher
                .dispatch(
                    Request::new("get")
                        .db(db)
                        .doc_id(id)
                        .success(Receiver::event(tag.clone())),
                )
                .unwrap();
            host.log.count(&tag) > 0
        })
        .await;
        assert!(arrived, "{} never reached {}", id, db);
    }
    assert_eq!(host.log.count("sync-error"), 0);

    host.dispatcher.cancel_sync(&DbRef::from("phone"));
    assert!(!host
        .dispatcher
        .registry()
        .has_subscription("phone", SubscriptionKind::SyncSession));
}

#[tokio::test]
async fn test_second_sync_replaces_the_first() {
    let host = Host::default();
    for tag in ["first", "second"] {
        host.dispatcher
            .dispatch(
                Request::new("sync")
                    .db("phone")
                    .target("server")
                    .on("change", Receiver::event(tag)),
            )
            .unwrap();
    }

    host.run(Request::new("put").db("phone").doc(json!({"_id": "a"}))).await;

    assert!(wait_until(|| host.log.count("second") >= 1).await);
    assert_eq!(host.log.count("first"), 0);
}

#[tokio::test]
async fn test_push_replication_completes() {
    let host = Host::default();
    host.run(Request::new("put").db("phone").doc(json!({"_id": "a"}))).await;

    let dispatched = host
        .dispatcher
        .dispatch(
            Request::new("replicate")
                .db("phone")
                .target("backup")
                .outbound(true)
                .on("complete", Receiver::event("pushed")),
        )
        .unwrap();
    assert!(matches!(dispatched, Dispatched::Replicating(_)));

    assert!(wait_until(|| host.log.count("pushed") == 1).await);
    host.run(
        Request::new("get")
            .db("backup")
            .doc_id("a")
            .success(Receiver::event("backed-up")),
    )
    .await;
    assert_eq!(host.log.count("backed-up"), 1);
}
