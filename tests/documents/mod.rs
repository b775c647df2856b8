use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

use docfx::codec;
use docfx::Receiver;
use docfx::Request;

use crate::common::Host;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Todo {
    #[serde(rename = "_id")]
    id: String,
    title: String,
    done: bool,
    priority: u32,
}

fn todo(
    id: &str,
    title: &str,
    priority: u32,
) -> Todo {
    Todo {
        id: id.to_string(),
        title: title.to_string(),
        done: false,
        priority,
    }
}

#[tokio::test]
async fn test_typed_document_lifecycle() {
    let host = Host::default();
    let milk = todo("milk", "buy milk", 2);

    host.run(
        Request::new("put")
            .db("todos")
            .typed_doc(&milk)
            .unwrap()
            .success(Receiver::event("saved")),
    )
    .await;
    let rev = host.log.first("saved")["rev"].as_str().unwrap().to_string();

    host.run(
        Request::new("get")
            .db("todos")
            .doc_id("milk")
            .success(Receiver::event("loaded")),
    )
    .await;
    let loaded = host.log.first("loaded");
    let back: Todo = codec::from_engine(loaded).unwrap();
    assert_eq!(back, milk);

    host.run(
        Request::new("put")
            .db("todos")
            .doc(json!({"_id": "milk", "title": "buy oat milk", "done": false, "priority": 2}))
            .success(Receiver::event("stale"))
            .failure(Receiver::event("conflict")),
    )
    .await;
    assert_eq!(host.log.count("stale"), 0);
    assert_eq!(host.log.first("conflict")["status"], json!(409));

    host.run(
        Request::new("remove")
            .db("todos")
            .doc_id("milk")
            .rev(rev)
            .success(Receiver::event("removed")),
    )
    .await;
    assert_eq!(host.log.first("removed")["ok"], json!(true));

    host.run(
        Request::new("info")
            .db("todos")
            .success(Receiver::event("info")),
    )
    .await;
    assert_eq!(host.log.first("info")["doc_count"], json!(0));
}

#[tokio::test]
async fn test_bulk_write_then_list_and_fetch() {
    let host = Host::default();
    let docs = ["a", "b", "c", "d"]
        .iter()
        .enumerate()
        .map(|(i, id)| codec::to_document(&todo(id, id, i as u32)).unwrap())
        .collect();

    host.run(
        Request::new("bulk-docs")
            .db("todos")
            .docs(docs)
            .success(Receiver::event("written")),
    )
    .await;
    assert_eq!(host.log.first("written").as_array().unwrap().len(), 4);

    host.run(
        Request::new("all-docs")
            .db("todos")
            .options(json!({"startkey": "b", "endkey": "c", "include_docs": true}))
            .success(Receiver::event("listed")),
    )
    .await;
    let listed = host.log.first("listed");
    let ids: Vec<_> = listed["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!("b"), json!("c")]);
    assert_eq!(listed["rows"][0]["doc"]["title"], json!("b"));

    host.run(
        Request::new("bulk-get")
            .db("todos")
            .options(json!({"docs": [{"id": "a"}, {"id": "zzz"}]}))
            .success(Receiver::event("fetched")),
    )
    .await;
    let results = host.log.first("fetched")["results"].clone();
    assert!(results[0]["docs"][0]["ok"].is_object());
    assert!(results[1]["docs"][0]["error"].is_object());
}

#[tokio::test]
async fn test_index_find_and_query() {
    let host = Host::default();
    let docs = vec![
        json!({"_id": "a", "kind": "task", "priority": 3}),
        json!({"_id": "b", "kind": "task", "priority": 1}),
        json!({"_id": "c", "kind": "note", "priority": 2}),
    ];
    host.run(Request::new("bulk-docs").db("work").docs(docs)).await;

    host.run(
        Request::new("create-index")
            .db("work")
            .index(json!({"index": {"fields": ["priority"]}, "name": "by-priority"}))
            .success(Receiver::event("indexed")),
    )
    .await;
    assert_eq!(host.log.first("indexed")["result"], json!("created"));

    host.run(
        Request::new("find")
            .db("work")
            .options(json!({
                "selector": {"kind": "task"},
                "sort": ["priority"],
                "fields": ["_id"],
            }))
            .success(Receiver::event("found")),
    )
    .await;
    assert_eq!(host.log.first("found")["docs"], json!([{"_id": "b"}, {"_id": "a"}]));

    host.run(
        Request::new("get-indexes")
            .db("work")
            .success(Receiver::event("indexes")),
    )
    .await;
    let names: Vec<_> = host.log.first("indexes")["indexes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|index| index["name"].clone())
        .collect();
    assert!(names.contains(&json!("by-priority")));

    host.run(
        Request::new("query")
            .db("work")
            .fun(json!({"map": "kind", "reduce": "_count"}))
            .options(json!({"group": true}))
            .success(Receiver::event("counted")),
    )
    .await;
    assert_eq!(
        host.log.first("counted")["rows"],
        json!([{"key": "note", "value": 1}, {"key": "task", "value": 2}])
    );

    host.run(
        Request::new("delete-index")
            .db("work")
            .index(json!({"name": "by-priority"}))
            .success(Receiver::event("dropped")),
    )
    .await;
    assert_eq!(host.log.first("dropped")["ok"], json!(true));
}

#[tokio::test]
async fn test_destroy_forgets_the_database() {
    let host = Host::default();
    host.run(Request::new("put").db("scratch").doc(json!({"_id": "a"}))).await;

    host.run(
        Request::new("destroy")
            .db("scratch")
            .success(Receiver::event("destroyed")),
    )
    .await;
    assert_eq!(host.log.first("destroyed")["ok"], json!(true));
    assert!(!host.dispatcher.registry().contains("scratch"));

    host.run(
        Request::new("get")
            .db("scratch")
            .doc_id("a")
            .failure(Receiver::event("gone")),
    )
    .await;
    assert_eq!(host.log.first("gone")["status"], json!(404));
}
