use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

use super::*;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Todo {
    #[serde(rename = "_id")]
    id: String,
    title: String,
    done: bool,
}

#[test]
fn to_document_keeps_field_names_as_keys() {
    let todo = Todo {
        id: "t1".to_string(),
        title: "write tests".to_string(),
        done: false,
    };

    let doc = to_document(&todo).unwrap();

    assert_eq!(doc, json!({"_id": "t1", "title": "write tests", "done": false}));
    assert_eq!(doc_id(&doc), Some("t1"));
    assert_eq!(doc_rev(&doc), None);
}

#[test]
fn from_engine_ignores_engine_metadata_the_host_type_does_not_declare() {
    let doc = json!({"_id": "t1", "_rev": "1-abc", "title": "x", "done": true});

    let todo: Todo = from_engine(doc).unwrap();

    assert_eq!(todo.id, "t1");
    assert!(todo.done);
}

#[test]
fn to_document_rejects_non_objects() {
    let result = to_document(&vec![1, 2, 3]);

    assert!(matches!(result, Err(CodecError::NotAnObject { found: "array" })));
}

#[test]
fn to_options_treats_unit_as_empty() {
    assert!(to_options(&()).unwrap().is_empty());
    assert_eq!(
        to_options(&json!({"include_docs": true})).unwrap().get("include_docs"),
        Some(&json!(true))
    );
    assert!(to_options(&"nope").is_err());
}

#[test]
fn error_payload_carries_status_error_and_reason() {
    let payload = error_payload(&EngineError::not_found("missing"));

    assert_eq!(payload, json!({"status": 404, "error": "not_found", "reason": "missing"}));
}

#[test]
fn error_payload_reads_back_as_the_same_error() {
    let error = EngineError::conflict();

    let back: EngineError = from_engine(error_payload(&error)).unwrap();

    assert_eq!(back, error);
}
