use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;

use super::*;
use crate::test_utils::RecordingBus;

fn recording_callback() -> (Receiver, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (Receiver::callback(move |payload| sink.lock().push(payload)), seen)
}

#[test]
fn event_tag_receiver_redispatches_exactly_once() {
    let bus = RecordingBus::new();
    let callback = wrap(Some(&Receiver::event("my-event")), &bus.as_dyn());

    callback(json!({"ok": true}));

    let events = bus.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tag.as_str(), "my-event");
    assert_eq!(events[0].payload, json!({"ok": true}));
}

#[test]
fn callback_receiver_is_invoked_with_the_same_payload_as_a_tag() {
    let bus = RecordingBus::new();
    let (receiver, seen) = recording_callback();

    wrap(Some(&receiver), &bus.as_dyn())(json!({"ok": true}));
    wrap(Some(&Receiver::event("evt")), &bus.as_dyn())(json!({"ok": true}));

    assert_eq!(*seen.lock(), vec![json!({"ok": true})]);
    assert_eq!(bus.payloads_for("evt"), vec![json!({"ok": true})]);
}

#[test]
fn absent_receiver_is_a_no_op() {
    let bus = RecordingBus::new();

    wrap(None, &bus.as_dyn())(json!(1));

    assert!(bus.events().is_empty());
}

#[test]
fn completion_fires_only_the_success_channel_on_ok() {
    let bus = RecordingBus::new();
    let (failure, failures) = recording_callback();
    let completion = Completion::new(
        "get",
        Some(&Receiver::event("got")),
        Some(&failure),
        &bus.as_dyn(),
        true,
    );

    completion.complete(Ok(json!({"_id": "a"})));

    assert_eq!(bus.payloads_for("got"), vec![json!({"_id": "a"})]);
    assert!(failures.lock().is_empty());
}

#[test]
fn completion_fires_only_the_failure_channel_with_the_converted_error() {
    let bus = RecordingBus::new();
    let (success, successes) = recording_callback();
    let completion = Completion::new(
        "get",
        Some(&success),
        Some(&Receiver::event("failed")),
        &bus.as_dyn(),
        true,
    );

    completion.complete(Err(EngineError::not_found("missing")));

    assert!(successes.lock().is_empty());
    let failures = bus.payloads_for("failed");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["status"], json!(404));
    assert_eq!(failures[0]["error"], json!("not_found"));
}

#[test]
fn completion_absorbs_failures_without_a_receiver() {
    let bus = RecordingBus::new();
    for warn_unhandled in [true, false] {
        let completion = Completion::new("get", None, None, &bus.as_dyn(), warn_unhandled);
        completion.complete(Err(EngineError::conflict()));
    }

    assert!(bus.events().is_empty());
}

#[test]
fn receiver_debug_does_not_require_debug_callbacks() {
    let (receiver, _) = recording_callback();

    assert_eq!(format!("{:?}", receiver), "Receiver::Callback(..)");
    assert!(format!("{:?}", Receiver::event("x")).contains("\"x\""));
}
