use serde_json::json;

use docfx::DispatchError;
use docfx::Request;
use docfx::RequestSpec;

use crate::common::wait_until;
use crate::common::Host;

fn dispatch_line(
    host: &Host,
    line: &str,
) -> Result<(), DispatchError> {
    let spec = RequestSpec::parse(line)?;
    host.dispatcher.dispatch(Request::from(spec)).map(|_| ())
}

#[tokio::test]
async fn test_json_lines_drive_a_session() {
    let host = Host::default();
    let lines = [
        r#"{"method": "attach-change-watcher", "db": "todos", "options": {"since": "now"}, "handler": "changed"}"#,
        r#"{"method": "put", "db": "todos", "doc": {"_id": "a", "title": "milk"}, "success": "saved"}"#,
        r#"{"method": "put-attachment", "db": "todos", "doc-id": "b", "attachment-id": "note", "attachment": "hi", "attachment-type": "text/plain", "success": "attached"}"#,
    ];
    for line in lines {
        dispatch_line(&host, line).unwrap();
    }

    assert!(wait_until(|| host.log.count("saved") == 1 && host.log.count("attached") == 1).await);
    assert!(wait_until(|| host.log.count("changed") == 2).await);
    assert_eq!(host.log.first("saved")["id"], json!("a"));
}

#[tokio::test]
async fn test_bad_lines_are_rejected_synchronously() {
    let host = Host::default();

    assert!(matches!(
        dispatch_line(&host, ""),
        Err(DispatchError::MalformedRequest { .. })
    ));
    assert!(matches!(dispatch_line(&host, "[1, 2]"), Err(DispatchError::Codec(_))));
    assert!(matches!(
        dispatch_line(&host, r#"{"method": "teleport", "db": "todos"}"#),
        Err(DispatchError::UnknownMethod { .. })
    ));
    assert!(matches!(
        dispatch_line(&host, r#"{"method": "get"}"#),
        Err(DispatchError::MissingDb { method: "get" })
    ));
    assert!(host.dispatcher.registry().is_empty());
}

#[test]
fn test_dispatch_error_messages_name_the_problem() {
    let error = RequestSpec::parse(r#"{"db": "todos"}"#).unwrap_err();
    assert!(error.to_string().contains("method"));

    let error = DispatchError::missing_field("put", "doc");
    assert_eq!(error.to_string(), "put: missing required field 'doc'");
}
