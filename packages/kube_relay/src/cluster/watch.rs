//! Decoding of the newline-delimited watch stream.

use serde::Deserialize;

use crate::error::WatchError;
use crate::relay::topic::EventType;

/// One change event read from a watch stream
#[derive(Clone, Debug)]
pub struct RawWatchEvent {
    pub event_type: EventType,
    pub object: serde_json::Value,
}

impl RawWatchEvent {
    pub fn resource_version(&self) -> Option<&str> {
        resource_version(&self.object)
    }
}

/// What a watch stream yields
#[derive(Clone, Debug)]
pub enum WatchUpdate {
    Event(RawWatchEvent),
    /// The server has sent everything up to this resource version
    Bookmark(String),
}

fn resource_version(object: &serde_json::Value) -> Option<&str> {
    object
        .pointer("/metadata/resourceVersion")
        .and_then(|v| v.as_str())
}

#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: serde_json::Value,
}

#[derive(Deserialize, Default)]
struct WireStatus {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Decode one line of a watch response.
///
/// Blank lines, unknown event types and bookmarks without a resource version
/// yield `Ok(None)`. An `ERROR` event is turned into a [`WatchError`]
/// classified by its status code.
pub fn decode_line(line: &str) -> Result<Option<WatchUpdate>, WatchError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let wire: WireEvent = serde_json::from_str(line)
        .map_err(|e| WatchError::Transient(format!("malformed watch event: {}", e)))?;

    let event_type = match wire.event_type.as_str() {
        "ADDED" => EventType::Added,
        "MODIFIED" => EventType::Modified,
        "DELETED" => EventType::Deleted,
        "ERROR" => return Err(status_error(wire.object)),
        "BOOKMARK" => {
            return Ok(resource_version(&wire.object)
                .map(|rv| WatchUpdate::Bookmark(rv.to_string())));
        }
        _ => return Ok(None),
    };

    Ok(Some(WatchUpdate::Event(RawWatchEvent {
        event_type,
        object: wire.object,
    })))
}

fn status_error(object: serde_json::Value) -> WatchError {
    let status: WireStatus = serde_json::from_value(object).unwrap_or_default();
    let message = status
        .message
        .or(status.reason)
        .unwrap_or_else(|| "watch error".to_string());
    match status.code {
        Some(410) => WatchError::Expired(message),
        Some(code) => WatchError::from_status(code, message),
        None => WatchError::Transient(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> RawWatchEvent {
        match decode_line(line).unwrap() {
            Some(WatchUpdate::Event(event)) => event,
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_added() {
        let line = r#"{"type":"ADDED","object":{"kind":"Pod","metadata":{"name":"web-0","resourceVersion":"41"}}}"#;
        let event = event(line);
        assert_eq!(event.event_type, EventType::Added);
        assert_eq!(event.object["metadata"]["name"], "web-0");
        assert_eq!(event.resource_version(), Some("41"));
    }

    #[test]
    fn test_decode_deleted() {
        let event = event(r#"{"type":"DELETED","object":{"kind":"Pod"}}"#);
        assert_eq!(event.event_type, EventType::Deleted);
        assert_eq!(event.resource_version(), None);
    }

    #[test]
    fn test_bookmark_carries_resource_version() {
        let line = r#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"12"}}}"#;
        assert!(matches!(
            decode_line(line).unwrap(),
            Some(WatchUpdate::Bookmark(rv)) if rv == "12"
        ));
    }

    #[test]
    fn test_blank_and_unversioned_bookmark_ignored() {
        let line = r#"{"type":"BOOKMARK","object":{"metadata":{}}}"#;
        assert!(decode_line(line).unwrap().is_none());
        assert!(decode_line("").unwrap().is_none());
        assert!(decode_line("   \r").unwrap().is_none());
    }

    #[test]
    fn test_expired_resource_version() {
        let line = r#"{"type":"ERROR","object":{"kind":"Status","code":410,"reason":"Expired","message":"too old resource version"}}"#;
        let err = decode_line(line).unwrap_err();
        assert_eq!(err, WatchError::Expired("too old resource version".into()));
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_forbidden_is_permanent() {
        let line = r#"{"type":"ERROR","object":{"kind":"Status","code":403,"message":"forbidden"}}"#;
        assert!(decode_line(line).unwrap_err().is_permanent());
    }

    #[test]
    fn test_server_error_is_transient() {
        let line = r#"{"type":"ERROR","object":{"kind":"Status","code":500}}"#;
        assert!(!decode_line(line).unwrap_err().is_permanent());
    }

    #[test]
    fn test_malformed_line_is_transient() {
        let err = decode_line("{not json").unwrap_err();
        assert!(!err.is_permanent());
    }
}
