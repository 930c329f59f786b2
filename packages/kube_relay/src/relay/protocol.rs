//! Dashboard Protocol Types
//!
//! Messages exchanged with dashboard clients over the relay WebSocket. Every
//! message is a JSON object whose `type` field names the event.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::topic::{EventType, ResourceEvent};

/// Messages sent FROM the client TO the server
///
/// Fields a handler requires are still optional here so that a missing field is
/// answered with a precise `error` message instead of a generic parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Re-announce the connection (answered with `connection`)
    #[serde(rename = "connect")]
    Connect,

    /// Close the connection from the client side
    #[serde(rename = "disconnect")]
    Disconnect,

    /// Join the topic for a kind, optionally scoped to one namespace
    #[serde(rename = "subscribe_resources")]
    SubscribeResources {
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        namespace: Option<String>,
    },

    #[serde(rename = "unsubscribe_resources")]
    UnsubscribeResources {
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        namespace: Option<String>,
    },

    /// Open a shell in a container. `command` overrides the default shell list.
    #[serde(rename = "terminal:start")]
    TerminalStart {
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        pod: Option<String>,
        #[serde(default)]
        container: Option<String>,
        #[serde(default)]
        command: Option<String>,
    },

    /// Keystrokes for the connection's terminal
    #[serde(rename = "terminal:input")]
    TerminalInput {
        #[serde(default)]
        data: String,
    },

    #[serde(rename = "terminal:resize")]
    TerminalResize {
        #[serde(default)]
        cols: Option<i64>,
        #[serde(default)]
        rows: Option<i64>,
    },

    #[serde(rename = "terminal:close")]
    TerminalClose,

    /// Keepalive
    #[serde(rename = "ping")]
    Ping,
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First message on every connection
    #[serde(rename = "connection")]
    Connection {
        status: String,
        connection_id: String,
    },

    #[serde(rename = "subscribed")]
    Subscribed {
        kind: String,
        namespace: Option<String>,
    },

    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        kind: String,
        namespace: Option<String>,
    },

    #[serde(rename = "resource:added")]
    ResourceAdded {
        kind: String,
        namespace: Option<String>,
        resource: Arc<serde_json::Value>,
    },

    #[serde(rename = "resource:modified")]
    ResourceModified {
        kind: String,
        namespace: Option<String>,
        resource: Arc<serde_json::Value>,
    },

    #[serde(rename = "resource:deleted")]
    ResourceDeleted {
        kind: String,
        namespace: Option<String>,
        resource: Arc<serde_json::Value>,
    },

    /// Decoded stdout/stderr text of the connection's terminal
    #[serde(rename = "terminal:output")]
    TerminalOutput { text: String },

    /// The terminal is live and running `shell`
    #[serde(rename = "terminal:started")]
    TerminalStarted { session_id: String, shell: String },

    #[serde(rename = "terminal:closed")]
    TerminalClosed { session_id: String, reason: String },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

impl From<ResourceEvent> for ServerMessage {
    fn from(event: ResourceEvent) -> Self {
        let kind = event.key.kind;
        let namespace = event.key.namespace;
        let resource = event.resource;
        match event.event_type {
            EventType::Added => ServerMessage::ResourceAdded {
                kind,
                namespace,
                resource,
            },
            EventType::Modified => ServerMessage::ResourceModified {
                kind,
                namespace,
                resource,
            },
            EventType::Deleted => ServerMessage::ResourceDeleted {
                kind,
                namespace,
                resource,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::topic::WatchKey;

    #[test]
    fn test_parse_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe_resources","kind":"pod","namespace":"default"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SubscribeResources { kind, namespace } => {
                assert_eq!(kind.as_deref(), Some("pod"));
                assert_eq!(namespace.as_deref(), Some("default"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_subscribe_without_kind() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_resources"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::SubscribeResources { kind: None, namespace: None }
        ));
    }

    #[test]
    fn test_parse_terminal_messages() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"terminal:start","namespace":"default","pod":"web-0","container":"app"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::TerminalStart { command: None, .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"terminal:input","data":"ls\r"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::TerminalInput { ref data } if data == "ls\r"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"terminal:resize","cols":80,"rows":24}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::TerminalResize {
                cols: Some(80),
                rows: Some(24)
            }
        ));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"terminal:close"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::TerminalClose));
    }

    #[test]
    fn test_parse_unknown_type_fails() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_serialize_resource_event() {
        let event = ResourceEvent {
            event_type: EventType::Modified,
            key: WatchKey::new("pod", Some("default")),
            resource: Arc::new(serde_json::json!({"metadata": {"name": "web-0"}})),
        };
        let json = serde_json::to_value(ServerMessage::from(event)).unwrap();
        assert_eq!(json["type"], "resource:modified");
        assert_eq!(json["kind"], "pod");
        assert_eq!(json["namespace"], "default");
        assert_eq!(json["resource"]["metadata"]["name"], "web-0");
    }

    #[test]
    fn test_serialize_all_namespaces_as_null() {
        let msg = ServerMessage::Subscribed {
            kind: "node".into(),
            namespace: None,
        };
        let json = serde_json::to_value(msg).unwrap();
        assert_eq!(json, serde_json::json!({"type": "subscribed", "kind": "node", "namespace": null}));
    }

    #[test]
    fn test_serialize_unit_variants() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }
}
