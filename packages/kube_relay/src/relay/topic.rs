//! Topic identity and the events that flow through topics.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cluster::kinds;

/// Identity of one upstream watch stream: an object kind and a namespace scope.
///
/// Kind names are normalized (`Pods`, `po` and `pod` are the same key) and an
/// empty namespace means all namespaces, same as a missing one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct WatchKey {
    pub kind: String,
    pub namespace: Option<String>,
}

impl WatchKey {
    pub fn new(kind: &str, namespace: Option<&str>) -> Self {
        let kind = match kinds::lookup(kind) {
            Some(info) => info.name.to_string(),
            None => kind.trim().to_ascii_lowercase(),
        };
        let namespace = namespace
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string);
        Self { kind, namespace }
    }
}

impl std::fmt::Display for WatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}",
            self.kind,
            self.namespace.as_deref().unwrap_or("all")
        )
    }
}

/// Change type reported by a watch stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// One object change, as delivered to every subscriber of a topic
#[derive(Clone, Debug)]
pub struct ResourceEvent {
    pub event_type: EventType,
    pub key: WatchKey,
    /// The object as returned by the API server; forwarded, never interpreted
    pub resource: Arc<serde_json::Value>,
}

/// What a topic broadcasts to its subscribers
#[derive(Clone, Debug)]
pub enum TopicMessage {
    Event(ResourceEvent),
    /// The topic's stream failed permanently
    Failed(String),
}
