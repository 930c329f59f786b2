//! Topic broker
//!
//! One topic per [`WatchKey`]. A topic owns a broadcast channel, the set of
//! connections subscribed to it and at most one watch task feeding it. Each
//! subscription gets its own forwarder task that copies topic messages into the
//! connection's outbound queue, so a slow client only ever lags its own
//! receiver and never the watch task or other subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatcher;
use super::protocol::ServerMessage;
use super::topic::{ResourceEvent, TopicMessage, WatchKey};
use crate::cluster::WatchSource;
use crate::config::WatchConfig;
use crate::metrics::ServerMetrics;

pub type ConnectionId = String;

struct WatchHandle {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

struct Topic {
    tx: broadcast::Sender<TopicMessage>,
    /// Subscribed connections and the token that stops their forwarder
    subscribers: HashMap<ConnectionId, CancellationToken>,
    watch: Option<WatchHandle>,
    /// Set once the stream failed permanently; cleared only when the topic is collected
    failed: bool,
    last_error: Option<String>,
    /// Bumped on every subscribe so a pending retire can tell it went stale
    retire_epoch: u64,
    created_at: DateTime<Utc>,
    last_event_at: Option<DateTime<Utc>>,
    events_published: u64,
}

impl Topic {
    fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            tx,
            subscribers: HashMap::new(),
            watch: None,
            failed: false,
            last_error: None,
            retire_epoch: 0,
            created_at: Utc::now(),
            last_event_at: None,
            events_published: 0,
        }
    }

    fn is_active(&self) -> bool {
        self.watch.as_ref().is_some_and(WatchHandle::is_running)
    }

    fn failure_message(&self, key: &WatchKey) -> Option<String> {
        if !self.failed {
            return None;
        }
        Some(watch_failure_message(
            key,
            self.last_error.as_deref().unwrap_or("unknown error"),
        ))
    }
}

fn watch_failure_message(key: &WatchKey, error: &str) -> String {
    format!("Watch for {} failed: {}", key, error)
}

/// Topic state for `/api/topics`
#[derive(Debug, Clone, Serialize)]
pub struct TopicInfo {
    pub key: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub subscribers: usize,
    pub active: bool,
    pub failed: bool,
    pub last_error: Option<String>,
    pub events_published: u64,
    pub created_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Result of [`Broker::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// False when the connection was already subscribed
    pub joined: bool,
    /// Set when the topic's stream has failed permanently
    pub failure: Option<String>,
}

struct BrokerInner {
    topics: Mutex<HashMap<WatchKey, Topic>>,
    source: Arc<dyn WatchSource>,
    config: WatchConfig,
    topic_buffer: usize,
    metrics: Arc<ServerMetrics>,
    next_watch_id: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(
        source: Arc<dyn WatchSource>,
        config: WatchConfig,
        topic_buffer: usize,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: Mutex::new(HashMap::new()),
                source,
                config,
                topic_buffer: topic_buffer.max(1),
                metrics,
                next_watch_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn source(&self) -> &Arc<dyn WatchSource> {
        &self.inner.source
    }

    pub(crate) fn config(&self) -> &WatchConfig {
        &self.inner.config
    }

    pub(crate) fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.inner.metrics
    }

    /// Add `conn` to the topic for `key`, starting the watch if none is running.
    ///
    /// Subscribing twice is a no-op. The receiver is created under the topic
    /// lock before the watch can start, so no event published after this call
    /// returns is missed.
    pub async fn subscribe(
        &self,
        conn: &ConnectionId,
        key: &WatchKey,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> SubscribeOutcome {
        let mut topics = self.inner.topics.lock().await;
        let topic = topics.entry(key.clone()).or_insert_with(|| {
            info!(topic = %key, "Topic created");
            Topic::new(self.inner.topic_buffer)
        });
        topic.retire_epoch += 1;

        let joined = !topic.subscribers.contains_key(conn);
        if joined {
            let cancel = self.inner.shutdown.child_token();
            tokio::spawn(forward(
                key.clone(),
                conn.clone(),
                topic.tx.subscribe(),
                outbound,
                cancel.clone(),
                self.inner.metrics.clone(),
            ));
            topic.subscribers.insert(conn.clone(), cancel);
            debug!(
                conn_id = %conn,
                topic = %key,
                subscribers = topic.subscribers.len(),
                "Subscribed"
            );
        }

        self.ensure_watch(key, topic);

        SubscribeOutcome {
            joined,
            failure: topic.failure_message(key),
        }
    }

    /// Remove `conn` from the topic. Returns false if it was not subscribed.
    pub async fn unsubscribe(&self, conn: &ConnectionId, key: &WatchKey) -> bool {
        let mut topics = self.inner.topics.lock().await;
        let Some(topic) = topics.get_mut(key) else {
            return false;
        };
        let Some(cancel) = topic.subscribers.remove(conn) else {
            return false;
        };
        cancel.cancel();
        debug!(
            conn_id = %conn,
            topic = %key,
            subscribers = topic.subscribers.len(),
            "Unsubscribed"
        );
        if topic.subscribers.is_empty() {
            self.schedule_retire(key, topic);
        }
        true
    }

    /// Remove `conn` from every topic. Returns the keys it had joined.
    pub async fn drop_connection(&self, conn: &ConnectionId) -> Vec<WatchKey> {
        let mut topics = self.inner.topics.lock().await;
        let mut left = Vec::new();
        for (key, topic) in topics.iter_mut() {
            if let Some(cancel) = topic.subscribers.remove(conn) {
                cancel.cancel();
                left.push(key.clone());
                if topic.subscribers.is_empty() {
                    self.schedule_retire(key, topic);
                }
            }
        }
        left
    }

    /// Start the watch for `key` unless one is already running or the topic
    /// failed. Callers hold the topics lock, so concurrent subscribes on a cold
    /// topic start one stream.
    fn ensure_watch(&self, key: &WatchKey, topic: &mut Topic) -> bool {
        if topic.failed || topic.is_active() {
            return false;
        }
        let id = self.inner.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        let task = tokio::spawn(dispatcher::run_watch(
            self.clone(),
            key.clone(),
            id,
            cancel.clone(),
        ));
        topic.watch = Some(WatchHandle { id, cancel, task });
        true
    }

    fn schedule_retire(&self, key: &WatchKey, topic: &mut Topic) {
        if topic.watch.is_none() {
            return;
        }
        let Some(grace) = self.inner.config.retire_grace else {
            retire(key, topic);
            return;
        };

        topic.retire_epoch += 1;
        let epoch = topic.retire_epoch;
        let broker = self.clone();
        let key = key.clone();
        debug!(topic = %key, "No subscribers left, retiring watch in {:?}", grace);
        tokio::spawn(async move {
            tokio::select! {
                _ = broker.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            let mut topics = broker.inner.topics.lock().await;
            if let Some(topic) = topics.get_mut(&key) {
                if topic.retire_epoch == epoch && topic.subscribers.is_empty() {
                    retire(&key, topic);
                }
            }
        });
    }

    /// Broadcast an event to the topic's current subscribers.
    ///
    /// Returns the number of receivers the event was queued for.
    pub async fn publish(&self, key: &WatchKey, event: ResourceEvent) -> usize {
        let mut topics = self.inner.topics.lock().await;
        let Some(topic) = topics.get_mut(key) else {
            return 0;
        };
        topic.events_published += 1;
        topic.last_event_at = Some(Utc::now());
        self.inner.metrics.event_published();
        topic.tx.send(TopicMessage::Event(event)).unwrap_or(0)
    }

    /// Called by a watch task whose stream broke or ended. Records the error
    /// and decides whether the task should reopen its stream.
    ///
    /// A task that is no longer the topic's current watch, or whose topic has
    /// no subscribers left, is told to stop; in the latter case the topic is
    /// marked inactive so the next subscribe starts a fresh watch.
    pub(crate) async fn watch_interrupted(
        &self,
        key: &WatchKey,
        id: u64,
        error: Option<&str>,
    ) -> bool {
        let mut topics = self.inner.topics.lock().await;
        let Some(topic) = topics.get_mut(key) else {
            return false;
        };
        if !topic.watch.as_ref().is_some_and(|w| w.id == id) {
            return false;
        }
        if let Some(error) = error {
            topic.last_error = Some(error.to_string());
        }
        if topic.subscribers.is_empty() {
            topic.watch = None;
            return false;
        }
        true
    }

    /// Mark the topic failed and tell its subscribers. Ignored when `id` is
    /// no longer the topic's current watch.
    pub(crate) async fn watch_failed(&self, key: &WatchKey, id: u64, error: String) {
        let mut topics = self.inner.topics.lock().await;
        let Some(topic) = topics.get_mut(key) else {
            return;
        };
        if !topic.watch.as_ref().is_some_and(|w| w.id == id) {
            debug!(topic = %key, watch_id = id, "Ignoring failure from a retired watch");
            return;
        }
        topic.watch = None;
        topic.failed = true;
        topic.last_error = Some(error.clone());
        let _ = topic.tx.send(TopicMessage::Failed(error));
    }

    /// Drop topics with no subscribers and no running watch.
    pub async fn collect_idle(&self) -> usize {
        let mut topics = self.inner.topics.lock().await;
        let before = topics.len();
        topics.retain(|key, topic| {
            let idle = topic.subscribers.is_empty() && !topic.is_active();
            if idle {
                debug!(topic = %key, "Collecting idle topic");
            }
            !idle
        });
        before - topics.len()
    }

    /// Periodically collect idle topics until shutdown.
    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        let broker = self.clone();
        let period = self.inner.config.gc_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = broker.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let collected = broker.collect_idle().await;
                        if collected > 0 {
                            info!("Collected {} idle topics", collected);
                        }
                    }
                }
            }
        })
    }

    pub async fn snapshot(&self) -> Vec<TopicInfo> {
        let topics = self.inner.topics.lock().await;
        let mut infos: Vec<TopicInfo> = topics
            .iter()
            .map(|(key, topic)| TopicInfo {
                key: key.to_string(),
                kind: key.kind.clone(),
                namespace: key.namespace.clone(),
                subscribers: topic.subscribers.len(),
                active: topic.is_active(),
                failed: topic.failed,
                last_error: topic.last_error.clone(),
                events_published: topic.events_published,
                created_at: topic.created_at,
                last_event_at: topic.last_event_at,
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Stop every watch and forwarder.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, key: &WatchKey) -> usize {
        let topics = self.inner.topics.lock().await;
        topics.get(key).map_or(0, |t| t.subscribers.len())
    }

    #[cfg(test)]
    pub async fn is_active(&self, key: &WatchKey) -> bool {
        let topics = self.inner.topics.lock().await;
        topics.get(key).is_some_and(Topic::is_active)
    }

    #[cfg(test)]
    pub async fn topic_count(&self) -> usize {
        self.inner.topics.lock().await.len()
    }
}

fn retire(key: &WatchKey, topic: &mut Topic) {
    if let Some(watch) = topic.watch.take() {
        watch.cancel.cancel();
        info!(topic = %key, "Watch retired");
    }
}

/// Copy topic messages into one connection's outbound queue.
async fn forward(
    key: WatchKey,
    conn: ConnectionId,
    mut rx: broadcast::Receiver<TopicMessage>,
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    metrics: Arc<ServerMetrics>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = rx.recv() => match result {
                Ok(TopicMessage::Event(event)) => ServerMessage::from(event),
                Ok(TopicMessage::Failed(error)) => {
                    ServerMessage::error(watch_failure_message(&key, &error))
                }
                Err(RecvError::Lagged(n)) => {
                    metrics.events_lagged(n);
                    warn!(conn_id = %conn, topic = %key, "Subscriber lagged, dropped {} events", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = outbound.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(conn_id = %conn, topic = %key, "Forwarder stopped");
}
