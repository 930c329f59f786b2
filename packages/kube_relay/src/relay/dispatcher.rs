//! Watch task
//!
//! One task per active topic. It keeps the topic's upstream stream open for as
//! long as the topic has subscribers: transient failures and clean stream ends
//! are followed by a backoff and a reopen, permanent failures end the topic.
//! Reopens resume from the last resource version seen, so subscribers do not
//! get the current state replayed after every interruption.

use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broker::Broker;
use super::topic::{ResourceEvent, WatchKey};
use crate::cluster::WatchUpdate;
use crate::error::WatchError;
use crate::metrics::ServerMetrics;
use crate::retry::Backoff;

/// Keeps the active-watch gauge honest however the task exits.
struct ActiveWatch(Arc<ServerMetrics>);

impl ActiveWatch {
    fn start(metrics: &Arc<ServerMetrics>) -> Self {
        metrics.watch_started();
        Self(metrics.clone())
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.0.watch_stopped();
    }
}

pub(crate) async fn run_watch(broker: Broker, key: WatchKey, id: u64, cancel: CancellationToken) {
    let metrics = broker.metrics().clone();
    let _active = ActiveWatch::start(&metrics);
    let mut backoff = Backoff::new(broker.config().backoff.clone());
    let mut resource_version: Option<String> = None;
    info!(topic = %key, watch_id = id, "Watch started");

    loop {
        // Dropping the stream future on cancel releases the upstream connection
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = consume(&broker, &key, &mut resource_version, &mut backoff, &metrics) => outcome,
        };

        let error = match outcome {
            Err(e) if e.is_permanent() => {
                warn!(topic = %key, "Watch failed permanently: {}", e);
                metrics.watch_failed();
                broker.watch_failed(&key, id, e.to_string()).await;
                break;
            }
            Err(e) if e.is_expired() => {
                debug!(topic = %key, "Resource version expired, relisting");
                resource_version = None;
                Some(e.to_string())
            }
            Err(e) => Some(e.to_string()),
            Ok(()) => None,
        };

        if !broker.watch_interrupted(&key, id, error.as_deref()).await {
            debug!(topic = %key, "No subscribers left, not reopening");
            break;
        }

        let delay = backoff.next_delay();
        match &error {
            Some(e) => warn!(
                topic = %key,
                attempt = backoff.attempts(),
                "Watch interrupted ({}), reopening in {:?}",
                e,
                delay
            ),
            None => debug!(topic = %key, "Watch stream ended, reopening in {:?}", delay),
        }
        metrics.watch_restarted();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(topic = %key, watch_id = id, "Watch stopped");
}

/// Open the stream and publish its events until it ends (`Ok`) or fails.
///
/// `resource_version` tracks the newest version seen, from events and
/// bookmarks alike.
async fn consume(
    broker: &Broker,
    key: &WatchKey,
    resource_version: &mut Option<String>,
    backoff: &mut Backoff,
    metrics: &ServerMetrics,
) -> Result<(), WatchError> {
    let mut stream = broker
        .source()
        .open_watch(key, resource_version.as_deref())
        .await?;
    metrics.watch_opened();
    debug!(topic = %key, resource_version = ?resource_version, "Watch stream open");

    while let Some(update) = stream.next().await {
        backoff.reset();
        let event = match update? {
            WatchUpdate::Bookmark(rv) => {
                *resource_version = Some(rv);
                continue;
            }
            WatchUpdate::Event(event) => event,
        };
        if let Some(rv) = event.resource_version() {
            *resource_version = Some(rv.to_string());
        }
        broker
            .publish(
                key,
                ResourceEvent {
                    event_type: event.event_type,
                    key: key.clone(),
                    resource: Arc::new(event.object),
                },
            )
            .await;
    }
    Ok(())
}
