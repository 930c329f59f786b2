//! Server metrics for observability
//!
//! Runtime counters for connections, watch topics and terminal sessions.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently connected dashboard clients
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Watch metrics
    /// Watch tasks currently running
    pub active_watches: AtomicU64,
    /// Upstream watch streams successfully opened
    pub watch_streams_opened: AtomicU64,
    /// Restarts after a transient failure or stream end
    pub watch_restarts: AtomicU64,
    /// Topics that failed permanently
    pub watch_failures: AtomicU64,

    // Event metrics
    /// Events published to topics
    pub events_published: AtomicU64,
    /// Events a lagging subscriber never received
    pub events_dropped: AtomicU64,

    // Terminal metrics
    /// Sessions that became active
    pub terminals_started: AtomicU64,
    /// Start requests where no candidate shell worked
    pub terminals_failed: AtomicU64,
    /// Sessions currently active
    pub active_terminals: AtomicU64,

    // Error metrics
    /// Malformed or incomplete client messages
    pub protocol_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        decrement(&self.active_connections);
    }

    // Watch tracking
    pub fn watch_started(&self) {
        self.active_watches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn watch_stopped(&self) {
        decrement(&self.active_watches);
    }

    pub fn watch_opened(&self) {
        self.watch_streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn watch_restarted(&self) {
        self.watch_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn watch_failed(&self) {
        self.watch_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Event tracking
    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_lagged(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    // Terminal tracking
    pub fn terminal_started(&self) {
        self.terminals_started.fetch_add(1, Ordering::Relaxed);
        self.active_terminals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn terminal_failed(&self) {
        self.terminals_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn terminal_closed(&self) {
        decrement(&self.active_terminals);
    }

    // Error tracking
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            watches: WatchMetrics {
                active: self.active_watches.load(Ordering::Relaxed),
                streams_opened: self.watch_streams_opened.load(Ordering::Relaxed),
                restarts: self.watch_restarts.load(Ordering::Relaxed),
                failures: self.watch_failures.load(Ordering::Relaxed),
            },
            events: EventMetrics {
                published: self.events_published.load(Ordering::Relaxed),
                dropped: self.events_dropped.load(Ordering::Relaxed),
            },
            terminals: TerminalMetrics {
                active: self.active_terminals.load(Ordering::Relaxed),
                started: self.terminals_started.load(Ordering::Relaxed),
                failed: self.terminals_failed.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                protocol: self.protocol_errors.load(Ordering::Relaxed),
            },
        }
    }
}

// Gauges never wrap below zero, even if a close is reported twice.
fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub watches: WatchMetrics,
    pub events: EventMetrics,
    pub terminals: TerminalMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchMetrics {
    pub active: u64,
    pub streams_opened: u64,
    pub restarts: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetrics {
    pub published: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalMetrics {
    pub active: u64,
    pub started: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub protocol: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub topics: TopicHealth,
    pub terminals: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicHealth {
    pub total: u64,
    pub active: u64,
    pub failed: u64,
}
