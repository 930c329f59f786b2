//! Relay hub
//!
//! Entry point for dashboard connections. Owns the broker, the registry and
//! the terminal service for one server instance and routes every parsed
//! client message to the right one.

use exec_channel::ExecTarget;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{Broker, ConnectionId};
use super::protocol::{ClientMessage, ServerMessage};
use super::registry::ConnectionRegistry;
use super::terminal::{StartRequest, TerminalService};
use super::topic::WatchKey;
use crate::cluster::{ExecConnector, WatchSource};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::metrics::{HealthStatus, ServerMetrics, TopicHealth};

/// What the socket loop should do after a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Clone)]
pub struct RelayHub {
    broker: Broker,
    registry: Arc<ConnectionRegistry>,
    terminals: TerminalService,
    metrics: Arc<ServerMetrics>,
    send_buffer: usize,
    shutdown_grace: Duration,
}

impl RelayHub {
    pub fn new(
        source: Arc<dyn WatchSource>,
        connector: Arc<dyn ExecConnector>,
        config: &RelayConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broker = Broker::new(
            source,
            config.watch.clone(),
            config.topic_buffer,
            metrics.clone(),
        );
        let terminals = TerminalService::new(
            connector,
            registry.clone(),
            config.terminal.clone(),
            metrics.clone(),
        );
        Self {
            broker,
            registry,
            terminals,
            metrics,
            send_buffer: config.send_buffer.max(1),
            shutdown_grace: config.terminal.shutdown_grace,
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a new connection and queue its `connection` greeting.
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let conn = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.send_buffer);
        self.registry.register(conn.clone(), tx.clone()).await;
        self.metrics.connection_opened();
        info!(conn_id = %conn, "Client connected");
        let _ = tx.send(connected(&conn)).await;
        (conn, rx)
    }

    pub async fn handle(&self, conn: &ConnectionId, msg: ClientMessage) -> Flow {
        match self.dispatch(conn, msg).await {
            Ok(flow) => flow,
            Err(e) => {
                self.reject(conn, e).await;
                Flow::Continue
            }
        }
    }

    /// Answer a bad request with an `error` message; the connection stays open.
    pub async fn reject(&self, conn: &ConnectionId, error: RelayError) {
        self.metrics.protocol_error();
        debug!(conn_id = %conn, "Rejected client message: {}", error);
        self.send(conn, ServerMessage::error(error.to_string())).await;
    }

    async fn send(&self, conn: &ConnectionId, msg: ServerMessage) {
        if let Some(outbound) = self.registry.outbound(conn).await {
            let _ = outbound.send(msg).await;
        }
    }

    async fn dispatch(&self, conn: &ConnectionId, msg: ClientMessage) -> Result<Flow, RelayError> {
        match msg {
            ClientMessage::Connect => self.send(conn, connected(conn)).await,
            ClientMessage::Disconnect => return Ok(Flow::Close),
            ClientMessage::Ping => self.send(conn, ServerMessage::Pong).await,

            ClientMessage::SubscribeResources { kind, namespace } => {
                let key = watch_key(kind, namespace)?;
                info!(conn_id = %conn, topic = %key, "Subscribing");
                let outcome = self.registry.subscribe(conn, &key, &self.broker).await?;
                self.send(
                    conn,
                    ServerMessage::Subscribed {
                        kind: key.kind.clone(),
                        namespace: key.namespace.clone(),
                    },
                )
                .await;
                if let Some(failure) = outcome.failure {
                    self.send(conn, ServerMessage::error(failure)).await;
                }
            }

            ClientMessage::UnsubscribeResources { kind, namespace } => {
                let key = watch_key(kind, namespace)?;
                info!(conn_id = %conn, topic = %key, "Unsubscribing");
                self.registry.unsubscribe(conn, &key, &self.broker).await?;
                self.send(
                    conn,
                    ServerMessage::Unsubscribed {
                        kind: key.kind,
                        namespace: key.namespace,
                    },
                )
                .await;
            }

            ClientMessage::TerminalStart {
                namespace,
                pod,
                container,
                command,
            } => {
                let (Some(namespace), Some(pod), Some(container)) =
                    (present(namespace), present(pod), present(container))
                else {
                    return Err(RelayError::MissingArguments);
                };
                let outbound = self
                    .registry
                    .outbound(conn)
                    .await
                    .ok_or(RelayError::ConnectionClosed)?;
                let request = StartRequest {
                    target: ExecTarget::new(namespace, pod, container),
                    command,
                };

                // Negotiation can take a while; keep reading the client meanwhile
                let terminals = self.terminals.clone();
                let registry = self.registry.clone();
                let metrics = self.metrics.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    if let Err(e) = terminals.start(&conn, request, outbound.clone()).await {
                        if e == RelayError::ConnectionClosed || !registry.is_alive(&conn).await {
                            debug!(conn_id = %conn, "Connection went away before the terminal started");
                            return;
                        }
                        metrics.protocol_error();
                        let _ = outbound.send(ServerMessage::error(e.to_string())).await;
                    }
                });
            }

            ClientMessage::TerminalInput { data } => {
                if !self.terminals.input(conn, data.as_bytes()).await {
                    debug!(conn_id = %conn, "Input without an active terminal dropped");
                }
            }

            ClientMessage::TerminalResize { cols, rows } => {
                let (cols, rows) = terminal_size(cols, rows)?;
                self.terminals.resize(conn, cols, rows).await;
            }

            ClientMessage::TerminalClose => {
                self.terminals.close(conn).await;
            }
        }
        Ok(Flow::Continue)
    }

    /// Tear down everything `conn` owned. Safe to call more than once.
    pub async fn disconnect(&self, conn: &ConnectionId) {
        let Some(departed) = self.registry.unregister(conn).await else {
            return;
        };
        self.broker.drop_connection(conn).await;
        for session in &departed.sessions {
            session.close();
        }
        self.metrics.connection_closed();
        info!(
            conn_id = %conn,
            topics = departed.topics.len(),
            terminals = departed.sessions.len(),
            "Client disconnected"
        );
    }

    pub async fn health(&self) -> HealthStatus {
        let topics = self.broker.snapshot().await;
        HealthStatus {
            status: "healthy".to_string(),
            connections: self.registry.connection_count().await as u64,
            topics: TopicHealth {
                total: topics.len() as u64,
                active: topics.iter().filter(|t| t.active).count() as u64,
                failed: topics.iter().filter(|t| t.failed).count() as u64,
            },
            terminals: self.registry.session_count().await as u64,
            uptime_secs: self.metrics.uptime_secs(),
        }
    }

    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        self.broker.spawn_janitor()
    }

    /// Stop all watches and close all terminals.
    pub async fn shutdown(&self) {
        self.broker.shutdown();
        let sessions = self.registry.all_sessions().await;
        if !sessions.is_empty() {
            warn!("Closing {} terminal sessions for shutdown", sessions.len());
        }
        for session in &sessions {
            session.close();
        }
        let closed = futures::future::join_all(sessions.iter().map(|s| s.wait_closed()));
        if tokio::time::timeout(self.shutdown_grace, closed).await.is_err() {
            warn!(
                "Terminal sessions did not close within {:?}",
                self.shutdown_grace
            );
        }
    }
}

fn connected(conn: &ConnectionId) -> ServerMessage {
    ServerMessage::Connection {
        status: "connected".to_string(),
        connection_id: conn.clone(),
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn watch_key(kind: Option<String>, namespace: Option<String>) -> Result<WatchKey, RelayError> {
    let kind = present(kind).ok_or(RelayError::MissingField("kind"))?;
    Ok(WatchKey::new(&kind, namespace.as_deref()))
}

fn terminal_size(cols: Option<i64>, rows: Option<i64>) -> Result<(u16, u16), RelayError> {
    let (Some(cols), Some(rows)) = (cols, rows) else {
        return Err(RelayError::InvalidResize(
            "cols and rows are required".to_string(),
        ));
    };
    let dimension = |v: i64| u16::try_from(v).ok().filter(|v| *v > 0);
    match (dimension(cols), dimension(rows)) {
        (Some(c), Some(r)) => Ok((c, r)),
        _ => Err(RelayError::InvalidResize(format!("{}x{}", cols, rows))),
    }
}
