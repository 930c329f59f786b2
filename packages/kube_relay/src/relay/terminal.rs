//! Terminal sessions
//!
//! A session is one interactive shell in a container, bound to one dashboard
//! connection and one exec stream. It moves through
//! `Connecting -> Active -> Closing -> Closed`; `Closed` is final.
//!
//! While `Connecting`, candidate shells are tried in order until one opens and
//! survives the probe window. Each attempt owns its stream; a failed attempt
//! releases it before the next one starts. Once `Active`, a single relay task
//! owns the stream: it forwards output to the client and is the only writer of
//! input and resize frames upstream.

use exec_channel::{ExecError, ExecStatus, ExecStream, ExecTarget, Frame, TerminalSize, channel};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::ConnectionId;
use super::protocol::ServerMessage;
use super::registry::ConnectionRegistry;
use super::utf8::Utf8StreamDecoder;
use crate::cluster::ExecConnector;
use crate::config::TerminalConfig;
use crate::error::RelayError;
use crate::metrics::ServerMetrics;

pub type SessionId = String;

/// Input frames queued for the relay task
const INPUT_BUFFER: usize = 64;

/// Commands that mean "whatever shell the container has"
const DEFAULT_SHELL_COMMANDS: [&str; 2] = ["/bin/bash", "/bin/sh"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// A client's request to open a shell
#[derive(Clone, Debug)]
pub struct StartRequest {
    pub target: ExecTarget,
    pub command: Option<String>,
}

/// Shells to try for a start request, in order.
///
/// A custom command is tried alone. No command, or one of the conventional
/// default shells, falls back to the configured list.
pub fn candidate_shells(command: Option<&str>, defaults: &[String]) -> Vec<String> {
    match command.map(str::trim).filter(|c| !c.is_empty()) {
        Some(command) if !DEFAULT_SHELL_COMMANDS.iter().any(|c| *c == command) => {
            vec![command.to_string()]
        }
        _ => defaults.to_vec(),
    }
}

/// An exec stream that passed negotiation, plus what arrived during the probe
struct Negotiated {
    stream: ExecStream,
    buffered: Vec<Frame>,
    ended: bool,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Open(#[from] ExecError),

    #[error("{0}")]
    Exited(String),

    #[error("exec stream closed before the shell started")]
    Closed,
}

/// What the relay task needs besides the session itself
#[derive(Clone)]
struct RelayContext {
    registry: Arc<ConnectionRegistry>,
    outbound: mpsc::Sender<ServerMessage>,
    metrics: Arc<ServerMetrics>,
    close_timeout: Duration,
}

#[derive(Default)]
struct SessionInner {
    shell: Option<String>,
    input: Option<mpsc::Sender<Frame>>,
    finished: bool,
}

pub struct TerminalSession {
    id: SessionId,
    conn_id: ConnectionId,
    target: ExecTarget,
    /// Written only while `inner` is locked, so state and input sender agree
    state: watch::Sender<SessionState>,
    inner: Mutex<SessionInner>,
    cancel: CancellationToken,
}

impl TerminalSession {
    pub fn new(conn_id: ConnectionId, target: ExecTarget) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: Uuid::new_v4().to_string(),
            conn_id,
            target,
            state,
            inner: Mutex::new(SessionInner::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn shell(&self) -> Option<String> {
        self.lock().shell.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active_input(&self) -> Option<mpsc::Sender<Frame>> {
        let inner = self.lock();
        if *self.state.borrow() != SessionState::Active {
            return None;
        }
        inner.input.clone()
    }

    /// Queue keystrokes for the shell. A no-op unless the session is Active.
    pub async fn input(&self, data: &[u8]) -> bool {
        let Some(input) = self.active_input() else {
            return false;
        };
        input.send(Frame::stdin(data)).await.is_ok()
    }

    /// Queue a resize. A no-op unless the session is Active.
    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        let Some(input) = self.active_input() else {
            return false;
        };
        let frame = match Frame::resize(TerminalSize {
            width: cols,
            height: rows,
        }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session = %self.id, "Failed to encode resize: {}", e);
                return false;
            }
        };
        input.send(frame).await.is_ok()
    }

    /// Begin closing. Returns false if the session was already closing or closed.
    pub fn close(&self) -> bool {
        let mut inner = self.lock();
        let changed = self.state.send_if_modified(|state| match state {
            SessionState::Connecting | SessionState::Active => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        });
        if !changed {
            return false;
        }
        inner.input = None;
        drop(inner);
        self.cancel.cancel();
        debug!(session = %self.id, "Terminal close requested");
        true
    }

    /// Resolves once the session reached `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Connecting -> Active. Returns the receiving end of the input queue, or
    /// `None` if the session was closed while negotiating.
    fn activate(&self, shell: &str) -> Option<mpsc::Receiver<Frame>> {
        let mut inner = self.lock();
        if *self.state.borrow() != SessionState::Connecting {
            return None;
        }
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        inner.shell = Some(shell.to_string());
        inner.input = Some(input_tx);
        self.state.send_replace(SessionState::Active);
        Some(input_rx)
    }

    fn spawn_relay(
        self: &Arc<Self>,
        negotiated: Negotiated,
        input_rx: mpsc::Receiver<Frame>,
        ctx: RelayContext,
    ) {
        tokio::spawn(relay(self.clone(), negotiated, input_rx, ctx));
    }

    /// Active -> Closing when the upstream side ended on its own.
    fn begin_closing(&self) {
        let mut inner = self.lock();
        self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        inner.input = None;
    }

    /// Enter `Closed` and release everything the session holds. Runs once.
    async fn finish(&self, ctx: &RelayContext, reason: String, was_active: bool) {
        {
            let mut inner = self.lock();
            if inner.finished {
                return;
            }
            inner.finished = true;
            inner.input = None;
            self.state.send_replace(SessionState::Closed);
        }
        self.cancel.cancel();
        ctx.registry.release_session(&self.id).await;

        info!(
            session = %self.id,
            conn_id = %self.conn_id,
            reason = %reason,
            "Terminal session closed"
        );
        if was_active {
            ctx.metrics.terminal_closed();
            let msg = ServerMessage::TerminalClosed {
                session_id: self.id.clone(),
                reason,
            };
            let _ = tokio::time::timeout(ctx.close_timeout, ctx.outbound.send(msg)).await;
        }
    }

    /// Forward a message to the client unless the session is being torn down.
    async fn notify(&self, ctx: &RelayContext, msg: ServerMessage) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = ctx.outbound.send(msg) => sent.is_ok(),
        }
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("target", &self.target)
            .field("state", &self.state())
            .field("shell", &self.shell())
            .finish_non_exhaustive()
    }
}

/// stdout and stderr are decoded separately so a character split on one
/// channel is not corrupted by bytes from the other.
#[derive(Default)]
struct OutputDecoder {
    stdout: Utf8StreamDecoder,
    stderr: Utf8StreamDecoder,
}

impl OutputDecoder {
    fn decode(&mut self, frame: &Frame) -> String {
        if frame.channel == channel::STDERR {
            self.stderr.decode(&frame.payload)
        } else {
            self.stdout.decode(&frame.payload)
        }
    }

    fn finish(&mut self) -> String {
        let mut tail = self.stdout.finish();
        tail.push_str(&self.stderr.finish());
        tail
    }
}

enum Step {
    Cancelled,
    Input(Frame),
    Upstream(Option<Result<Frame, ExecError>>),
}

async fn relay(
    session: Arc<TerminalSession>,
    negotiated: Negotiated,
    mut input_rx: mpsc::Receiver<Frame>,
    ctx: RelayContext,
) {
    let Negotiated {
        mut stream,
        buffered,
        mut ended,
    } = negotiated;
    let mut output = OutputDecoder::default();
    let mut status: Option<ExecStatus> = None;
    let mut reason: Option<String> = None;

    for frame in buffered {
        if !forward_frame(&session, &ctx, frame, &mut output, &mut status).await {
            reason = Some("closed".to_string());
            break;
        }
    }

    let reason = loop {
        if let Some(reason) = reason.take() {
            break reason;
        }
        if ended {
            break end_reason(status.as_ref());
        }

        let step = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => Step::Cancelled,
            Some(frame) = input_rx.recv() => Step::Input(frame),
            frame = stream.next_frame() => Step::Upstream(frame),
        };

        match step {
            Step::Cancelled => break "closed".to_string(),
            Step::Input(frame) => {
                if let Err(e) = stream.send(frame).await {
                    warn!(session = %session.id, "Failed to write to exec stream: {}", e);
                    report_error(&session, &ctx, &e).await;
                    break e.to_string();
                }
            }
            Step::Upstream(Some(Ok(frame))) => {
                if !forward_frame(&session, &ctx, frame, &mut output, &mut status).await {
                    reason = Some("closed".to_string());
                }
            }
            Step::Upstream(Some(Err(e))) => {
                warn!(session = %session.id, "Exec stream failed: {}", e);
                report_error(&session, &ctx, &e).await;
                break e.to_string();
            }
            Step::Upstream(None) => ended = true,
        }
    };

    let tail = output.finish();
    if !tail.is_empty() {
        session
            .notify(&ctx, ServerMessage::TerminalOutput { text: tail })
            .await;
    }

    session.begin_closing();
    drop(input_rx);
    release(stream, ctx.close_timeout).await;
    session.finish(&ctx, reason, true).await;
}

/// Returns false once the client can no longer be reached.
async fn forward_frame(
    session: &TerminalSession,
    ctx: &RelayContext,
    frame: Frame,
    output: &mut OutputDecoder,
    status: &mut Option<ExecStatus>,
) -> bool {
    match frame.channel {
        channel::STDOUT | channel::STDERR => {
            let text = output.decode(&frame);
            if text.is_empty() {
                return true;
            }
            session
                .notify(ctx, ServerMessage::TerminalOutput { text })
                .await
        }
        channel::ERROR => {
            if let Some(parsed) = ExecStatus::parse(&frame.payload) {
                debug!(session = %session.id, status = %parsed.status, "Exec status received");
                *status = Some(parsed);
            }
            true
        }
        other => {
            debug!(session = %session.id, channel = other, "Ignoring frame on unexpected channel");
            true
        }
    }
}

async fn report_error(session: &TerminalSession, ctx: &RelayContext, error: &ExecError) {
    let text = format!("\r\nError: {}\r\n", error);
    session
        .notify(ctx, ServerMessage::TerminalOutput { text })
        .await;
}

fn end_reason(status: Option<&ExecStatus>) -> String {
    match status {
        Some(status) => status.describe(),
        None => "connection closed".to_string(),
    }
}

/// Close handshake with a deadline, then drop the stream regardless.
async fn release(mut stream: ExecStream, timeout: Duration) {
    match tokio::time::timeout(timeout, stream.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Exec stream close failed: {}", e),
        Err(_) => debug!("Exec stream close timed out after {:?}", timeout),
    }
}

/// Starts terminal sessions and routes input to a connection's current one.
#[derive(Clone)]
pub struct TerminalService {
    connector: Arc<dyn ExecConnector>,
    registry: Arc<ConnectionRegistry>,
    config: TerminalConfig,
    metrics: Arc<ServerMetrics>,
}

enum Probe {
    Ready,
    Frame(Option<Result<Frame, ExecError>>),
}

impl TerminalService {
    pub fn new(
        connector: Arc<dyn ExecConnector>,
        registry: Arc<ConnectionRegistry>,
        config: TerminalConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            connector,
            registry,
            config,
            metrics,
        }
    }

    /// Open a shell for `conn`, replacing its previous session.
    ///
    /// Returns the session once it is Active, or once it was closed while
    /// still negotiating. Fails if the connection is gone or no candidate
    /// shell could be started.
    pub async fn start(
        &self,
        conn: &ConnectionId,
        request: StartRequest,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<Arc<TerminalSession>, RelayError> {
        let session = Arc::new(TerminalSession::new(conn.clone(), request.target.clone()));
        for previous in self.registry.attach_session(conn, session.clone()).await? {
            if previous.close() {
                info!(session = %previous.id(), conn_id = %conn, "Closing previous terminal");
            }
        }

        let ctx = RelayContext {
            registry: self.registry.clone(),
            outbound,
            metrics: self.metrics.clone(),
            close_timeout: self.config.close_timeout,
        };
        info!(
            session = %session.id(),
            conn_id = %conn,
            target = %request.target,
            "Starting terminal"
        );

        let candidates = candidate_shells(request.command.as_deref(), &self.config.shells);
        let mut last_error = None;
        let mut chosen = None;
        for shell in &candidates {
            let argv: Vec<String> = shell.split_whitespace().map(str::to_string).collect();
            // Dropping an in-flight attempt releases whatever it opened
            let attempt = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => break,
                attempt = self.attempt(&request.target, &argv) => attempt,
            };
            match attempt {
                Ok(negotiated) => {
                    chosen = Some((shell.clone(), negotiated));
                    break;
                }
                Err(e) => {
                    debug!(session = %session.id(), shell = %shell, "Shell candidate failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        let Some((shell, negotiated)) = chosen else {
            if session.cancel.is_cancelled() {
                session.finish(&ctx, "closed".to_string(), false).await;
                return Ok(session);
            }
            self.metrics.terminal_failed();
            let detail = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no shell to try".to_string());
            warn!(session = %session.id(), target = %request.target, "No shell could be started: {}", detail);
            session.finish(&ctx, detail.clone(), false).await;
            return Err(RelayError::TerminalStart(detail));
        };

        let Some(input_rx) = session.activate(&shell) else {
            release(negotiated.stream, self.config.close_timeout).await;
            session.finish(&ctx, "closed".to_string(), false).await;
            return Ok(session);
        };

        self.metrics.terminal_started();
        info!(session = %session.id(), shell = %shell, "Terminal session active");
        let _ = ctx
            .outbound
            .send(ServerMessage::TerminalStarted {
                session_id: session.id().to_string(),
                shell,
            })
            .await;
        session.spawn_relay(negotiated, input_rx, ctx);
        Ok(session)
    }

    /// Open one candidate and watch it through the probe window.
    async fn attempt(
        &self,
        target: &ExecTarget,
        argv: &[String],
    ) -> Result<Negotiated, AttemptError> {
        let mut stream = self.connector.open_exec(target, argv).await?;
        let Some(window) = self.config.probe else {
            return Ok(Negotiated {
                stream,
                buffered: Vec::new(),
                ended: false,
            });
        };

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        let mut buffered: Vec<Frame> = Vec::new();
        loop {
            let probe = tokio::select! {
                _ = &mut deadline => Probe::Ready,
                frame = stream.next_frame() => Probe::Frame(frame),
            };
            match probe {
                Probe::Ready => {
                    return Ok(Negotiated {
                        stream,
                        buffered,
                        ended: false,
                    });
                }
                Probe::Frame(Some(Ok(frame))) => {
                    // A non-zero exit means the command ran; only an exec that
                    // never started disqualifies the candidate
                    let produced_output = buffered.iter().any(Frame::is_output);
                    if frame.channel == channel::ERROR && !produced_output {
                        if let Some(status) = ExecStatus::parse(&frame.payload) {
                            if !status.is_success() && !status.is_process_exit() {
                                release(stream, self.config.close_timeout).await;
                                return Err(AttemptError::Exited(status.describe()));
                            }
                        }
                    }
                    buffered.push(frame);
                }
                Probe::Frame(Some(Err(e))) => {
                    release(stream, self.config.close_timeout).await;
                    return Err(e.into());
                }
                Probe::Frame(None) => {
                    if buffered.is_empty() {
                        release(stream, self.config.close_timeout).await;
                        return Err(AttemptError::Closed);
                    }
                    return Ok(Negotiated {
                        stream,
                        buffered,
                        ended: true,
                    });
                }
            }
        }
    }

    pub async fn input(&self, conn: &ConnectionId, data: &[u8]) -> bool {
        match self.registry.current_session(conn).await {
            Some(session) => session.input(data).await,
            None => false,
        }
    }

    pub async fn resize(&self, conn: &ConnectionId, cols: u16, rows: u16) -> bool {
        match self.registry.current_session(conn).await {
            Some(session) => session.resize(cols, rows).await,
            None => false,
        }
    }

    pub async fn close(&self, conn: &ConnectionId) -> bool {
        match self.registry.current_session(conn).await {
            Some(session) => session.close(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeConnector, ShellBehavior, recv, wait_until};
    use futures::StreamExt;
    use std::sync::atomic::Ordering;

    struct Harness {
        connector: Arc<FakeConnector>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<ServerMetrics>,
        service: TerminalService,
        conn: ConnectionId,
        rx: mpsc::Receiver<ServerMessage>,
        tx: mpsc::Sender<ServerMessage>,
    }

    async fn harness(probe: Option<Duration>) -> Harness {
        let connector = FakeConnector::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(ServerMetrics::new());
        let config = TerminalConfig {
            shells: vec!["/bin/bash".into(), "/bin/ash".into(), "/bin/sh".into()],
            probe,
            close_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(1),
        };
        let service = TerminalService::new(
            connector.clone(),
            registry.clone(),
            config,
            metrics.clone(),
        );
        let (tx, rx) = mpsc::channel(64);
        let conn = "conn-1".to_string();
        registry.register(conn.clone(), tx.clone()).await;
        Harness {
            connector,
            registry,
            metrics,
            service,
            conn,
            rx,
            tx,
        }
    }

    fn request(command: Option<&str>) -> StartRequest {
        StartRequest {
            target: ExecTarget::new("default", "web-0", "app"),
            command: command.map(str::to_string),
        }
    }

    async fn start(h: &mut Harness, command: Option<&str>) -> Arc<TerminalSession> {
        let session = h
            .service
            .start(&h.conn, request(command), h.tx.clone())
            .await
            .unwrap();
        match recv(&mut h.rx).await {
            ServerMessage::TerminalStarted { session_id, .. } => {
                assert_eq!(session_id, session.id())
            }
            other => panic!("unexpected message: {:?}", other),
        }
        session
    }

    #[test]
    fn test_candidate_shells() {
        let defaults = vec!["/bin/bash".to_string(), "/bin/sh".to_string()];
        assert_eq!(candidate_shells(None, &defaults), defaults);
        assert_eq!(candidate_shells(Some("/bin/bash"), &defaults), defaults);
        assert_eq!(candidate_shells(Some(" /bin/sh "), &defaults), defaults);
        assert_eq!(candidate_shells(Some(""), &defaults), defaults);
        assert_eq!(
            candidate_shells(Some("/usr/bin/zsh -l"), &defaults),
            vec!["/usr/bin/zsh -l".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fallback_picks_first_working_shell() {
        let mut h = harness(None).await;
        h.connector.set("/bin/bash", ShellBehavior::Refuse);
        h.connector.set("/bin/ash", ShellBehavior::Refuse);

        let session = start(&mut h, None).await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.shell().as_deref(), Some("/bin/sh"));
        assert_eq!(
            h.connector.attempts(),
            vec!["/bin/bash", "/bin/ash", "/bin/sh"]
        );
        assert_eq!(h.connector.live(), 1);
    }

    #[tokio::test]
    async fn test_probe_rejects_shell_that_exits_immediately() {
        let mut h = harness(Some(Duration::from_millis(50))).await;
        h.connector.set("/bin/bash", ShellBehavior::ExitImmediately);
        h.connector.set("/bin/ash", ShellBehavior::ExitImmediately);

        let session = start(&mut h, None).await;
        assert_eq!(session.shell().as_deref(), Some("/bin/sh"));
        assert_eq!(
            h.connector.attempts(),
            vec!["/bin/bash", "/bin/ash", "/bin/sh"]
        );
        // The two failed attempts released their streams
        assert_eq!(h.connector.live(), 1);
    }

    #[tokio::test]
    async fn test_command_that_exits_during_negotiation_still_starts() {
        let mut h = harness(Some(Duration::from_millis(200))).await;
        h.connector.set("false", ShellBehavior::ExitWithCode(2));

        let session = start(&mut h, Some("false")).await;
        match recv(&mut h.rx).await {
            ServerMessage::TerminalClosed { session_id, reason } => {
                assert_eq!(session_id, session.id());
                assert_eq!(reason, "exit code 2");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(h.connector.attempts(), vec!["false"]);
        assert_eq!(h.metrics.terminals_started.load(Ordering::Relaxed), 1);
        assert_eq!(h.metrics.terminals_failed.load(Ordering::Relaxed), 0);
        session.wait_closed().await;
        wait_until(|| h.connector.live() == 0).await;
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_releases_attempt() {
        let mut h = harness(Some(Duration::from_secs(1))).await;
        let service = h.service.clone();
        let conn = h.conn.clone();
        let tx = h.tx.clone();
        let task = tokio::spawn(async move { service.start(&conn, request(None), tx).await });

        wait_until(|| h.connector.live() == 1).await;
        let departed = h.registry.unregister(&h.conn).await.unwrap();
        assert_eq!(departed.sessions.len(), 1);
        assert_eq!(departed.sessions[0].state(), SessionState::Connecting);
        for session in &departed.sessions {
            assert!(session.close());
        }

        let session = task.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        wait_until(|| h.connector.live() == 0).await;
        assert_eq!(h.connector.attempts(), vec!["/bin/bash"]);
        assert_eq!(h.metrics.terminals_started.load(Ordering::Relaxed), 0);
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_attempts_after_a_shell_works() {
        let mut h = harness(None).await;
        let session = start(&mut h, None).await;
        assert_eq!(session.shell().as_deref(), Some("/bin/bash"));
        assert_eq!(h.connector.attempts(), vec!["/bin/bash"]);
    }

    #[tokio::test]
    async fn test_custom_command_is_tried_alone() {
        let h = harness(None).await;
        h.connector.set("htop -d 10", ShellBehavior::Refuse);

        let err = h
            .service
            .start(&h.conn, request(Some("htop -d 10")), h.tx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TerminalStart(_)));
        assert_eq!(h.connector.attempts(), vec!["htop -d 10"]);
        assert_eq!(h.connector.live(), 0);
        assert_eq!(h.registry.session_count().await, 0);
        assert_eq!(h.metrics.terminals_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_input_is_sent_as_one_stdin_frame() {
        let mut h = harness(None).await;
        let session = start(&mut h, None).await;
        let mut remote = h.connector.take_remote();

        assert!(h.service.input(&h.conn, b"ls -la\r").await);
        let frame = remote.next_upstream().await;
        assert_eq!(frame.encode(), b"\x00ls -la\r".to_vec());
        let extra = tokio::time::timeout(Duration::from_millis(50), remote.upstream.next()).await;
        assert!(extra.is_err(), "extra frame sent");
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_resize_sends_channel_four_json() {
        let mut h = harness(None).await;
        start(&mut h, None).await;
        let mut remote = h.connector.take_remote();

        assert!(h.service.resize(&h.conn, 80, 24).await);
        let frame = remote.next_upstream().await;
        assert_eq!(frame.channel, channel::RESIZE);
        let size: TerminalSize = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(
            size,
            TerminalSize {
                width: 80,
                height: 24
            }
        );
        let json: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(json, serde_json::json!({"Width": 80, "Height": 24}));
    }

    #[tokio::test]
    async fn test_output_is_decoded_and_forwarded() {
        let mut h = harness(None).await;
        start(&mut h, None).await;
        let remote = h.connector.take_remote();

        let bytes = "héllo".as_bytes();
        remote
            .downstream
            .unbounded_send(Ok(Frame::new(channel::STDOUT, &bytes[..2])))
            .unwrap();
        remote
            .downstream
            .unbounded_send(Ok(Frame::new(channel::STDERR, b"err".to_vec())))
            .unwrap();
        remote
            .downstream
            .unbounded_send(Ok(Frame::new(channel::STDOUT, &bytes[2..])))
            .unwrap();

        let mut text = String::new();
        while text.len() < "héllo".len() + 3 {
            match recv(&mut h.rx).await {
                ServerMessage::TerminalOutput { text: chunk } => text.push_str(&chunk),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(text, "herréllo");
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let mut h = harness(None).await;
        let session = start(&mut h, None).await;
        let _remote = h.connector.take_remote();

        assert!(session.close());
        assert!(!session.close());
        session.wait_closed().await;
        assert!(!session.close());

        match recv(&mut h.rx).await {
            ServerMessage::TerminalClosed { reason, .. } => assert_eq!(reason, "closed"),
            other => panic!("unexpected message: {:?}", other),
        }
        wait_until(|| h.connector.live() == 0).await;
        assert_eq!(h.registry.session_count().await, 0);
        assert_eq!(h.metrics.active_terminals.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_input_after_close_is_noop() {
        let mut h = harness(None).await;
        let session = start(&mut h, None).await;
        session.close();
        session.wait_closed().await;

        assert!(!session.input(b"echo hi").await);
        assert!(!session.resize(80, 24).await);
        assert!(!h.service.input(&h.conn, b"echo hi").await);
    }

    #[tokio::test]
    async fn test_upstream_exit_closes_with_exit_code() {
        let mut h = harness(None).await;
        let session = start(&mut h, None).await;
        let remote = h.connector.take_remote();

        let status = br#"{"status":"Failure","reason":"NonZeroExitCode","details":{"causes":[{"reason":"ExitCode","message":"3"}]}}"#;
        remote
            .downstream
            .unbounded_send(Ok(Frame::new(channel::ERROR, status.to_vec())))
            .unwrap();
        drop(remote);

        session.wait_closed().await;
        match recv(&mut h.rx).await {
            ServerMessage::TerminalClosed { reason, .. } => assert_eq!(reason, "exit code 3"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upstream_error_is_reported_then_closed() {
        let mut h = harness(None).await;
        let session = start(&mut h, None).await;
        let remote = h.connector.take_remote();

        remote
            .downstream
            .unbounded_send(Err(ExecError::Transport("connection reset".into())))
            .unwrap();

        match recv(&mut h.rx).await {
            ServerMessage::TerminalOutput { text } => {
                assert!(text.contains("Error: transport error: connection reset"))
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(
            recv(&mut h.rx).await,
            ServerMessage::TerminalClosed { .. }
        ));
        session.wait_closed().await;
        wait_until(|| h.connector.live() == 0).await;
    }

    #[tokio::test]
    async fn test_new_start_replaces_previous_session() {
        let mut h = harness(None).await;
        let first = start(&mut h, None).await;
        let second = h
            .service
            .start(&h.conn, request(None), h.tx.clone())
            .await
            .unwrap();

        first.wait_closed().await;
        let mut closed = None;
        let mut started = None;
        while closed.is_none() || started.is_none() {
            match recv(&mut h.rx).await {
                ServerMessage::TerminalClosed { session_id, .. } => closed = Some(session_id),
                ServerMessage::TerminalStarted { session_id, .. } => started = Some(session_id),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(closed.as_deref(), Some(first.id()));
        assert_eq!(started.as_deref(), Some(second.id()));
        assert_eq!(second.state(), SessionState::Active);
        let current = h.registry.current_session(&h.conn).await.unwrap();
        assert_eq!(current.id(), second.id());
    }

    #[tokio::test]
    async fn test_start_on_dead_connection_is_rejected() {
        let h = harness(None).await;
        h.registry.unregister(&h.conn).await;
        let err = h
            .service
            .start(&h.conn, request(None), h.tx.clone())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::ConnectionClosed);
        assert!(h.connector.attempts().is_empty());
    }
}
