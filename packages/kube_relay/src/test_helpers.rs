use async_trait::async_trait;
use exec_channel::{ExecError, ExecStream, ExecTarget, Frame, channel};
use futures::SinkExt;
use futures::StreamExt;
use futures::channel::mpsc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cluster::{ExecConnector, RawWatchEvent, WatchSource, WatchStream, WatchUpdate};
use crate::error::WatchError;
use crate::relay::topic::{EventType, WatchKey};

type WatchItem = Result<WatchUpdate, WatchError>;

/// Decrements a live-stream gauge when the stream holding it is dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory watch source. Tests push events into the open streams by key.
#[derive(Default)]
pub struct FakeWatchSource {
    opened: AtomicUsize,
    opened_from: Mutex<Vec<Option<String>>>,
    live: Arc<AtomicUsize>,
    streams: Mutex<HashMap<WatchKey, Vec<mpsc::UnboundedSender<WatchItem>>>>,
    open_errors: Mutex<HashMap<WatchKey, WatchError>>,
}

impl FakeWatchSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total successful `open_watch` calls
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// The resume version passed to each successful open, in order
    pub fn opened_from(&self) -> Vec<Option<String>> {
        self.opened_from.lock().unwrap().clone()
    }

    /// Streams opened and not yet dropped by the relay
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Make every future open of `key` fail with `error`.
    pub fn fail_opens(&self, key: &WatchKey, error: WatchError) {
        self.open_errors.lock().unwrap().insert(key.clone(), error);
    }

    /// Deliver an event on every open stream for `key`; returns how many streams got it.
    pub fn emit(&self, key: &WatchKey, event_type: EventType, object: serde_json::Value) -> usize {
        self.push(
            key,
            Ok(WatchUpdate::Event(RawWatchEvent {
                event_type,
                object,
            })),
        )
    }

    /// Deliver a bookmark on every open stream for `key`.
    pub fn bookmark(&self, key: &WatchKey, resource_version: &str) -> usize {
        self.push(key, Ok(WatchUpdate::Bookmark(resource_version.to_string())))
    }

    /// Fail every open stream for `key` with `error`.
    pub fn break_streams(&self, key: &WatchKey, error: WatchError) -> usize {
        self.push(key, Err(error))
    }

    /// End every open stream for `key` cleanly.
    pub fn end_streams(&self, key: &WatchKey) {
        self.streams.lock().unwrap().remove(key);
    }

    fn push(&self, key: &WatchKey, item: WatchItem) -> usize {
        let mut streams = self.streams.lock().unwrap();
        let Some(senders) = streams.get_mut(key) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| tx.unbounded_send(item.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl WatchSource for FakeWatchSource {
    async fn open_watch(
        &self,
        key: &WatchKey,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, WatchError> {
        if let Some(error) = self.open_errors.lock().unwrap().get(key) {
            return Err(error.clone());
        }
        let (tx, rx) = mpsc::unbounded();
        self.streams
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(tx);
        self.opened_from
            .lock()
            .unwrap()
            .push(resource_version.map(str::to_string));
        self.opened.fetch_add(1, Ordering::SeqCst);

        let guard = LiveGuard::new(&self.live);
        Ok(rx
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed())
    }
}

/// How a fake container reacts to an exec of a given command
#[derive(Clone, Debug)]
pub enum ShellBehavior {
    /// The upgrade is refused
    Refuse,
    /// The stream opens, then reports a failed status and closes
    ExitImmediately,
    /// The command runs and exits at once with a non-zero code
    ExitWithCode(i32),
    /// A working shell; the test drives it through a [`RemoteShell`]
    Accept,
}

/// The container side of an accepted fake exec
pub struct RemoteShell {
    pub command: String,
    /// Frames the relay sent upstream
    pub upstream: mpsc::UnboundedReceiver<Frame>,
    /// Frames (or failures) to deliver to the relay
    pub downstream: mpsc::UnboundedSender<Result<Frame, ExecError>>,
}

impl RemoteShell {
    pub fn output(&self, text: &str) {
        let _ = self
            .downstream
            .unbounded_send(Ok(Frame::new(channel::STDOUT, text.as_bytes())));
    }

    pub async fn next_upstream(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), self.upstream.next())
            .await
            .expect("timed out waiting for an upstream frame")
            .expect("exec stream closed")
    }
}

/// In-memory exec connector. Unknown commands behave as [`ShellBehavior::Accept`].
#[derive(Default)]
pub struct FakeConnector {
    behaviors: Mutex<HashMap<String, ShellBehavior>>,
    attempts: Mutex<Vec<String>>,
    live: Arc<AtomicUsize>,
    remotes: Mutex<Vec<RemoteShell>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, command: &str, behavior: ShellBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(command.to_string(), behavior);
    }

    /// Commands tried so far, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    /// Exec streams opened and not yet dropped
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Take the most recently accepted shell.
    pub fn take_remote(&self) -> RemoteShell {
        self.remotes
            .lock()
            .unwrap()
            .pop()
            .expect("no accepted exec stream")
    }
}

#[async_trait]
impl ExecConnector for FakeConnector {
    async fn open_exec(
        &self,
        _target: &ExecTarget,
        command: &[String],
    ) -> Result<ExecStream, ExecError> {
        let command = command.join(" ");
        self.attempts.lock().unwrap().push(command.clone());
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&command)
            .cloned()
            .unwrap_or(ShellBehavior::Accept);

        if let ShellBehavior::Refuse = behavior {
            return Err(ExecError::Rejected {
                status: 500,
                message: format!("exec {} refused", command),
            });
        }

        let (up_tx, up_rx) = mpsc::unbounded::<Frame>();
        let (down_tx, down_rx) = mpsc::unbounded::<Result<Frame, ExecError>>();
        let guard = LiveGuard::new(&self.live);
        let sink = up_tx.sink_map_err(|e| ExecError::Transport(e.to_string()));
        let source = down_rx.map(move |item| {
            let _held = &guard;
            item
        });

        match behavior {
            ShellBehavior::ExitImmediately => {
                let payload = serde_json::json!({
                    "status": "Failure",
                    "message": format!("{}: not found", command),
                })
                .to_string();
                let _ = down_tx.unbounded_send(Ok(Frame::new(channel::ERROR, payload)));
            }
            ShellBehavior::ExitWithCode(code) => {
                let payload = serde_json::json!({
                    "status": "Failure",
                    "reason": "NonZeroExitCode",
                    "message": format!("command terminated with non-zero exit code: {}", code),
                    "details": {"causes": [{"reason": "ExitCode", "message": code.to_string()}]},
                })
                .to_string();
                let _ = down_tx.unbounded_send(Ok(Frame::new(channel::ERROR, payload)));
            }
            _ => self.remotes.lock().unwrap().push(RemoteShell {
                command,
                upstream: up_rx,
                downstream: down_tx,
            }),
        }

        Ok(ExecStream::new(sink, source))
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive the next message, failing the test after two seconds.
pub async fn recv<T>(rx: &mut tokio::sync::mpsc::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}
