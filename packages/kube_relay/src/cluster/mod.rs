//! Cluster API collaborators
//!
//! The relay only needs two things from the cluster: a restartable watch stream
//! per topic and an exec stream per terminal. Both sit behind traits so the relay
//! can be driven by in-memory fakes.

pub mod client;
pub mod kinds;
pub mod watch;

use async_trait::async_trait;
use exec_channel::{ExecError, ExecStream, ExecTarget};
use futures::stream::BoxStream;

use crate::error::WatchError;
use crate::relay::topic::WatchKey;

pub use client::ClusterClient;
pub use watch::{RawWatchEvent, WatchUpdate};

/// A live watch: events and bookmarks until the stream ends or fails
pub type WatchStream = BoxStream<'static, Result<WatchUpdate, WatchError>>;

/// Opens change feeds for a (kind, namespace) pair.
#[async_trait]
pub trait WatchSource: Send + Sync + 'static {
    /// Open a watch. With a `resource_version` the stream resumes after that
    /// version; without one the server lists current state as ADDED events.
    async fn open_watch(
        &self,
        key: &WatchKey,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, WatchError>;
}

/// Opens exec streams into containers.
#[async_trait]
pub trait ExecConnector: Send + Sync + 'static {
    async fn open_exec(
        &self,
        target: &ExecTarget,
        command: &[String],
    ) -> Result<ExecStream, ExecError>;
}
