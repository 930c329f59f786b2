use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::retry::BackoffConfig;

// =============================================================================
// File config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   relay.toml:      [watch]
//                    retire_grace_secs = 30
//
//   env var:         RELAY_WATCH__RETIRE_GRACE_SECS=30   (double underscore = nesting)
//
//   CLI:             --host / --port override [server] last

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub cluster: ClusterFileConfig,
    #[serde(default)]
    pub watch: WatchFileConfig,
    #[serde(default)]
    pub terminal: TerminalFileConfig,
}

/// Listener and queue sizes (lives under `[server]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Outbound queue per client connection
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    /// Broadcast capacity per topic; slower subscribers lose the oldest events
    #[serde(default = "default_topic_buffer")]
    pub topic_buffer: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            send_buffer: default_send_buffer(),
            topic_buffer: default_topic_buffer(),
        }
    }
}

/// API server access (lives under `[cluster]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterFileConfig {
    /// Base URL of the API server. Defaults to the in-cluster service address.
    #[serde(default)]
    pub api_server: Option<String>,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_ca_file")]
    pub ca_file: PathBuf,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ClusterFileConfig {
    fn default() -> Self {
        Self {
            api_server: None,
            token_file: default_token_file(),
            ca_file: default_ca_file(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Watch dispatcher tunables (lives under `[watch]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchFileConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Keep a topic's stream alive this long after its last subscriber leaves (0 = stop at once)
    #[serde(default = "default_retire_grace_secs")]
    pub retire_grace_secs: u64,
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    /// Server-side watch timeout; the stream is reopened when it expires
    #[serde(default = "default_server_timeout_secs")]
    pub server_timeout_secs: u64,
}

impl Default for WatchFileConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            retire_grace_secs: default_retire_grace_secs(),
            gc_interval_secs: default_gc_interval_secs(),
            server_timeout_secs: default_server_timeout_secs(),
        }
    }
}

/// Terminal relay tunables (lives under `[terminal]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalFileConfig {
    /// Shells tried in order when the client does not ask for a specific command
    #[serde(default = "default_shells")]
    pub shells: Vec<String>,
    #[serde(default = "default_probe_ms")]
    pub probe_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// How long server shutdown waits for open terminals to close
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TerminalFileConfig {
    fn default() -> Self {
        Self {
            shells: default_shells(),
            probe_ms: default_probe_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_send_buffer() -> usize {
    256
}
fn default_topic_buffer() -> usize {
    1024
}
fn default_token_file() -> PathBuf {
    Path::new(SERVICE_ACCOUNT_DIR).join("token")
}
fn default_ca_file() -> PathBuf {
    Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt")
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_backoff_initial_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_retire_grace_secs() -> u64 {
    10
}
fn default_gc_interval_secs() -> u64 {
    60
}
fn default_server_timeout_secs() -> u64 {
    300
}
fn default_shells() -> Vec<String> {
    vec![
        "/bin/bash".to_string(),
        "/bin/ash".to_string(),
        "/bin/sh".to_string(),
    ]
}
fn default_probe_ms() -> u64 {
    500
}
fn default_close_timeout_ms() -> u64 {
    2000
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}

/// Build a figment that layers: defaults → relay.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///   `RELAY_WATCH__BACKOFF_MAX_MS=60000`  →  `watch.backoff_max_ms = 60000`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Sizes of the relay's queues (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub send_buffer: usize,
    pub topic_buffer: usize,
    pub watch: WatchConfig,
    pub terminal: TerminalConfig,
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            send_buffer: fc.server.send_buffer.max(1),
            topic_buffer: fc.server.topic_buffer.max(1),
            watch: WatchConfig::from_file(&fc.watch),
            terminal: TerminalConfig::from_file(&fc.terminal),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

/// Watch dispatcher configuration (runtime view).
#[derive(Clone, Debug)]
pub struct WatchConfig {
    pub backoff: BackoffConfig,
    /// `None` retires an idle topic's stream immediately
    pub retire_grace: Option<Duration>,
    pub gc_interval: Duration,
}

impl WatchConfig {
    pub fn from_file(fc: &WatchFileConfig) -> Self {
        let initial = Duration::from_millis(fc.backoff_initial_ms.max(1));
        Self {
            backoff: BackoffConfig {
                initial_delay: initial,
                max_delay: Duration::from_millis(fc.backoff_max_ms).max(initial),
                ..Default::default()
            },
            retire_grace: if fc.retire_grace_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.retire_grace_secs))
            },
            gc_interval: Duration::from_secs(fc.gc_interval_secs.max(1)),
        }
    }
}

/// Terminal relay configuration (runtime view).
#[derive(Clone, Debug)]
pub struct TerminalConfig {
    pub shells: Vec<String>,
    /// `None` accepts a candidate as soon as its stream opens
    pub probe: Option<Duration>,
    pub close_timeout: Duration,
    /// Never shorter than `close_timeout`, so each session gets to release
    /// its stream
    pub shutdown_grace: Duration,
}

impl TerminalConfig {
    pub fn from_file(fc: &TerminalFileConfig) -> Self {
        let shells: Vec<String> = fc
            .shells
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            shells: if shells.is_empty() {
                default_shells()
            } else {
                shells
            },
            probe: if fc.probe_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(fc.probe_ms))
            },
            close_timeout: Duration::from_millis(fc.close_timeout_ms),
            shutdown_grace: Duration::from_millis(
                fc.shutdown_grace_ms.max(fc.close_timeout_ms),
            ),
        }
    }
}

/// Where the API server is and how to authenticate to it (runtime view).
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub api_server: Url,
    pub token_file: PathBuf,
    pub ca_file: PathBuf,
    pub connect_timeout: Duration,
    pub watch_timeout: Duration,
}

impl ClusterConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let api_server = match &fc.cluster.api_server {
            Some(url) => url.clone(),
            None => in_cluster_api_server().context(
                "No API server configured: set [cluster] api_server or run inside a cluster",
            )?,
        };
        let api_server = Url::parse(&api_server)
            .with_context(|| format!("Invalid API server URL: {}", api_server))?;

        Ok(Self {
            api_server,
            token_file: fc.cluster.token_file.clone(),
            ca_file: fc.cluster.ca_file.clone(),
            connect_timeout: Duration::from_secs(fc.cluster.connect_timeout_secs.max(1)),
            watch_timeout: Duration::from_secs(fc.watch.server_timeout_secs.max(1)),
        })
    }
}

/// The API server address advertised to every pod.
fn in_cluster_api_server() -> Option<String> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .ok()
        .filter(|h| !h.is_empty())?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT")
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "443".to_string());
    Some(api_server_url(&host, &port))
}

fn api_server_url(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}
