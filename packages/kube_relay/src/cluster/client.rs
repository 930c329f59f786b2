//! HTTP/WebSocket client for the Kubernetes API server.
//!
//! Authenticates with the pod's service-account token (re-read on every open so
//! rotated tokens are picked up) and trusts the cluster CA when one is mounted.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use exec_channel::{ExecEndpoint, ExecError, ExecStream, ExecTarget};
use futures::{StreamExt, TryStreamExt, future};
use rustls::pki_types::{CertificateDer, pem::PemObject};
use std::path::Path;
use std::sync::Arc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

use super::watch::decode_line;
use super::{ExecConnector, WatchSource, WatchStream, kinds};
use crate::config::ClusterConfig;
use crate::error::WatchError;
use crate::relay::topic::WatchKey;

/// Upper bound for a single watch event line
const MAX_EVENT_BYTES: usize = 16 * 1024 * 1024;

pub struct ClusterClient {
    config: ClusterConfig,
    http: reqwest::Client,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl ClusterClient {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        let tls = if config.ca_file.exists() {
            info!("Trusting cluster CA from {}", config.ca_file.display());
            Some(load_ca(&config.ca_file)?)
        } else {
            debug!(
                "No CA bundle at {}, using system roots",
                config.ca_file.display()
            );
            None
        };

        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(tls) = &tls {
            builder = builder.use_preconfigured_tls(tls.as_ref().clone());
        }
        let http = builder.build().context("Failed to build HTTP client")?;

        Ok(Self { config, http, tls })
    }

    pub fn api_server(&self) -> &Url {
        &self.config.api_server
    }

    async fn bearer_token(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.config.token_file).await {
            Ok(token) => {
                let token = token.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(
                    "Failed to read service account token {}: {}",
                    self.config.token_file.display(),
                    e
                );
                None
            }
        }
    }

    fn watch_url(&self, key: &WatchKey) -> Result<String, WatchError> {
        let info = kinds::lookup(&key.kind).ok_or_else(|| {
            WatchError::Permanent(format!("Unsupported resource kind: {}", key.kind))
        })?;
        let path = info.collection_path(key.namespace.as_deref())?;
        Ok(format!(
            "{}{}",
            self.config.api_server.as_str().trim_end_matches('/'),
            path
        ))
    }
}

#[async_trait]
impl WatchSource for ClusterClient {
    async fn open_watch(
        &self,
        key: &WatchKey,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, WatchError> {
        let url = self.watch_url(key)?;
        let timeout = self.config.watch_timeout.as_secs().to_string();

        let mut request = self.http.get(&url).query(&[
            ("watch", "true"),
            ("allowWatchBookmarks", "true"),
            ("timeoutSeconds", timeout.as_str()),
        ]);
        if let Some(rv) = resource_version {
            request = request.query(&[("resourceVersion", rv)]);
        }
        if let Some(token) = self.bearer_token().await {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WatchError::Transient(format!("Watch request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WatchError::from_status(
                status.as_u16(),
                status_message(&body),
            ));
        }

        debug!(topic = %key, resource_version = ?resource_version, "Watch response streaming");

        let body = response.bytes_stream().map_err(std::io::Error::other);
        let lines = FramedRead::new(
            StreamReader::new(body),
            LinesCodec::new_with_max_length(MAX_EVENT_BYTES),
        );
        let events = lines.filter_map(|line| {
            future::ready(match line {
                Ok(line) => decode_line(&line).transpose(),
                Err(e) => Some(Err(WatchError::Transient(format!(
                    "Watch stream error: {}",
                    e
                )))),
            })
        });

        Ok(events.boxed())
    }
}

#[async_trait]
impl ExecConnector for ClusterClient {
    async fn open_exec(
        &self,
        target: &ExecTarget,
        command: &[String],
    ) -> Result<ExecStream, ExecError> {
        let mut endpoint = ExecEndpoint::new(self.config.api_server.clone())
            .with_connect_timeout(self.config.connect_timeout);
        if let Some(tls) = &self.tls {
            endpoint = endpoint.with_tls(tls.clone());
        }
        if let Some(token) = self.bearer_token().await {
            endpoint = endpoint.with_token(token);
        }
        exec_channel::connect(&endpoint, target, command).await
    }
}

/// Pull the human-readable message out of a Status response body.
fn status_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn load_ca(path: &Path) -> Result<Arc<rustls::ClientConfig>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read CA bundle: {}", path.display()))?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(&pem) {
        let cert =
            cert.map_err(|e| anyhow!("Invalid certificate in {}: {:?}", path.display(), e))?;
        roots
            .add(cert)
            .with_context(|| format!("Rejected CA certificate in {}", path.display()))?;
    }
    anyhow::ensure!(
        !roots.is_empty(),
        "No certificates found in {}",
        path.display()
    );

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("TLS provider rejected the default protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
