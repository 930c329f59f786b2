use futures::{SinkExt, StreamExt, future};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest, http};
use tracing::debug;
use url::Url;

use crate::error::ExecError;
use crate::frame::Frame;
use crate::stream::ExecStream;

/// Sub-protocol requested from (and required of) the API server.
pub const SUBPROTOCOL: &str = "v4.channel.k8s.io";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The container an exec stream is opened against
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ExecTarget {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }

    fn validate(&self) -> Result<(), ExecError> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("pod", &self.pod),
            ("container", &self.container),
        ] {
            if value.trim().is_empty() {
                return Err(ExecError::InvalidTarget(format!("{} is empty", field)));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Where and how to reach the API server
#[derive(Clone)]
pub struct ExecEndpoint {
    pub api_server: Url,
    pub bearer_token: Option<String>,
    /// Custom TLS configuration (cluster CA). `None` uses the webpki roots.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub connect_timeout: Duration,
}

impl ExecEndpoint {
    pub fn new(api_server: Url) -> Self {
        Self {
            api_server,
            bearer_token: None,
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for ExecEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecEndpoint")
            .field("api_server", &self.api_server.as_str())
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("custom_tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Build the WebSocket URL of the pod `exec` subresource.
///
/// Every argv element becomes its own `command` query parameter; stdin,
/// stdout, stderr and a TTY are always requested.
pub fn exec_url(api_server: &Url, target: &ExecTarget, command: &[String]) -> Result<Url, ExecError> {
    let mut url = api_server.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ExecError::InvalidTarget(format!(
                "unsupported API server scheme: {}",
                other
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ExecError::InvalidTarget(format!("cannot use scheme {}", scheme)))?;

    url.path_segments_mut()
        .map_err(|_| ExecError::InvalidTarget(format!("API server URL cannot be a base: {}", api_server)))?
        .pop_if_empty()
        .extend([
            "api",
            "v1",
            "namespaces",
            target.namespace.as_str(),
            "pods",
            target.pod.as_str(),
            "exec",
        ]);

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for arg in command {
            query.append_pair("command", arg);
        }
        query
            .append_pair("container", &target.container)
            .append_pair("stdin", "true")
            .append_pair("stdout", "true")
            .append_pair("stderr", "true")
            .append_pair("tty", "true");
    }

    Ok(url)
}

/// Open an exec stream running `command` in the target container.
///
/// Fails without leaving anything open: every error path drops the partially
/// established connection before returning.
pub async fn connect(
    endpoint: &ExecEndpoint,
    target: &ExecTarget,
    command: &[String],
) -> Result<ExecStream, ExecError> {
    target.validate()?;
    if command.is_empty() {
        return Err(ExecError::InvalidTarget("empty command".to_string()));
    }

    let url = exec_url(&endpoint.api_server, target, command)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ExecError::Connect(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        http::header::SEC_WEBSOCKET_PROTOCOL,
        http::HeaderValue::from_static(SUBPROTOCOL),
    );
    if let Some(token) = &endpoint.bearer_token {
        let value = http::HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|e| ExecError::Connect(format!("invalid bearer token: {}", e)))?;
        headers.insert(http::header::AUTHORIZATION, value);
    }

    debug!(target = %target, command = ?command, "Opening exec stream");

    let connector = endpoint.tls.clone().map(Connector::Rustls);
    let handshake = tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);
    let (ws, response) = tokio::time::timeout(endpoint.connect_timeout, handshake)
        .await
        .map_err(|_| ExecError::Timeout(endpoint.connect_timeout))?
        .map_err(handshake_error)?;

    let negotiated = response
        .headers()
        .get(http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if negotiated != SUBPROTOCOL {
        return Err(ExecError::Protocol {
            expected: SUBPROTOCOL.to_string(),
            actual: negotiated.to_string(),
        });
    }

    debug!(target = %target, "Exec stream established");

    let (ws_sink, ws_source) = ws.split();

    let sink = ws_sink
        .with(|frame: Frame| {
            future::ready(Ok::<_, tungstenite::Error>(Message::Binary(
                frame.encode().into(),
            )))
        })
        .sink_map_err(|e| ExecError::Transport(e.to_string()));

    let source = ws_source
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Frame::decode(&data).map(Ok),
                Ok(_) => None,
                Err(e) => Some(Err(ExecError::Transport(e.to_string()))),
            })
        });

    Ok(ExecStream::new(sink, source))
}

fn handshake_error(err: tungstenite::Error) -> ExecError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let message = response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).trim().to_string())
                .unwrap_or_default();
            ExecError::Rejected { status, message }
        }
        other => ExecError::Connect(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ExecTarget {
        ExecTarget::new("default", "web-0", "app")
    }

    #[test]
    fn test_exec_url_https_becomes_wss() {
        let base: Url = "https://10.96.0.1:443".parse().unwrap();
        let url = exec_url(&base, &target(), &["/bin/bash".to_string()]).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/api/v1/namespaces/default/pods/web-0/exec");
        assert_eq!(
            url.query(),
            Some("command=%2Fbin%2Fbash&container=app&stdin=true&stdout=true&stderr=true&tty=true")
        );
    }

    #[test]
    fn test_exec_url_http_becomes_ws() {
        let base: Url = "http://127.0.0.1:8001".parse().unwrap();
        let url = exec_url(&base, &target(), &["sh".to_string()]).unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn test_exec_url_keeps_base_path() {
        let base: Url = "https://rancher.example/k8s/clusters/c-1/".parse().unwrap();
        let url = exec_url(&base, &target(), &["sh".to_string()]).unwrap();
        assert_eq!(
            url.path(),
            "/k8s/clusters/c-1/api/v1/namespaces/default/pods/web-0/exec"
        );
    }

    #[test]
    fn test_exec_url_multi_arg_command() {
        let base: Url = "https://10.96.0.1".parse().unwrap();
        let command = vec!["python3".to_string(), "-i".to_string()];
        let url = exec_url(&base, &target(), &command).unwrap();
        let commands: Vec<String> = url
            .query_pairs()
            .filter(|(k, _)| k == "command")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(commands, command);
    }

    #[test]
    fn test_exec_url_rejects_other_schemes() {
        let base: Url = "ftp://example.com".parse().unwrap();
        assert!(matches!(
            exec_url(&base, &target(), &["sh".to_string()]),
            Err(ExecError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_target() {
        let endpoint = ExecEndpoint::new("https://127.0.0.1:1".parse().unwrap());
        let target = ExecTarget::new("default", "", "app");
        let err = connect(&endpoint, &target, &["sh".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_command() {
        let endpoint = ExecEndpoint::new("https://127.0.0.1:1".parse().unwrap());
        let err = connect(&endpoint, &target(), &[]).await.unwrap_err();
        assert!(matches!(err, ExecError::InvalidTarget(_)));
    }

    #[test]
    fn test_endpoint_debug_redacts_token() {
        let endpoint =
            ExecEndpoint::new("https://10.96.0.1".parse().unwrap()).with_token("s3cr3t");
        let debug = format!("{:?}", endpoint);
        assert!(!debug.contains("s3cr3t"));
        assert!(debug.contains("<redacted>"));
    }
}
