/// Errors from an upstream watch stream.
///
/// The classification drives the dispatcher: transient failures are retried with
/// backoff, permanent ones are reported to the topic's subscribers once and the
/// stream is not reopened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// Stream drop, network blip, server error
    #[error("{0}")]
    Transient(String),

    /// The resume version is too old; the next open must start from scratch
    #[error("{0}")]
    Expired(String),

    /// Unsupported kind, bad scope, denied access
    #[error("{0}")]
    Permanent(String),
}

impl WatchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, WatchError::Permanent(_))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, WatchError::Expired(_))
    }

    /// Classify an HTTP status returned by the API server.
    pub fn from_status(status: u16, message: impl AsRef<str>) -> Self {
        let message = message.as_ref().trim();
        let text = if message.is_empty() {
            format!("API server returned HTTP {}", status)
        } else {
            format!("API server returned HTTP {}: {}", status, message)
        };
        match status {
            401 | 403 | 404 => WatchError::Permanent(text),
            410 => WatchError::Expired(text),
            _ => WatchError::Transient(text),
        }
    }
}

/// Errors reported to a dashboard client as an `error` message.
///
/// The `Display` text is exactly what the client sees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Missing required arguments")]
    MissingArguments,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid terminal size: {0}")]
    InvalidResize(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Failed to start terminal: {0}")]
    TerminalStart(String),
}
