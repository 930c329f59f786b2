/// Errors that can occur while opening or using an exec stream
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    /// The exec target is not addressable (empty namespace, pod or container)
    #[error("invalid exec target: {0}")]
    InvalidTarget(String),

    /// TCP/TLS/WebSocket handshake failed before an upgrade response arrived
    #[error("failed to connect: {0}")]
    Connect(String),

    /// The API server answered the upgrade with a non-101 status
    #[error("upgrade rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The server did not agree to the channel sub-protocol
    #[error("sub-protocol mismatch: expected {expected}, got {actual}")]
    Protocol { expected: String, actual: String },

    /// Read or write on an established stream failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A control payload could not be encoded
    #[error("failed to encode frame: {0}")]
    Encode(String),

    /// The connection did not complete within the configured timeout
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<serde_json::Error> for ExecError {
    fn from(err: serde_json::Error) -> Self {
        ExecError::Encode(err.to_string())
    }
}
