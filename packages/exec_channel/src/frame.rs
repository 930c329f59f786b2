//! Multiplexed frame codec
//!
//! One WebSocket binary message carries exactly one frame: a channel byte
//! followed by the payload. The channel numbering is fixed by the Kubernetes
//! API server.

use serde::{Deserialize, Serialize};

/// Channel ids of the exec sub-protocol
pub mod channel {
    /// Channel 0: stdin (client to container)
    pub const STDIN: u8 = 0;
    /// Channel 1: stdout
    pub const STDOUT: u8 = 1;
    /// Channel 2: stderr
    pub const STDERR: u8 = 2;
    /// Channel 3: error / exit status document
    pub const ERROR: u8 = 3;
    /// Channel 4: terminal resize (client to container, JSON payload)
    pub const RESIZE: u8 = 4;
}

/// A single multiplexed frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(channel: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Frame carrying terminal input.
    pub fn stdin(data: &[u8]) -> Self {
        Self::new(channel::STDIN, data)
    }

    /// Frame carrying a resize request as `{"Width":..,"Height":..}`.
    pub fn resize(size: TerminalSize) -> Result<Self, serde_json::Error> {
        Ok(Self::new(channel::RESIZE, serde_json::to_vec(&size)?))
    }

    /// Parse a wire message. Empty messages carry no channel and yield `None`.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&channel, payload) = data.split_first()?;
        Some(Self::new(channel, payload))
    }

    /// Encode to a wire message (channel byte + payload).
    pub fn encode(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(1 + self.payload.len());
        msg.push(self.channel);
        msg.extend_from_slice(&self.payload);
        msg
    }

    /// True for the two output channels shown to the user.
    pub fn is_output(&self) -> bool {
        self.channel == channel::STDOUT || self.channel == channel::STDERR
    }
}

/// Terminal dimensions as the API server expects them on channel 4
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

/// Status document sent on the error channel when the remote process ends
/// or the exec could not be started.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExecStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub details: Option<StatusDetails>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatusDetails {
    #[serde(default)]
    pub causes: Vec<StatusCause>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatusCause {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ExecStatus {
    /// Parse an error-channel payload. Older servers send a bare text message
    /// instead of a JSON document; that is reported as a failure.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        match serde_json::from_slice::<ExecStatus>(payload) {
            Ok(status) => Some(status),
            Err(_) => Some(ExecStatus {
                status: "Failure".to_string(),
                message: Some(String::from_utf8_lossy(payload).trim().to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }

    /// Exit code reported by a `NonZeroExitCode` failure, if any.
    pub fn exit_code(&self) -> Option<i32> {
        if self.is_success() {
            return Some(0);
        }
        self.details
            .as_ref()?
            .causes
            .iter()
            .find(|c| c.reason.as_deref() == Some("ExitCode"))
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.parse().ok())
    }

    /// A non-zero exit of a process that did start, as opposed to an exec that
    /// never got going.
    pub fn is_process_exit(&self) -> bool {
        self.reason.as_deref() == Some("NonZeroExitCode")
    }

    /// Short human-readable description for close notifications.
    pub fn describe(&self) -> String {
        if let Some(code) = self.exit_code() {
            return format!("exit code {}", code);
        }
        self.message
            .clone()
            .or_else(|| self.reason.clone())
            .unwrap_or_else(|| self.status.clone())
    }
}
