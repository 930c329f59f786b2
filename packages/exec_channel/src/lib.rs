//! Exec Channel - Kubernetes channel-protocol exec streams
//!
//! This crate speaks the `v4.channel.k8s.io` sub-protocol used by the pod `exec`
//! subresource: every WebSocket message is one [`Frame`], a leading channel byte
//! followed by the payload. It knows nothing about dashboards, topics or
//! sessions; it only opens streams and moves frames.
//!
//! # Example
//!
//! ```no_run
//! use exec_channel::{ExecEndpoint, ExecTarget, Frame, TerminalSize, channel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), exec_channel::ExecError> {
//!     let endpoint = ExecEndpoint::new("https://10.0.0.1:443".parse().unwrap());
//!     let target = ExecTarget::new("default", "web-0", "app");
//!
//!     let mut stream = exec_channel::connect(&endpoint, &target, &["/bin/sh".to_string()]).await?;
//!     stream.send(Frame::resize(TerminalSize { width: 80, height: 24 })?).await?;
//!     stream.send(Frame::stdin(b"echo hello\n")).await?;
//!
//!     while let Some(frame) = stream.next_frame().await {
//!         let frame = frame?;
//!         if frame.channel == channel::STDOUT {
//!             print!("{}", String::from_utf8_lossy(&frame.payload));
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod connect;
mod error;
pub mod frame;
mod stream;

pub use connect::{ExecEndpoint, ExecTarget, SUBPROTOCOL, connect, exec_url};
pub use error::ExecError;
pub use frame::{ExecStatus, Frame, TerminalSize, channel};
pub use stream::ExecStream;
