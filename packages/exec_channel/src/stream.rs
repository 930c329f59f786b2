use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;

use crate::error::ExecError;
use crate::frame::Frame;

type FrameSink = Pin<Box<dyn Sink<Frame, Error = ExecError> + Send>>;
type FrameSource = Pin<Box<dyn Stream<Item = Result<Frame, ExecError>> + Send>>;

/// An open, bidirectional exec stream.
///
/// Dropping the stream releases the underlying connection; [`ExecStream::close`]
/// additionally sends a close handshake first.
pub struct ExecStream {
    sink: FrameSink,
    source: FrameSource,
}

impl ExecStream {
    /// Build a stream from any frame sink and source.
    ///
    /// The WebSocket connector uses this, and so can in-memory transports.
    pub fn new<Si, St>(sink: Si, source: St) -> Self
    where
        Si: Sink<Frame, Error = ExecError> + Send + 'static,
        St: Stream<Item = Result<Frame, ExecError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            source: Box::pin(source),
        }
    }

    /// Send one frame upstream.
    pub async fn send(&mut self, frame: Frame) -> Result<(), ExecError> {
        self.sink.send(frame).await
    }

    /// Next frame from upstream; `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> Option<Result<Frame, ExecError>> {
        self.source.next().await
    }

    /// Flush and close the write half.
    pub async fn close(&mut self) -> Result<(), ExecError> {
        self.sink.close().await
    }
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::channel;
    use futures::channel::mpsc;

    fn in_memory() -> (
        ExecStream,
        mpsc::UnboundedReceiver<Frame>,
        mpsc::UnboundedSender<Result<Frame, ExecError>>,
    ) {
        let (up_tx, up_rx) = mpsc::unbounded::<Frame>();
        let (down_tx, down_rx) = mpsc::unbounded::<Result<Frame, ExecError>>();
        let sink = up_tx.sink_map_err(|e| ExecError::Transport(e.to_string()));
        (ExecStream::new(sink, down_rx), up_rx, down_tx)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (mut stream, mut upstream, downstream) = in_memory();

        stream.send(Frame::stdin(b"pwd\n")).await.unwrap();
        let sent = upstream.next().await.unwrap();
        assert_eq!(sent.channel, channel::STDIN);
        assert_eq!(sent.payload, b"pwd\n");

        downstream
            .unbounded_send(Ok(Frame::new(channel::STDOUT, b"/root\n".to_vec())))
            .unwrap();
        let got = stream.next_frame().await.unwrap().unwrap();
        assert_eq!(got.payload, b"/root\n");
    }

    #[tokio::test]
    async fn test_stream_ends_when_remote_drops() {
        let (mut stream, _upstream, downstream) = in_memory();
        drop(downstream);
        assert!(stream.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_upstream() {
        let (mut stream, mut upstream, _downstream) = in_memory();
        stream.close().await.unwrap();
        assert!(upstream.next().await.is_none());
    }
}
