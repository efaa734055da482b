//! Dedicated writer task for server responses.
//!
//! Every connection owns one writer task holding the codec's send half.
//! Request tasks hand their finished responses to it over an mpsc channel,
//! so frames from concurrently completing requests never interleave.
//!
//! # Architecture
//!
//! ```text
//! Request task 1 ─┐
//! Request task 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► CodecWriter
//! Request task N ─┘
//! ```
//!
//! The task ends when every [`ResponseWriter`] has been dropped and the
//! channel is drained; it then closes the codec. Waiting on its
//! `JoinHandle` therefore waits for all request tasks of the connection.
//!
//! A response the codec refuses before touching the stream (an encoding
//! error, a frame over the size limit) is replaced by an error response for
//! the same sequence number. A stream failure shuts the connection down so
//! the client sees the end of stream instead of waiting forever.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{Body, BodyFormat, CodecWriter, Header};
use crate::error::{ErrorKind, Result, RpcError};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A response ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Response header.
    pub header: Header,
    /// Encoded reply, the encoded unit value for error responses.
    pub body: Body,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }
}

/// Handle for sending responses to the writer task.
///
/// This is cheaply cloneable; each request task holds one.
#[derive(Clone)]
pub struct ResponseWriter {
    tx: mpsc::Sender<OutboundFrame>,
}

impl ResponseWriter {
    /// Queue a frame, waiting while the channel is full.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The returned `JoinHandle` resolves once all handles are dropped, every
/// queued frame has been handled and the codec has been closed.
pub fn spawn_writer_task(
    writer: Box<dyn CodecWriter>,
    format: BodyFormat,
    capacity: usize,
) -> (ResponseWriter, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer, format));
    (ResponseWriter { tx }, task)
}

/// Main writer loop.
///
/// After a stream failure the codec is closed and remaining frames are
/// drained and dropped so senders never block on a dead connection.
async fn writer_loop(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: Box<dyn CodecWriter>,
    format: BodyFormat,
) -> Result<()> {
    let mut failure: Option<RpcError> = None;

    while let Some(frame) = rx.recv().await {
        if failure.is_some() {
            tracing::debug!(
                "rpc server: dropping response seq {} after write failure",
                frame.header.seq
            );
            continue;
        }
        if let Err(e) = write_response(writer.as_mut(), frame, format).await {
            tracing::warn!("rpc server: writing response: {}", e);
            if let Err(close_err) = writer.close().await {
                tracing::debug!("rpc server: closing codec after failure: {}", close_err);
            }
            failure = Some(e);
        }
    }

    match failure {
        Some(e) => Err(e),
        None => writer.close().await,
    }
}

/// Write one response, substituting an error response if the codec refuses
/// the frame without touching the stream.
async fn write_response(
    writer: &mut dyn CodecWriter,
    mut frame: OutboundFrame,
    format: BodyFormat,
) -> Result<()> {
    match writer.write(&frame.header, &frame.body).await {
        Err(e) if e.kind() != ErrorKind::Stream => {
            tracing::warn!(
                "rpc server: response seq {} rejected by codec: {}",
                frame.header.seq,
                e
            );
            frame.header.error = e.to_string();
            writer.write(&frame.header, &format.unit()).await
        }
        written => written,
    }
}
