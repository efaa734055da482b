//! Client builder and call correlation.
//!
//! The [`ClientBuilder`] negotiates a connection and returns a [`Client`].
//! The [`Client`] owns the codec and correlates responses to calls:
//! 1. Every call gets the next sequence number and a pending-table entry
//! 2. Frames are written under a single send lock
//! 3. One receive task reads responses and completes the matching calls
//! 4. On a stream failure every pending call is completed with the error
//!
//! # Example
//!
//! ```no_run
//! use poseidon::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder().dial("127.0.0.1:9999").await?;
//!
//!     let sum: i64 = client.call("Foo.Sum", &(1, 2)).await?;
//!     assert_eq!(sum, 3);
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{Body, BodyFormat, CodecPair, CodecReader, CodecRegistry, CodecWriter, Header, NewCodecFn};
use crate::error::{RpcError, Result};
use crate::protocol::Options;
use crate::transport::{connect_tcp, Transport};

#[cfg(unix)]
use crate::transport::connect_unix;

/// Builder for connecting a [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    options: Options,
    codecs: CodecRegistry,
    connect_timeout: Option<Duration>,
}

impl ClientBuilder {
    /// Create a builder using the default options and codecs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `options` as given.
    ///
    /// [`connect`](Self::connect) writes them unchanged; [`dial`](Self::dial)
    /// forces the protocol magic number first.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Select the codec by name.
    pub fn codec_type(mut self, name: &str) -> Self {
        self.options.codec_type = name.to_string();
        self
    }

    /// Make a codec available for [`codec_type`](Self::codec_type).
    pub fn register_codec(mut self, name: &str, constructor: NewCodecFn) -> Self {
        self.codecs.register(name, constructor);
        self
    }

    /// Bound the time [`dial`](Self::dial) waits for the connection.
    ///
    /// Default: no limit
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Negotiate over an established connection and start the client.
    ///
    /// An unknown codec is rejected before anything is written.
    pub async fn connect<T: Transport>(self, mut conn: T) -> Result<Client> {
        let new_codec = self.codecs.lookup(&self.options.codec_type).ok_or_else(|| {
            tracing::warn!("rpc client: invalid codec type {}", self.options.codec_type);
            RpcError::InvalidCodecType(self.options.codec_type.clone())
        })?;

        if let Err(e) = self.options.write_to(&mut conn).await {
            tracing::warn!("rpc client: options error: {}", e);
            return Err(e);
        }

        Ok(Client::start(self.options, new_codec(Box::new(conn))))
    }

    /// Connect to a TCP address and start the client.
    pub async fn dial<A: ToSocketAddrs>(mut self, addr: A) -> Result<Client> {
        self.options = self.options.normalized();
        let stream = connect_tcp(addr, self.connect_timeout).await?;
        self.connect(stream).await
    }

    /// Connect to a Unix socket and start the client.
    #[cfg(unix)]
    pub async fn dial_unix(mut self, path: &str) -> Result<Client> {
        self.options = self.options.normalized();
        let stream = connect_unix(path).await?;
        self.connect(stream).await
    }
}

/// A finished call, delivered on the completion channel given to
/// [`Client::go`].
#[derive(Debug)]
pub struct Call {
    /// Sequence number, 0 if the call was rejected before registration.
    pub seq: u64,
    /// Target in the form `"Service.Method"`.
    pub service_method: String,
    /// Encoded reply when the call succeeded.
    pub reply: Option<Body>,
    /// Failure, if any.
    pub error: Option<RpcError>,
    /// Format `reply` is encoded in.
    pub format: BodyFormat,
}

impl Call {
    /// Convert the outcome into a typed reply.
    pub fn into_reply<R: DeserializeOwned>(self) -> Result<R> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let body = self.reply.unwrap_or_else(|| self.format.unit());
        self.format.decode(&body)
    }
}

/// Pending-table entry for a call awaiting its response.
struct PendingCall {
    service_method: String,
    done: mpsc::Sender<Call>,
    format: BodyFormat,
}

impl PendingCall {
    /// Deliver the outcome exactly once without blocking the caller.
    ///
    /// If `done` has no free slot the completion is handed to a task that
    /// waits for room.
    fn complete(self, seq: u64, reply: Option<Body>, error: Option<RpcError>) {
        let call = Call {
            seq,
            service_method: self.service_method,
            reply,
            error,
            format: self.format,
        };
        match self.done.try_send(call) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(call)) => {
                let done = self.done;
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(call)) = done.send(call).await {
                        tracing::debug!(
                            "rpc: nobody waiting for {} seq {}",
                            call.service_method,
                            call.seq
                        );
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(call)) => {
                tracing::debug!(
                    "rpc: nobody waiting for {} seq {}",
                    call.service_method,
                    call.seq
                );
            }
        }
    }
}

/// State shared by callers and the receive task.
struct ClientState {
    /// Next sequence number to assign.
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    /// Set by `close`.
    closing: bool,
    /// Set when the receive loop ends.
    shutdown: bool,
}

struct ClientInner {
    options: Options,
    format: BodyFormat,
    /// Send lock; held for the whole register-and-write of one call.
    sending: tokio::sync::Mutex<Box<dyn CodecWriter>>,
    state: Mutex<ClientState>,
    receive_task: OnceLock<JoinHandle<()>>,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every pending call with the error that ended the receive loop.
    async fn terminate_calls(&self, err: RpcError) {
        let _sending = self.sending.lock().await;
        let (pending, closing) = {
            let mut state = self.state();
            state.shutdown = true;
            (std::mem::take(&mut state.pending), state.closing)
        };

        if !err.is_eof() {
            tracing::warn!("rpc: client protocol error: {}", err);
        } else if !closing {
            tracing::debug!("rpc: server closed the connection");
        }

        for (seq, call) in pending {
            let error = if closing && err.is_eof() {
                RpcError::Shutdown
            } else {
                err.to_terminal()
            };
            call.complete(seq, None, Some(error));
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.get() {
            task.abort();
        }
    }
}

/// An RPC client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn start(options: Options, codec: CodecPair) -> Self {
        let CodecPair {
            reader,
            writer,
            format,
        } = codec;
        let inner = Arc::new(ClientInner {
            options,
            format,
            sending: tokio::sync::Mutex::new(writer),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            receive_task: OnceLock::new(),
        });

        let task = tokio::spawn(receive_loop(Arc::downgrade(&inner), reader));
        let _ = inner.receive_task.set(task);
        Client { inner }
    }

    /// Options this client negotiated with.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Issue a call without waiting for it.
    ///
    /// The finished [`Call`] is sent on `done`. Returns the sequence number,
    /// or 0 if the call was rejected without any I/O. Exactly one [`Call`]
    /// is delivered per `go`, however many calls share `done`.
    pub async fn go<A>(&self, service_method: &str, args: &A, done: mpsc::Sender<Call>) -> u64
    where
        A: Serialize + ?Sized,
    {
        let format = self.inner.format;
        let pending = || PendingCall {
            service_method: service_method.to_string(),
            done: done.clone(),
            format,
        };
        let reject = |error: RpcError| {
            pending().complete(0, None, Some(error));
            0
        };

        let body = match format.encode(args) {
            Ok(body) => body,
            Err(e) => return reject(e),
        };

        let mut writer = self.inner.sending.lock().await;

        let seq = {
            let mut state = self.inner.state();
            if state.closing || state.shutdown {
                None
            } else {
                let seq = state.seq;
                state.seq += 1;
                state.pending.insert(seq, pending());
                Some(seq)
            }
        };
        let Some(seq) = seq else {
            return reject(RpcError::Shutdown);
        };

        let header = Header::new(service_method, seq);
        if let Err(e) = writer.write(&header, &body).await {
            tracing::debug!("rpc: writing {} seq {}: {}", service_method, seq, e);
            // The receive loop may already have failed the call.
            let call = self.inner.state().pending.remove(&seq);
            if let Some(call) = call {
                call.complete(seq, None, Some(e));
            }
        }
        seq
    }

    /// Call a remote method and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let (tx, mut rx) = mpsc::channel(1);
        self.go(service_method, args, tx).await;
        match rx.recv().await {
            Some(call) => call.into_reply(),
            None => Err(RpcError::ConnectionClosed),
        }
    }

    /// Like [`call`](Self::call) but give up waiting after `timeout`.
    ///
    /// The request is still sent; a late response is discarded.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let (tx, mut rx) = mpsc::channel(1);
        self.go(service_method, args, tx).await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(call)) => call.into_reply(),
            Ok(None) => Err(RpcError::ConnectionClosed),
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Stop issuing calls and shut the write side down.
    ///
    /// Calls already sent still receive their responses.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Shutdown`] if the client was already closed.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        let mut writer = self.inner.sending.lock().await;
        writer.close().await
    }

    /// Whether new calls can still be issued.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state();
        !state.closing && !state.shutdown
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.state().pending.len()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.inner.options)
            .field("available", &self.is_available())
            .finish()
    }
}

/// Receive loop: one per client, reads until the stream fails.
async fn receive_loop(client: Weak<ClientInner>, mut reader: Box<dyn CodecReader>) {
    let err = loop {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(e) => break e,
        };
        let call = match client.upgrade() {
            Some(inner) => {
                let call = inner.state().pending.remove(&header.seq);
                call
            }
            None => return,
        };

        match call {
            None => {
                // The write that registered it failed; nobody is waiting.
                tracing::debug!("rpc: discarding response for unknown seq {}", header.seq);
                if let Err(e) = reader.discard_body().await {
                    break e;
                }
            }
            Some(call) if !header.error.is_empty() => {
                let result = reader.discard_body().await;
                call.complete(header.seq, None, Some(RpcError::from_remote(header.error)));
                if let Err(e) = result {
                    break e;
                }
            }
            Some(call) => match reader.read_body().await {
                Ok(body) => call.complete(header.seq, Some(body), None),
                Err(e) => {
                    call.complete(header.seq, None, Some(RpcError::Decode(e.to_string())));
                    break e;
                }
            },
        }
    };

    if let Some(inner) = client.upgrade() {
        inner.terminate_calls(err).await;
    }
}
