//! Server builder and per-connection dispatch loop.
//!
//! The [`ServerBuilder`] collects services and codecs. The [`Server`] then
//! serves connections:
//! 1. Read the options line and pick the codec
//! 2. Read request frames (header + argument) in a loop
//! 3. Dispatch each request on its own task
//! 4. Hand every response to the connection's writer task
//!
//! When the read loop ends the server waits for all request tasks of the
//! connection, then closes the codec.
//!
//! # Example
//!
//! ```no_run
//! use poseidon::{Server, Service};
//! use tokio::net::TcpListener;
//!
//! struct Foo;
//!
//! impl Foo {
//!     fn sum(&self, args: (i64, i64), reply: &mut i64) -> Result<(), String> {
//!         *reply = args.0 + args.1;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::builder()
//!         .register(Service::builder("Foo", Foo).method("Sum", Foo::sum).build()?)?
//!         .build();
//!
//!     let listener = TcpListener::bind("127.0.0.1:9999").await?;
//!     server.accept(listener).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::codec::{Body, BodyFormat, CodecPair, CodecRegistry, Header, NewCodecFn};
use crate::error::Result;
use crate::protocol::Options;
use crate::service::{Service, ServiceRegistry};
use crate::transport::{peer_of, Transport};
use crate::writer::{spawn_writer_task, OutboundFrame, DEFAULT_CHANNEL_CAPACITY};

#[cfg(unix)]
use crate::transport::SocketListener;

/// Default maximum concurrent requests per connection.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Requests of one connection running at the same time. Reading the
    /// next request waits while the limit is reached.
    pub max_concurrent_requests: usize,
    /// Capacity of the response channel feeding the writer task.
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Builder for configuring and creating a [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    services: ServiceRegistry,
    codecs: CodecRegistry,
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new builder with the default codec registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service.
    ///
    /// # Errors
    ///
    /// Fails if a service with the same name is already registered.
    pub fn register(mut self, service: Service) -> Result<Self> {
        self.services.register(service)?;
        Ok(self)
    }

    /// Accept connections negotiating `name`.
    pub fn register_codec(mut self, name: &str, constructor: NewCodecFn) -> Self {
        self.codecs.register(name, constructor);
        self
    }

    /// Set the maximum number of concurrent requests per connection.
    ///
    /// Default: 256
    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.config.max_concurrent_requests = limit;
        self
    }

    /// Set the response channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Build the server.
    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                services: self.services,
                codecs: self.codecs,
                config: self.config,
            }),
        }
    }
}

struct ServerInner {
    services: ServiceRegistry,
    codecs: CodecRegistry,
    config: ServerConfig,
}

/// An RPC server. Cheap to clone; clones share services and codecs.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Registered services.
    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Accept TCP connections and serve each on its own task.
    ///
    /// Returns only when accepting fails.
    pub async fn accept(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await.map_err(|e| {
                tracing::error!("rpc server: accept error: {}", e);
                e
            })?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("rpc server: set_nodelay: {}", e);
            }
            let peer = peer_of(&stream);
            tracing::debug!("rpc server: accepted connection from {:?}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                server.serve_conn(stream).await;
                tracing::debug!("rpc server: connection from {:?} finished", peer);
            });
        }
    }

    /// Accept Unix socket connections and serve each on its own task.
    #[cfg(unix)]
    pub async fn accept_unix(&self, listener: &SocketListener) -> Result<()> {
        loop {
            let stream = listener.accept().await.map_err(|e| {
                tracing::error!("rpc server: accept error on {}: {}", listener.path(), e);
                e
            })?;

            let server = self.clone();
            tokio::spawn(async move {
                server.serve_conn(stream).await;
            });
        }
    }

    /// Serve one connection until the peer hangs up.
    ///
    /// Invalid options are logged and the connection is dropped without
    /// writing anything back.
    pub async fn serve_conn<T: Transport>(&self, conn: T) {
        let mut reader = BufReader::new(conn);

        let options = match Options::read_from(&mut reader).await {
            Ok(options) => options,
            Err(e) => {
                tracing::warn!("rpc server: options error: {}", e);
                return;
            }
        };
        let new_codec = match options.validate(&self.inner.codecs) {
            Ok(constructor) => constructor,
            Err(e) => {
                tracing::warn!("rpc server: {}", e);
                return;
            }
        };

        // Bytes buffered past the options line belong to the codec.
        self.serve_codec(new_codec(Box::new(reader))).await;
    }

    /// Run the request loop over an already negotiated codec.
    pub async fn serve_codec(&self, codec: CodecPair) {
        let CodecPair {
            mut reader,
            writer,
            format,
        } = codec;
        let (responses, writer_task) =
            spawn_writer_task(writer, format, self.inner.config.channel_capacity);
        let limiter = Arc::new(Semaphore::new(
            self.inner.config.max_concurrent_requests.max(1),
        ));

        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => {
                    if e.is_eof() {
                        tracing::debug!("rpc server: connection closed by peer");
                    } else {
                        tracing::warn!("rpc server: reading header: {}", e);
                    }
                    break;
                }
            };
            // A frame whose body cannot be read cannot be resynchronized.
            let arg = match reader.read_body().await {
                Ok(arg) => arg,
                Err(e) => {
                    tracing::warn!(
                        "rpc server: reading body of {} seq {}: {}",
                        header.service_method,
                        header.seq,
                        e
                    );
                    break;
                }
            };

            let permit = match limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let inner = self.inner.clone();
            let responses = responses.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let seq = header.seq;
                let frame = inner.handle_request(header, arg, format).await;
                if responses.send(frame).await.is_err() {
                    tracing::debug!("rpc server: response seq {} dropped, writer gone", seq);
                }
            });
        }

        // The writer task finishes once every request task has sent its
        // response and dropped its handle.
        drop(responses);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("rpc server: connection ended with write error: {}", e),
            Err(e) => tracing::error!("rpc server: writer task failed: {}", e),
        }
    }
}

impl ServerInner {
    /// Look up the target, invoke it and build the response frame.
    async fn handle_request(&self, mut header: Header, arg: Body, format: BodyFormat) -> OutboundFrame {
        header.error.clear();

        let result = match self.services.find_method(&header.service_method) {
            Ok((service, method)) => service.call(&method, arg, format).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(reply) => OutboundFrame::new(header, reply),
            Err(e) => {
                tracing::debug!(
                    "rpc server: {} seq {} failed: {}",
                    header.service_method,
                    header.seq,
                    e
                );
                header.error = e.to_string();
                OutboundFrame::new(header, format.unit())
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.inner.services.names())
            .field("codecs", &self.inner.codecs)
            .field("config", &self.inner.config)
            .finish()
    }
}
