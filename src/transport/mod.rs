//! Transport module - the byte streams RPC connections run over.
//!
//! Any ordered, reliable, bidirectional byte stream works as a transport:
//! - TCP sockets ([`connect_tcp`])
//! - Unix Domain Sockets ([`SocketListener`], [`connect_unix`])
//! - In-memory pipes (`tokio::io::duplex`, used heavily by the tests)

#[cfg(unix)]
mod socket;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{RpcError, Result};

#[cfg(unix)]
pub use socket::{connect_unix, generate_socket_path, SocketListener};

/// A bidirectional byte stream a connection can be served on.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport handed to codec constructors.
pub type BoxTransport = Box<dyn Transport>;

/// Open a TCP connection, optionally bounded by `timeout`.
pub async fn connect_tcp<A: ToSocketAddrs>(
    addr: A,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let stream = match timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout)??,
        None => TcpStream::connect(addr).await?,
    };
    // Small request frames should not wait on Nagle.
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Peer address of a TCP stream for logging, if still known.
pub(crate) fn peer_of(stream: &TcpStream) -> Option<SocketAddr> {
    stream.peer_addr().ok()
}
