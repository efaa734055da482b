//! # poseidon
//!
//! Lightweight RPC runtime: call a named method on a remote object as if it
//! were local.
//!
//! ## Architecture
//!
//! - **Negotiation**: every connection opens with one JSON line of
//!   [`Options`] (magic number + codec name)
//! - **Frames**: afterwards each message is a [`Header`](codec::Header)
//!   followed by a body, encoded by the negotiated codec
//! - **Client**: sequence numbers, a pending-call table, a send lock and one
//!   receive task correlating responses to calls
//! - **Server**: one task per connection, one task per request, one writer
//!   task per connection serializing responses
//!
//! ## Example
//!
//! ```no_run
//! use poseidon::{Client, Server, Service};
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
//!     let listener = TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!     tokio::spawn(async move { server.accept(listener).await });
//!
//!     let client = Client::builder().dial(addr).await?;
//!     let sum: i64 = client.call("Foo.Sum", &(1, 2)).await?;
//!     assert_eq!(sum, 3);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;

mod client;
mod server;
mod writer;

pub use client::{Call, Client, ClientBuilder};
pub use error::{ErrorKind, RpcError};
pub use protocol::Options;
pub use server::{Server, ServerBuilder, ServerConfig, DEFAULT_MAX_CONCURRENT_REQUESTS};
pub use service::{Service, ServiceBuilder, ServiceRegistry};
