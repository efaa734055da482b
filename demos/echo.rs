//! Echo demo - one server, one client, five concurrent calls.
//!
//! This example demonstrates:
//! - Registering a service with the builder pattern
//! - Serving it on an ephemeral TCP port
//! - Dialing it and issuing calls concurrently from one client
//!
//! ```text
//! RUST_LOG=debug cargo run --example echo
//! ```

use poseidon::{Client, Server, Service};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Argument of `Foo.Sum`.
#[derive(Deserialize, Serialize, Debug)]
struct SumArgs {
    num1: i64,
    num2: i64,
}

struct Foo;

impl Foo {
    fn sum(&self, args: SumArgs, reply: &mut i64) -> Result<(), String> {
        *reply = args.num1 + args.num2;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = Server::builder()
        .register(Service::builder("Foo", Foo).method("Sum", Foo::sum).build()?)?
        .build();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tracing::info!("start rpc server on {}", addr);
    tokio::spawn(async move { server.accept(listener).await });

    let client = Client::builder().dial(addr).await?;

    let mut calls = Vec::new();
    for i in 0..5 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let args = SumArgs {
                num1: i,
                num2: i * i,
            };
            let reply: i64 = client.call("Foo.Sum", &args).await?;
            tracing::info!("{} + {} = {}", args.num1, args.num2, reply);
            Ok::<_, poseidon::RpcError>(())
        }));
    }
    for call in calls {
        call.await??;
    }

    client.close().await?;
    Ok(())
}
