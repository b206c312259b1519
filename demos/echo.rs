//! Echo round trips - one client, one server, sequential calls.
//!
//! ```text
//! cargo run --example echo
//! ```

use std::time::Instant;

use rpcwire::service::Service;
use rpcwire::{dial, Options, Server};
use tokio::net::TcpListener;

struct Echo;

const CALLS: usize = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Server::new();
    server.register(
        Service::builder(Echo)
            .method("Hi", |_: &Echo, args: String, reply: &mut String| {
                *reply = format!("Echo: {args}");
                Ok::<_, String>(())
            })
            .build(),
    )?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn({
        let server = server.clone();
        async move { server.accept(listener).await }
    });

    let client = dial(&addr, Options::default()).await?;
    let start = Instant::now();
    for _ in 0..CALLS {
        let reply: String = client.call("Echo.Hi", "Hello").await?;
        debug_assert_eq!(reply, "Echo: Hello");
    }
    println!("{CALLS} calls took {:?}", start.elapsed());

    client.close()?;
    server.shutdown();
    Ok(())
}
