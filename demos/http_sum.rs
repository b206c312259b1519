//! Sum over an HTTP CONNECT tunnel with five concurrent calls.
//!
//! ```text
//! RUST_LOG=rpcwire=debug cargo run --example http_sum
//! ```

use rpcwire::service::Service;
use rpcwire::{dial_http, Options, Server};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

#[derive(Serialize, Deserialize, Debug)]
struct Args {
    num1: i32,
    num2: i32,
}

struct Foo;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Server::global();
    server.register(
        Service::builder(Foo)
            .method("Sum", |_: &Foo, args: Args, reply: &mut i32| {
                *reply = args.num1 + args.num2;
                Ok::<_, String>(())
            })
            .build(),
    )?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(async move { server.accept_http(listener).await });

    let client = dial_http(&addr, Options::default()).await?;
    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let args = Args { num1: i, num2: i * i };
                let reply: rpcwire::Result<i32> = client.call("Foo.Sum", &args).await;
                (args, reply)
            })
        })
        .collect();

    for task in tasks {
        let (args, reply) = task.await?;
        println!("{} + {} = {}", args.num1, args.num2, reply?);
    }

    for service in server.services() {
        for method in service.methods() {
            println!("{}.{}: {} calls", service.name(), method.name(), method.num_calls());
        }
    }

    client.close()?;
    Ok(())
}
