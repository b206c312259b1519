//! Load-balanced calls and broadcast across two servers.
//!
//! ```text
//! cargo run --example xclient
//! ```

use std::time::Duration;

use rpcwire::service::Service;
use rpcwire::xclient::{MultiServerDiscovery, SelectMode, XClient};
use rpcwire::{Options, Server};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Serialize, Deserialize)]
struct Args {
    num1: i32,
    num2: i32,
}

struct Foo;

fn foo_service() -> Service {
    Service::builder(Foo)
        .method("Sum", |_: &Foo, args: Args, reply: &mut i32| {
            *reply = args.num1 + args.num2;
            Ok::<_, String>(())
        })
        .method("Sleep", |_: &Foo, args: Args, reply: &mut i32| {
            std::thread::sleep(Duration::from_secs(args.num1 as u64));
            *reply = args.num1 + args.num2;
            Ok::<_, String>(())
        })
        .build()
}

async fn start_server() -> Result<String, Box<dyn std::error::Error>> {
    let server = Server::new();
    server.register(foo_service())?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { server.accept(listener).await });
    Ok(format!("tcp@{addr}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let servers = vec![start_server().await?, start_server().await?];
    let xc = XClient::new(
        MultiServerDiscovery::new(servers),
        SelectMode::Random,
        Options::default(),
    );

    for i in 0..5 {
        let args = Args { num1: i, num2: i * i };
        let reply: i32 = xc.call("Foo.Sum", &args).await?;
        println!("call Foo.Sum: {} + {} = {}", args.num1, args.num2, reply);

        let reply: i32 = xc.broadcast("Foo.Sum", &args).await?;
        println!("broadcast Foo.Sum: {} + {} = {}", args.num1, args.num2, reply);
    }

    // A call slower than the caller's patience is abandoned.
    let cancel = CancellationToken::new();
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        timer.cancel();
    });
    let slow: rpcwire::Result<i32> = xc
        .call_with_cancel("Foo.Sleep", &Args { num1: 2, num2: 0 }, &cancel)
        .await;
    println!("call Foo.Sleep: {slow:?}");

    xc.close().await;
    Ok(())
}
