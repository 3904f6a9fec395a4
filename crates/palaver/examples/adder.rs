//! Adder - minimal end-to-end round trip
//!
//! Starts a server with an ADD task, connects a client, dispatches a
//! request, pings the healthcheck, and receives a broadcast push.
//!
//! Usage: cargo run --example adder

use std::time::Duration;

use palaver::{Client, ClientEvent, ClientOptions, PushScope, Schema, Server};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let schema = Schema::builder()
        .task("ADD", |payload| async move {
            let x = payload["x"].as_i64().unwrap_or(0);
            let y = payload["y"].as_i64().unwrap_or(0);
            Ok(json!(x + y))
        })
        .build();

    let server = Server::new(schema)
        .with_healthcheck(|| async { Ok(json!({"status": "ok"})) })
        .listen("127.0.0.1:0".parse()?)
        .await?;
    println!("server on {}", server.local_addr());

    let client = Client::connect(
        format!("ws://{}", server.local_addr()),
        ClientOptions::default(),
    );
    client.wait_ready().await;

    let sum = client.dispatch("ADD", json!({"x": 3, "y": 5})).await?;
    println!("3 + 5 = {}", sum);

    let health = client.ping(Duration::from_secs(2)).await?;
    println!("healthcheck: {}", health);

    let mut events = client.subscribe();
    server.push("greeting", json!("hello out there"), PushScope::Broadcast);
    loop {
        if let ClientEvent::Push { event, payload } = events.recv().await? {
            println!("push {}: {}", event, payload);
            break;
        }
    }

    client.close().await;
    server.close().await;
    Ok(())
}
