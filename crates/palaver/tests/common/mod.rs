//! Shared helpers for the integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use palaver::{Schema, Server, ServerHandle};
use serde_json::json;
use tokio::sync::broadcast;

/// Schema with the tasks the scenarios use: ADD computes, SLEEP stalls.
pub fn adder_schema() -> Schema {
    Schema::builder()
        .task("ADD", |payload| async move {
            let x = payload["x"].as_i64().unwrap_or(0);
            let y = payload["y"].as_i64().unwrap_or(0);
            Ok(json!(x + y))
        })
        .build()
}

pub fn ephemeral_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub async fn start_server(schema: Schema) -> ServerHandle {
    Server::new(schema)
        .listen(ephemeral_addr())
        .await
        .expect("server failed to listen")
}

pub fn ws_url(server: &ServerHandle) -> String {
    format!("ws://{}", server.local_addr())
}

/// Receive events until one matches, panicking after `timeout`.
pub async fn next_matching<T, F>(
    rx: &mut broadcast::Receiver<T>,
    timeout: Duration,
    what: &str,
    mut pred: F,
) -> T
where
    T: Clone + std::fmt::Debug,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended while waiting for {what}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Drain whatever is immediately available on a broadcast receiver.
pub fn drain_events<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
