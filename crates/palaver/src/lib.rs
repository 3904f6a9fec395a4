//! palaver - bidirectional request/reply RPC for stateless microservices.
//!
//! A server advertises a [`Schema`] mapping task-type names to async
//! handlers and serves them over WebSocket (with server push) and one-shot
//! HTTP. A [`Client`] multiplexes correlated requests over a single
//! transport, enforces per-request timeouts with bounded retry, and rides
//! out transport loss: pending work is re-slung onto the replacement
//! connection.
//!
//! ```no_run
//! use palaver::{Client, ClientOptions, Schema, Server};
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let schema = Schema::builder()
//!     .task("ADD", |payload| async move {
//!         let x = payload["x"].as_i64().unwrap_or(0);
//!         let y = payload["y"].as_i64().unwrap_or(0);
//!         Ok(json!(x + y))
//!     })
//!     .build();
//!
//! let server = Server::new(schema).listen("127.0.0.1:0".parse()?).await?;
//! let client = Client::connect(
//!     format!("ws://{}", server.local_addr()),
//!     ClientOptions::default(),
//! );
//! let sum = client.dispatch("ADD", json!({"x": 3, "y": 5})).await?;
//! assert_eq!(sum, json!(8));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod middleware;
pub mod pool;
pub mod schema;
pub mod server;

pub use client::{Client, Connected, Connector, HttpClient, Transport, TransportEvent, WsConnector};
pub use config::{ClientOptions, Tolerance};
pub use error::{ClientError, PoolError};
pub use events::{ClientEvent, ServerEvent, StaleOutbound};
pub use middleware::{middleware_fn, Middleware, Next};
pub use pool::{ConcurrencyPool, PoolMiddleware};
pub use schema::{Schema, SchemaBuilder, TaskHandler};
pub use server::{ConnectionId, PushScope, Server, ServerHandle};

pub use palaverproto::{CloseCode, CodecError, Message, Push, Reply, Request, WireError, PING_TASK};
