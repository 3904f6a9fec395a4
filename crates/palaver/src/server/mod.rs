//! Request dispatcher and connection registry.
//!
//! One axum listener carries every surface: the WebSocket upgrade at `/`,
//! the one-shot HTTP variant at `POST /api/{task}`, `GET /healthcheck`,
//! and the admin `GET /disconnect`. Each WebSocket connection gets a
//! reader loop plus a writer task fed over an unbounded channel; requests
//! are dispatched on their own tasks so a slow handler never stalls the
//! transport.

mod http;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use palaverproto::{CloseCode, Message, Push, Reply, Request, WireError};

use crate::events::{ServerEvent, StaleOutbound};
use crate::middleware::{Middleware, Next};
use crate::schema::Schema;

/// Identifier of one live transport, usable as a push scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery scope for a server push.
#[derive(Debug, Clone)]
pub enum PushScope {
    /// Every currently-open connection.
    Broadcast,
    /// One connection.
    Single(ConnectionId),
    /// An explicit set of connections.
    List(Vec<ConnectionId>),
}

/// Healthcheck invoked for `$PING` requests and `GET /healthcheck`.
pub type HealthcheckFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, WireError>> + Send + Sync>;

enum Outbound {
    Frame(String),
    Close(u16),
}

#[derive(Clone)]
struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl ConnectionHandle {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self, code: u16) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Close(code));
    }
}

/// Server configuration: a schema, an optional healthcheck, and a
/// middleware chain applied in registration order.
pub struct Server {
    schema: Schema,
    healthcheck: Option<HealthcheckFn>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Server {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            healthcheck: None,
            middleware: Vec::new(),
        }
    }

    pub fn with_healthcheck<F, Fut>(mut self, healthcheck: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, WireError>> + Send + 'static,
    {
        self.healthcheck = Some(Arc::new(move || Box::pin(healthcheck())));
        self
    }

    /// Append a middleware to the chain.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Bind and start serving. The returned handle owns the listener.
    pub async fn listen(self, addr: SocketAddr) -> Result<ServerHandle> {
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(ServerInner {
            schema: self.schema,
            healthcheck: self.healthcheck,
            chain: self.middleware.into(),
            connections: DashMap::new(),
            events,
        });

        let app = Router::new()
            .route("/", get(ws_upgrade))
            .route("/healthcheck", get(http::healthcheck))
            .route("/disconnect", get(http::disconnect))
            .route("/api/{task}", post(http::dispatch))
            .with_state(inner.clone());

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create listener socket")?;
        socket
            .set_reuseaddr(true)
            .context("failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind to {addr}"))?;
        let listener = socket.listen(1024).context("failed to listen")?;
        let local_addr = listener.local_addr().context("no local address")?;

        info!("palaver server listening on {}", local_addr);

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let serve_task = tokio::spawn(async move {
            let graceful = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
            {
                warn!("listener error: {}", e);
            }
        });

        Ok(ServerHandle {
            inner,
            local_addr,
            shutdown,
            serve_task: std::sync::Mutex::new(Some(serve_task)),
        })
    }
}

/// A running server: push, observe, close.
pub struct ServerHandle {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    serve_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Ids of the currently registered connections, in no particular order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner.connections.iter().map(|e| *e.key()).collect()
    }

    /// Send an out-of-band event to the scoped connections.
    pub fn push(&self, event: &str, payload: Value, scope: PushScope) {
        self.inner.push(event, payload, scope);
    }

    /// Close every connection with `ServerShuttingOff` and stop the
    /// listener.
    pub async fn close(&self) {
        self.inner
            .close_all_connections(CloseCode::ServerShuttingOff.to_u16());
        let _ = self.shutdown.send(true);
        let task = self.serve_task.lock().unwrap().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                warn!("listener did not drain in time, aborting");
                task.abort();
            }
        }
    }
}

struct ServerInner {
    schema: Schema,
    healthcheck: Option<HealthcheckFn>,
    chain: Arc<[Arc<dyn Middleware>]>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    events: broadcast::Sender<ServerEvent>,
}

impl ServerInner {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Run a request through the chain and shape the outcome as a reply.
    ///
    /// The chain runs on its own task so a panicking handler is contained
    /// and surfaced as an ERR instead of taking the dispatcher down.
    async fn execute(&self, request: Request) -> Reply {
        let id = request.id.clone();
        let task = request.task.clone();

        let fut: BoxFuture<'static, Result<Value, WireError>> = if request.is_ping() {
            match &self.healthcheck {
                Some(healthcheck) => healthcheck(),
                None => Box::pin(async { Ok(Value::Null) }),
            }
        } else if let Some(handler) = self.schema.get(&request.task) {
            Next::chain(self.chain.clone(), handler.clone()).run(request)
        } else {
            let message = format!("Unknown request type: \"{}\"", request.task);
            Box::pin(async move { Err(WireError::new(message)) })
        };

        let outcome = match tokio::spawn(fut).await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => {
                warn!(task = %task, "handler panicked");
                Err(WireError::new(format!("handler for \"{task}\" panicked")))
            }
            Err(_) => Err(WireError::new("handler was cancelled")),
        };

        match outcome {
            Ok(payload) => Reply::ok(id, payload),
            Err(error) => Reply::err(id, error),
        }
    }

    fn send_reply(&self, conn: &ConnectionHandle, reply: Reply) {
        if conn.is_open() {
            let encoded = Message::Reply(reply.clone()).encode();
            if conn.outbound.send(Outbound::Frame(encoded)).is_ok() {
                return;
            }
        }
        debug!(connection = %conn.id, id = reply.id(), "reply to closed connection");
        self.emit(ServerEvent::Stale(StaleOutbound::Reply(reply)));
    }

    fn push(&self, event: &str, payload: Value, scope: PushScope) {
        let push = Push::new(event, payload);
        let encoded = Message::Push(push.clone()).encode();

        let deliver = |conn: &ConnectionHandle| {
            if conn.is_open() && conn.outbound.send(Outbound::Frame(encoded.clone())).is_ok() {
                return;
            }
            self.emit(ServerEvent::Stale(StaleOutbound::Push(push.clone())));
        };

        match scope {
            PushScope::Broadcast => {
                for entry in self.connections.iter() {
                    deliver(entry.value());
                }
            }
            PushScope::Single(id) => match self.connections.get(&id) {
                Some(entry) => deliver(entry.value()),
                None => self.emit(ServerEvent::Stale(StaleOutbound::Push(push.clone()))),
            },
            PushScope::List(ids) => {
                for id in ids {
                    match self.connections.get(&id) {
                        Some(entry) => deliver(entry.value()),
                        None => self.emit(ServerEvent::Stale(StaleOutbound::Push(push.clone()))),
                    }
                }
            }
        }
    }

    fn close_all_connections(&self, code: u16) {
        for entry in self.connections.iter() {
            entry.value().close(code);
        }
    }
}

/// Decode one inbound frame and dispatch it on its own task.
fn handle_frame(inner: &Arc<ServerInner>, conn: &ConnectionHandle, text: &str) {
    match Message::decode(text) {
        Ok(Message::Request(request)) => {
            inner.emit(ServerEvent::Request(request.clone()));
            let inner = inner.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let reply = inner.execute(request).await;
                inner.emit(ServerEvent::Reply(reply.clone()));
                inner.send_reply(&conn, reply);
            });
        }
        Ok(other) => {
            debug!(connection = %conn.id, "ignoring non-request frame: {:?}", other);
        }
        Err(e) => {
            inner.emit(ServerEvent::Error(format!("bad frame: {e}")));
            conn.close(CloseCode::ProtocolError.to_u16());
        }
    }
}

async fn ws_upgrade(State(inner): State<Arc<ServerInner>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(inner, socket))
}

async fn handle_socket(inner: Arc<ServerInner>, socket: WebSocket) {
    let id = ConnectionId::new();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));
    let handle = ConnectionHandle {
        id,
        outbound: outbound_tx,
        open: open.clone(),
    };
    inner.connections.insert(id, handle.clone());
    inner.emit(ServerEvent::Connection(id));
    debug!(connection = %id, "transport connected");

    let (mut sink, mut stream) = socket.split();
    let writer_open = open.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = outbound_rx.recv().await {
            match out {
                Outbound::Frame(text) => {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code) => {
                    writer_open.store(false, Ordering::SeqCst);
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: Utf8Bytes::from_static(""),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => handle_frame(&inner, &handle, text.as_str()),
            Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_frame(&inner, &handle, text),
                Err(_) => {
                    inner.emit(ServerEvent::Error("bad frame: not UTF-8".into()));
                    handle.close(CloseCode::ProtocolError.to_u16());
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                inner.emit(ServerEvent::Error(format!("connection error: {e}")));
                break;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    inner.connections.remove(&id);
    inner.emit(ServerEvent::Terminated(id));
    debug!(connection = %id, "transport closed");

    // The writer ends once every handle clone is gone; in-flight replies
    // surface as stale rather than holding the socket.
    drop(handle);
    drop(writer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_inner(schema: Schema) -> Arc<ServerInner> {
        let (events, _) = broadcast::channel(64);
        Arc::new(ServerInner {
            schema,
            healthcheck: None,
            chain: Vec::new().into(),
            connections: DashMap::new(),
            events,
        })
    }

    fn closed_handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: ConnectionId::new(),
            outbound: tx,
            open: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    #[tokio::test]
    async fn unknown_type_becomes_err_reply() {
        let inner = test_inner(Schema::default());
        let reply = inner
            .execute(Request::with_id("NOPE", "r1", Value::Null))
            .await;
        match reply {
            Reply::Err { id, error, .. } => {
                assert_eq!(id, "r1");
                assert_eq!(error.message, "Unknown request type: \"NOPE\"");
            }
            other => panic!("expected ERR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ping_without_healthcheck_resolves_null() {
        let inner = test_inner(Schema::default());
        let reply = inner
            .execute(Request::with_id(palaverproto::PING_TASK, "r1", Value::Null))
            .await;
        assert_eq!(reply, Reply::ok("r1", Value::Null));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let schema = Schema::builder()
            .task("BOOM", |_| async move { panic!("kaboom") })
            .build();
        let inner = test_inner(schema);
        let reply = inner
            .execute(Request::with_id("BOOM", "r1", Value::Null))
            .await;
        match reply {
            Reply::Err { error, .. } => assert!(error.message.contains("panicked")),
            other => panic!("expected ERR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reply_to_closed_connection_is_stale() {
        let inner = test_inner(Schema::default());
        let mut events = inner.events.subscribe();
        let (handle, _rx) = closed_handle();

        inner.send_reply(&handle, Reply::ok("r1", json!(1)));

        match events.try_recv() {
            Ok(ServerEvent::Stale(StaleOutbound::Reply(reply))) => assert_eq!(reply.id(), "r1"),
            other => panic!("expected stale reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn push_to_missing_connection_is_stale() {
        let inner = test_inner(Schema::default());
        let mut events = inner.events.subscribe();

        inner.push("foo", json!(1), PushScope::Single(ConnectionId::new()));

        match events.try_recv() {
            Ok(ServerEvent::Stale(StaleOutbound::Push(push))) => assert_eq!(push.event, "foo"),
            other => panic!("expected stale push, got {:?}", other),
        }
    }
}
