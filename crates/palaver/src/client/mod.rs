//! Client coordinator: multiplexes requests over one transport, correlates
//! replies by id, retries on timeout, and recovers from transport loss.
//!
//! Architecture follows the reactor pattern: the socket and all per-request
//! state live in one background task. Public calls flow through an mpsc
//! command channel and get their answer back on a per-request oneshot, so
//! no lock is ever held across a suspension.
//!
//! Reconnection has three triggers: a close with code 1000 or 1006, a
//! drain tick (voluntary rotation), and a tolerance trip (too many
//! timeouts over a window, meaning the transport is open but wedged).
//! Whatever the trigger, pending requests survive: when the replacement
//! transport opens, every entry whose transmission predates it is re-slung
//! once, with its original timeout window left running.

pub mod http;
pub mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use palaverproto::{CloseCode, Message, Request, PING_TASK};

use crate::config::ClientOptions;
use crate::error::ClientError;
use crate::events::ClientEvent;

pub use http::HttpClient;
pub use transport::{Connected, Connector, Transport, TransportEvent, WsConnector};

enum Command {
    Dispatch {
        task: String,
        payload: Value,
        ping_timeout: Option<Duration>,
        reply_tx: oneshot::Sender<Result<Value, ClientError>>,
    },
    Open,
    Close(oneshot::Sender<()>),
}

/// Handle to a running coordinator. Cheap to clone; the coordinator stops
/// when every handle is gone or `close` is called.
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    opened: watch::Receiver<u64>,
}

impl Client {
    /// Connect to a WebSocket URL and start the coordinator.
    pub fn connect(url: impl Into<String>, options: ClientOptions) -> Self {
        Self::start(Arc::new(WsConnector::new(url)), options, true)
    }

    /// Build a coordinator around a caller-supplied connector without
    /// connecting; call [`Client::open`] to bring the transport up.
    pub fn with_connector(connector: Arc<dyn Connector>, options: ClientOptions) -> Self {
        Self::start(connector, options, false)
    }

    fn start(connector: Arc<dyn Connector>, options: ClientOptions, auto_connect: bool) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);
        let (opened_tx, opened_rx) = watch::channel(0);
        let (merged_tx, merged_rx) = mpsc::channel(256);

        let reactor = Reactor::new(connector, options, events.clone(), opened_tx, merged_tx);
        tokio::spawn(reactor.run(cmd_rx, merged_rx, auto_connect));

        Self {
            cmd_tx,
            events,
            opened: opened_rx,
        }
    }

    /// Trigger the initial connection of a [`Client::with_connector`]
    /// coordinator.
    pub async fn open(&self) {
        let _ = self.cmd_tx.send(Command::Open).await;
    }

    /// Dispatch a task and await its terminal outcome.
    ///
    /// Deferred while the transport is down; fails with `Timeout` after
    /// `attempts` transmissions without a reply, or `Closed` after
    /// [`Client::close`].
    pub async fn dispatch(
        &self,
        task: impl Into<String>,
        payload: Value,
    ) -> Result<Value, ClientError> {
        self.submit(task.into(), payload, None).await
    }

    /// Healthcheck the server with a deadline independent of the dispatch
    /// timeout chain. A single transmission, no retries.
    pub async fn ping(&self, timeout: Duration) -> Result<Value, ClientError> {
        self.submit(PING_TASK.to_string(), Value::Null, Some(timeout))
            .await
    }

    async fn submit(
        &self,
        task: String,
        payload: Value,
        ping_timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dispatch {
                task,
                payload,
                ping_timeout,
                reply_tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Observe lifecycle and traffic events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Whether a transport is currently open.
    pub fn is_ready(&self) -> bool {
        *self.opened.borrow() != 0
    }

    /// Wait until a transport is open.
    pub async fn wait_ready(&self) {
        let mut opened = self.opened.clone();
        while *opened.borrow_and_update() == 0 {
            if opened.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sever the transport; pending and future dispatches fail with
    /// `Closed`.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Built but never asked to connect (`with_connector`).
    Idle,
    /// A connect attempt is in flight or scheduled.
    Connecting,
    /// Transport open; dispatches transmit immediately.
    Ready,
    /// Terminal: explicit close or a `GoingAway` from the server.
    Closed,
}

struct PendingEntry {
    request: Request,
    /// Transport epoch of the last transmission; 0 = never sent.
    epoch: u64,
    /// Retransmissions left after the initial send.
    attempts_remaining: u32,
    /// Armed at first transmission; never reset by a re-sling.
    deadline: Option<Instant>,
    timeout: Duration,
    reply_tx: oneshot::Sender<Result<Value, ClientError>>,
    is_ping: bool,
}

struct ActiveTransport {
    epoch: u64,
    transport: Box<dyn Transport>,
}

/// A rotated-out transport, held open until every id that was pending on
/// it reaches a terminal outcome.
struct DrainingTransport {
    epoch: u64,
    transport: Box<dyn Transport>,
    awaiting: HashSet<String>,
}

struct Reactor {
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    events: broadcast::Sender<ClientEvent>,
    opened: watch::Sender<u64>,
    merged_tx: mpsc::Sender<(u64, TransportEvent)>,
    state: Lifecycle,
    ever_ready: bool,
    epoch: u64,
    active: Option<ActiveTransport>,
    draining: Vec<DrainingTransport>,
    pending: HashMap<String, PendingEntry>,
    next_connect_at: Option<Instant>,
    next_drain_at: Option<Instant>,
    window_requests: u64,
    window_timeouts: u64,
}

impl Reactor {
    fn new(
        connector: Arc<dyn Connector>,
        options: ClientOptions,
        events: broadcast::Sender<ClientEvent>,
        opened: watch::Sender<u64>,
        merged_tx: mpsc::Sender<(u64, TransportEvent)>,
    ) -> Self {
        Self {
            connector,
            options,
            events,
            opened,
            merged_tx,
            state: Lifecycle::Idle,
            ever_ready: false,
            epoch: 0,
            active: None,
            draining: Vec::new(),
            pending: HashMap::new(),
            next_connect_at: None,
            next_drain_at: None,
            window_requests: 0,
            window_timeouts: 0,
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut merged_rx: mpsc::Receiver<(u64, TransportEvent)>,
        auto_connect: bool,
    ) {
        let mut connecting: Option<oneshot::Receiver<anyhow::Result<Connected>>> = None;

        if auto_connect {
            self.state = Lifecycle::Connecting;
            connecting = Some(self.spawn_connect());
        }

        let mut tolerance_ticker = self.options.tolerance.map(|t| {
            let mut ticker = tokio::time::interval_at(Instant::now() + t.interval, t.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        debug!("coordinator reactor started");

        loop {
            let next_deadline = self.pending.values().filter_map(|p| p.deadline).min();
            let next_connect = if connecting.is_none() {
                self.next_connect_at
            } else {
                None
            };
            let next_drain = self.next_drain_at;

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Dispatch { task, payload, ping_timeout, reply_tx }) => {
                        self.handle_dispatch(task, payload, ping_timeout, reply_tx).await;
                    }
                    Some(Command::Open) => {
                        if self.state == Lifecycle::Idle {
                            self.state = Lifecycle::Connecting;
                            if connecting.is_none() {
                                connecting = Some(self.spawn_connect());
                            }
                        }
                    }
                    Some(Command::Close(done_tx)) => {
                        self.handle_close().await;
                        let _ = done_tx.send(());
                    }
                    None => break,
                },

                outcome = async {
                    match connecting.as_mut() {
                        Some(rx) => rx.await,
                        None => futures::future::pending().await,
                    }
                }, if connecting.is_some() => {
                    connecting = None;
                    match outcome {
                        Ok(Ok(connected)) => self.on_connected(connected).await,
                        Ok(Err(e)) => self.on_connect_failed(e.to_string()),
                        Err(_) => self.on_connect_failed("connect task vanished".into()),
                    }
                },

                ev = merged_rx.recv() => {
                    if let Some((epoch, event)) = ev {
                        self.on_transport_event(epoch, event).await;
                    }
                },

                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                        if next_deadline.is_some() => {
                    self.sweep_deadlines().await;
                },

                _ = sleep_until(next_connect.unwrap_or_else(Instant::now)),
                        if next_connect.is_some() => {
                    self.next_connect_at = None;
                    connecting = Some(self.spawn_connect());
                },

                _ = sleep_until(next_drain.unwrap_or_else(Instant::now)),
                        if next_drain.is_some() => {
                    self.rotate_for_drain().await;
                },

                _ = async {
                    match tolerance_ticker.as_mut() {
                        Some(ticker) => { ticker.tick().await; }
                        None => futures::future::pending().await,
                    }
                }, if tolerance_ticker.is_some() => {
                    self.tolerance_tick().await;
                },
            }
        }

        // Every handle dropped: tear down quietly.
        self.handle_close().await;
        debug!("coordinator reactor exited");
    }

    fn spawn_connect(&self) -> oneshot::Receiver<anyhow::Result<Connected>> {
        let (tx, rx) = oneshot::channel();
        let connector = self.connector.clone();
        tokio::spawn(async move {
            let result = connector.connect().await;
            let _ = tx.send(result);
        });
        rx
    }

    async fn handle_dispatch(
        &mut self,
        task: String,
        payload: Value,
        ping_timeout: Option<Duration>,
        reply_tx: oneshot::Sender<Result<Value, ClientError>>,
    ) {
        if self.state == Lifecycle::Closed {
            let _ = reply_tx.send(Err(ClientError::Closed));
            return;
        }

        let request = Request::new(task, payload);
        let is_ping = ping_timeout.is_some();
        self.emit(ClientEvent::Request {
            id: request.id.clone(),
            task: request.task.clone(),
        });
        if !is_ping {
            self.window_requests += 1;
        }

        let mut entry = PendingEntry {
            epoch: 0,
            attempts_remaining: if is_ping {
                0
            } else {
                self.options.attempts.saturating_sub(1)
            },
            // A ping measures liveness: its clock starts now, connected or
            // not. Dispatch deadlines start at first transmission.
            deadline: ping_timeout.map(|t| Instant::now() + t),
            timeout: ping_timeout.unwrap_or(self.options.timeout),
            reply_tx,
            is_ping,
            request,
        };

        if self.state == Lifecycle::Ready {
            if let Some(active) = self.active.as_mut() {
                send_entry(active, &mut entry, &self.events).await;
            }
        } else {
            trace!(id = %entry.request.id, "dispatch deferred until transport opens");
        }
        self.pending.insert(entry.request.id.clone(), entry);
    }

    async fn handle_close(&mut self) {
        if self.state == Lifecycle::Closed {
            return;
        }
        info!("coordinator closing");
        self.state = Lifecycle::Closed;
        let _ = self.opened.send_replace(0);
        self.next_connect_at = None;
        self.next_drain_at = None;

        if let Some(mut active) = self.active.take() {
            active
                .transport
                .close(CloseCode::GoingAway.to_u16())
                .await;
        }
        for mut draining in self.draining.drain(..) {
            draining
                .transport
                .close(CloseCode::GoingAway.to_u16())
                .await;
        }
        for (_, entry) in self.pending.drain() {
            let _ = entry.reply_tx.send(Err(ClientError::Closed));
        }
    }

    async fn on_connected(&mut self, connected: Connected) {
        if self.state == Lifecycle::Closed {
            let mut transport = connected.transport;
            transport.close(CloseCode::GoingAway.to_u16()).await;
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;

        let merged_tx = self.merged_tx.clone();
        let mut events = connected.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if merged_tx.send((epoch, event)).await.is_err() {
                    break;
                }
            }
        });

        self.active = Some(ActiveTransport {
            epoch,
            transport: connected.transport,
        });
        self.state = Lifecycle::Ready;
        let _ = self.opened.send_replace(epoch);

        if self.ever_ready {
            info!(epoch, "transport reconnected");
            self.emit(ClientEvent::Reconnected);
        } else {
            info!(epoch, "transport ready");
            self.emit(ClientEvent::Ready);
        }
        self.ever_ready = true;

        self.resling().await;

        if let Some(interval) = self.options.drain_interval {
            self.next_drain_at = Some(Instant::now() + interval);
        }
    }

    fn on_connect_failed(&mut self, error: String) {
        if self.state == Lifecycle::Closed {
            return;
        }
        debug!("connect attempt failed: {}", error);
        self.emit(ClientEvent::ReconnectFailed);
        self.next_connect_at = Some(Instant::now() + self.options.reconnect_interval);
    }

    /// Retransmit every pending entry whose last transmission predates the
    /// current transport. Timeout windows keep running.
    async fn resling(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let epoch = active.epoch;
        let mut reslung = 0usize;
        for entry in self.pending.values_mut() {
            if entry.epoch != epoch {
                send_entry(active, entry, &self.events).await;
                reslung += 1;
            }
        }
        if reslung > 0 {
            debug!(count = reslung, epoch, "re-slung pending requests");
        }
    }

    async fn on_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => self.on_frame(&text).await,
            TransportEvent::Error(error) => {
                warn!(epoch, "transport error: {}", error);
                self.emit(ClientEvent::Error(error));
            }
            TransportEvent::Closed(code) => self.on_transport_closed(epoch, code).await,
        }
    }

    async fn on_frame(&mut self, text: &str) {
        match Message::decode(text) {
            Ok(Message::Reply(reply)) => {
                let id = reply.id().to_string();
                match self.pending.remove(&id) {
                    Some(entry) => {
                        trace!(id = %id, ok = reply.is_ok(), "reply correlated");
                        let _ = entry
                            .reply_tx
                            .send(reply.into_result().map_err(ClientError::Task));
                    }
                    None => {
                        // Retired by timeout, or a duplicate after re-sling.
                        debug!(id = %id, "discarding orphan reply");
                    }
                }
                self.retire_id(&id).await;
            }
            Ok(Message::Push(push)) => {
                self.emit(ClientEvent::Push {
                    event: push.event,
                    payload: push.payload,
                });
            }
            Ok(Message::Request(request)) => {
                debug!(task = %request.task, "ignoring server-originated request");
            }
            Err(e) => {
                warn!("ignoring undecodable frame: {}", e);
            }
        }
    }

    async fn on_transport_closed(&mut self, epoch: u64, code: u16) {
        if self.active.as_ref().map(|a| a.epoch) == Some(epoch) {
            self.active = None;
            if self.state == Lifecycle::Closed {
                return;
            }
            if CloseCode::is_terminal(code) {
                info!(code, "host closed transport for good");
                self.handle_close().await;
                return;
            }
            // 1000, 1006, and anything else unexpected: reconnect.
            info!(code, "host closed transport, reconnecting");
            self.emit(ClientEvent::HostClosed);
            self.state = Lifecycle::Connecting;
            let _ = self.opened.send_replace(0);
            self.next_drain_at = None;
            self.next_connect_at = Some(Instant::now());
            return;
        }

        // A draining transport finished on its own.
        let before = self.draining.len();
        self.draining.retain(|d| d.epoch != epoch);
        if self.draining.len() != before {
            debug!(epoch, code, "draining transport closed by peer");
        }
    }

    async fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            let Some(mut entry) = self.pending.remove(&id) else {
                continue;
            };
            if entry.attempts_remaining > 0 {
                entry.attempts_remaining -= 1;
                entry.deadline = Some(now + entry.timeout);
                debug!(id = %id, remaining = entry.attempts_remaining, "attempt expired, retransmitting");
                if self.state == Lifecycle::Ready {
                    if let Some(active) = self.active.as_mut() {
                        send_entry(active, &mut entry, &self.events).await;
                    }
                }
                self.pending.insert(id, entry);
            } else {
                if entry.is_ping {
                    debug!(id = %id, "ping timed out");
                    self.emit(ClientEvent::PingTimeout);
                } else {
                    debug!(id = %id, "request timed out");
                    self.window_timeouts += 1;
                    self.emit(ClientEvent::Timeout { id: id.clone() });
                }
                let _ = entry.reply_tx.send(Err(ClientError::Timeout));
                self.retire_id(&id).await;
            }
        }
    }

    /// Drop `id` from every draining transport's awaiting set; close the
    /// ones that have nothing left to wait for.
    async fn retire_id(&mut self, id: &str) {
        for draining in &mut self.draining {
            draining.awaiting.remove(id);
        }
        let mut index = 0;
        while index < self.draining.len() {
            if self.draining[index].awaiting.is_empty() {
                let mut finished = self.draining.remove(index);
                finished
                    .transport
                    .close(CloseCode::GoingAway.to_u16())
                    .await;
                debug!(epoch = finished.epoch, "drained transport closed");
            } else {
                index += 1;
            }
        }
    }

    /// Voluntary rotation: open a replacement transport and park the old
    /// one until its in-flight ids resolve.
    async fn rotate_for_drain(&mut self) {
        self.next_drain_at = None;
        if self.state != Lifecycle::Ready {
            return;
        }
        info!("drain tick: rotating transport");
        self.emit(ClientEvent::Reconnecting);

        if let Some(active) = self.active.take() {
            let awaiting: HashSet<String> = self
                .pending
                .iter()
                .filter(|(_, e)| e.epoch == active.epoch)
                .map(|(id, _)| id.clone())
                .collect();
            if awaiting.is_empty() {
                let mut transport = active.transport;
                transport.close(CloseCode::GoingAway.to_u16()).await;
                debug!(epoch = active.epoch, "old transport had no pending ids, closed");
            } else {
                debug!(
                    epoch = active.epoch,
                    awaiting = awaiting.len(),
                    "old transport parked until pending ids resolve"
                );
                self.draining.push(DrainingTransport {
                    epoch: active.epoch,
                    transport: active.transport,
                    awaiting,
                });
            }
        }

        self.state = Lifecycle::Connecting;
        let _ = self.opened.send_replace(0);
        self.next_connect_at = Some(Instant::now());
    }

    /// Window boundary: trip when the timeout ratio is too high, else
    /// reset the counters. Counters survive a trip so a persistent burst
    /// keeps tripping.
    async fn tolerance_tick(&mut self) {
        let Some(tolerance) = self.options.tolerance else {
            return;
        };
        let tripped = self.state == Lifecycle::Ready
            && self.window_requests > 0
            && (self.window_timeouts as f64 / self.window_requests as f64) > tolerance.ratio;

        if tripped {
            warn!(
                requests = self.window_requests,
                timeouts = self.window_timeouts,
                "timeout tolerance exceeded, recycling transport"
            );
            self.emit(ClientEvent::HostClosed);
            if let Some(mut active) = self.active.take() {
                active
                    .transport
                    .close(CloseCode::GoingAway.to_u16())
                    .await;
            }
            self.state = Lifecycle::Connecting;
            let _ = self.opened.send_replace(0);
            self.next_drain_at = None;
            self.next_connect_at = Some(Instant::now());
        } else {
            self.window_requests = 0;
            self.window_timeouts = 0;
        }
    }
}

/// Transmit an entry on the given transport, stamping its epoch and arming
/// its deadline on first send.
async fn send_entry(
    active: &mut ActiveTransport,
    entry: &mut PendingEntry,
    events: &broadcast::Sender<ClientEvent>,
) {
    let frame = Message::Request(entry.request.clone()).encode();
    match active.transport.send(frame).await {
        Ok(()) => {
            entry.epoch = active.epoch;
            if entry.deadline.is_none() {
                entry.deadline = Some(Instant::now() + entry.timeout);
            }
            trace!(id = %entry.request.id, epoch = active.epoch, "request transmitted");
        }
        Err(e) => {
            // The reader will surface the closure; the entry keeps its
            // place in the table and rides the reconnect.
            warn!(id = %entry.request.id, "send failed: {}", e);
            let _ = events.send(ClientEvent::Error(e.to_string()));
        }
    }
}
