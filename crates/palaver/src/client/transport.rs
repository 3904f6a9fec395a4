//! Transport seam between the coordinator and the network.
//!
//! The coordinator only ever sees `Transport` + `TransportEvent`; the
//! production implementation wraps `tokio-tungstenite` with a writer task
//! and a reader task. Tests inject channel-backed implementations through
//! the same `Connector` trait, which is also the `noServer` story: build
//! the client around your own connector instead of a URL.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use palaverproto::CloseCode;

/// Events a transport reports to the coordinator. A transport emits
/// `Closed` exactly once, with code `Abnormal` (1006) when the connection
/// dropped without a close handshake.
#[derive(Debug)]
pub enum TransportEvent {
    /// One inbound text frame.
    Message(String),
    /// The transport is gone; carries the close code.
    Closed(u16),
    /// I/O error; a `Closed` follows.
    Error(String),
}

/// Write half of an established transport.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    async fn close(&mut self, code: u16);
}

/// A freshly established transport and its event stream.
pub struct Connected {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Factory for transports; called on every (re)connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connected>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

enum WsOut {
    Text(String),
    Close(u16),
}

/// `Connector` over a WebSocket URL.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connected> {
        let (stream, _response) = connect_async(&self.url)
            .await
            .with_context(|| format!("failed to connect to {}", self.url))?;
        debug!("connected to {}", self.url);

        let (sink, read) = stream.split();
        let (event_tx, event_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::spawn(writer_task(sink, out_rx));
        tokio::spawn(reader_task(read, event_tx));

        Ok(Connected {
            transport: Box::new(WsTransport { out_tx }),
            events: event_rx,
        })
    }
}

struct WsTransport {
    out_tx: mpsc::UnboundedSender<WsOut>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.out_tx
            .send(WsOut::Text(text))
            .map_err(|_| anyhow!("transport writer is gone"))
    }

    async fn close(&mut self, code: u16) {
        let _ = self.out_tx.send(WsOut::Close(code));
    }
}

async fn writer_task(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<WsOut>) {
    while let Some(out) = rx.recv().await {
        match out {
            WsOut::Text(text) => {
                if sink.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            }
            WsOut::Close(code) => {
                let frame = CloseFrame {
                    code: code.into(),
                    reason: "".into(),
                };
                let _ = sink.send(WsMessage::Close(Some(frame))).await;
                break;
            }
        }
    }
    trace!("transport writer finished");
}

async fn reader_task(mut read: WsRead, events: mpsc::Sender<TransportEvent>) {
    let close_code = loop {
        match read.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                if events
                    .send(TransportEvent::Message(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(WsMessage::Binary(bytes))) => {
                if let Ok(text) = std::str::from_utf8(&bytes) {
                    if events
                        .send(TransportEvent::Message(text.to_owned()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                break frame
                    .map(|f| u16::from(f.code))
                    .unwrap_or(CloseCode::Abnormal.to_u16());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                break CloseCode::Abnormal.to_u16();
            }
            None => break CloseCode::Abnormal.to_u16(),
        }
    };
    let _ = events.send(TransportEvent::Closed(close_code)).await;
    trace!("transport reader finished (close code {})", close_code);
}
