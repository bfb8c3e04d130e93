//! # WebSocket Transport
//!
//! Opens one connection to the hub and turns it into a pair of channels:
//! outbound text frames in, inbound frames and a final close reason out.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Transport Connection                                 │
//! │                                                                         │
//! │   Connector::connect(endpoint)                                         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   ┌─────────────┐  frames   ┌──────────────┐  text   ┌──────────────┐  │
//! │   │ Connection  │ ────────► │  pump task   │ ──────► │  WebSocket   │  │
//! │   │ (engine)    │ ◄──────── │  (one per    │ ◄────── │  (tungstenite│  │
//! │   └─────────────┘  events   │  connection) │  text   │   stream)    │  │
//! │                             └──────┬───────┘         └──────────────┘  │
//! │                                    │                                    │
//! │                     ping every ping_interval,                          │
//! │                     no pong within pong_timeout ──► Closed(Timeout)    │
//! │                     close frame                 ──► Closed(Normal)     │
//! │                     socket error                ──► Closed(Error)      │
//! │                     Connection dropped          ──► close frame sent   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport never reconnects by itself; that is the supervisor's job.
//! After a `Closed` event no further events are delivered.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};

/// One JSON text frame.
pub type Frame = String;

// =============================================================================
// Transport Events
// =============================================================================

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The hub closed the connection cleanly.
    Normal,
    /// Socket or protocol failure.
    Error(String),
    /// Keepalive went unanswered.
    Timeout,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "closed by hub"),
            CloseReason::Error(e) => write!(f, "error: {}", e),
            CloseReason::Timeout => write!(f, "keepalive timeout"),
        }
    }
}

/// What a connection delivers to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// Terminal; nothing follows it.
    Closed(CloseReason),
}

// =============================================================================
// Connection
// =============================================================================

/// The engine's end of an open connection.
///
/// Dropping it (or calling [`Connection::close`]) closes the socket.
#[derive(Debug)]
pub struct Connection {
    outgoing: mpsc::Sender<Frame>,
    incoming: mpsc::Receiver<TransportEvent>,
    finished: bool,
}

/// The far end of a [`Connection`]: whatever moves frames to and from the
/// hub. The WebSocket pump owns one; tests drive one directly.
#[derive(Debug)]
pub struct ConnectionPeer {
    pub from_client: mpsc::Receiver<Frame>,
    pub to_client: mpsc::Sender<TransportEvent>,
}

impl Connection {
    /// Creates a connected pair with the given channel capacity.
    pub fn pair(buffer: usize) -> (Connection, ConnectionPeer) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        (
            Connection {
                outgoing: out_tx,
                incoming: in_rx,
                finished: false,
            },
            ConnectionPeer {
                from_client: out_rx,
                to_client: in_tx,
            },
        )
    }

    /// Queues a frame for the hub.
    ///
    /// Fails with [`SyncError::SendFailed`] once the connection is gone.
    pub async fn send(&self, frame: Frame) -> SyncResult<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| SyncError::SendFailed("connection closed".into()))
    }

    /// Queues a frame without waiting for room.
    ///
    /// The owner of a connection also drains its inbound side, so it must
    /// not block on a full outbound queue while the pump blocks on a full
    /// inbound one. A full queue counts as a failed send.
    pub fn try_send(&self, frame: Frame) -> SyncResult<()> {
        self.outgoing.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SyncError::SendFailed("outbound queue full".into()),
            mpsc::error::TrySendError::Closed(_) => SyncError::SendFailed("connection closed".into()),
        })
    }

    /// Next event. After the connection ends this keeps returning the
    /// closing event's equivalent; a peer that vanished without saying why
    /// reads as `Closed(Error)`.
    pub async fn recv(&mut self) -> TransportEvent {
        if self.finished {
            return TransportEvent::Closed(CloseReason::Error("connection already closed".into()));
        }
        match self.incoming.recv().await {
            Some(TransportEvent::Frame(frame)) => TransportEvent::Frame(frame),
            Some(TransportEvent::Closed(reason)) => {
                self.finished = true;
                TransportEvent::Closed(reason)
            }
            None => {
                self.finished = true;
                TransportEvent::Closed(CloseReason::Error("transport ended".into()))
            }
        }
    }

    /// Closes the connection. Equivalent to dropping it.
    pub fn close(self) {
        debug!("Closing connection");
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens connections to a hub endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> SyncResult<Connection>;
}

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Channel capacity in each direction.
    pub buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            buffer: 256,
        }
    }
}

impl From<&SyncSettings> for TransportConfig {
    fn from(settings: &SyncSettings) -> Self {
        TransportConfig {
            connect_timeout: settings.connect_timeout(),
            ping_interval: settings.ping_interval(),
            pong_timeout: settings.pong_timeout(),
            ..TransportConfig::default()
        }
    }
}

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: TransportConfig,
}

impl WebSocketConnector {
    pub fn new(config: TransportConfig) -> Self {
        WebSocketConnector { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> SyncResult<Connection> {
        debug!(endpoint = %endpoint, "Connecting to hub");

        let ws_stream = match timeout(self.config.connect_timeout, connect_async(endpoint)).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                ws_stream
            }
            Ok(Err(e)) => return Err(SyncError::from(e)),
            Err(_) => return Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        };

        let (connection, peer) = Connection::pair(self.config.buffer);
        tokio::spawn(pump(ws_stream, peer, self.config.clone()));
        Ok(connection)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Moves frames between the socket and the connection channels until
/// either side ends.
async fn pump(ws_stream: WsStream, mut peer: ConnectionPeer, config: TransportConfig) {
    let (mut write, mut read) = ws_stream.split();

    let mut ping_interval = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    let reason = loop {
        let deadline = pong_deadline;
        let pong_wait = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outgoing = peer.from_client.recv() => match outgoing {
                Some(frame) => {
                    if let Err(e) = write.send(WsMessage::Text(frame.into())).await {
                        break CloseReason::Error(e.to_string());
                    }
                }
                None => {
                    // Owner hung up; nobody is left to tell.
                    let _ = write.send(WsMessage::Close(None)).await;
                    debug!("Connection released, socket closed");
                    return;
                }
            },

            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame = text.as_str().to_owned();
                    if peer.to_client.send(TransportEvent::Frame(frame)).await.is_err() {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(frame) => {
                        if peer.to_client.send(TransportEvent::Frame(frame)).await.is_err() {
                            let _ = write.send(WsMessage::Close(None)).await;
                            return;
                        }
                    }
                    Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = write.send(WsMessage::Pong(data)).await {
                        break CloseReason::Error(e.to_string());
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    pong_deadline = None;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "Hub closed the connection");
                    break CloseReason::Normal;
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => break CloseReason::Error(e.to_string()),
                None => break CloseReason::Error("stream ended".into()),
            },

            _ = ping_interval.tick() => {
                if pong_deadline.is_none() {
                    if let Err(e) = write.send(WsMessage::Ping(Vec::new().into())).await {
                        break CloseReason::Error(e.to_string());
                    }
                    pong_deadline = Some(Instant::now() + config.pong_timeout);
                }
            }

            _ = pong_wait => {
                warn!(timeout = ?config.pong_timeout, "No pong from hub");
                break CloseReason::Timeout;
            }
        }
    };

    debug!(reason = %reason, "Connection ended");
    let _ = peer.to_client.send(TransportEvent::Closed(reason)).await;
}
