//! Duplex text channels the [`ConnectionManager`](crate::connection::ConnectionManager)
//! runs over.
//!
//! `WsTransport` is the real websocket client; `MemoryTransport` hands the far
//! end of each channel to the caller so the client state machines can be
//! driven without a network.

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::stream::BoxStream;
use futures::{future, Sink, SinkExt, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::error::SessionError;

pub type BoxSink = Pin<Box<dyn Sink<String, Error = SessionError> + Send>>;
pub type InboundStream = BoxStream<'static, Result<String, SessionError>>;

/// An open channel. The stream ending means the remote closed.
pub struct Duplex {
    pub sink: BoxSink,
    pub stream: InboundStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Duplex, SessionError>;
}

// ── Websocket ────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, endpoint: &str) -> Result<Duplex, SessionError> {
        let (ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| SessionError::Connection(format!("{endpoint}: {e}")))?;
        let (ws_tx, ws_rx) = ws.split();

        let sink = ws_tx
            .sink_map_err(|e| SessionError::Connection(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, SessionError>(Message::Text(text))));

        let stream = ws_rx.filter_map(|item| async move {
            match item {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    Some(Err(SessionError::ChannelClosed))
                }
                Err(e) => Some(Err(SessionError::Connection(e.to_string()))),
            }
        });

        Ok(Duplex {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}

// ── In-memory ────────────────────────────────────────────

/// Transport whose every `open` yields a [`MemoryPeer`] on the receiver
/// returned by [`MemoryTransport::new`].
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refuse: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Make subsequent `open` calls fail with a connection error.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, endpoint: &str) -> Result<Duplex, SessionError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::Connection(format!("{endpoint}: refused")));
        }

        let (to_client, inbound) = fmpsc::unbounded::<Result<String, SessionError>>();
        let (outbound, from_client) = fmpsc::unbounded::<String>();

        let peer = MemoryPeer {
            endpoint: endpoint.to_string(),
            to_client,
            from_client,
        };
        self.peers
            .send(peer)
            .map_err(|_| SessionError::Connection("memory transport dropped".into()))?;

        Ok(Duplex {
            sink: Box::pin(outbound.sink_map_err(|_| SessionError::ChannelClosed)),
            stream: inbound.boxed(),
        })
    }
}

/// The server side of one in-memory channel.
pub struct MemoryPeer {
    pub endpoint: String,
    to_client: fmpsc::UnboundedSender<Result<String, SessionError>>,
    from_client: fmpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_client.unbounded_send(Ok(text.into()));
    }

    pub fn send_json<T: Serialize>(&self, value: &T) {
        self.send_text(serde_json::to_string(value).unwrap_or_default());
    }

    /// Inject a channel-level failure.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .unbounded_send(Err(SessionError::Connection(reason.to_string())));
    }

    /// Remote close.
    pub fn close(&self) {
        self.to_client.close_channel();
    }

    /// Next message the client sent; `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_next().ok().flatten()
    }
}
