//! Lifecycle wrapper around one duplex channel, shared by both client roles.
//!
//! `connect` moves the manager to `Connecting` and spawns a driver task. The
//! driver opens the transport, flips to `Connected`, then multiplexes the
//! outbound queue and inbound dispatch until the channel ends or `close` is
//! called. Inbound text is parsed into an [`Envelope`] and handed to the
//! role's [`MessageHandler`] by its `type`.
//!
//! Sends are at-most-once: anything sent while not `Connected`/`Streaming` is
//! dropped, and there is no delivery confirmation or reconnect.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::OverflowPolicy;
use crate::error::SessionError;
use crate::models::{ConnectionState, Envelope};
use crate::transport::{Duplex, Transport};

/// Per-role reaction to channel events. Called from the driver task, one
/// callback at a time.
#[async_trait]
pub trait MessageHandler: Send + 'static {
    fn on_connected(&mut self, _conn: &ConnectionManager) {}

    /// A `ProtocolError` here discards this one message; the channel stays open.
    fn on_message(&mut self, kind: &str, data: Value) -> Result<(), SessionError>;

    /// The driver has exited. `state` is where it left the manager.
    async fn on_terminated(&mut self, _state: ConnectionState) {}
}

enum OutboxTx {
    Queue(mpsc::UnboundedSender<String>),
    DropNewest(mpsc::Sender<String>),
}

enum OutboxRx {
    Queue(mpsc::UnboundedReceiver<String>),
    DropNewest(mpsc::Receiver<String>),
}

impl OutboxTx {
    fn channel(policy: OverflowPolicy, depth: usize) -> (Self, OutboxRx) {
        match policy {
            OverflowPolicy::Queue => {
                let (tx, rx) = mpsc::unbounded_channel();
                (OutboxTx::Queue(tx), OutboxRx::Queue(rx))
            }
            OverflowPolicy::DropNewest => {
                let (tx, rx) = mpsc::channel(depth.max(1));
                (OutboxTx::DropNewest(tx), OutboxRx::DropNewest(rx))
            }
        }
    }

    fn push(&self, msg: String) -> bool {
        match self {
            OutboxTx::Queue(tx) => tx.send(msg).is_ok(),
            OutboxTx::DropNewest(tx) => tx.try_send(msg).is_ok(),
        }
    }
}

impl OutboxRx {
    async fn recv(&mut self) -> Option<String> {
        match self {
            OutboxRx::Queue(rx) => rx.recv().await,
            OutboxRx::DropNewest(rx) => rx.recv().await,
        }
    }
}

struct Shared {
    label: String,
    state: watch::Sender<ConnectionState>,
    outbox: Mutex<Option<OutboxTx>>,
    cancel: Mutex<Option<CancellationToken>>,
    overflow: OverflowPolicy,
    depth: usize,
}

/// Cheap to clone; clones share the same channel and state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(label: impl Into<String>, overflow: OverflowPolicy, depth: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                state,
                outbox: Mutex::new(None),
                cancel: Mutex::new(None),
                overflow,
                depth,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub(crate) fn transition(&self, to: ConnectionState) {
        let from = self.shared.state.send_replace(to);
        if from != to {
            tracing::debug!("{}: {from} -> {to}", self.shared.label);
        }
    }

    /// `Connected` → `Streaming`. No-op from any other state.
    pub fn mark_streaming(&self) -> bool {
        self.shared.state.send_if_modified(|s| {
            if *s == ConnectionState::Connected {
                *s = ConnectionState::Streaming;
                true
            } else {
                false
            }
        })
    }

    /// Start connecting to `endpoint`. Returns immediately; progress is
    /// observed through [`state`](Self::state) and the handler callbacks.
    pub fn connect<H: MessageHandler>(
        &self,
        transport: Arc<dyn Transport>,
        endpoint: &str,
        handler: H,
    ) -> Result<(), SessionError> {
        let token = {
            let mut cancel = self.shared.cancel.lock();
            if cancel.is_some() {
                return Err(SessionError::AlreadyActive);
            }
            let token = CancellationToken::new();
            *cancel = Some(token.clone());
            token
        };

        self.transition(ConnectionState::Connecting);
        tracing::info!("{}: connecting to {endpoint}", self.shared.label);

        let conn = self.clone();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move { conn.drive(transport, endpoint, handler, token).await });
        Ok(())
    }

    /// Fire-and-forget. Returns whether the message was queued.
    pub fn send(&self, msg: String) -> bool {
        if !self.state().can_send() {
            return false;
        }
        let queued = match self.shared.outbox.lock().as_ref() {
            Some(outbox) => outbox.push(msg),
            None => false,
        };
        if !queued {
            tracing::debug!("{}: outbound message dropped", self.shared.label);
        }
        queued
    }

    pub fn send_json<T: Serialize>(&self, msg: &T) -> bool {
        match serde_json::to_string(msg) {
            Ok(text) => self.send(text),
            Err(e) => {
                tracing::warn!("{}: could not serialize outbound message: {e}", self.shared.label);
                false
            }
        }
    }

    /// Transition to `Disconnected` and stop the driver. Repeated calls are no-ops.
    pub fn close(&self) {
        if let Some(token) = self.shared.cancel.lock().take() {
            token.cancel();
            tracing::info!("{}: closed", self.shared.label);
        }
        self.shared.outbox.lock().take();
        self.transition(ConnectionState::Disconnected);
    }

    /// Parse one inbound record and route it by `type`.
    pub fn dispatch<H: MessageHandler>(&self, handler: &mut H, text: &str) -> Result<(), SessionError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        handler.on_message(&envelope.kind, envelope.data)
    }

    async fn drive<H: MessageHandler>(
        self,
        transport: Arc<dyn Transport>,
        endpoint: String,
        mut handler: H,
        token: CancellationToken,
    ) {
        let label = self.shared.label.clone();

        let opened = tokio::select! {
            res = transport.open(&endpoint) => res,
            _ = token.cancelled() => {
                handler.on_terminated(ConnectionState::Disconnected).await;
                return;
            }
        };

        let Duplex { mut sink, mut stream } = match opened {
            Ok(duplex) => duplex,
            Err(e) => {
                tracing::warn!("{label}: {e}");
                let state = self.finish(&token, ConnectionState::Error);
                handler.on_terminated(state).await;
                return;
            }
        };

        let (outbox, mut outbound) = OutboxTx::channel(self.shared.overflow, self.shared.depth);
        let live = {
            let _cancel = self.shared.cancel.lock();
            if token.is_cancelled() {
                false
            } else {
                *self.shared.outbox.lock() = Some(outbox);
                self.transition(ConnectionState::Connected);
                true
            }
        };
        if !live {
            handler.on_terminated(ConnectionState::Disconnected).await;
            return;
        }
        tracing::info!("{label}: connected");
        handler.on_connected(&self);

        let ended = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = sink.close().await;
                    break ConnectionState::Disconnected;
                }
                Some(msg) = outbound.recv() => {
                    if let Err(e) = sink.send(msg).await {
                        tracing::warn!("{label}: send failed: {e}");
                        break ConnectionState::Error;
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => {
                        if let Err(e) = self.dispatch(&mut handler, &text) {
                            tracing::warn!("{label}: discarding inbound message: {e}");
                        }
                    }
                    Some(Err(SessionError::ChannelClosed)) | None => {
                        tracing::info!("{label}: channel closed by remote");
                        break ConnectionState::Disconnected;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("{label}: {e}");
                        break ConnectionState::Error;
                    }
                }
            }
        };

        let state = self.finish(&token, ended);
        handler.on_terminated(state).await;
    }

    /// Record how the driver ended unless `close` already took over.
    fn finish(&self, token: &CancellationToken, ended: ConnectionState) -> ConnectionState {
        let mut cancel = self.shared.cancel.lock();
        if token.is_cancelled() {
            return ConnectionState::Disconnected;
        }
        cancel.take();
        self.shared.outbox.lock().take();
        self.transition(ended);
        ended
    }
}
