//! In-process transport.
//!
//! Every accepted connection hands a [`MemoryPeer`] (the server side) to the
//! [`MemoryPeers`] receiver returned by [`MemoryConnector::new`]. Connection
//! attempts can be scripted to fail, which makes backoff, heartbeat and
//! correlation behaviour observable without sockets.

use std::sync::Arc;

use futures::channel::mpsc as chan;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Connection, ConnectionParams, Connector};
use crate::error::TransportError;
use crate::frame::WireFrame;

#[derive(Debug)]
struct ConnectorState {
    failures_remaining: u32,
    refusing: bool,
    attempts: u32,
    last_params: Option<ConnectionParams>,
}

/// Connector producing in-process connections.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    /// Create a connector and the receiver for its server-side peers.
    #[must_use]
    pub fn new() -> (Self, MemoryPeers) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(Mutex::new(ConnectorState {
                failures_remaining: 0,
                refusing: false,
                attempts: 0,
                last_params: None,
            })),
            peers: peers_tx,
        };
        (connector, MemoryPeers(peers_rx))
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures_remaining = n;
    }

    /// Fail every attempt until switched off again.
    pub fn set_refusing(&self, refusing: bool) {
        self.state.lock().refusing = refusing;
    }

    /// Number of connection attempts so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Parameters used by the most recent attempt.
    #[must_use]
    pub fn last_params(&self) -> Option<ConnectionParams> {
        self.state.lock().last_params.clone()
    }

    fn accept(&self, params: &ConnectionParams) -> Result<Connection, TransportError> {
        {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.last_params = Some(params.clone());
            if state.refusing {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(TransportError::Connect("connection refused".to_string()));
            }
        }

        let (client_tx, peer_rx) = chan::unbounded::<WireFrame>();
        let (peer_tx, client_rx) = chan::unbounded::<Result<WireFrame, TransportError>>();

        let peer = MemoryPeer {
            to_client: Some(peer_tx),
            from_client: peer_rx,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("no peer listener".to_string()))?;

        let sink = client_tx.sink_map_err(|_| TransportError::Connect("peer gone".to_string()));
        Ok(Connection::new(sink, client_rx))
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectionParams,
    ) -> BoxFuture<'a, Result<Connection, TransportError>> {
        let result = self.accept(params);
        Box::pin(async move { result })
    }
}

/// Receives the server side of every accepted in-process connection.
#[derive(Debug)]
pub struct MemoryPeers(mpsc::UnboundedReceiver<MemoryPeer>);

impl MemoryPeers {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.0.recv().await
    }

    /// Take an already accepted connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.0.try_recv().ok()
    }
}

/// Server side of an in-process connection. Dropping it closes the connection.
#[derive(Debug)]
pub struct MemoryPeer {
    to_client: Option<chan::UnboundedSender<Result<WireFrame, TransportError>>>,
    from_client: chan::UnboundedReceiver<WireFrame>,
}

impl MemoryPeer {
    /// Push a frame to the client. Returns false once the client is gone.
    pub fn send(&self, frame: WireFrame) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.unbounded_send(Ok(frame)).is_ok())
    }

    /// Push a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(WireFrame::Text(text.into()))
    }

    /// Push a JSON text frame to the client.
    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Make the client's read side fail.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.to_client.as_ref().is_some_and(|tx| {
            tx.unbounded_send(Err(TransportError::Connect(reason.into())))
                .is_ok()
        })
    }

    /// Close the connection from the server side.
    pub fn close(&mut self) {
        self.to_client = None;
    }

    /// Next frame written by the client, or `None` once it hung up.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.from_client.next().await
    }

    /// Next frame written by the client, parsed as JSON. Non-JSON frames are skipped.
    pub async fn recv_json(&mut self) -> Option<Value> {
        while let Some(frame) = self.recv().await {
            if let Ok(value) = serde_json::from_slice(frame.as_bytes()) {
                return Some(value);
            }
        }
        None
    }

    /// Whether the client still holds its end.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.to_client.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}
