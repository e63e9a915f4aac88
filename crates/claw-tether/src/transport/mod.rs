//! Physical connection abstraction.
//!
//! The manager never touches sockets directly: it resolves
//! [`ConnectionParams`] through a [`ParamsResolver`] and hands them to a
//! [`Connector`], which produces a [`Connection`] (a frame sink plus a frame
//! stream). [`websocket::WebSocketConnector`] is the production connector and
//! [`memory::MemoryConnector`] an in-process one.

pub mod memory;
pub mod websocket;

use std::future::Future;
use std::pin::Pin;

use futures::future::BoxFuture;
use futures::{Sink, Stream};

use crate::error::TransportError;
use crate::frame::WireFrame;

/// Parameters for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// WebSocket URL (`ws://` or `wss://`).
    pub url: String,
    /// Extra handshake headers, e.g. credentials.
    pub headers: Vec<(String, String)>,
}

impl ConnectionParams {
    /// Parameters with no extra headers.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Add a handshake header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add an `Authorization: Bearer` header.
    #[must_use]
    pub fn with_bearer_token(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }
}

/// Produces fresh connection parameters before every connection attempt.
///
/// May re-fetch a token or URL; a failure counts as a failed attempt and feeds
/// the backoff loop. Closures returning a future implement this trait.
pub trait ParamsResolver: Send + Sync + 'static {
    /// Resolve parameters for the next attempt.
    fn resolve(&self) -> BoxFuture<'_, Result<ConnectionParams, TransportError>>;
}

impl<F, Fut> ParamsResolver for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ConnectionParams, TransportError>> + Send + 'static,
{
    fn resolve(&self) -> BoxFuture<'_, Result<ConnectionParams, TransportError>> {
        Box::pin(self())
    }
}

impl ParamsResolver for ConnectionParams {
    fn resolve(&self) -> BoxFuture<'_, Result<ConnectionParams, TransportError>> {
        let params = self.clone();
        Box::pin(async move { Ok(params) })
    }
}

/// Outbound half of a physical connection.
pub type WireSink = Pin<Box<dyn Sink<WireFrame, Error = TransportError> + Send>>;

/// Inbound half of a physical connection.
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireFrame, TransportError>> + Send>>;

/// A live physical connection. Dropping it releases the underlying socket.
pub struct Connection {
    /// Frames written here go to the peer.
    pub sink: WireSink,
    /// Frames from the peer. Ends when the peer closes.
    pub stream: WireStream,
}

impl Connection {
    /// Box a sink and a stream into a connection.
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<WireFrame, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<WireFrame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens physical connections.
pub trait Connector: Send + Sync + 'static {
    /// Open a connection using the resolved parameters.
    fn connect<'a>(
        &'a self,
        params: &'a ConnectionParams,
    ) -> BoxFuture<'a, Result<Connection, TransportError>>;
}
