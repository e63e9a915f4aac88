//! WebSocket connector over tokio-tungstenite.

use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::debug;

use super::{Connection, ConnectionParams, Connector};
use crate::error::TransportError;
use crate::frame::WireFrame;

/// Opens WebSocket connections.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketConnector {
    /// Create a connector with the default 10s handshake timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn open(&self, params: &ConnectionParams) -> Result<Connection, TransportError> {
        if !params.url.starts_with("ws://") && !params.url.starts_with("wss://") {
            return Err(TransportError::Configuration(format!(
                "url must start with ws:// or wss://: {}",
                params.url
            )));
        }

        let mut request = params
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid request: {e}")))?;

        for (name, value) in &params.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Configuration(format!("bad header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Configuration(format!("bad header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Connect("connection timeout".to_string()))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!(url = %params.url, "websocket handshake complete");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Connect(format!("write failed: {e}")))
            .with(|frame: WireFrame| {
                future::ready(Ok::<_, TransportError>(match frame {
                    WireFrame::Text(text) => Message::Text(text),
                    WireFrame::Binary(bytes) => Message::Binary(bytes),
                }))
            });

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(WireFrame::Text(text))),
                Ok(Message::Binary(bytes)) => Some(Ok(WireFrame::Binary(bytes))),
                // Protocol-level ping/pong is answered by tungstenite itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Ok(Message::Close(_)) => None,
                Err(e) => Some(Err(TransportError::Connect(e.to_string()))),
            })
        });

        Ok(Connection::new(sink, stream))
    }
}

impl Connector for WebSocketConnector {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectionParams,
    ) -> BoxFuture<'a, Result<Connection, TransportError>> {
        Box::pin(self.open(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout() {
        let connector = WebSocketConnector::new();
        assert_eq!(connector.connect_timeout, Duration::from_secs(10));

        let connector = connector.with_connect_timeout(Duration::from_millis(250));
        assert_eq!(connector.connect_timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let connector = WebSocketConnector::new();
        let result = connector
            .connect(&ConnectionParams::new("https://example.com"))
            .await;
        assert!(matches!(result, Err(TransportError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let connector = WebSocketConnector::new().with_connect_timeout(Duration::from_secs(2));
        let result = connector
            .connect(&ConnectionParams::new(format!("ws://{addr}")))
            .await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
