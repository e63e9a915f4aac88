//! Error types for claw-tether.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Errors raised by the transport, the plugin pipeline and the connection manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// A send was attempted while the connection was not open.
    #[error("not connected")]
    NotConnected,

    /// The manager was permanently closed.
    #[error("connection manager closed")]
    Closed,

    /// Invalid configuration or misuse of the builder API.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Opening the physical connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connection parameter resolver failed.
    #[error("failed to resolve connection parameters: {0}")]
    Resolve(String),

    /// A plugin refused an outbound frame.
    #[error("send vetoed by plugin '{plugin}': {reason}")]
    Vetoed {
        /// Name of the vetoing plugin.
        plugin: &'static str,
        /// Reason given by the plugin.
        reason: String,
    },

    /// A structured frame reached the wire without being encoded.
    #[error("structured frame reached the wire without a codec")]
    Unencoded,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    Backpressure,

    /// Encoding an outbound frame failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors raised by a [`Codec`](crate::pipeline::codec::Codec).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// An inbound frame could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A structured value could not be encoded.
    #[error("encoding failed: {0}")]
    Encode(String),
}

/// Errors surfaced to the single caller awaiting a correlated operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CorrelationError {
    /// No correlated response arrived in time.
    #[error("operation {id} timed out after {after:?}")]
    Timeout {
        /// Operation id.
        id: String,
        /// Configured timeout.
        after: Duration,
    },

    /// The connection was permanently closed while the operation was pending.
    #[error("connection closed while operation {id} was pending")]
    ConnectionClosed {
        /// Operation id.
        id: String,
    },

    /// The peer answered with an error status.
    #[error("operation {id} failed remotely: {data}")]
    Remote {
        /// Operation id.
        id: String,
        /// Error payload sent by the peer.
        data: Value,
    },

    /// The id is already in flight.
    #[error("operation id already in flight: {0}")]
    DuplicateId(String),

    /// Outbound payloads must be JSON objects so the id field can be added.
    #[error("payload must be a JSON object")]
    PayloadNotObject,

    /// The request could not be sent.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Convenience alias for transport results.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
