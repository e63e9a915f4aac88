//! Frames flowing through the pipeline.

use serde_json::Value;

use crate::error::TransportError;

/// A frame as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl WireFrame {
    /// Raw bytes of the frame.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// A frame inside the plugin pipeline.
///
/// Outbound frames usually start as [`Frame::Value`] and are turned into wire
/// frames by the codec plugin; inbound frames start as wire frames and are
/// decoded into values.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Structured value (not yet encoded, or already decoded).
    Value(Value),
}

impl Frame {
    /// The structured value, if this frame carries one.
    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Convert into a wire frame. Structured values must be encoded first.
    pub fn into_wire(self) -> Result<WireFrame, TransportError> {
        match self {
            Self::Text(text) => Ok(WireFrame::Text(text)),
            Self::Binary(bytes) => Ok(WireFrame::Binary(bytes)),
            Self::Value(_) => Err(TransportError::Unencoded),
        }
    }
}

impl From<WireFrame> for Frame {
    fn from(frame: WireFrame) -> Self {
        match frame {
            WireFrame::Text(text) => Self::Text(text),
            WireFrame::Binary(bytes) => Self::Binary(bytes),
        }
    }
}

impl From<Value> for Frame {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}
