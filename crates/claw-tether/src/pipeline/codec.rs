//! Payload encoding.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::warn;

use super::{Flow, Plugin};
use crate::error::{CodecError, TransportError};
use crate::frame::{Frame, WireFrame};

/// Converts structured values to wire frames and back.
pub trait Codec: Send + Sync + 'static {
    /// Serialize a value for the wire.
    fn encode(&self, value: &Value) -> Result<WireFrame, CodecError>;

    /// Deserialize a wire frame.
    fn decode(&self, frame: &WireFrame) -> Result<Value, CodecError>;
}

/// JSON over text frames. Binary frames are decoded as UTF-8 JSON as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<WireFrame, CodecError> {
        serde_json::to_string(value)
            .map(WireFrame::Text)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &WireFrame) -> Result<Value, CodecError> {
        serde_json::from_slice(frame.as_bytes()).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

/// Plugin that encodes outbound values and decodes inbound frames.
///
/// A frame that fails to decode is logged and dropped; it never reaches later
/// plugins, never fails a caller and never closes the connection.
#[derive(Debug, Default)]
pub struct CodecPlugin<C = JsonCodec> {
    codec: C,
    dropped: AtomicU64,
}

impl<C: Codec> CodecPlugin<C> {
    /// Wrap a codec.
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of malformed inbound frames dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl CodecPlugin<JsonCodec> {
    /// JSON codec plugin.
    #[must_use]
    pub fn json() -> Self {
        Self::new(JsonCodec)
    }
}

impl<C: Codec> Plugin for CodecPlugin<C> {
    fn name(&self) -> &'static str {
        "codec"
    }

    fn on_before_send(&self, frame: Frame) -> Result<Frame, TransportError> {
        match frame {
            Frame::Value(value) => Ok(self.codec.encode(&value)?.into()),
            wire => Ok(wire),
        }
    }

    fn on_message(&self, frame: Frame) -> Flow {
        let wire = match frame {
            Frame::Text(text) => WireFrame::Text(text),
            Frame::Binary(bytes) => WireFrame::Binary(bytes),
            decoded @ Frame::Value(_) => return Flow::Continue(decoded),
        };

        match self.codec.decode(&wire) {
            Ok(value) => Flow::Continue(Frame::Value(value)),
            Err(e) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, dropped, len = wire.as_bytes().len(), "dropping malformed frame");
                Flow::Consumed
            }
        }
    }
}
