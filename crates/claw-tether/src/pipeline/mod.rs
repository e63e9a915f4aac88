//! Plugin pipeline.
//!
//! A [`Plugin`] observes connection lifecycle events and intercepts frames.
//! Plugins are registered before the manager is first opened and are invoked
//! in a fixed order:
//!
//! - `on_before_connect`, `on_open`, `on_close`: registration order.
//! - `on_before_send`: registration order. Any plugin may transform the frame
//!   or veto the send; a veto is returned to the caller.
//! - `on_message`: registration order. Any plugin may consume the frame, in
//!   which case later plugins and consumers never see it.
//!
//! The usual stack is `AuthGate`, `HeartbeatMonitor`, `CodecPlugin`. The
//! codec goes last so it encodes after every other send hook ran, and decodes
//! only frames the heartbeat monitor did not swallow.

pub mod auth;
pub mod codec;
pub mod heartbeat;

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::error::TransportError;
use crate::events::DisconnectReason;
use crate::frame::{Frame, WireFrame};
use crate::state::Generation;
use crate::transport::ConnectionParams;

/// Outcome of an inbound hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Hand the (possibly transformed) frame to the next hook.
    Continue(Frame),
    /// Stop here; the frame is not delivered.
    Consumed,
}

/// Cross-cutting behaviour attached to a connection manager.
///
/// Every hook has a no-op default.
pub trait Plugin: Send + Sync + 'static {
    /// Short name used in logs and veto errors.
    fn name(&self) -> &'static str;

    /// Runs before every connection attempt. May wait; an error fails the attempt.
    fn on_before_connect<'a>(
        &'a self,
        _params: &'a ConnectionParams,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(future::ready(Ok(())))
    }

    /// A physical connection was opened.
    fn on_open(&self, _link: &ConnectionLink) {}

    /// A physical connection ended, for whatever reason.
    fn on_close(&self, _generation: Generation, _reason: &DisconnectReason) {}

    /// Transform or veto an outbound frame.
    fn on_before_send(&self, frame: Frame) -> Result<Frame, TransportError> {
        Ok(frame)
    }

    /// Inspect, transform or consume an inbound frame.
    fn on_message(&self, frame: Frame) -> Flow {
        Flow::Continue(frame)
    }
}

/// An ordered, frozen list of plugins.
#[derive(Default)]
pub struct Pipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline from plugins in registration order.
    #[must_use]
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Run every `on_before_connect` hook in order.
    pub async fn before_connect(&self, params: &ConnectionParams) -> Result<(), TransportError> {
        for plugin in &self.plugins {
            plugin.on_before_connect(params).await?;
        }
        Ok(())
    }

    /// Notify every plugin that a connection opened.
    pub fn opened(&self, link: &ConnectionLink) {
        for plugin in &self.plugins {
            plugin.on_open(link);
        }
    }

    /// Notify every plugin that a connection ended.
    pub fn closed(&self, generation: Generation, reason: &DisconnectReason) {
        for plugin in &self.plugins {
            plugin.on_close(generation, reason);
        }
    }

    /// Run every `on_before_send` hook in order.
    pub fn before_send(&self, mut frame: Frame) -> Result<Frame, TransportError> {
        for plugin in &self.plugins {
            frame = plugin.on_before_send(frame)?;
        }
        Ok(frame)
    }

    /// Run every `on_message` hook in order. `None` if a plugin consumed the frame.
    pub fn inbound(&self, mut frame: Frame) -> Option<Frame> {
        for plugin in &self.plugins {
            match plugin.on_message(frame) {
                Flow::Continue(next) => frame = next,
                Flow::Consumed => {
                    debug!(plugin = plugin.name(), "inbound frame consumed");
                    return None;
                }
            }
        }
        Some(frame)
    }
}

/// Handle to one physical connection, given to plugins in `on_open`.
///
/// The link is scoped to its [`Generation`]: once that connection ends,
/// every operation on the link is a no-op or fails with `NotConnected`, so
/// timers from a superseded connection cannot touch its successor.
#[derive(Clone)]
pub struct ConnectionLink {
    generation: Generation,
    outbound: mpsc::Sender<WireFrame>,
    pipeline: Arc<Pipeline>,
    token: CancellationToken,
    recycle_reason: Arc<Mutex<Option<DisconnectReason>>>,
}

impl std::fmt::Debug for ConnectionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLink")
            .field("generation", &self.generation)
            .field("closed", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ConnectionLink {
    pub(crate) fn new(
        generation: Generation,
        outbound: mpsc::Sender<WireFrame>,
        pipeline: Arc<Pipeline>,
        token: CancellationToken,
    ) -> Self {
        Self {
            generation,
            outbound,
            pipeline,
            token,
            recycle_reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Generation of the connection this link belongs to.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Send a frame through every `on_before_send` hook, then to the wire.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        let frame = self.pipeline.before_send(frame)?;
        self.send_raw(frame.into_wire()?)
    }

    /// Send a control frame straight to the wire, skipping the send hooks.
    pub fn send_raw(&self, frame: WireFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backpressure,
            TrySendError::Closed(_) => TransportError::NotConnected,
        })
    }

    /// Tear this connection down and let the manager reconnect.
    ///
    /// Treated exactly like an unexpected close. The first reason wins; a
    /// stale link is ignored.
    pub fn recycle(&self, reason: DisconnectReason) {
        if self.is_closed() {
            return;
        }
        {
            let mut slot = self.recycle_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// Whether this connection has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this connection has ended.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub(crate) fn take_recycle_reason(&self) -> Option<DisconnectReason> {
        self.recycle_reason.lock().take()
    }
}
