//! Claw-tether - durable client-side WebSocket transport.
//!
//! Keeps one long-lived connection alive across network drops, credential
//! changes and idle periods, and layers request/response correlation on top.
//!
//! - [`ConnectionManager`] owns the connection: it resolves fresh
//!   [`ConnectionParams`] before every attempt, reconnects with backoff
//!   (indefinitely, unless [`ReconnectConfig::max_attempts`] is set) and
//!   publishes its [`ConnectionState`] and [`ConnectionEvent`]s.
//! - [`Plugin`]s intercept lifecycle and traffic: [`AuthGate`] holds connection
//!   attempts until the user is signed in, [`HeartbeatMonitor`] recycles
//!   unresponsive connections and [`CodecPlugin`] converts JSON values.
//! - [`ReactiveCorrelator`] and [`CachedCorrelator`] turn pushed messages
//!   into awaitable operations.
//!
//! ```no_run
//! use std::sync::Arc;
//! use claw_tether::{
//!     CodecPlugin, ConnectionManager, ConnectionParams, HeartbeatConfig, HeartbeatMonitor,
//!     ReactiveConfig, ReactiveCorrelator, WebSocketConnector,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConnectionManager::builder(
//!     WebSocketConnector::new(),
//!     ConnectionParams::new("wss://example.com/ws"),
//! )
//! .with_plugin(Arc::new(HeartbeatMonitor::new(HeartbeatConfig::default())))
//! .with_plugin(Arc::new(CodecPlugin::json()))
//! .build();
//! manager.open()?;
//!
//! let rpc = ReactiveCorrelator::new(Arc::new(manager), ReactiveConfig::default())?;
//! let status = rpc.call(serde_json::json!({"op": "status"})).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod frame;
pub mod manager;
pub mod pipeline;
pub mod state;
pub mod transport;

pub use backoff::{BackoffStrategy, ReconnectConfig, RetryAttempt, reconnect_with_backoff};
pub use config::TransportConfig;
pub use correlation::cached::{CachedConfig, CachedCorrelator};
pub use correlation::new_operation_id;
pub use correlation::reactive::{ReactiveConfig, ReactiveCorrelator};
pub use error::{CodecError, CorrelationError, Result, TransportError};
pub use events::{ConnectionEvent, DisconnectReason};
pub use frame::{Frame, WireFrame};
pub use manager::{ConnectionManager, ConnectionManagerBuilder};
pub use pipeline::auth::{AuthFlag, AuthGate, AuthState};
pub use pipeline::codec::{Codec, CodecPlugin, JsonCodec};
pub use pipeline::heartbeat::{HeartbeatConfig, HeartbeatMonitor, HeartbeatSnapshot};
pub use pipeline::{ConnectionLink, Flow, Pipeline, Plugin};
pub use state::{ConnectionState, Generation};
pub use transport::memory::{MemoryConnector, MemoryPeer, MemoryPeers};
pub use transport::websocket::WebSocketConnector;
pub use transport::{Connection, ConnectionParams, Connector, ParamsResolver};
