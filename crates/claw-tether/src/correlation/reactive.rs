//! Reactive correlation: one awaited response per request.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::table::{CorrelationTable, Outcome, Retention};
use super::{current_runtime, field_str, new_operation_id, spawn_listener, stamp};
use crate::error::{CorrelationError, TransportError};
use crate::manager::ConnectionManager;

const STATUS_FIELD: &str = "status";
const DATA_FIELD: &str = "data";

/// Reactive correlation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactiveConfig {
    /// Envelope field carrying the operation id.
    pub id_field: String,
    /// Default per-call timeout.
    pub timeout: Duration,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Ok(Value),
    Error(Value),
}

impl Reply {
    /// Parse `{ id, status: "Ok" | "Error", data? }`. Anything else is not a response.
    fn parse(message: &Value) -> Option<Self> {
        let data = message.get(DATA_FIELD).cloned().unwrap_or(Value::Null);
        match field_str(message, STATUS_FIELD)? {
            "Ok" => Some(Self::Ok(data)),
            "Error" => Some(Self::Error(data)),
            _ => None,
        }
    }
}

/// Turns request/response exchanges into awaitable calls.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use serde_json::json;
/// # use claw_tether::{ConnectionManager, ReactiveCorrelator, ReactiveConfig};
/// # async fn demo(manager: Arc<ConnectionManager>) -> Result<(), claw_tether::CorrelationError> {
/// let rpc = ReactiveCorrelator::new(manager, ReactiveConfig::default())?;
/// let reply = rpc.call(json!({"op": "status"})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ReactiveCorrelator {
    manager: Arc<ConnectionManager>,
    config: ReactiveConfig,
    table: Arc<CorrelationTable<Reply>>,
    listener: JoinHandle<()>,
}

impl ReactiveCorrelator {
    /// Attach to a manager.
    ///
    /// Fails with a configuration error outside a Tokio runtime.
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: ReactiveConfig,
    ) -> Result<Self, TransportError> {
        let runtime = current_runtime()?;
        let table = CorrelationTable::new(Retention::Exclusive, runtime.clone());

        let listener = {
            let table = Arc::clone(&table);
            let id_field = config.id_field.clone();
            spawn_listener(&runtime, &manager, move |message| {
                let Some(id) = field_str(message, &id_field) else {
                    return;
                };
                let Some(reply) = Reply::parse(message) else {
                    return;
                };
                if !table.fulfil(id, reply) {
                    trace!(%id, "ignoring response with no pending call");
                }
            })
        };

        Ok(Self {
            manager,
            config,
            table,
            listener,
        })
    }

    /// Send `payload` and wait for the correlated response, using the
    /// configured timeout. Resolves with the response's `data`.
    pub async fn call(&self, payload: Value) -> Result<Value, CorrelationError> {
        self.call_with_id(new_operation_id(), payload, self.config.timeout)
            .await
    }

    /// Like [`call`](Self::call) with an explicit timeout.
    pub async fn call_with_timeout(
        &self,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CorrelationError> {
        self.call_with_id(new_operation_id(), payload, timeout).await
    }

    /// Like [`call_with_timeout`](Self::call_with_timeout) with a caller-chosen id.
    ///
    /// Fails with `DuplicateId` while another call with the same id is pending.
    pub async fn call_with_id(
        &self,
        id: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CorrelationError> {
        let id = id.into();
        if self.manager.is_closed() {
            return Err(CorrelationError::ConnectionClosed { id });
        }

        let envelope = stamp(payload, &self.config.id_field, &id)?;
        let waiter = self.table.register(&id)?;
        self.manager.send(envelope)?;
        debug!(%id, "call sent");

        match waiter.wait(timeout, &self.manager.shutdown_token()).await {
            Outcome::Delivered(Reply::Ok(data)) => Ok(data),
            Outcome::Delivered(Reply::Error(data)) => Err(CorrelationError::Remote { id, data }),
            Outcome::TimedOut => {
                warn!(%id, timeout_ms = timeout.as_millis() as u64, "call timed out");
                Err(CorrelationError::Timeout { id, after: timeout })
            }
            Outcome::Closed => Err(CorrelationError::ConnectionClosed { id }),
        }
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.table.len()
    }
}

impl Drop for ReactiveCorrelator {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
