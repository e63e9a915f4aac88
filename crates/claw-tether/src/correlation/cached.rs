//! Cached correlation: results pushed out of band, looked up by id.
//!
//! Used for long-running operations whose result may arrive before or after
//! anybody starts waiting, and may be wanted by several callers at once.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use super::table::{CorrelationTable, Outcome, Retention};
use super::{current_runtime, field_str, new_operation_id, spawn_listener, stamp};
use crate::error::{CorrelationError, TransportError};
use crate::manager::ConnectionManager;

/// Cached correlation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedConfig {
    /// Push field carrying the operation id.
    pub id_field: String,
    /// Push field carrying the result.
    pub value_field: String,
    /// How long a result is kept after it arrives.
    pub grace: Duration,
    /// Default `wait_for` timeout.
    pub wait_timeout: Duration,
}

impl Default for CachedConfig {
    fn default() -> Self {
        Self {
            id_field: "requestId".to_string(),
            value_field: "value".to_string(),
            grace: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(600),
        }
    }
}

/// Stores every `{ requestId, value }` push and serves lookups by id.
#[derive(Debug)]
pub struct CachedCorrelator {
    manager: Arc<ConnectionManager>,
    config: CachedConfig,
    table: Arc<CorrelationTable<Value>>,
    listener: JoinHandle<()>,
}

impl CachedCorrelator {
    /// Attach to a manager.
    ///
    /// Fails with a configuration error outside a Tokio runtime.
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: CachedConfig,
    ) -> Result<Self, TransportError> {
        let runtime = current_runtime()?;
        let table = CorrelationTable::new(
            Retention::Cached {
                grace: config.grace,
            },
            runtime.clone(),
        );

        let listener = {
            let table = Arc::clone(&table);
            let id_field = config.id_field.clone();
            let value_field = config.value_field.clone();
            spawn_listener(&runtime, &manager, move |message| {
                let (Some(id), Some(value)) =
                    (field_str(message, &id_field), message.get(&value_field))
                else {
                    return;
                };
                debug!(%id, "cached result received");
                table.fulfil(id, value.clone());
            })
        };

        Ok(Self {
            manager,
            config,
            table,
            listener,
        })
    }

    /// Stamp a fresh id onto `payload`, send it and return the id to wait on.
    pub fn submit(&self, payload: Value) -> Result<String, CorrelationError> {
        let id = new_operation_id();
        let envelope = stamp(payload, &self.config.id_field, &id)?;
        self.manager.send(envelope)?;
        Ok(id)
    }

    /// Wait for the result of `id`, using the configured timeout.
    ///
    /// Resolves immediately if the result is already stored. `None` after the
    /// timeout or once the connection is permanently closed.
    pub async fn wait_for(&self, id: &str) -> Option<Value> {
        self.wait_for_with_timeout(id, self.config.wait_timeout).await
    }

    /// Like [`wait_for`](Self::wait_for) with an explicit timeout.
    pub async fn wait_for_with_timeout(&self, id: &str, timeout: Duration) -> Option<Value> {
        let waiter = self.table.attach(id);
        match waiter.wait(timeout, &self.manager.shutdown_token()).await {
            Outcome::Delivered(value) => Some(value),
            Outcome::TimedOut => {
                debug!(%id, "cached wait timed out");
                None
            }
            Outcome::Closed => None,
        }
    }

    /// The stored result for `id`, without waiting.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Value> {
        self.table.get(id)
    }

    /// Number of retained entries, including empty ones being waited on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CachedCorrelator {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
