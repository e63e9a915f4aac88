//! Request/response correlation on top of the connection manager.
//!
//! Two modes share one slot table:
//!
//! - [`reactive::ReactiveCorrelator`]: `call(payload)` stamps a fresh id onto
//!   the payload, sends it and resolves with the first response carrying the
//!   same id, or fails with `Timeout` or `ConnectionClosed`.
//! - [`cached::CachedCorrelator`]: every `{ requestId, value }` push is stored
//!   whether or not anybody waits for it, and `wait_for(id)` resolves from the
//!   store. Entries are evicted a grace period after they arrive.
//!
//! Each correlator runs one background listener for its whole lifetime. It
//! reads the manager's lossless message feed, not the event broadcast, so a
//! burst of unrelated pushes cannot evict a response. Both need decoded
//! frames, so the manager's pipeline must include a codec plugin.

pub mod cached;
pub mod reactive;
pub(crate) mod table;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{CorrelationError, TransportError};
use crate::manager::ConnectionManager;

/// Generate a fresh operation id.
#[must_use]
pub fn new_operation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Add `field: id` to an object payload.
pub(crate) fn stamp(payload: Value, field: &str, id: &str) -> Result<Value, CorrelationError> {
    let Value::Object(mut map) = payload else {
        return Err(CorrelationError::PayloadNotObject);
    };
    map.insert(field.to_string(), Value::String(id.to_string()));
    Ok(Value::Object(map))
}

/// The string at `field`, if present.
pub(crate) fn field_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field)?.as_str()
}

/// Handle of the current Tokio runtime.
pub(crate) fn current_runtime() -> Result<Handle, TransportError> {
    Handle::try_current().map_err(|_| {
        TransportError::Configuration("correlators must be created inside a Tokio runtime".into())
    })
}

/// Feed every decoded inbound message to `on_message` until the manager closes.
pub(crate) fn spawn_listener<F>(
    runtime: &Handle,
    manager: &ConnectionManager,
    mut on_message: F,
) -> JoinHandle<()>
where
    F: FnMut(&Value) + Send + 'static,
{
    let mut frames = manager.message_feed();
    let shutdown = manager.shutdown_token();

    runtime.spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                () = shutdown.cancelled() => return,
                frame = frames.recv() => frame,
            };

            let Some(frame) = frame else { return };
            if let Some(value) = frame.as_value() {
                on_message(value);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stamp_adds_id_field() {
        let stamped = stamp(json!({"x": 1}), "id", "op-1").expect("object payload");
        assert_eq!(stamped, json!({"x": 1, "id": "op-1"}));
    }

    #[test]
    fn test_stamp_overrides_existing_id() {
        let stamped = stamp(json!({"id": "stale"}), "id", "fresh").expect("object payload");
        assert_eq!(field_str(&stamped, "id"), Some("fresh"));
    }

    #[test]
    fn test_stamp_rejects_non_objects() {
        assert_eq!(
            stamp(json!([1, 2]), "id", "op"),
            Err(CorrelationError::PayloadNotObject)
        );
    }

    #[test]
    fn test_operation_ids_are_unique() {
        assert_ne!(new_operation_id(), new_operation_id());
    }

    #[test]
    fn test_current_runtime_outside_tokio() {
        assert!(matches!(
            current_runtime(),
            Err(TransportError::Configuration(_))
        ));
    }
}
