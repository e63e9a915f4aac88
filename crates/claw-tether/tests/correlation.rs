//! Correlation scenarios over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use claw_tether::{
    CachedConfig, CachedCorrelator, CodecPlugin, ConnectionManager, ConnectionParams,
    ConnectionState, CorrelationError, MemoryConnector, MemoryPeer, ReactiveConfig,
    ReactiveCorrelator, TransportError,
};
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};

const LONG: Duration = Duration::from_secs(3600);

// ============================================================================
// Test Helpers
// ============================================================================

async fn connected() -> (Arc<ConnectionManager>, MemoryPeer) {
    connected_with_event_buffer(1024).await
}

async fn connected_with_event_buffer(
    event_buffer: usize,
) -> (Arc<ConnectionManager>, MemoryPeer) {
    let (connector, mut peers) = MemoryConnector::new();
    let manager = Arc::new(
        ConnectionManager::builder(connector, ConnectionParams::new("memory://rpc"))
            .with_event_buffer(event_buffer)
            .with_plugin(Arc::new(CodecPlugin::json()))
            .build(),
    );

    let mut state = manager.watch_state();
    manager.open().expect("open");
    let peer = peers.accept().await.expect("peer");
    state
        .wait_for(|s| *s == ConnectionState::Open)
        .await
        .expect("connection opened");

    (manager, peer)
}

/// Read the next request and return its id.
async fn request_id(peer: &mut MemoryPeer, field: &str) -> String {
    let request = peer.recv_json().await.expect("request");
    request[field].as_str().expect("id is a string").to_string()
}

fn ok_response(id: &str, data: Value) -> Value {
    json!({"id": id, "status": "Ok", "data": data})
}

// ============================================================================
// Reactive mode
// ============================================================================

#[tokio::test]
async fn test_call_resolves_with_correlated_response() {
    let (manager, mut peer) = connected().await;
    let rpc = ReactiveCorrelator::new(Arc::clone(&manager), ReactiveConfig::default())
        .expect("correlator");

    let (result, ()) = tokio::join!(rpc.call(json!({"x": 1})), async {
        let request = peer.recv_json().await.expect("request");
        assert_eq!(request["x"], 1);
        let id = request["id"].as_str().expect("id").to_string();

        // A push without an id and a response to someone else are ignored.
        peer.send_json(&json!({"type": "notice"}));
        peer.send_json(&ok_response("someone-else", json!(0)));

        let response = ok_response(&id, json!({"y": 2}));
        peer.send_json(&response);
        peer.send_json(&response);
    });

    assert_eq!(result, Ok(json!({"y": 2})));
    assert_eq!(rpc.pending(), 0);

    // The replayed response is dropped without resurrecting anything.
    sleep(Duration::from_millis(20)).await;
    assert_eq!(rpc.pending(), 0);
    assert_eq!(manager.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_call_times_out_without_dangling_entry() {
    let (manager, mut peer) = connected().await;
    let rpc = ReactiveCorrelator::new(
        Arc::clone(&manager),
        ReactiveConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .expect("correlator");

    let start = Instant::now();
    let result = rpc.call(json!({"op": "slow"})).await;
    let elapsed = start.elapsed();

    let Err(CorrelationError::Timeout { id, after }) = result else {
        panic!("expected timeout");
    };
    assert_eq!(after, Duration::from_millis(100));
    assert_eq!(elapsed, Duration::from_millis(100));
    assert_eq!(rpc.pending(), 0);

    // A late answer is ignored.
    assert_eq!(request_id(&mut peer, "id").await, id);
    peer.send_json(&ok_response(&id, json!("late")));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(rpc.pending(), 0);
}

#[tokio::test]
async fn test_close_rejects_every_pending_call() {
    let (manager, mut peer) = connected().await;
    let rpc = ReactiveCorrelator::new(Arc::clone(&manager), ReactiveConfig::default())
        .expect("correlator");

    let (a, b, ()) = tokio::join!(
        rpc.call_with_id("a", json!({"n": 1}), LONG),
        rpc.call_with_id("b", json!({"n": 2}), LONG),
        async {
            peer.recv_json().await.expect("request a");
            peer.recv_json().await.expect("request b");
            assert_eq!(rpc.pending(), 2);
            manager.close();
        }
    );

    assert_eq!(a, Err(CorrelationError::ConnectionClosed { id: "a".to_string() }));
    assert_eq!(b, Err(CorrelationError::ConnectionClosed { id: "b".to_string() }));
    assert_eq!(rpc.pending(), 0);

    assert_eq!(
        rpc.call_with_id("c", json!({}), LONG).await,
        Err(CorrelationError::ConnectionClosed { id: "c".to_string() })
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_of_one_call_does_not_affect_another() {
    let (manager, mut peer) = connected().await;
    let rpc = ReactiveCorrelator::new(Arc::clone(&manager), ReactiveConfig::default())
        .expect("correlator");

    let (slow, fast, ()) = tokio::join!(
        rpc.call_with_id("slow", json!({}), Duration::from_millis(50)),
        rpc.call_with_id("fast", json!({}), Duration::from_secs(5)),
        async {
            assert_eq!(request_id(&mut peer, "id").await, "slow");
            assert_eq!(request_id(&mut peer, "id").await, "fast");
            sleep(Duration::from_millis(200)).await;
            peer.send_json(&ok_response("fast", json!("done")));
        }
    );

    assert!(matches!(slow, Err(CorrelationError::Timeout { .. })));
    assert_eq!(fast, Ok(json!("done")));
}

#[tokio::test]
async fn test_error_status_rejects_with_remote_error() {
    let (manager, mut peer) = connected().await;
    let rpc = ReactiveCorrelator::new(Arc::clone(&manager), ReactiveConfig::default())
        .expect("correlator");

    let (result, ()) = tokio::join!(rpc.call(json!({"op": "explode"})), async {
        let id = request_id(&mut peer, "id").await;
        peer.send_json(&json!({"id": id, "status": "Error", "data": {"code": 42}}));
    });

    let Err(CorrelationError::Remote { data, .. }) = result else {
        panic!("expected remote error");
    };
    assert_eq!(data, json!({"code": 42}));
}

#[tokio::test]
async fn test_custom_id_field() {
    let (manager, mut peer) = connected().await;
    let rpc = ReactiveCorrelator::new(
        Arc::clone(&manager),
        ReactiveConfig {
            id_field: "correlationId".to_string(),
            ..Default::default()
        },
    )
    .expect("correlator");

    let (result, ()) = tokio::join!(rpc.call(json!({"op": "ping"})), async {
        let id = request_id(&mut peer, "correlationId").await;
        peer.send_json(&json!({"correlationId": id, "status": "Ok", "data": true}));
    });
    assert_eq!(result, Ok(json!(true)));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_id_is_rejected_while_pending() {
    let (manager, mut peer) = connected().await;
    let rpc = ReactiveCorrelator::new(Arc::clone(&manager), ReactiveConfig::default())
        .expect("correlator");

    let (first, second) = tokio::join!(
        rpc.call_with_id("same", json!({}), Duration::from_millis(100)),
        async {
            // The first call has registered and sent by now.
            assert_eq!(request_id(&mut peer, "id").await, "same");
            rpc.call_with_id("same", json!({}), LONG).await
        }
    );

    assert!(matches!(first, Err(CorrelationError::Timeout { .. })));
    assert_eq!(second, Err(CorrelationError::DuplicateId("same".to_string())));

    // Free again once the first call is gone.
    assert!(matches!(
        rpc.call_with_id("same", json!({}), Duration::from_millis(10)).await,
        Err(CorrelationError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_response_survives_a_burst_larger_than_the_event_buffer() {
    let (manager, mut peer) = connected_with_event_buffer(16).await;
    // A subscriber that never reads, so the broadcast lags.
    let _idle_ui = manager.events();
    let rpc = ReactiveCorrelator::new(Arc::clone(&manager), ReactiveConfig::default())
        .expect("correlator");

    let (result, ()) = tokio::join!(
        rpc.call_with_timeout(json!({"x": 1}), Duration::from_secs(2)),
        async {
            let id = request_id(&mut peer, "id").await;
            peer.send_json(&ok_response(&id, json!({"y": 2})));
            for seq in 0..200 {
                peer.send_json(&json!({"type": "notice", "seq": seq}));
            }
        }
    );

    assert_eq!(result, Ok(json!({"y": 2})));
    assert_eq!(rpc.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_response_at_the_timeout_instant_settles_once() {
    let (manager, mut peer) = connected().await;
    let rpc = ReactiveCorrelator::new(
        Arc::clone(&manager),
        ReactiveConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .expect("correlator");

    let (result, ()) = tokio::join!(rpc.call(json!({"x": 1})), async {
        let id = request_id(&mut peer, "id").await;
        sleep(Duration::from_millis(100)).await;
        peer.send_json(&ok_response(&id, json!("on time")));
    });

    match result {
        Ok(data) => assert_eq!(data, json!("on time")),
        Err(CorrelationError::Timeout { after, .. }) => {
            assert_eq!(after, Duration::from_millis(100));
        }
        Err(other) => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(rpc.pending(), 0);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(rpc.pending(), 0);
}

#[tokio::test]
async fn test_call_rejects_bad_payload_and_disconnected_manager() {
    let (connector, _peers) = MemoryConnector::new();
    let idle = Arc::new(ConnectionManager::new(
        connector,
        ConnectionParams::new("memory://idle"),
    ));
    let rpc = ReactiveCorrelator::new(Arc::clone(&idle), ReactiveConfig::default())
        .expect("correlator");

    assert_eq!(
        rpc.call(json!([1, 2, 3])).await,
        Err(CorrelationError::PayloadNotObject)
    );
    assert_eq!(
        rpc.call(json!({"x": 1})).await,
        Err(CorrelationError::Transport(TransportError::NotConnected))
    );
    assert_eq!(rpc.pending(), 0);
}

// ============================================================================
// Cached mode
// ============================================================================

fn cached(manager: &Arc<ConnectionManager>) -> CachedCorrelator {
    CachedCorrelator::new(
        Arc::clone(manager),
        CachedConfig {
            grace: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(600),
            ..Default::default()
        },
    )
    .expect("correlator")
}

#[tokio::test(start_paused = true)]
async fn test_unclaimed_results_are_stored_then_evicted() {
    let (manager, peer) = connected().await;
    let cache = cached(&manager);

    for i in 0..5 {
        peer.send_json(&json!({"requestId": format!("job-{i}"), "value": i}));
    }

    // Pushes are handled in order, so the last one implies the rest.
    assert_eq!(cache.wait_for("job-4").await, Some(json!(4)));
    assert_eq!(cache.len(), 5);
    assert_eq!(cache.get("job-0"), Some(json!(0)));

    sleep(Duration::from_secs(61)).await;
    assert_eq!(cache.len(), 0);
    assert!(cache.is_empty());
    assert_eq!(cache.get("job-0"), None);
}

#[tokio::test(start_paused = true)]
async fn test_every_push_is_stored_despite_a_burst() {
    let (manager, peer) = connected_with_event_buffer(16).await;
    let cache = cached(&manager);

    for i in 0..200 {
        peer.send_json(&json!({"requestId": format!("job-{i}"), "value": i}));
    }

    assert_eq!(cache.wait_for("job-199").await, Some(json!(199)));
    assert_eq!(cache.len(), 200);
    assert_eq!(cache.get("job-0"), Some(json!(0)));
}

#[tokio::test(start_paused = true)]
async fn test_waiter_before_push_receives_value() {
    let (manager, peer) = connected().await;
    let cache = cached(&manager);

    let (first, second, ()) = tokio::join!(cache.wait_for("bulk-7"), cache.wait_for("bulk-7"), async {
        sleep(Duration::from_secs(90)).await;
        peer.send_json(&json!({"requestId": "bulk-7", "value": {"rows": 1200}}));
    });

    assert_eq!(first, Some(json!({"rows": 1200})));
    assert_eq!(second, Some(json!({"rows": 1200})));

    // Still retrievable until the grace period ends.
    assert_eq!(cache.wait_for("bulk-7").await, Some(json!({"rows": 1200})));
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out_with_none() {
    let (manager, _peer) = connected().await;
    let cache = cached(&manager);

    let start = Instant::now();
    assert_eq!(
        cache
            .wait_for_with_timeout("missing", Duration::from_secs(5))
            .await,
        None
    );
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_submit_stamps_request_id() {
    let (manager, mut peer) = connected().await;
    let cache = cached(&manager);

    let id = cache.submit(json!({"op": "export"})).expect("submit");
    let request = peer.recv_json().await.expect("request");
    assert_eq!(request["requestId"], json!(id));
    assert_eq!(request["op"], "export");

    peer.send_json(&json!({"requestId": id, "value": "s3://bucket/export.csv"}));
    assert_eq!(
        cache.wait_for(&id).await,
        Some(json!("s3://bucket/export.csv"))
    );
}

#[tokio::test]
async fn test_cached_wait_ends_on_close() {
    let (manager, _peer) = connected().await;
    let cache = cached(&manager);

    let (result, ()) = tokio::join!(cache.wait_for("never"), async {
        tokio::task::yield_now().await;
        manager.close();
    });
    assert_eq!(result, None);
}
