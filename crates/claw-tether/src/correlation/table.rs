//! Id-keyed slots shared by both correlation modes.
//!
//! A slot is created when a caller starts waiting (or, for cached retention,
//! when a value arrives first) and carries a `watch` channel the waiters
//! listen on. Every mutation happens under one lock, so a delivery and a
//! timeout racing for the same slot resolve first-writer-wins: whoever
//! removes or fills the slot under the lock decides the outcome.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::CorrelationError;

/// How long slots live and who may share them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retention {
    /// One waiter per id. The slot is removed on delivery; values for unknown
    /// ids are ignored.
    Exclusive,
    /// Any number of waiters per id. Values are stored even when nobody waits
    /// and evicted `grace` after they arrive, consumed or not.
    Cached {
        /// Retention after delivery.
        grace: Duration,
    },
}

#[derive(Debug)]
struct Slot<T> {
    key: u64,
    version: u64,
    tx: watch::Sender<Option<T>>,
    created_at: Instant,
    received_at: Option<Instant>,
}

impl<T> Slot<T> {
    fn new(key: u64) -> Self {
        Self {
            key,
            version: 0,
            tx: watch::Sender::new(None),
            created_at: Instant::now(),
            received_at: None,
        }
    }
}

#[derive(Debug)]
struct Slots<T> {
    by_id: HashMap<String, Slot<T>>,
    next_key: u64,
}

impl<T> Slots<T> {
    fn get_or_insert(&mut self, id: &str) -> &mut Slot<T> {
        let next_key = &mut self.next_key;
        self.by_id.entry(id.to_string()).or_insert_with(|| {
            *next_key += 1;
            Slot::new(*next_key)
        })
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome<T> {
    /// A value was delivered for the id.
    Delivered(T),
    /// The wait timed out first.
    TimedOut,
    /// The owning connection was permanently closed first.
    Closed,
}

/// Correlation slots keyed by operation id.
#[derive(Debug)]
pub(crate) struct CorrelationTable<T> {
    retention: Retention,
    slots: Mutex<Slots<T>>,
    runtime: Handle,
}

impl<T> CorrelationTable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Eviction timers run on `runtime`.
    pub(crate) fn new(retention: Retention, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            retention,
            slots: Mutex::new(Slots {
                by_id: HashMap::new(),
                next_key: 0,
            }),
            runtime,
        })
    }

    /// Register the only waiter for `id`.
    pub(crate) fn register(self: &Arc<Self>, id: &str) -> Result<Waiter<T>, CorrelationError> {
        let mut slots = self.slots.lock();
        if slots.by_id.contains_key(id) {
            return Err(CorrelationError::DuplicateId(id.to_string()));
        }
        let slot = slots.get_or_insert(id);
        Ok(Waiter {
            id: id.to_string(),
            key: slot.key,
            rx: slot.tx.subscribe(),
            table: Arc::clone(self),
        })
    }

    /// Join the waiters for `id`, creating an empty slot if needed.
    pub(crate) fn attach(self: &Arc<Self>, id: &str) -> Waiter<T> {
        let mut slots = self.slots.lock();
        let slot = slots.get_or_insert(id);
        Waiter {
            id: id.to_string(),
            key: slot.key,
            rx: slot.tx.subscribe(),
            table: Arc::clone(self),
        }
    }

    /// Deliver a value for `id`. Returns whether anything was delivered or stored.
    pub(crate) fn fulfil(self: &Arc<Self>, id: &str, value: T) -> bool {
        match self.retention {
            Retention::Exclusive => {
                let Some(slot) = self.slots.lock().by_id.remove(id) else {
                    return false;
                };
                trace!(%id, waited = ?slot.created_at.elapsed(), "correlated response delivered");
                slot.tx.send_replace(Some(value));
                true
            }
            Retention::Cached { grace } => {
                let (key, version) = {
                    let mut slots = self.slots.lock();
                    let slot = slots.get_or_insert(id);
                    slot.version += 1;
                    slot.received_at = Some(Instant::now());
                    slot.tx.send_replace(Some(value));
                    (slot.key, slot.version)
                };
                self.schedule_eviction(id.to_string(), key, version, grace);
                true
            }
        }
    }

    fn schedule_eviction(self: &Arc<Self>, id: String, key: u64, version: u64, grace: Duration) {
        let table: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            sleep(grace).await;
            let Some(table) = table.upgrade() else { return };
            let mut slots = table.slots.lock();
            if slots
                .by_id
                .get(&id)
                .is_some_and(|slot| slot.key == key && slot.version == version)
            {
                slots.by_id.remove(&id);
                debug!(%id, "cached result evicted");
            }
        });
    }

    /// Drop a waiter's claim on its slot. Returns whether the slot was removed.
    ///
    /// Exclusive slots are removed outright. Cached slots are removed only
    /// while still empty and only by their last waiter; filled slots are left
    /// to eviction.
    fn release(&self, id: &str, key: u64) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.by_id.get(id) else {
            return false;
        };
        if slot.key != key {
            return false;
        }
        let removable = match self.retention {
            Retention::Exclusive => true,
            Retention::Cached { .. } => {
                slot.received_at.is_none() && slot.tx.receiver_count() <= 1
            }
        };
        if removable {
            slots.by_id.remove(id);
        }
        removable
    }

    /// Current value for `id`, without waiting.
    pub(crate) fn get(&self, id: &str) -> Option<T> {
        self.slots
            .lock()
            .by_id
            .get(id)
            .and_then(|slot| (*slot.tx.borrow()).clone())
    }

    /// Number of live slots.
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().by_id.len()
    }
}

/// One caller's claim on a slot. Dropping it (including by cancelling the
/// future that holds it) releases the claim.
#[derive(Debug)]
pub(crate) struct Waiter<T>
where
    T: Clone + Send + Sync + 'static,
{
    id: String,
    key: u64,
    rx: watch::Receiver<Option<T>>,
    table: Arc<CorrelationTable<T>>,
}

enum Fired<T> {
    Value(Option<T>),
    Timeout,
    Shutdown,
}

impl<T> Waiter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wait for a value, the timeout or `shutdown`, whichever comes first.
    pub(crate) async fn wait(mut self, timeout: Duration, shutdown: &CancellationToken) -> Outcome<T> {
        let fired = tokio::select! {
            biased;
            value = self.rx.wait_for(Option::is_some) => {
                Fired::Value(value.ok().and_then(|value| (*value).clone()))
            }
            () = shutdown.cancelled() => Fired::Shutdown,
            () = sleep(timeout) => Fired::Timeout,
        };

        match fired {
            Fired::Value(Some(value)) => Outcome::Delivered(value),
            // Slot dropped without a value.
            Fired::Value(None) => Outcome::Closed,
            Fired::Shutdown => self.current().map_or(Outcome::Closed, Outcome::Delivered),
            Fired::Timeout => {
                if self.table.release(&self.id, self.key) {
                    return Outcome::TimedOut;
                }
                self.current().map_or(Outcome::TimedOut, Outcome::Delivered)
            }
        }
    }

    fn current(&self) -> Option<T> {
        (*self.rx.borrow()).clone()
    }
}

impl<T> Drop for Waiter<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.table.release(&self.id, self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::{assert_pending, assert_ready, task};

    const LONG: Duration = Duration::from_secs(60);

    fn table<T>(retention: Retention) -> Arc<CorrelationTable<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        CorrelationTable::new(retention, Handle::current())
    }

    #[tokio::test]
    async fn test_exclusive_delivery_removes_slot() {
        let table = table(Retention::Exclusive);
        let waiter = table.register("a").expect("register");
        assert_eq!(table.len(), 1);

        assert!(table.fulfil("a", 7));
        assert_eq!(table.len(), 0);
        assert!(!table.fulfil("a", 8), "second delivery is ignored");

        let outcome = waiter.wait(LONG, &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Delivered(7));
    }

    #[tokio::test]
    async fn test_exclusive_rejects_duplicate_id() {
        let table = table::<u32>(Retention::Exclusive);
        let _waiter = table.register("a").expect("register");
        assert_eq!(
            table.register("a").map(|_| ()),
            Err(CorrelationError::DuplicateId("a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_exclusive_ignores_unknown_ids() {
        let table = table::<u32>(Retention::Exclusive);
        assert!(!table.fulfil("nobody", 1));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_no_slot() {
        let table = table::<u32>(Retention::Exclusive);
        let waiter = table.register("a").expect("register");

        let outcome = waiter
            .wait(Duration::from_millis(100), &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::TimedOut);
        assert_eq!(table.len(), 0);
        assert!(!table.fulfil("a", 1), "late response is ignored");
    }

    #[tokio::test]
    async fn test_dropped_waiter_releases_slot() {
        let table = table::<u32>(Retention::Exclusive);
        let waiter = table.register("a").expect("register");
        drop(waiter);
        assert_eq!(table.len(), 0);
        assert!(table.register("a").is_ok(), "id is free again");
    }

    #[tokio::test]
    async fn test_shutdown_closes_waiter() {
        let table = table::<u32>(Retention::Exclusive);
        let waiter = table.register("a").expect("register");
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert_eq!(waiter.wait(LONG, &shutdown).await, Outcome::Closed);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_value_without_waiter_is_evicted() {
        let table = table(Retention::Cached {
            grace: Duration::from_secs(60),
        });

        for i in 0..10 {
            assert!(table.fulfil(&format!("job-{i}"), i));
        }
        assert_eq!(table.len(), 10);
        assert_eq!(table.get("job-3"), Some(3));

        sleep(Duration::from_secs(61)).await;
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_value_is_shared_by_waiters() {
        let table = table(Retention::Cached {
            grace: Duration::from_secs(60),
        });
        let shutdown = CancellationToken::new();

        let first = table.attach("bulk");
        let second = table.attach("bulk");
        assert_eq!(table.len(), 1);

        assert!(table.fulfil("bulk", "done"));
        assert_eq!(first.wait(LONG, &shutdown).await, Outcome::Delivered("done"));
        assert_eq!(second.wait(LONG, &shutdown).await, Outcome::Delivered("done"));

        // Late lookups still succeed inside the grace period.
        let late = table.attach("bulk");
        assert_eq!(late.wait(LONG, &shutdown).await, Outcome::Delivered("done"));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_empty_slot_removed_by_last_waiter() {
        let table = table::<u32>(Retention::Cached {
            grace: Duration::from_secs(60),
        });
        let shutdown = CancellationToken::new();

        let first = table.attach("x");
        let second = table.attach("x");
        drop(first);
        assert_eq!(table.len(), 1, "second waiter still holds the slot");

        let outcome = second.wait(Duration::from_millis(50), &shutdown).await;
        assert_eq!(outcome, Outcome::TimedOut);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_push_restarts_grace() {
        let table = table(Retention::Cached {
            grace: Duration::from_secs(10),
        });

        table.fulfil("x", 1);
        sleep(Duration::from_secs(6)).await;
        table.fulfil("x", 2);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(table.get("x"), Some(2), "first eviction is stale");

        sleep(Duration::from_secs(5)).await;
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_racing_an_elapsed_timeout_wins() {
        let table = table::<u32>(Retention::Exclusive);
        let shutdown = CancellationToken::new();
        let mut wait = task::spawn(
            table
                .register("a")
                .expect("register")
                .wait(Duration::from_millis(100), &shutdown),
        );
        assert_pending!(wait.poll());

        // The timer has fired but the waiter has not run yet.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(table.fulfil("a", 7));

        assert_eq!(assert_ready!(wait.poll()), Outcome::Delivered(7));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_that_ran_first_keeps_late_delivery_out() {
        let table = table::<u32>(Retention::Exclusive);
        let shutdown = CancellationToken::new();
        let mut wait = task::spawn(
            table
                .register("a")
                .expect("register")
                .wait(Duration::from_millis(100), &shutdown),
        );
        assert_pending!(wait.poll());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(assert_ready!(wait.poll()), Outcome::TimedOut);
        assert!(!table.fulfil("a", 7));
        assert_eq!(table.len(), 0);
    }
}
