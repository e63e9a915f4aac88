//! Authentication gate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info};

use super::Plugin;
use crate::error::TransportError;
use crate::transport::ConnectionParams;

/// Source of truth for "is the user currently authenticated".
pub trait AuthState: Send + Sync + 'static {
    /// Current authentication status.
    fn is_authenticated(&self) -> bool;
}

impl<F> AuthState for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    fn is_authenticated(&self) -> bool {
        self()
    }
}

/// Shared, settable authentication flag.
#[derive(Debug, Clone, Default)]
pub struct AuthFlag(Arc<AtomicBool>);

impl AuthFlag {
    /// Create a flag with an initial value.
    #[must_use]
    pub fn new(authenticated: bool) -> Self {
        Self(Arc::new(AtomicBool::new(authenticated)))
    }

    /// Update the flag; every clone observes the change.
    pub fn set(&self, authenticated: bool) {
        self.0.store(authenticated, Ordering::SeqCst);
    }
}

impl AuthState for AuthFlag {
    fn is_authenticated(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Holds every connection attempt until the user is authenticated.
///
/// Revoking authentication while connected does not disconnect; it only keeps
/// the next attempt (after any disconnect) from completing until the user
/// signs in again.
pub struct AuthGate {
    state: Box<dyn AuthState>,
    poll_interval: Duration,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    /// Gate connection attempts on `state`, re-checking every 250ms.
    pub fn new(state: impl AuthState) -> Self {
        Self {
            state: Box::new(state),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Change how often a blocked attempt re-checks the predicate.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn wait_until_authenticated(&self) {
        if self.state.is_authenticated() {
            return;
        }

        info!("connection attempt waiting for authentication");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.state.is_authenticated() {
                debug!("authenticated, releasing connection attempt");
                return;
            }
        }
    }
}

impl Plugin for AuthGate {
    fn name(&self) -> &'static str {
        "auth-gate"
    }

    fn on_before_connect<'a>(
        &'a self,
        _params: &'a ConnectionParams,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.wait_until_authenticated().await;
            Ok(())
        })
    }
}
