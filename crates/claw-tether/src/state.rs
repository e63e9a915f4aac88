//! Connection state types.

use std::fmt;

use tokio::sync::watch;

/// State of the logical connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed, `open()` not called yet.
    Idle,
    /// First connection attempt in progress.
    Connecting,
    /// Connected; sends are forwarded.
    Open,
    /// Lost the connection (or never got one); retrying with backoff.
    Reconnecting,
    /// Torn down by the owner. Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Identifies one physical connection within a manager's lifetime.
///
/// Incremented on every successful open. Timers and callbacks carry the
/// generation they were created for and ignore themselves once it is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observable connection state with a single logical writer.
///
/// Once `Closed` is stored, further writes are ignored, so a driver that is
/// still unwinding cannot resurrect a torn-down connection.
#[derive(Debug)]
pub struct StateCell(watch::Sender<ConnectionState>);

impl StateCell {
    /// Create a new cell.
    #[must_use]
    pub fn new(state: ConnectionState) -> Self {
        Self(watch::Sender::new(state))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        *self.0.borrow()
    }

    /// Store a new state, returning whether it was applied.
    pub fn store(&self, state: ConnectionState) -> bool {
        self.0.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }
            *current = state;
            true
        })
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.0.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_transitions() {
        let state = StateCell::new(ConnectionState::Idle);
        assert_eq!(state.load(), ConnectionState::Idle);

        assert!(state.store(ConnectionState::Connecting));
        assert_eq!(state.load(), ConnectionState::Connecting);

        assert!(state.store(ConnectionState::Open));
        assert_eq!(state.load(), ConnectionState::Open);
    }

    #[test]
    fn test_closed_is_terminal() {
        let state = StateCell::new(ConnectionState::Open);
        assert!(state.store(ConnectionState::Closed));

        assert!(!state.store(ConnectionState::Reconnecting));
        assert!(!state.store(ConnectionState::Open));
        assert_eq!(state.load(), ConnectionState::Closed);
    }

    #[test]
    fn test_same_state_is_not_a_change() {
        let state = StateCell::new(ConnectionState::Reconnecting);
        assert!(!state.store(ConnectionState::Reconnecting));
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let state = StateCell::new(ConnectionState::Idle);
        let mut rx = state.subscribe();

        state.store(ConnectionState::Connecting);
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);
    }

    #[test]
    fn test_generation_next() {
        let first = Generation::default().next();
        assert_eq!(first, Generation(1));
        assert!(first.next() > first);
        assert_eq!(first.to_string(), "#1");
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Idle.to_string(), "idle");
    }
}
