//! Connection event types.

use std::fmt;
use std::time::Duration;

use crate::frame::Frame;
use crate::state::Generation;

/// Why a physical connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection or the stream ended.
    PeerClosed,
    /// Reading or writing the socket failed.
    Io(String),
    /// The heartbeat monitor gave up on an unresponsive peer.
    HeartbeatTimeout {
        /// Consecutive unanswered pings.
        missed: u32,
    },
    /// A plugin asked for the connection to be recycled.
    Forced(String),
    /// The owner closed the manager.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("connection closed by peer"),
            Self::Io(e) => write!(f, "websocket error: {e}"),
            Self::HeartbeatTimeout { missed } => {
                write!(f, "heartbeat timeout after {missed} missed pongs")
            }
            Self::Forced(reason) => write!(f, "forced reconnect: {reason}"),
            Self::Shutdown => f.write_str("manager closed"),
        }
    }
}

/// Events broadcast by the connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A physical connection was established.
    Opened {
        /// Generation of the new connection.
        generation: Generation,
    },
    /// A physical connection was lost (reconnection follows).
    Disconnected {
        /// Generation of the lost connection.
        generation: Generation,
        /// Why it was lost.
        reason: DisconnectReason,
    },
    /// A connection attempt failed and the next one is scheduled.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// An inbound frame passed every plugin.
    Message(Frame),
    /// The manager was permanently closed.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::HeartbeatTimeout { missed: 3 }.to_string(),
            "heartbeat timeout after 3 missed pongs"
        );
        assert_eq!(
            DisconnectReason::PeerClosed.to_string(),
            "connection closed by peer"
        );
        assert!(
            DisconnectReason::Io("reset".to_string())
                .to_string()
                .contains("reset")
        );
    }

    #[test]
    fn test_reconnecting_event() {
        let event = ConnectionEvent::Reconnecting {
            attempt: 3,
            delay: Duration::from_millis(1500),
        };
        if let ConnectionEvent::Reconnecting { attempt, delay } = event {
            assert_eq!(attempt, 3);
            assert_eq!(delay, Duration::from_millis(1500));
        } else {
            panic!("expected Reconnecting");
        }
    }

    #[test]
    fn test_message_event() {
        let event = ConnectionEvent::Message(Frame::Value(json!({"type": "notice"})));
        assert!(matches!(event, ConnectionEvent::Message(Frame::Value(_))));
    }
}
