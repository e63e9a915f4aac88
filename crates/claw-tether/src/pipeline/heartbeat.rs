//! Heartbeat/keepalive mechanism.
//!
//! While a connection is open the monitor sends a ping every `interval` and
//! waits `pong_timeout` for the pong. Each unanswered ping counts as a miss;
//! once `max_missed` consecutive pings go unanswered the connection is
//! recycled exactly like an unexpected close. Pong frames are consumed here
//! and never reach consumers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, warn};

use super::{ConnectionLink, Flow, Plugin};
use crate::events::DisconnectReason;
use crate::frame::{Frame, WireFrame};
use crate::state::Generation;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub interval: Duration,
    /// How long to wait for a pong after each ping.
    pub pong_timeout: Duration,
    /// Consecutive unanswered pings before the connection is recycled.
    pub max_missed: u32,
    /// Ping payload sent as a text frame.
    pub ping: String,
    /// Pong payload expected from the peer (exact match).
    pub pong: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            max_missed: 3,
            ping: "ping".to_string(),
            pong: "pong".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct HeartbeatState {
    generation: Option<Generation>,
    last_pong_at: Option<Instant>,
    missed_count: u32,
    timer: Option<JoinHandle<()>>,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSnapshot {
    /// Connection currently monitored.
    pub generation: Option<Generation>,
    /// When the last pong arrived.
    pub last_pong_at: Option<Instant>,
    /// Consecutive unanswered pings.
    pub missed_count: u32,
    /// Whether the ping timer is live.
    pub running: bool,
}

/// Liveness probe plugin.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<Mutex<HeartbeatState>>,
    pongs: watch::Sender<u64>,
}

impl HeartbeatMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HeartbeatState::default())),
            pongs: watch::Sender::new(0),
        }
    }

    /// Current monitor state.
    #[must_use]
    pub fn snapshot(&self) -> HeartbeatSnapshot {
        let state = self.state.lock();
        HeartbeatSnapshot {
            generation: state.generation,
            last_pong_at: state.last_pong_at,
            missed_count: state.missed_count,
            running: state.timer.as_ref().is_some_and(|t| !t.is_finished()),
        }
    }

    fn is_pong(&self, frame: &Frame) -> bool {
        match frame {
            Frame::Text(text) => *text == self.config.pong,
            Frame::Binary(bytes) => bytes.as_slice() == self.config.pong.as_bytes(),
            Frame::Value(_) => false,
        }
    }

    fn stop_timer(state: &mut HeartbeatState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

impl Plugin for HeartbeatMonitor {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn on_open(&self, link: &ConnectionLink) {
        let mut state = self.state.lock();
        Self::stop_timer(&mut state);
        state.generation = Some(link.generation());
        state.missed_count = 0;
        state.last_pong_at = None;
        state.timer = Some(tokio::spawn(run_heartbeat(
            link.clone(),
            self.config.clone(),
            Arc::clone(&self.state),
            self.pongs.subscribe(),
        )));
    }

    fn on_close(&self, generation: Generation, _reason: &DisconnectReason) {
        let mut state = self.state.lock();
        if state.generation == Some(generation) {
            Self::stop_timer(&mut state);
        }
    }

    fn on_message(&self, frame: Frame) -> Flow {
        if !self.is_pong(&frame) {
            return Flow::Continue(frame);
        }

        {
            let mut state = self.state.lock();
            state.last_pong_at = Some(Instant::now());
            state.missed_count = 0;
        }
        self.pongs.send_modify(|count| *count = count.wrapping_add(1));
        Flow::Consumed
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        Self::stop_timer(&mut self.state.lock());
    }
}

async fn run_heartbeat(
    link: ConnectionLink,
    config: HeartbeatConfig,
    state: Arc<Mutex<HeartbeatState>>,
    mut pongs: watch::Receiver<u64>,
) {
    let generation = link.generation();
    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = link.closed() => return,
            _ = ticker.tick() => {}
        }

        pongs.borrow_and_update();
        if let Err(e) = link.send_raw(WireFrame::Text(config.ping.clone())) {
            debug!(%generation, error = %e, "heartbeat stopped, ping not sent");
            return;
        }

        let answered = tokio::select! {
            () = link.closed() => return,
            changed = pongs.changed() => changed.is_ok(),
            () = sleep(config.pong_timeout) => false,
        };

        let missed = {
            let mut state = state.lock();
            if state.generation != Some(generation) {
                return;
            }
            if answered {
                state.missed_count = 0;
            } else {
                state.missed_count += 1;
            }
            state.missed_count
        };

        if answered {
            continue;
        }

        warn!(%generation, missed, max = config.max_missed, "heartbeat pong missed");
        if missed >= config.max_missed {
            link.recycle(DisconnectReason::HeartbeatTimeout { missed });
            return;
        }
    }
}
