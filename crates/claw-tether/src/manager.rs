//! Connection manager with automatic reconnection.
//!
//! The manager owns one logical connection slot. A single driver task opens
//! the physical connection, pumps frames through the plugin pipeline, and on
//! any unexpected close re-resolves the connection parameters and reconnects
//! with backoff.
//!
//! **Reconnection is indefinite by default.** Unless
//! [`ReconnectConfig::max_attempts`] is set, a network partition or a
//! permanently failing resolver is retried forever; the owner stops it with
//! [`ConnectionManager::close`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{ReconnectConfig, RetryAttempt};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::events::{ConnectionEvent, DisconnectReason};
use crate::frame::Frame;
use crate::pipeline::{ConnectionLink, Pipeline, Plugin};
use crate::state::{ConnectionState, Generation, StateCell};
use crate::transport::{Connection, Connector, ParamsResolver};

const DEFAULT_SEND_BUFFER: usize = 256;
const DEFAULT_EVENT_BUFFER: usize = 1024;
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Builder for [`ConnectionManager`].
pub struct ConnectionManagerBuilder {
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn ParamsResolver>,
    reconnect: ReconnectConfig,
    send_buffer: usize,
    event_buffer: usize,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl ConnectionManagerBuilder {
    /// Configure reconnection behavior.
    #[must_use]
    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Depth of the outbound queue; a full queue fails sends with `Backpressure`.
    #[must_use]
    pub fn with_send_buffer(mut self, send_buffer: usize) -> Self {
        self.send_buffer = send_buffer.max(1);
        self
    }

    /// Depth of the event broadcast; slow subscribers lose the oldest events.
    #[must_use]
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    /// Apply the transport-level parts of a [`TransportConfig`].
    #[must_use]
    pub fn with_config(self, config: &TransportConfig) -> Self {
        self.with_reconnect_config(config.reconnect())
            .with_send_buffer(config.send_buffer)
            .with_event_buffer(config.event_buffer)
    }

    /// Append a plugin to the pipeline.
    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Build the manager in the `Idle` state.
    #[must_use]
    pub fn build(self) -> ConnectionManager {
        let (events, _) = broadcast::channel(self.event_buffer);
        ConnectionManager {
            inner: Arc::new(Inner {
                connector: self.connector,
                resolver: self.resolver,
                reconnect: self.reconnect,
                send_buffer: self.send_buffer,
                state: StateCell::new(ConnectionState::Idle),
                retry: Mutex::new(RetryAttempt::default()),
                plugins: Mutex::new(self.plugins),
                pipeline: OnceLock::new(),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
                feeds: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        }
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn ParamsResolver>,
    reconnect: ReconnectConfig,
    send_buffer: usize,
    state: StateCell,
    retry: Mutex<RetryAttempt>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    pipeline: OnceLock<Arc<Pipeline>>,
    link: Mutex<Option<ConnectionLink>>,
    generation: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Owns one logical connection and keeps it alive.
///
/// Dropping the manager closes it.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.inner.state.load())
            .field("generation", &self.generation())
            .field("retry", &self.retry_attempt())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Start building a manager.
    pub fn builder(
        connector: impl Connector,
        resolver: impl ParamsResolver,
    ) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            connector: Arc::new(connector),
            resolver: Arc::new(resolver),
            reconnect: ReconnectConfig::default(),
            send_buffer: DEFAULT_SEND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            plugins: Vec::new(),
        }
    }

    /// A manager with default settings and no plugins.
    pub fn new(connector: impl Connector, resolver: impl ParamsResolver) -> Self {
        Self::builder(connector, resolver).build()
    }

    /// Append a plugin to the pipeline.
    ///
    /// Only allowed before the first [`open`](Self::open); afterwards the
    /// pipeline is frozen and this returns a configuration error.
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let mut plugins = self.inner.plugins.lock();
        if self.inner.pipeline.get().is_some() {
            return Err(TransportError::Configuration(format!(
                "plugin '{}' registered after open()",
                plugin.name()
            )));
        }
        plugins.push(plugin);
        Ok(())
    }

    /// Begin connecting. A no-op while already connecting, open or reconnecting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut driver = self.inner.driver.lock();
        if driver.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TransportError::Configuration("open() must be called inside a Tokio runtime".into())
        })?;

        let pipeline = {
            let plugins = self.inner.plugins.lock();
            let pipeline = Arc::new(Pipeline::new(plugins.clone()));
            let _ = self.inner.pipeline.set(Arc::clone(&pipeline));
            pipeline
        };

        self.inner.state.store(ConnectionState::Connecting);
        info!(plugins = ?pipeline, "opening connection");

        *driver = Some(runtime.spawn(drive(Arc::clone(&self.inner), pipeline)));
        Ok(())
    }

    /// Tear the connection down permanently.
    ///
    /// Synchronously cancels every timer, notifies plugins, rejects every
    /// pending correlated operation with `ConnectionClosed` and releases the
    /// physical connection. The state becomes `Closed` and never changes again.
    pub fn close(&self) {
        self.inner.teardown();
        if let Some(driver) = self.inner.driver.lock().take() {
            driver.abort();
        }
    }

    /// Send a frame through the pipeline.
    ///
    /// Fails fast with `NotConnected` unless the connection is open; frames
    /// are never buffered across reconnects.
    pub fn send(&self, frame: impl Into<Frame>) -> Result<()> {
        if self.inner.state.load() != ConnectionState::Open {
            return Err(TransportError::NotConnected);
        }
        let link = self
            .inner
            .link
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        link.send(frame.into())
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to connection events and inbound messages.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Current retry bookkeeping.
    #[must_use]
    pub fn retry_attempt(&self) -> RetryAttempt {
        *self.inner.retry.lock()
    }

    /// Generation of the most recent physical connection.
    #[must_use]
    pub fn generation(&self) -> Generation {
        Generation(self.inner.generation.load(Ordering::SeqCst))
    }

    /// Whether the manager was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the manager is closed.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Every inbound frame that survives the pipeline, in arrival order.
    ///
    /// Unlike [`events`](Self::events) this never drops frames for a slow
    /// reader. The feed ends when the manager is dropped.
    pub(crate) fn message_feed(&self) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.feeds.lock().push(tx);
        rx
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn deliver(&self, frame: Frame) {
        self.feeds
            .lock()
            .retain(|feed| feed.send(frame.clone()).is_ok());
        self.emit(ConnectionEvent::Message(frame));
    }

    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        if let Some(link) = self.link.lock().take() {
            if let Some(pipeline) = self.pipeline.get() {
                pipeline.closed(link.generation(), &DisconnectReason::Shutdown);
            }
        }
        self.state.store(ConnectionState::Closed);
        self.emit(ConnectionEvent::Closed);
        info!("connection manager closed");
    }

    async fn establish(&self, pipeline: &Pipeline) -> Result<Connection> {
        let params = self.resolver.resolve().await?;
        pipeline.before_connect(&params).await?;
        debug!(url = %params.url, "connecting");
        self.connector.connect(&params).await
    }

    async fn run_connection(
        &self,
        connection: Connection,
        pipeline: &Arc<Pipeline>,
    ) -> (Generation, DisconnectReason) {
        let generation = Generation(self.generation.fetch_add(1, Ordering::SeqCst)).next();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(self.send_buffer);
        let token = self.shutdown.child_token();
        let link = ConnectionLink::new(generation, outbound_tx, Arc::clone(pipeline), token.clone());

        self.retry.lock().reset();
        *self.link.lock() = Some(link.clone());
        self.state.store(ConnectionState::Open);
        info!(%generation, "connection open");
        self.emit(ConnectionEvent::Opened { generation });
        pipeline.opened(&link);

        let Connection {
            mut sink,
            mut stream,
        } = connection;

        let reason = loop {
            tokio::select! {
                () = token.cancelled() => {
                    break link.take_recycle_reason().unwrap_or(DisconnectReason::Shutdown);
                }

                inbound = stream.next() => match inbound {
                    Some(Ok(frame)) => {
                        if let Some(frame) = pipeline.inbound(frame.into()) {
                            self.deliver(frame);
                        }
                    }
                    Some(Err(e)) => break DisconnectReason::Io(e.to_string()),
                    None => break DisconnectReason::PeerClosed,
                },

                outbound = outbound_rx.recv() => {
                    // `link` is held for the whole loop, so the sender never drops here.
                    let Some(frame) = outbound else { continue };
                    if let Err(e) = sink.send(frame).await {
                        break DisconnectReason::Io(e.to_string());
                    }
                }
            }
        };

        token.cancel();
        {
            let mut current = self.link.lock();
            if current.as_ref().is_some_and(|l| l.generation() == generation) {
                *current = None;
            }
        }
        pipeline.closed(generation, &reason);
        let _ = timeout(CLOSE_HANDSHAKE_TIMEOUT, sink.close()).await;

        (generation, reason)
    }
}

async fn drive(inner: Arc<Inner>, pipeline: Arc<Pipeline>) {
    loop {
        let attempt = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => return,
            result = inner.establish(&pipeline) => result,
        };

        match attempt {
            Ok(connection) => {
                let (generation, reason) = inner.run_connection(connection, &pipeline).await;
                if inner.shutdown.is_cancelled() {
                    return;
                }

                inner.state.store(ConnectionState::Reconnecting);
                warn!(%generation, %reason, "connection lost, reconnecting");
                inner.emit(ConnectionEvent::Disconnected { generation, reason });
            }
            Err(e) => {
                let (attempt, delay) = {
                    let mut retry = inner.retry.lock();
                    let delay = retry.record_failure(&inner.reconnect);
                    (retry.attempt_number, delay)
                };

                if !inner.reconnect.should_reconnect(attempt) {
                    warn!(attempt, error = %e, "giving up after max reconnection attempts");
                    inner.teardown();
                    return;
                }

                inner.state.store(ConnectionState::Reconnecting);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "connection attempt failed, retrying"
                );
                inner.emit(ConnectionEvent::Reconnecting { attempt, delay });

                tokio::select! {
                    biased;
                    () = inner.shutdown.cancelled() => return,
                    () = sleep(delay) => {}
                }
            }
        }
    }
}
