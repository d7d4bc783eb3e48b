//! WebSocket adapter.
//!
//! Adds heartbeat probes and optional automatic reconnect on top of a
//! duplex socket obtained from a [`SocketDialer`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use relay_protocol::{ConnectionId, Protocol};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::observer::{AdapterObserver, CloseInfo};
use crate::scheduler::{Scheduler, TimerHandle, TimerTask, TokioScheduler};
use crate::state::{AdapterCore, ConnectionState};
use crate::traits::{AdapterError, AdapterFactory, TransportAdapter};

/// Payload of heartbeat probes.
pub const HEARTBEAT_PROBE: &[u8] = &[0x01];

/// WebSocket adapter configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Endpoint to dial.
    pub url: String,
    /// Interval between heartbeat probes. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Delay before reconnecting after an unexpected close.
    pub reconnect_interval: Duration,
    /// Reconnect automatically after an unexpected close.
    pub reconnect: bool,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl WebSocketConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            heartbeat_interval: Duration::from_millis(10_000),
            reconnect_interval: Duration::from_millis(3_000),
            reconnect: false,
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Events read from an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A data message.
    Message(Bytes),
    /// Reply to a heartbeat probe.
    Pong(Bytes),
    /// A transport fault that did not close the socket.
    Error(String),
    /// The socket closed.
    Closed(CloseInfo),
}

/// Write half of an open socket.
#[async_trait]
pub trait SocketSink: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), AdapterError>;

    /// Send a heartbeat probe; the peer answers with [`SocketEvent::Pong`].
    async fn ping(&self, probe: Bytes) -> Result<(), AdapterError>;

    async fn close(&self) -> Result<(), AdapterError>;

    fn buffered_amount(&self) -> usize {
        0
    }
}

/// An open socket: its write half and its event stream.
pub struct SocketLink {
    pub sink: Arc<dyn SocketSink>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets.
#[async_trait]
pub trait SocketDialer: Send + Sync {
    async fn dial(&self, config: &WebSocketConfig) -> Result<SocketLink, AdapterError>;
}

/// WebSocket adapter.
pub struct WebSocketAdapter {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    core: AdapterCore,
    config: WebSocketConfig,
    dialer: Arc<dyn SocketDialer>,
    scheduler: Arc<dyn Scheduler>,
    sink: RwLock<Option<Arc<dyn SocketSink>>>,
    /// Serializes writes so payloads leave in call order.
    send_lock: tokio::sync::Mutex<()>,
    heartbeat: Mutex<Option<TimerHandle>>,
    reconnect: Mutex<Option<TimerHandle>>,
    reader: Mutex<Option<AbortHandle>>,
    probe_sent_at: Mutex<Option<Duration>>,
    /// Set by an explicit disconnect; suppresses reconnects.
    closing: AtomicBool,
    /// Bumped per link so a stale reader cannot touch a newer one.
    generation: AtomicU64,
}

impl WebSocketAdapter {
    /// Create an adapter driven by tokio timers.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        config: WebSocketConfig,
        dialer: Arc<dyn SocketDialer>,
    ) -> Self {
        Self::with_scheduler(connection_id, config, dialer, Arc::new(TokioScheduler::new()))
    }

    #[must_use]
    pub fn with_scheduler(
        connection_id: ConnectionId,
        config: WebSocketConfig,
        dialer: Arc<dyn SocketDialer>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                core: AdapterCore::new(Protocol::WebSocket, connection_id),
                config,
                dialer,
                scheduler,
                sink: RwLock::new(None),
                send_lock: tokio::sync::Mutex::new(()),
                heartbeat: Mutex::new(None),
                reconnect: Mutex::new(None),
                reader: Mutex::new(None),
                probe_sent_at: Mutex::new(None),
                closing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.inner.config
    }
}

/// Builds one [`WebSocketAdapter`] per connection, all dialing through the
/// same dialer.
#[derive(Clone)]
pub struct WebSocketFactory {
    config: WebSocketConfig,
    dialer: Arc<dyn SocketDialer>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl WebSocketFactory {
    #[must_use]
    pub fn new(config: WebSocketConfig, dialer: Arc<dyn SocketDialer>) -> Self {
        Self {
            config,
            dialer,
            scheduler: None,
        }
    }

    /// Drive every adapter's timers from `scheduler`.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

impl AdapterFactory for WebSocketFactory {
    fn create(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<dyn TransportAdapter>, AdapterError> {
        let adapter = match &self.scheduler {
            Some(scheduler) => WebSocketAdapter::with_scheduler(
                connection_id.clone(),
                self.config.clone(),
                Arc::clone(&self.dialer),
                Arc::clone(scheduler),
            ),
            None => WebSocketAdapter::new(
                connection_id.clone(),
                self.config.clone(),
                Arc::clone(&self.dialer),
            ),
        };
        Ok(Arc::new(adapter))
    }
}

impl SocketInner {
    async fn open(self: Arc<Self>) -> Result<(), AdapterError> {
        self.core
            .transition(ConnectionState::Connecting)
            .map_err(|e| self.core.fail(e))?;
        info!(connection = %self.core.connection_id(), url = %self.config.url, "Connecting");

        let link = match self.dialer.dial(&self.config).await {
            Ok(link) => link,
            Err(e) => {
                self.core
                    .transition_from(&[ConnectionState::Connecting], ConnectionState::Failed);
                return Err(self.core.fail(e));
            }
        };

        // A disconnect while dialing wins.
        if self.core.state() != ConnectionState::Connecting {
            let _ = link.sink.close().await;
            return Err(self.core.fail(AdapterError::ConnectionClosed));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.sink.write() = Some(link.sink);
        let reader = tokio::spawn(Self::read_loop(
            Arc::downgrade(&self),
            generation,
            link.events,
        ));
        *self.reader.lock() = Some(reader.abort_handle());

        if !self
            .core
            .transition_from(&[ConnectionState::Connecting], ConnectionState::Connected)
        {
            return Err(self.core.fail(AdapterError::ConnectionClosed));
        }
        info!(connection = %self.core.connection_id(), "Connected");
        self.core.observer().emit_open();
        self.start_heartbeat();
        Ok(())
    }

    async fn read_loop(
        weak: Weak<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            match event {
                SocketEvent::Message(data) => inner.on_data(data),
                SocketEvent::Pong(_) => inner.on_pong(),
                SocketEvent::Error(e) => {
                    inner.core.fail(AdapterError::Other(e));
                }
                SocketEvent::Closed(info) => {
                    inner.on_closed(info);
                    return;
                }
            }
        }

        if let Some(inner) = weak.upgrade() {
            if inner.generation.load(Ordering::SeqCst) == generation {
                inner.on_closed(CloseInfo::remote(None, "stream ended"));
            }
        }
    }

    fn on_data(&self, data: Bytes) {
        if data.len() > self.config.max_message_size {
            self.core.fail(AdapterError::MessageTooLarge {
                size: data.len(),
                max: self.config.max_message_size,
            });
            return;
        }

        trace!(connection = %self.core.connection_id(), bytes = data.len(), "Received message");
        let envelope = self.core.envelope(data, &self.config.url);
        self.core.observer().emit_message(envelope);
    }

    fn on_pong(&self) {
        let Some(sent_at) = self.probe_sent_at.lock().take() else {
            return;
        };
        let latency = self.scheduler.now().saturating_sub(sent_at);
        trace!(connection = %self.core.connection_id(), ?latency, "Heartbeat");
        self.core.observer().emit_heartbeat(latency);
    }

    fn on_closed(self: &Arc<Self>, info: CloseInfo) {
        self.stop_heartbeat();
        self.sink.write().take();
        self.reader.lock().take();

        if !self
            .core
            .transition_from(&[ConnectionState::Connected], ConnectionState::Disconnected)
        {
            return;
        }
        info!(
            connection = %self.core.connection_id(),
            code = ?info.code,
            reason = %info.reason,
            "Connection closed by remote"
        );
        self.core.observer().emit_close(info);

        if self.config.reconnect && !self.closing.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        if interval.is_zero() {
            return;
        }

        let weak = Arc::downgrade(self);
        let task: TimerTask = Box::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.send_probe().await;
                }
            }
            .boxed()
        });

        let handle = self.scheduler.schedule_repeating(interval, task);
        if let Some(previous) = self.heartbeat.lock().replace(handle) {
            previous.cancel();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.cancel();
        }
        self.probe_sent_at.lock().take();
    }

    /// Heartbeat failures are reported but never change state.
    async fn send_probe(&self) {
        let Some(sink) = self.sink.read().clone() else {
            return;
        };

        *self.probe_sent_at.lock() = Some(self.scheduler.now());
        if let Err(e) = sink.ping(Bytes::from_static(HEARTBEAT_PROBE)).await {
            self.core.fail(e);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task: TimerTask = Box::new(move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.closing.load(Ordering::SeqCst)
                    || !inner.core.transition_from(
                        &[ConnectionState::Disconnected],
                        ConnectionState::Reconnecting,
                    )
                {
                    return;
                }

                info!(connection = %inner.core.connection_id(), "Reconnecting");
                if let Err(e) = Arc::clone(&inner).open().await {
                    warn!(connection = %inner.core.connection_id(), "Reconnect failed: {}", e);
                }
            }
            .boxed()
        });

        debug!(
            connection = %self.core.connection_id(),
            delay = ?self.config.reconnect_interval,
            "Scheduling reconnect"
        );
        let handle = self
            .scheduler
            .schedule_once(self.config.reconnect_interval, task);
        if let Some(previous) = self.reconnect.lock().replace(handle) {
            previous.cancel();
        }
    }

    fn cancel_timers(&self) {
        self.stop_heartbeat();
        if let Some(handle) = self.reconnect.lock().take() {
            handle.cancel();
        }
    }
}

#[async_trait]
impl TransportAdapter for WebSocketAdapter {
    fn protocol(&self) -> Protocol {
        self.inner.core.protocol()
    }

    fn connection_id(&self) -> &ConnectionId {
        self.inner.core.connection_id()
    }

    fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.inner.closing.store(false, Ordering::SeqCst);
        Arc::clone(&self.inner).open().await
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        let inner = &self.inner;
        inner.closing.store(true, Ordering::SeqCst);
        inner.cancel_timers();
        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = inner.reader.lock().take() {
            reader.abort();
        }
        let sink = inner.sink.write().take();

        if !inner.core.transition_from(
            &[
                ConnectionState::Connected,
                ConnectionState::Connecting,
                ConnectionState::Reconnecting,
            ],
            ConnectionState::Disconnected,
        ) {
            return Ok(());
        }
        info!(connection = %inner.core.connection_id(), "Disconnected");
        inner.core.observer().emit_close(CloseInfo::local());

        if let Some(sink) = sink {
            sink.close().await.map_err(|e| inner.core.fail(e))?;
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), AdapterError> {
        let inner = &self.inner;
        inner.core.ensure_connected()?;

        let _ordered = inner.send_lock.lock().await;
        let Some(sink) = inner.sink.read().clone() else {
            return Err(inner.core.fail(AdapterError::NotConnected(inner.core.state())));
        };
        sink.send(data).await.map_err(|e| inner.core.fail(e))
    }

    fn buffered_amount(&self) -> usize {
        self.inner
            .sink
            .read()
            .as_ref()
            .map_or(0, |sink| sink.buffered_amount())
    }

    fn health_check(&self) -> bool {
        self.inner.core.state() == ConnectionState::Connected && self.inner.sink.read().is_some()
    }

    fn set_observer(&self, observer: AdapterObserver) {
        self.inner.core.set_observer(observer);
    }
}

impl Drop for WebSocketAdapter {
    fn drop(&mut self) {
        self.inner.cancel_timers();
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
    }
}
