//! Peer-to-peer data channel adapter.
//!
//! Wraps one data channel opened through a [`PeerConnector`]. Signaling and
//! peer negotiation belong to the connector. No heartbeat or reconnect.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use relay_protocol::{ConnectionId, Protocol};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::observer::{AdapterObserver, CloseInfo};
use crate::state::{AdapterCore, ConnectionState};
use crate::traits::{AdapterError, TransportAdapter};

/// Data channel adapter configuration.
#[derive(Debug, Clone)]
pub struct DataChannelConfig {
    /// Channel label, also used as the envelope transport URI.
    pub label: String,
    /// How long `connect` waits for the channel to open.
    pub open_timeout: Duration,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            label: "relay".to_string(),
            open_timeout: Duration::from_secs(10),
        }
    }
}

/// Events raised by a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelEvent {
    Open,
    Message(Bytes),
    Error(String),
    Close,
}

/// One negotiated data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), AdapterError>;

    async fn close(&self) -> Result<(), AdapterError>;

    fn buffered_amount(&self) -> usize {
        0
    }
}

/// A created data channel and its events.
pub struct DataChannelLink {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<DataChannelEvent>,
}

/// Creates data channels on an established peer connection.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<DataChannelLink, AdapterError>;
}

/// Data channel adapter.
pub struct DataChannelAdapter {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    core: AdapterCore,
    config: DataChannelConfig,
    connector: Arc<dyn PeerConnector>,
    channel: RwLock<Option<Arc<dyn DataChannel>>>,
    send_lock: tokio::sync::Mutex<()>,
    /// Resolves a pending `connect` once the channel opens or fails.
    ready: Mutex<Option<oneshot::Sender<Result<(), AdapterError>>>>,
    pump: Mutex<Option<AbortHandle>>,
    generation: AtomicU64,
}

impl DataChannelAdapter {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        config: DataChannelConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                core: AdapterCore::new(Protocol::WebRtc, connection_id),
                config,
                connector,
                channel: RwLock::new(None),
                send_lock: tokio::sync::Mutex::new(()),
                ready: Mutex::new(None),
                pump: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.config.label
    }
}

impl PeerInner {
    async fn pump(
        weak: Weak<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<DataChannelEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            match event {
                DataChannelEvent::Open => inner.on_open(),
                DataChannelEvent::Message(data) => {
                    let envelope = inner.core.envelope(data, &inner.config.label);
                    inner.core.observer().emit_message(envelope);
                }
                DataChannelEvent::Error(e) => inner.on_error(AdapterError::Other(e)),
                DataChannelEvent::Close => {
                    inner.on_close();
                    return;
                }
            }
        }

        if let Some(inner) = weak.upgrade() {
            if inner.generation.load(Ordering::SeqCst) == generation {
                inner.on_close();
            }
        }
    }

    fn resolve(&self, result: Result<(), AdapterError>) {
        if let Some(ready) = self.ready.lock().take() {
            let _ = ready.send(result);
        }
    }

    /// Fails a `connect` still waiting for the open event.
    fn cancel_pending(&self) {
        let pending = self.ready.lock().take();
        if let Some(ready) = pending {
            let _ = ready.send(Err(self.core.fail(AdapterError::ConnectionClosed)));
        }
    }

    fn on_open(&self) {
        if !self
            .core
            .transition_from(&[ConnectionState::Connecting], ConnectionState::Connected)
        {
            return;
        }
        info!(connection = %self.core.connection_id(), label = %self.config.label, "Data channel open");
        self.core.observer().emit_open();
        self.resolve(Ok(()));
    }

    fn on_error(&self, error: AdapterError) {
        let error = self.core.fail(error);
        if self
            .core
            .transition_from(&[ConnectionState::Connecting], ConnectionState::Failed)
        {
            self.channel.write().take();
            self.resolve(Err(error));
        }
    }

    fn on_close(&self) {
        self.channel.write().take();
        self.pump.lock().take();

        if self
            .core
            .transition_from(&[ConnectionState::Connected], ConnectionState::Disconnected)
        {
            info!(connection = %self.core.connection_id(), "Data channel closed by peer");
            self.core
                .observer()
                .emit_close(CloseInfo::remote(None, "data channel closed"));
        } else if self
            .core
            .transition_from(&[ConnectionState::Connecting], ConnectionState::Failed)
        {
            let error = self.core.fail(AdapterError::ConnectionClosed);
            self.resolve(Err(error));
        }
    }
}

#[async_trait]
impl TransportAdapter for DataChannelAdapter {
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
        let inner = &self.inner;
        inner
            .core
            .transition(ConnectionState::Connecting)
            .map_err(|e| inner.core.fail(e))?;
        debug!(connection = %inner.core.connection_id(), label = %inner.config.label, "Creating data channel");

        let link = match inner.connector.create_data_channel(&inner.config.label).await {
            Ok(link) => link,
            Err(e) => {
                inner
                    .core
                    .transition_from(&[ConnectionState::Connecting], ConnectionState::Failed);
                return Err(inner.core.fail(e));
            }
        };
        if inner.core.state() != ConnectionState::Connecting {
            let _ = link.channel.close().await;
            return Err(inner.core.fail(AdapterError::ConnectionClosed));
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        *inner.ready.lock() = Some(ready_tx);
        *inner.channel.write() = Some(Arc::clone(&link.channel));

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pump = tokio::spawn(PeerInner::pump(
            Arc::downgrade(inner),
            generation,
            link.events,
        ));
        *inner.pump.lock() = Some(pump.abort_handle());

        match tokio::time::timeout(inner.config.open_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(inner.core.fail(AdapterError::ConnectionClosed)),
            Err(_) => {
                inner.ready.lock().take();
                inner.generation.fetch_add(1, Ordering::SeqCst);
                if let Some(pump) = inner.pump.lock().take() {
                    pump.abort();
                }
                inner.channel.write().take();
                inner
                    .core
                    .transition_from(&[ConnectionState::Connecting], ConnectionState::Failed);
                let _ = link.channel.close().await;
                Err(inner.core.fail(AdapterError::Timeout(format!(
                    "data channel '{}' did not open",
                    inner.config.label
                ))))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pump) = inner.pump.lock().take() {
            pump.abort();
        }
        let channel = inner.channel.write().take();

        if !inner.core.transition_from(
            &[ConnectionState::Connected, ConnectionState::Connecting],
            ConnectionState::Disconnected,
        ) {
            return Ok(());
        }
        inner.cancel_pending();
        info!(connection = %inner.core.connection_id(), "Data channel disconnected");
        inner.core.observer().emit_close(CloseInfo::local());

        if let Some(channel) = channel {
            channel.close().await.map_err(|e| inner.core.fail(e))?;
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), AdapterError> {
        let inner = &self.inner;
        inner.core.ensure_connected()?;

        let _ordered = inner.send_lock.lock().await;
        let Some(channel) = inner.channel.read().clone() else {
            return Err(inner.core.fail(AdapterError::NotConnected(inner.core.state())));
        };
        channel.send(data).await.map_err(|e| inner.core.fail(e))
    }

    fn buffered_amount(&self) -> usize {
        self.inner
            .channel
            .read()
            .as_ref()
            .map_or(0, |channel| channel.buffered_amount())
    }

    fn set_observer(&self, observer: AdapterObserver) {
        self.inner.core.set_observer(observer);
    }
}

impl Drop for DataChannelAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
    }
}
