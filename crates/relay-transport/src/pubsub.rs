//! Broker publish/subscribe adapter.
//!
//! The adapter subscribes to and publishes on one fixed topic. Inbound
//! envelopes carry the originating topic as their transport URI. Brokers
//! are expected not to echo a client's own publications back to it.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_protocol::{ConnectionId, Protocol};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::observer::{AdapterObserver, CloseInfo};
use crate::state::{AdapterCore, ConnectionState};
use crate::traits::{AdapterError, TransportAdapter};

/// Pub/sub adapter configuration.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub broker_url: String,
    /// Client identifier presented to the broker; the connection id if
    /// unset.
    pub client_id: Option<String>,
    /// Topic subscribed to and published on.
    pub topic: String,
    pub keep_alive: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://127.0.0.1:1883".to_string(),
            client_id: None,
            topic: "relay/messages".to_string(),
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Events delivered by a broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubEvent {
    Message { topic: String, payload: Bytes },
    Error(String),
    /// Broker session ended.
    Closed(Option<String>),
}

/// Broker client seam.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Open a session presenting `client_id`; events flow until the
    /// session ends.
    async fn connect(
        &self,
        client_id: &str,
        config: &PubSubConfig,
    ) -> Result<mpsc::UnboundedReceiver<PubSubEvent>, AdapterError>;

    async fn subscribe(&self, topic: &str) -> Result<(), AdapterError>;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), AdapterError>;

    async fn disconnect(&self) -> Result<(), AdapterError>;

    fn buffered_amount(&self) -> usize {
        0
    }
}

/// Pub/sub adapter.
pub struct PubSubAdapter {
    inner: Arc<PubSubInner>,
}

struct PubSubInner {
    core: AdapterCore,
    config: PubSubConfig,
    client: Arc<dyn PubSubClient>,
    send_lock: tokio::sync::Mutex<()>,
    pump: Mutex<Option<AbortHandle>>,
    generation: AtomicU64,
}

impl PubSubAdapter {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        config: PubSubConfig,
        client: Arc<dyn PubSubClient>,
    ) -> Self {
        Self {
            inner: Arc::new(PubSubInner {
                core: AdapterCore::new(Protocol::Mqtt, connection_id),
                config,
                client,
                send_lock: tokio::sync::Mutex::new(()),
                pump: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Topic the adapter subscribes to and publishes on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.config.topic
    }
}

impl PubSubInner {
    async fn pump(
        weak: Weak<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<PubSubEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            match event {
                PubSubEvent::Message { topic, payload } => {
                    trace!(connection = %inner.core.connection_id(), topic = %topic, bytes = payload.len(), "Received message");
                    let envelope = inner.core.envelope(payload, &topic);
                    inner.core.observer().emit_message(envelope);
                }
                PubSubEvent::Error(e) => {
                    inner.core.fail(AdapterError::Other(e));
                }
                PubSubEvent::Closed(reason) => {
                    inner.on_closed(reason);
                    return;
                }
            }
        }

        if let Some(inner) = weak.upgrade() {
            if inner.generation.load(Ordering::SeqCst) == generation {
                inner.on_closed(None);
            }
        }
    }

    fn on_closed(&self, reason: Option<String>) {
        self.pump.lock().take();
        if self
            .core
            .transition_from(&[ConnectionState::Connected], ConnectionState::Disconnected)
        {
            info!(connection = %self.core.connection_id(), "Broker session closed");
            self.core.observer().emit_close(CloseInfo::remote(
                None,
                reason.unwrap_or_else(|| "broker session ended".to_string()),
            ));
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<(), AdapterError> {
        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| self.core.connection_id().to_string());
        let events = self.client.connect(&client_id, &self.config).await?;

        let topic = &self.config.topic;
        if let Err(e) = self.client.subscribe(topic).await {
            let _ = self.client.disconnect().await;
            return Err(e);
        }
        debug!(connection = %self.core.connection_id(), topic = %topic, "Subscribed");

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pump = tokio::spawn(Self::pump(Arc::downgrade(self), generation, events));
        *self.pump.lock() = Some(pump.abort_handle());
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for PubSubAdapter {
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
        info!(connection = %inner.core.connection_id(), broker = %inner.config.broker_url, "Connecting to broker");

        if let Err(e) = inner.establish().await {
            inner
                .core
                .transition_from(&[ConnectionState::Connecting], ConnectionState::Failed);
            return Err(inner.core.fail(e));
        }

        if !inner
            .core
            .transition_from(&[ConnectionState::Connecting], ConnectionState::Connected)
        {
            inner.generation.fetch_add(1, Ordering::SeqCst);
            if let Some(pump) = inner.pump.lock().take() {
                pump.abort();
            }
            let _ = inner.client.disconnect().await;
            return Err(inner.core.fail(AdapterError::ConnectionClosed));
        }
        inner.core.observer().emit_open();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(pump) = inner.pump.lock().take() {
            pump.abort();
        }

        if !inner.core.transition_from(
            &[ConnectionState::Connected, ConnectionState::Connecting],
            ConnectionState::Disconnected,
        ) {
            return Ok(());
        }
        info!(connection = %inner.core.connection_id(), "Disconnected from broker");
        inner.core.observer().emit_close(CloseInfo::local());

        if let Err(e) = inner.client.disconnect().await {
            warn!(connection = %inner.core.connection_id(), "Broker disconnect failed: {}", e);
            return Err(inner.core.fail(e));
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), AdapterError> {
        let inner = &self.inner;
        inner.core.ensure_connected()?;

        let _ordered = inner.send_lock.lock().await;
        inner
            .client
            .publish(&inner.config.topic, data)
            .await
            .map_err(|e| inner.core.fail(e))
    }

    fn buffered_amount(&self) -> usize {
        self.inner.client.buffered_amount()
    }

    fn set_observer(&self, observer: AdapterObserver) {
        self.inner.core.set_observer(observer);
    }
}

impl Drop for PubSubAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    use ConnectionState::*;

    fn adapter(broker: &MemoryBroker, id: &str) -> PubSubAdapter {
        PubSubAdapter::new(
            ConnectionId::from(id),
            PubSubConfig::default(),
            Arc::new(broker.client()),
        )
    }

    #[tokio::test]
    async fn test_publish_to_fixed_topic() {
        let broker = MemoryBroker::new();
        let mqtt = adapter(&broker, "conn-1");
        mqtt.connect().await.unwrap();

        mqtt.send(Bytes::from_static(b"a")).await.unwrap();
        mqtt.send(Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(
            broker.published(),
            vec![
                ("relay/messages".to_string(), Bytes::from_static(b"a")),
                ("relay/messages".to_string(), Bytes::from_static(b"b")),
            ]
        );
        assert_eq!(broker.client_ids(), vec!["conn-1".to_string()]);
    }

    #[tokio::test]
    async fn test_inbound_envelope_carries_topic() {
        let broker = MemoryBroker::new();
        let mqtt = adapter(&broker, "conn-1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        mqtt.set_observer(AdapterObserver::new().on_message(move |env| {
            let _ = tx.send(env);
        }));
        mqtt.connect().await.unwrap();

        assert_eq!(broker.publish("relay/messages", Bytes::from_static(b"in")), 1);
        assert_eq!(broker.publish("other/topic", Bytes::from_static(b"skip")), 0);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.protocol, Protocol::Mqtt);
        assert_eq!(envelope.transport_uri.as_deref(), Some("relay/messages"));
        assert_eq!(&envelope.raw[..], b"in");
    }

    #[tokio::test]
    async fn test_broker_refuses_connection() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let mqtt = adapter(&broker, "conn-1");

        assert!(matches!(mqtt.connect().await, Err(AdapterError::ConnectFailed(_))));
        assert_eq!(mqtt.state(), Failed);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting() {
        let broker = MemoryBroker::new();
        broker.hold_connects(true);
        let mqtt = Arc::new(adapter(&broker, "conn-1"));

        let states = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        mqtt.set_observer(
            AdapterObserver::new()
                .on_state_change({
                    let states = Arc::clone(&states);
                    move |_, to| states.lock().push(to)
                })
                .on_error({
                    let errors = Arc::clone(&errors);
                    move |e| errors.lock().push(e.clone())
                }),
        );

        let pending = tokio::spawn({
            let mqtt = Arc::clone(&mqtt);
            async move { mqtt.connect().await }
        });
        while broker.pending_connects() == 0 {
            tokio::task::yield_now().await;
        }
        mqtt.disconnect().await.unwrap();
        broker.hold_connects(false);

        assert_eq!(pending.await.unwrap(), Err(AdapterError::ConnectionClosed));
        assert_eq!(*states.lock(), vec![Connecting, Disconnected]);
        assert_eq!(*errors.lock(), vec![AdapterError::ConnectionClosed]);

        // The late session was torn down again.
        assert_eq!(broker.subscriber_count("relay/messages"), 0);
        assert!(broker.client_ids().is_empty());
        assert_eq!(broker.publish("relay/messages", Bytes::from_static(b"x")), 0);
    }

    #[tokio::test]
    async fn test_session_end_disconnects() {
        let broker = MemoryBroker::new();
        let mqtt = adapter(&broker, "conn-1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        mqtt.set_observer(AdapterObserver::new().on_close(move |info| {
            let _ = tx.send(info);
        }));
        mqtt.connect().await.unwrap();

        broker.disconnect_all();
        let info = rx.recv().await.unwrap();
        assert!(!info.local);
        assert_eq!(mqtt.state(), Disconnected);
        assert!(matches!(
            mqtt.send(Bytes::from_static(b"late")).await,
            Err(AdapterError::NotConnected(Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_releases_subscriptions() {
        let broker = MemoryBroker::new();
        let mqtt = adapter(&broker, "conn-1");
        mqtt.connect().await.unwrap();
        assert_eq!(broker.subscriber_count("relay/messages"), 1);

        mqtt.disconnect().await.unwrap();
        assert_eq!(broker.subscriber_count("relay/messages"), 0);
        assert_eq!(mqtt.state(), Disconnected);
    }
}
