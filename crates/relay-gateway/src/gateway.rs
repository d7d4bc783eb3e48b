//! Connection orchestration and fan-out.
//!
//! The gateway owns one adapter per connection, routes frames between
//! connections through the channel registry and replays offline buffers.
//! Each connection gets a dispatch task that consumes its adapter's events
//! in order.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use indexmap::IndexSet;
use parking_lot::Mutex;
use relay_protocol::{
    codec, now_millis, Ack, AckStatus, ChannelId, ClientId, ConnectionId, Envelope, Frame,
    Message, MessageId, OfflinePolicyKind, ProtocolError,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tenvis_relay_core::{ChannelConfig, ChannelError, ChannelMetrics, ChannelRegistry};
use tenvis_relay_transport::{
    AdapterError, AdapterFactory, AdapterObserver, CloseInfo, ConnectionState, TransportAdapter,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::config::GatewayConfig;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::observer::{AccessPolicy, AllowAll, GatewayObserver};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Adapter error.
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Channel error.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Inbound or outbound frame could not be coded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The factory could not build an adapter.
    #[error("Adapter construction failed: {0}")]
    AdapterConstruction(AdapterError),

    /// Subscription rejected by the access policy or channel allow-list.
    #[error("Access denied for {client} on channel {channel}")]
    AccessDenied { client: ClientId, channel: ChannelId },
}

impl GatewayError {
    /// Label used for the `type` dimension of the error counter.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Adapter(_) => "adapter",
            GatewayError::Channel(_) => "channel",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::AdapterConstruction(_) => "construction",
            GatewayError::AccessDenied { .. } => "access_denied",
        }
    }
}

/// An acknowledgement as received by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckRecord {
    pub connection_id: ConnectionId,
    pub ack: Ack,
    /// Milliseconds since the Unix epoch when the gateway recorded it.
    pub recorded_at: u64,
}

/// What a publish did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub message_id: MessageId,
    pub channel: ChannelId,
    /// Subscribers the message was fanned out to.
    pub recipients: usize,
    /// Sends that succeeded, retries included.
    pub sent: usize,
    /// Sends that failed after exhausting their retry budget.
    pub failed: usize,
    /// Stored in the channel's offline buffer.
    pub buffered: bool,
    /// Oldest buffered message evicted to make room.
    pub evicted: Option<MessageId>,
    /// Dropped for lack of subscribers.
    pub dropped: bool,
}

/// Gateway snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub connections: usize,
    /// Connections whose adapter is currently connected.
    pub connected: usize,
    pub channels: usize,
    pub subscriptions: usize,
    pub buffered_messages: usize,
    pub acknowledgements: usize,
    /// Operations ignored because their connection or channel was unknown.
    pub lookup_misses: u64,
}

#[derive(Debug, Clone, Copy)]
enum LookupKind {
    Connection,
    Channel,
}

impl LookupKind {
    fn as_str(self) -> &'static str {
        match self {
            LookupKind::Connection => "connection",
            LookupKind::Channel => "channel",
        }
    }
}

/// Adapter events forwarded to a connection's dispatch task.
enum ConnectionEvent {
    Inbound(Envelope),
    Opened,
    Closed(CloseInfo),
    Failed,
}

struct Connection {
    client_id: Option<ClientId>,
    adapter: Arc<dyn TransportAdapter>,
    /// Callbacks supplied by the caller of `connect`.
    observer: AdapterObserver,
    /// Gateway events scoped to this connection.
    events: GatewayObserver,
    /// Subscribed channels, in subscription order.
    channels: Mutex<IndexSet<ChannelId>>,
    established: AtomicBool,
    dispatch: Mutex<Option<AbortHandle>>,
    _metrics: ConnectionMetricsGuard,
}

impl Connection {
    /// Identity checked against access policies.
    fn principal<'a>(&'a self, id: &'a ConnectionId) -> &'a str {
        self.client_id.as_deref().unwrap_or(id.as_str())
    }
}

struct GatewayInner {
    config: GatewayConfig,
    factory: Arc<dyn AdapterFactory>,
    channels: ChannelRegistry,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    acks: DashMap<MessageId, Vec<AckRecord>>,
    observer: GatewayObserver,
    access: Arc<dyn AccessPolicy>,
    lookup_misses: AtomicU64,
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    factory: Arc<dyn AdapterFactory>,
    observer: GatewayObserver,
    access: Arc<dyn AccessPolicy>,
}

impl GatewayBuilder {
    #[must_use]
    pub fn observer(mut self, observer: GatewayObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Consulted on every subscribe, before the channel allow-list.
    #[must_use]
    pub fn access_policy(mut self, policy: impl AccessPolicy + 'static) -> Self {
        self.access = Arc::new(policy);
        self
    }

    #[must_use]
    pub fn build(self) -> Gateway {
        let channels = ChannelRegistry::with_defaults(self.config.channel_defaults());
        Gateway {
            inner: Arc::new(GatewayInner {
                config: self.config,
                factory: self.factory,
                channels,
                connections: DashMap::new(),
                acks: DashMap::new(),
                observer: self.observer,
                access: self.access,
                lookup_misses: AtomicU64::new(0),
            }),
        }
    }
}

/// Realtime gateway. Clones share state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Gateway with no observer and no access policy.
    #[must_use]
    pub fn new(config: GatewayConfig, factory: impl AdapterFactory + 'static) -> Self {
        Self::builder(config, factory).build()
    }

    #[must_use]
    pub fn builder(config: GatewayConfig, factory: impl AdapterFactory + 'static) -> GatewayBuilder {
        GatewayBuilder {
            config,
            factory: Arc::new(factory),
            observer: GatewayObserver::default(),
            access: Arc::new(AllowAll),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// The channel registry backing this gateway.
    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    /// Open a new connection.
    ///
    /// `observer` receives the adapter's own callbacks in addition to the
    /// gateway's handling of them. Gateway-level events such as acks and
    /// backpressure only reach the gateway observer; use
    /// [`Gateway::connect_with_events`] to receive them per connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory cannot build an adapter or the
    /// adapter fails to connect. The connection is not kept in either case.
    pub async fn connect(
        &self,
        client_id: Option<ClientId>,
        observer: Option<AdapterObserver>,
    ) -> Result<ConnectionId, GatewayError> {
        self.connect_with_events(client_id, observer, GatewayObserver::default())
            .await
    }

    /// Open a new connection whose gateway events (connect, disconnect,
    /// message, ack, error, backpressure) are also delivered to `events`.
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::connect`].
    pub async fn connect_with_events(
        &self,
        client_id: Option<ClientId>,
        observer: Option<AdapterObserver>,
        events: GatewayObserver,
    ) -> Result<ConnectionId, GatewayError> {
        let id = ConnectionId::generate();
        let adapter = match self.inner.factory.create(&id) {
            Ok(adapter) => adapter,
            Err(e) => {
                let err = GatewayError::AdapterConstruction(e);
                self.report_error(None, &err);
                return Err(err);
            }
        };

        let observer = observer.unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        adapter.set_observer(self.wire_observer(&id, &observer, &events, tx));

        let connection = Arc::new(Connection {
            client_id,
            adapter: Arc::clone(&adapter),
            observer,
            events,
            channels: Mutex::new(IndexSet::new()),
            established: AtomicBool::new(false),
            dispatch: Mutex::new(None),
            _metrics: ConnectionMetricsGuard::new(),
        });
        self.inner.connections.insert(id.clone(), Arc::clone(&connection));

        let task = tokio::spawn(drive_connection(
            Arc::downgrade(&self.inner),
            id.clone(),
            rx,
        ));
        *connection.dispatch.lock() = Some(task.abort_handle());

        info!(
            connection = %id,
            client = ?connection.client_id,
            protocol = %adapter.protocol(),
            "Opening connection"
        );

        if let Err(e) = adapter.connect().await {
            self.inner.connections.remove(&id);
            task.abort();
            adapter.set_observer(connection.observer.clone());
            warn!(connection = %id, "Connection failed: {}", e);
            return Err(e.into());
        }

        connection.established.store(true, Ordering::SeqCst);
        self.inner.observer.emit_connect(&id);
        connection.events.emit_connect(&id);
        Ok(id)
    }

    /// Tear down a connection: leave every channel, stop dispatch and
    /// disconnect the adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter fails to close cleanly; the
    /// connection is removed regardless.
    pub async fn disconnect(&self, id: &ConnectionId) -> Result<(), GatewayError> {
        let Some((_, connection)) = self.inner.connections.remove(id) else {
            self.lookup_miss(LookupKind::Connection, id.as_str());
            return Ok(());
        };

        let channels = self.release(id, &connection);
        let result = connection.adapter.disconnect().await;
        info!(connection = %id, channels = channels.len(), "Connection closed");
        let info = CloseInfo::local();
        self.inner.observer.emit_disconnect(id, &info);
        connection.events.emit_disconnect(id, &info);
        result.map_err(GatewayError::from)
    }

    /// Disconnect every connection.
    pub async fn disconnect_all(&self) {
        for id in self.connection_ids() {
            if let Err(e) = self.disconnect(&id).await {
                warn!(connection = %id, "Disconnect failed: {}", e);
            }
        }
    }

    /// Subscribe a connection to a channel, creating the channel on first
    /// reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or access is denied.
    pub fn subscribe(&self, id: &ConnectionId, channel: &str) -> Result<(), GatewayError> {
        let Some(connection) = self.connection(id) else {
            self.lookup_miss(LookupKind::Connection, id.as_str());
            return Ok(());
        };
        let client = connection.principal(id);

        let added = if self.inner.access.allows(client, channel) {
            self.inner.channels.with_channel(channel, |ch| {
                ch.can_client_access(client).then(|| ch.subscribe(id.as_str()))
            })?
        } else {
            None
        };

        let Some(added) = added else {
            warn!(connection = %id, client = %client, channel = %channel, "Subscription denied");
            metrics::record_error("access_denied");
            return Err(GatewayError::AccessDenied {
                client: client.to_string(),
                channel: channel.to_string(),
            });
        };

        if added {
            connection.channels.lock().insert(channel.to_string());
            metrics::record_subscription();
            metrics::set_active_channels(self.inner.channels.len());
            debug!(connection = %id, channel = %channel, "Subscribed");
        }
        Ok(())
    }

    /// Unsubscribe a connection from a channel. Unknown channels are not
    /// created.
    ///
    /// # Errors
    ///
    /// Currently infallible; lookup misses are logged and counted.
    pub fn unsubscribe(&self, id: &ConnectionId, channel: &str) -> Result<(), GatewayError> {
        let Some(connection) = self.connection(id) else {
            self.lookup_miss(LookupKind::Connection, id.as_str());
            return Ok(());
        };

        match self.inner.channels.unsubscribe(channel, id.as_str()) {
            None => self.lookup_miss(LookupKind::Channel, channel),
            Some(removed) => {
                connection.channels.lock().shift_remove(channel);
                if removed {
                    debug!(connection = %id, channel = %channel, "Unsubscribed");
                }
            }
        }
        Ok(())
    }

    /// Publish a message on behalf of a connection.
    ///
    /// The connection is recorded as the message source unless one is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or the message
    /// cannot be encoded. Failed sends are counted in the report.
    pub async fn publish(
        &self,
        id: &ConnectionId,
        mut message: Message,
    ) -> Result<PublishReport, GatewayError> {
        if !self.inner.connections.contains_key(id) {
            self.lookup_miss(LookupKind::Connection, id.as_str());
            return Ok(PublishReport::default());
        }
        if message.source.is_none() {
            message.source = Some(id.clone());
        }
        self.distribute(message).await
    }

    /// Publish a message that no connection originated.
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::publish`].
    pub async fn broadcast(&self, message: Message) -> Result<PublishReport, GatewayError> {
        self.distribute(message).await
    }

    async fn distribute(&self, message: Message) -> Result<PublishReport, GatewayError> {
        let message = Arc::new(message);
        let (outcome, subscribers) = self.inner.channels.with_channel(&message.channel, |ch| {
            let outcome = ch.publish(Arc::clone(&message));
            let subscribers = if outcome.dropped {
                Vec::new()
            } else {
                ch.subscribers()
            };
            (outcome, subscribers)
        })?;
        metrics::set_active_channels(self.inner.channels.len());

        if matches!(
            outcome.policy,
            Some(OfflinePolicyKind::Persist | OfflinePolicyKind::Sync)
        ) {
            let persist_key = message.offline.as_ref().and_then(|p| p.persist_key.as_deref());
            debug!(
                channel = %message.channel,
                message = %message.id,
                policy = ?outcome.policy,
                persist_key = ?persist_key,
                "Offline handling deferred to external collaborator"
            );
        }

        let mut report = PublishReport {
            message_id: message.id.clone(),
            channel: message.channel.clone(),
            recipients: outcome.recipients,
            buffered: outcome.buffered,
            evicted: outcome.evicted.map(|m| m.id.clone()),
            dropped: outcome.dropped,
            ..PublishReport::default()
        };
        if subscribers.is_empty() {
            return Ok(report);
        }

        let frame = codec::encode(&Frame::publish(message.as_ref().clone()))?;
        let retries = message.retry_budget();

        let targets: Vec<_> = subscribers
            .into_iter()
            .map(ConnectionId::from)
            .filter_map(|target| self.connection(&target).map(|c| (target, c)))
            .collect();
        let results = join_all(
            targets
                .iter()
                .map(|(target, connection)| self.deliver(target, connection, frame.clone(), retries)),
        )
        .await;

        report.sent = results.iter().filter(|sent| **sent).count();
        report.failed = results.len() - report.sent;
        trace!(
            channel = %report.channel,
            message = %report.message_id,
            sent = report.sent,
            failed = report.failed,
            "Fan-out complete"
        );
        Ok(report)
    }

    /// Send one frame, retrying up to `retries` times. True if it was sent.
    async fn deliver(
        &self,
        id: &ConnectionId,
        connection: &Connection,
        frame: Bytes,
        retries: u32,
    ) -> bool {
        let mut attempt = 0;
        loop {
            match connection.adapter.send(frame.clone()).await {
                Ok(()) => {
                    metrics::record_message(frame.len(), "outbound");
                    self.check_backpressure(id, connection);
                    return true;
                }
                Err(e) if attempt < retries => {
                    attempt += 1;
                    metrics::record_send_retry();
                    debug!(connection = %id, attempt, "Send failed, retrying: {}", e);
                }
                Err(e) => {
                    warn!(connection = %id, "Send failed: {}", e);
                    return false;
                }
            }
        }
    }

    fn check_backpressure(&self, id: &ConnectionId, connection: &Connection) {
        let buffered = connection.adapter.buffered_amount();
        if buffered > self.inner.config.gateway.backpressure_threshold_bytes {
            debug!(connection = %id, buffered, "Backpressure");
            metrics::record_backpressure();
            self.inner.observer.emit_backpressure(id, buffered);
            connection.events.emit_backpressure(id, buffered);
        }
    }

    /// Record a delivery confirmation from a connection.
    ///
    /// # Errors
    ///
    /// Currently infallible; lookup misses are logged and counted.
    pub fn acknowledge(&self, id: &ConnectionId, ack: Ack) -> Result<(), GatewayError> {
        if !self.inner.connections.contains_key(id) {
            self.lookup_miss(LookupKind::Connection, id.as_str());
            return Ok(());
        }

        metrics::record_ack(match ack.status {
            AckStatus::Received => "received",
            AckStatus::Processed => "processed",
            AckStatus::Rejected => "rejected",
        });
        trace!(connection = %id, message = %ack.message_id, status = ?ack.status, "Ack");
        self.notify(id, |o| o.emit_ack(id, &ack));
        self.inner
            .acks
            .entry(ack.message_id.clone())
            .or_default()
            .push(AckRecord {
                connection_id: id.clone(),
                ack,
                recorded_at: now_millis(),
            });
        Ok(())
    }

    /// Acknowledgements recorded for a message, in arrival order.
    #[must_use]
    pub fn acknowledgements(&self, message_id: &str) -> Vec<AckRecord> {
        self.inner
            .acks
            .get(message_id)
            .map(|records| records.value().clone())
            .unwrap_or_default()
    }

    /// Drain the offline buffer of every channel the connection is
    /// subscribed to and send the messages to that connection only.
    ///
    /// Channels are visited in subscription order, messages oldest first.
    /// Messages that fail to send are not buffered again. Returns the
    /// number sent.
    ///
    /// # Errors
    ///
    /// Currently infallible; encode failures are reported as error events.
    pub async fn flush_offline_queue(&self, id: &ConnectionId) -> Result<usize, GatewayError> {
        let Some(connection) = self.connection(id) else {
            self.lookup_miss(LookupKind::Connection, id.as_str());
            return Ok(0);
        };

        let channels: Vec<ChannelId> = connection.channels.lock().iter().cloned().collect();
        let mut sent = 0;
        for channel in channels {
            let Some(messages) = self.inner.channels.flush(&channel) else {
                continue;
            };
            for message in messages {
                let frame = match codec::encode(&Frame::publish(message.as_ref().clone())) {
                    Ok(frame) => frame,
                    Err(e) => {
                        self.report_error(Some(id), &e.into());
                        continue;
                    }
                };
                if self
                    .deliver(id, &connection, frame, message.retry_budget())
                    .await
                {
                    sent += 1;
                }
            }
        }

        if sent > 0 {
            info!(connection = %id, replayed = sent, "Flushed offline buffers");
            metrics::record_replayed(sent);
        }
        Ok(sent)
    }

    /// Decode an inbound payload and apply it as the given connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not decode or the resulting
    /// operation fails.
    pub async fn dispatch(&self, id: &ConnectionId, envelope: Envelope) -> Result<(), GatewayError> {
        if !self.inner.connections.contains_key(id) {
            self.lookup_miss(LookupKind::Connection, id.as_str());
            return Ok(());
        }

        metrics::record_message(envelope.raw.len(), "inbound");
        let frame = codec::decode(&envelope.raw)?;
        trace!(connection = %id, frame_type = ?frame.frame_type(), "Dispatching frame");

        match frame {
            Frame::Subscribe { channel } => self.subscribe(id, &channel),
            Frame::Unsubscribe { channel } => self.unsubscribe(id, &channel),
            Frame::Publish { message } => {
                self.notify(id, |o| o.emit_message(id, &message));
                self.publish(id, message).await.map(|_| ())
            }
            Frame::Ack { ack } => self.acknowledge(id, ack),
        }
    }

    /// True when every managed adapter is connected.
    #[must_use]
    pub fn health_check(&self) -> bool {
        self.inner
            .connections
            .iter()
            .all(|entry| entry.adapter.health_check())
    }

    /// Register a channel with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the channel exists.
    pub fn create_channel(&self, name: &str, config: ChannelConfig) -> Result<(), GatewayError> {
        self.inner.channels.create(name, config)?;
        metrics::set_active_channels(self.inner.channels.len());
        Ok(())
    }

    #[must_use]
    pub fn channel_metrics(&self, name: &str) -> Option<ChannelMetrics> {
        self.inner.channels.metrics(name)
    }

    /// Drop every channel and subscription. Connections stay open.
    pub fn reset_channels(&self) {
        self.inner.channels.reset();
        for entry in self.inner.connections.iter() {
            entry.channels.lock().clear();
        }
        metrics::set_active_channels(0);
        info!("Channels reset");
    }

    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    #[must_use]
    pub fn connection_state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.connection(id).map(|c| c.adapter.state())
    }

    /// The adapter bound to a connection.
    #[must_use]
    pub fn adapter(&self, id: &ConnectionId) -> Option<Arc<dyn TransportAdapter>> {
        self.connection(id).map(|c| Arc::clone(&c.adapter))
    }

    /// Channels a connection is subscribed to, in subscription order.
    #[must_use]
    pub fn subscriptions(&self, id: &ConnectionId) -> Vec<ChannelId> {
        self.connection(id)
            .map(|c| c.channels.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        let registry = self.inner.channels.stats();
        GatewayStats {
            connections: self.inner.connections.len(),
            connected: self
                .inner
                .connections
                .iter()
                .filter(|entry| entry.adapter.state() == ConnectionState::Connected)
                .count(),
            channels: registry.channel_count,
            subscriptions: registry.total_subscriptions,
            buffered_messages: registry.total_buffered,
            acknowledgements: self.inner.acks.iter().map(|entry| entry.len()).sum(),
            lookup_misses: self.inner.lookup_misses.load(Ordering::Relaxed),
        }
    }

    fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn lookup_miss(&self, kind: LookupKind, key: &str) {
        warn!(kind = kind.as_str(), id = %key, "Unknown identifier, ignoring");
        metrics::record_lookup_miss(kind.as_str());
        self.inner.lookup_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn report_error(&self, id: Option<&ConnectionId>, error: &GatewayError) {
        warn!(connection = ?id, "Gateway error: {}", error);
        metrics::record_error(error.kind());
        self.inner.observer.emit_error(id, error);
        if let Some(connection) = id.and_then(|id| self.connection(id)) {
            connection.events.emit_error(id, error);
        }
    }

    /// Deliver an event to the gateway observer and the connection's own.
    fn notify(&self, id: &ConnectionId, emit: impl Fn(&GatewayObserver)) {
        emit(&self.inner.observer);
        if let Some(connection) = self.connection(id) {
            emit(&connection.events);
        }
    }

    /// Detach a removed connection from channels and its dispatch task and
    /// hand the adapter's callbacks back to the caller's observer.
    fn release(&self, id: &ConnectionId, connection: &Connection) -> Vec<ChannelId> {
        if let Some(task) = connection.dispatch.lock().take() {
            task.abort();
        }
        connection.adapter.set_observer(connection.observer.clone());
        connection.channels.lock().clear();
        let channels = self.inner.channels.unsubscribe_all(id.as_str());
        metrics::set_active_channels(self.inner.channels.len());
        channels
    }

    /// Route adapter callbacks to the caller's observer, the gateway
    /// observer and the dispatch task.
    fn wire_observer(
        &self,
        id: &ConnectionId,
        user: &AdapterObserver,
        scoped: &GatewayObserver,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> AdapterObserver {
        let on_open = {
            let user = user.clone();
            let events = events.clone();
            move || {
                user.emit_open();
                let _ = events.send(ConnectionEvent::Opened);
            }
        };
        let on_message = {
            let user = user.clone();
            let events = events.clone();
            move |envelope: Envelope| {
                user.emit_message(envelope.clone());
                let _ = events.send(ConnectionEvent::Inbound(envelope));
            }
        };
        let on_error = {
            let user = user.clone();
            let observer = self.inner.observer.clone();
            let scoped = scoped.clone();
            let id = id.clone();
            move |error: &AdapterError| {
                user.emit_error(error);
                metrics::record_error("adapter");
                let error = GatewayError::Adapter(error.clone());
                observer.emit_error(Some(&id), &error);
                scoped.emit_error(Some(&id), &error);
            }
        };
        let on_close = {
            let user = user.clone();
            let events = events.clone();
            move |info: CloseInfo| {
                user.emit_close(info.clone());
                let _ = events.send(ConnectionEvent::Closed(info));
            }
        };
        let on_heartbeat = {
            let user = user.clone();
            move |latency| user.emit_heartbeat(latency)
        };
        let on_state_change = {
            let user = user.clone();
            move |from, to| {
                user.emit_state_change(from, to);
                if to == ConnectionState::Failed {
                    let _ = events.send(ConnectionEvent::Failed);
                }
            }
        };

        AdapterObserver::new()
            .on_open(on_open)
            .on_message(on_message)
            .on_error(on_error)
            .on_close(on_close)
            .on_heartbeat(on_heartbeat)
            .on_state_change(on_state_change)
    }

    async fn on_reopen(&self, id: &ConnectionId) {
        info!(connection = %id, "Connection re-established");
        self.notify(id, |o| o.emit_connect(id));
        if !self.inner.config.gateway.replay_on_reconnect {
            return;
        }
        if let Err(e) = self.flush_offline_queue(id).await {
            self.report_error(Some(id), &e);
        }
    }

    fn on_failed(&self, id: &ConnectionId) -> bool {
        let established = self
            .connection(id)
            .is_some_and(|c| c.established.load(Ordering::SeqCst));
        if !established {
            return false;
        }
        let Some((_, connection)) = self.inner.connections.remove(id) else {
            return false;
        };

        let channels = self.release(id, &connection);
        warn!(connection = %id, channels = channels.len(), "Adapter failed, connection removed");
        true
    }
}

/// Consume one connection's adapter events in order.
async fn drive_connection(
    weak: Weak<GatewayInner>,
    id: ConnectionId,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let mut opens = 0u64;
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let gateway = Gateway { inner };

        match event {
            ConnectionEvent::Inbound(envelope) => {
                if let Err(e) = gateway.dispatch(&id, envelope).await {
                    gateway.report_error(Some(&id), &e);
                }
            }
            ConnectionEvent::Opened => {
                opens += 1;
                if opens > 1 {
                    gateway.on_reopen(&id).await;
                }
            }
            ConnectionEvent::Closed(info) => {
                gateway.notify(&id, |o| o.emit_disconnect(&id, &info));
            }
            ConnectionEvent::Failed => {
                if gateway.on_failed(&id) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{DeliveryMode, OfflinePolicy, Protocol, Qos, SecurityPolicy};
    use std::collections::HashMap;
    use std::time::Duration;
    use tenvis_relay_transport::{
        ManualScheduler, MemorySocketDialer, WebSocketAdapter, WebSocketConfig, WebSocketFactory,
    };

    use ConnectionState::*;

    struct Harness {
        gateway: Gateway,
        dialers: Arc<Mutex<HashMap<ConnectionId, MemorySocketDialer>>>,
        scheduler: ManualScheduler,
    }

    impl Harness {
        fn new(
            mut config: GatewayConfig,
            customize: impl FnOnce(GatewayBuilder) -> GatewayBuilder,
        ) -> Self {
            config.websocket.heartbeat_interval_ms = 0;
            config.websocket.reconnect_interval_ms = 100;

            let dialers = Arc::new(Mutex::new(HashMap::new()));
            let scheduler = ManualScheduler::new();
            let factory = {
                let dialers = Arc::clone(&dialers);
                let scheduler = scheduler.clone();
                let ws = config.websocket_config();
                move |id: &ConnectionId| -> Result<Arc<dyn TransportAdapter>, AdapterError> {
                    let dialer = MemorySocketDialer::new();
                    dialers.lock().insert(id.clone(), dialer.clone());
                    Ok(Arc::new(WebSocketAdapter::with_scheduler(
                        id.clone(),
                        ws.clone(),
                        Arc::new(dialer),
                        Arc::new(scheduler.clone()),
                    )))
                }
            };

            let gateway = customize(Gateway::builder(config, factory)).build();
            Self {
                gateway,
                dialers,
                scheduler,
            }
        }

        fn dialer(&self, id: &ConnectionId) -> MemorySocketDialer {
            self.dialers.lock().get(id).cloned().unwrap()
        }

        async fn connect(&self) -> ConnectionId {
            self.gateway.connect(None, None).await.unwrap()
        }
    }

    fn harness() -> Harness {
        Harness::new(GatewayConfig::default(), |builder| builder)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        check()
    }

    fn published(frames: &[Bytes]) -> Vec<Message> {
        frames
            .iter()
            .map(|raw| match codec::decode(raw).unwrap() {
                Frame::Publish { message } => message,
                other => panic!("unexpected frame: {other:?}"),
            })
            .collect()
    }

    fn inbound(frame: &Frame) -> Bytes {
        codec::encode(frame).unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let observer = {
            let on_connect = Arc::clone(&events);
            let on_disconnect = Arc::clone(&events);
            GatewayObserver::new()
                .on_connect(move |id| on_connect.lock().push(format!("connect:{id}")))
                .on_disconnect(move |id, info| {
                    on_disconnect.lock().push(format!("disconnect:{id}:{}", info.local));
                })
        };
        let h = Harness::new(GatewayConfig::default(), |b| b.observer(observer));

        let id = h.connect().await;
        assert_eq!(h.gateway.connection_state(&id), Some(Connected));
        assert!(h.gateway.health_check());
        h.gateway.subscribe(&id, "news").unwrap();
        assert_eq!(h.gateway.subscriptions(&id), vec!["news".to_string()]);

        h.gateway.disconnect(&id).await.unwrap();
        assert_eq!(h.gateway.connection_count(), 0);
        assert_eq!(h.gateway.registry().subscriber_count("news"), 0);
        assert_eq!(
            *events.lock(),
            vec![format!("connect:{id}"), format!("disconnect:{id}:true")]
        );
    }

    #[tokio::test]
    async fn test_caller_observer_sees_adapter_events() {
        let h = harness();
        let opens = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&opens);
        let observer = AdapterObserver::new().on_open(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let id = h.gateway.connect(None, Some(observer)).await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.gateway.adapter(&id).unwrap().protocol(), Protocol::WebSocket);
    }

    #[tokio::test]
    async fn test_adapter_construction_failure() {
        let gateway = Gateway::new(
            GatewayConfig::default(),
            |_: &ConnectionId| -> Result<Arc<dyn TransportAdapter>, AdapterError> {
                Err(AdapterError::Unsupported(Protocol::Quic))
            },
        );

        let err = gateway.connect(None, None).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::AdapterConstruction(AdapterError::Unsupported(Protocol::Quic))
        ));
        assert_eq!(gateway.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_removes_connection() {
        let dialer = MemorySocketDialer::new();
        dialer.fail_next_dials(1);
        let errors = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&errors);

        let gateway = Gateway::builder(
            GatewayConfig::default(),
            WebSocketFactory::new(WebSocketConfig::default(), Arc::new(dialer.clone())),
        )
        .observer(GatewayObserver::new().on_error(move |id, err| {
            assert!(id.is_some());
            assert_eq!(err.kind(), "adapter");
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .build();

        let err = gateway.connect(None, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Adapter(AdapterError::ConnectFailed(_))));
        assert_eq!(gateway.connection_count(), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        gateway.connect(None, None).await.unwrap();
        assert_eq!(gateway.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscribers() {
        let h = harness();
        let a = h.connect().await;
        let b = h.connect().await;
        let publisher = h.connect().await;
        h.gateway.subscribe(&a, "news").unwrap();
        h.gateway.subscribe(&b, "news").unwrap();

        let report = h
            .gateway
            .publish(&publisher, Message::new("news", b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(report.recipients, 2);
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 0);
        assert!(!report.buffered);

        for id in [&a, &b] {
            let messages = published(&h.dialer(id).sent());
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].id, report.message_id);
            assert_eq!(messages[0].source, Some(publisher.clone()));
            assert_eq!(&messages[0].payload[..], b"hello");
        }
        assert!(h.dialer(&publisher).sent().is_empty());

        let metrics = h.gateway.channel_metrics("news").unwrap();
        assert_eq!(metrics.published_messages, 1);
        assert_eq!(metrics.delivered_messages, 2);
    }

    #[tokio::test]
    async fn test_per_connection_order() {
        let h = harness();
        let a = h.connect().await;
        h.gateway.subscribe(&a, "feed").unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            let report = h
                .gateway
                .broadcast(Message::new("feed", vec![i]))
                .await
                .unwrap();
            ids.push(report.message_id);
        }

        let received: Vec<_> = published(&h.dialer(&a).sent())
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(received, ids);
    }

    #[tokio::test]
    async fn test_at_least_once_retries() {
        let errors = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&errors);
        let h = Harness::new(GatewayConfig::default(), |b| {
            b.observer(GatewayObserver::new().on_error(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        });
        let a = h.connect().await;
        h.gateway.subscribe(&a, "jobs").unwrap();

        h.dialer(&a).fail_next_sends(2);
        let reliable = Message::new("jobs", b"retry me".to_vec())
            .with_qos(Qos::new(DeliveryMode::AtLeastOnce).with_max_retry(2));
        let report = h.gateway.broadcast(reliable).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.dialer(&a).sent().len(), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 2);

        h.dialer(&a).fail_next_sends(1);
        let report = h
            .gateway
            .broadcast(Message::new("jobs", b"once".to_vec()))
            .await
            .unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(h.dialer(&a).sent().len(), 1);
    }

    #[tokio::test]
    async fn test_access_policy_and_allow_list() {
        let h = Harness::new(GatewayConfig::default(), |b| {
            b.access_policy(|_client: &str, channel: &str| !channel.starts_with("admin"))
        });
        h.gateway
            .create_channel(
                "vip",
                ChannelConfig::default().with_security(SecurityPolicy::allow_only(["alice"])),
            )
            .unwrap();

        let alice = h.gateway.connect(Some("alice".to_string()), None).await.unwrap();
        let bob = h.gateway.connect(Some("bob".to_string()), None).await.unwrap();

        assert!(matches!(
            h.gateway.subscribe(&alice, "admin:ops"),
            Err(GatewayError::AccessDenied { .. })
        ));
        h.gateway.subscribe(&alice, "vip").unwrap();
        match h.gateway.subscribe(&bob, "vip") {
            Err(GatewayError::AccessDenied { client, channel }) => {
                assert_eq!(client, "bob");
                assert_eq!(channel, "vip");
            }
            other => panic!("expected access denied, got {other:?}"),
        }

        assert_eq!(h.gateway.registry().subscribers("vip"), vec![alice.to_string()]);
        assert!(h.gateway.subscriptions(&bob).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let h = harness();
        let a = h.connect().await;
        h.gateway.subscribe(&a, "news").unwrap();
        h.gateway.subscribe(&a, "news").unwrap();
        assert_eq!(h.gateway.registry().subscriber_count("news"), 1);

        h.gateway.unsubscribe(&a, "news").unwrap();
        h.gateway.unsubscribe(&a, "news").unwrap();
        assert_eq!(h.gateway.registry().subscriber_count("news"), 0);
        assert!(h.gateway.subscriptions(&a).is_empty());
        assert_eq!(h.gateway.stats().lookup_misses, 0);
    }

    #[tokio::test]
    async fn test_flush_offline_queue() {
        let h = harness();
        h.gateway
            .create_channel("inbox", ChannelConfig::default().with_offline(OfflinePolicy::queue()))
            .unwrap();
        let a = h.connect().await;
        h.gateway.subscribe(&a, "inbox").unwrap();

        let first = h
            .gateway
            .broadcast(Message::new("inbox", b"1".to_vec()))
            .await
            .unwrap();
        let second = h
            .gateway
            .broadcast(Message::new("inbox", b"2".to_vec()))
            .await
            .unwrap();
        assert!(first.buffered && second.buffered);
        h.dialer(&a).clear_sent();

        assert_eq!(h.gateway.flush_offline_queue(&a).await.unwrap(), 2);
        let replayed: Vec<_> = published(&h.dialer(&a).sent())
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(replayed, vec![first.message_id, second.message_id]);
        assert_eq!(h.gateway.channel_metrics("inbox").unwrap().buffered_messages, 0);
        assert_eq!(h.gateway.flush_offline_queue(&a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drop_policy_without_subscribers() {
        let mut config = GatewayConfig::default();
        config.channels.offline_policy = Some(OfflinePolicyKind::Drop);
        let h = Harness::new(config, |b| b);

        let report = h
            .gateway
            .broadcast(Message::new("empty", b"x".to_vec()))
            .await
            .unwrap();
        assert!(report.dropped);
        assert_eq!(report.recipients, 0);

        let metrics = h.gateway.channel_metrics("empty").unwrap();
        assert_eq!(metrics.dropped_messages, 1);
        assert_eq!(metrics.delivered_messages, 0);
    }

    #[tokio::test]
    async fn test_replay_on_reconnect() {
        let connects = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&connects);
        let mut config = GatewayConfig::default();
        config.websocket.reconnect = true;
        let h = Harness::new(config, |b| {
            b.observer(GatewayObserver::new().on_connect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        });
        h.gateway
            .create_channel("inbox", ChannelConfig::default().with_offline(OfflinePolicy::queue()))
            .unwrap();

        let a = h.connect().await;
        let publisher = h.connect().await;
        h.gateway.subscribe(&a, "inbox").unwrap();
        let dialer = h.dialer(&a);

        dialer.close_remote(Some(1006), "network lost");
        assert!(eventually(|| h.gateway.connection_state(&a) == Some(Disconnected)).await);

        let report = h
            .gateway
            .publish(&publisher, Message::new("inbox", b"while away".to_vec()))
            .await
            .unwrap();
        assert_eq!(report.recipients, 1);
        assert!(report.buffered);
        assert_eq!(report.failed, 1);
        assert!(dialer.sent().is_empty());

        h.scheduler.advance(Duration::from_millis(100)).await;
        assert_eq!(h.gateway.connection_state(&a), Some(Connected));
        assert!(eventually(|| dialer.sent().len() == 1).await);

        let replayed = published(&dialer.sent());
        assert_eq!(replayed[0].id, report.message_id);
        assert_eq!(h.gateway.channel_metrics("inbox").unwrap().buffered_messages, 0);
        assert!(eventually(|| connects.load(Ordering::SeqCst) == 3).await);
    }

    #[tokio::test]
    async fn test_no_replay_when_disabled() {
        let mut config = GatewayConfig::default();
        config.websocket.reconnect = true;
        config.gateway.replay_on_reconnect = false;
        let h = Harness::new(config, |b| b);
        h.gateway
            .create_channel("inbox", ChannelConfig::default().with_offline(OfflinePolicy::queue()))
            .unwrap();

        let a = h.connect().await;
        h.gateway.subscribe(&a, "inbox").unwrap();
        let dialer = h.dialer(&a);
        dialer.close_remote(None, "gone");
        assert!(eventually(|| h.gateway.connection_state(&a) == Some(Disconnected)).await);

        h.gateway
            .broadcast(Message::new("inbox", b"kept".to_vec()))
            .await
            .unwrap();
        h.scheduler.advance(Duration::from_millis(100)).await;
        assert_eq!(h.gateway.connection_state(&a), Some(Connected));

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(dialer.sent().is_empty());
        assert_eq!(h.gateway.channel_metrics("inbox").unwrap().buffered_messages, 1);
    }

    #[tokio::test]
    async fn test_failed_adapter_is_removed() {
        let mut config = GatewayConfig::default();
        config.websocket.reconnect = true;
        let h = Harness::new(config, |b| b);

        let a = h.connect().await;
        h.gateway.subscribe(&a, "news").unwrap();
        let dialer = h.dialer(&a);
        dialer.fail_next_dials(1);
        dialer.close_remote(None, "gone");
        assert!(eventually(|| h.gateway.connection_state(&a) == Some(Disconnected)).await);

        h.scheduler.advance(Duration::from_millis(100)).await;
        assert!(eventually(|| h.gateway.connection_count() == 0).await);
        assert_eq!(h.gateway.registry().subscriber_count("news"), 0);
    }

    #[tokio::test]
    async fn test_health_check_after_remote_close() {
        let disconnects = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&disconnects);
        let h = Harness::new(GatewayConfig::default(), |b| {
            b.observer(GatewayObserver::new().on_disconnect(move |_, info| {
                sink.lock().push(info.clone());
            }))
        });
        assert!(h.gateway.health_check());

        let a = h.connect().await;
        let _b = h.connect().await;
        assert!(h.gateway.health_check());

        h.dialer(&a).close_remote(Some(1001), "going away");
        assert!(eventually(|| !h.gateway.health_check()).await);
        assert!(eventually(|| !disconnects.lock().is_empty()).await);
        assert_eq!(disconnects.lock()[0].code, Some(1001));
        assert!(!disconnects.lock()[0].local);
    }

    #[tokio::test]
    async fn test_lookup_misses_are_counted() {
        let h = harness();
        let ghost = ConnectionId::from("ghost");

        h.gateway.disconnect(&ghost).await.unwrap();
        h.gateway.subscribe(&ghost, "x").unwrap();
        let report = h
            .gateway
            .publish(&ghost, Message::new("x", b"?".to_vec()))
            .await
            .unwrap();
        assert_eq!(report, PublishReport::default());
        h.gateway.acknowledge(&ghost, Ack::received("m")).unwrap();

        let a = h.connect().await;
        h.gateway.unsubscribe(&a, "never-created").unwrap();

        assert_eq!(h.gateway.stats().lookup_misses, 5);
        assert!(h.gateway.channel_metrics("never-created").is_none());
        assert!(h.gateway.channel_metrics("x").is_none());
        assert!(h.gateway.acknowledgements("m").is_empty());
    }

    #[tokio::test]
    async fn test_inbound_frames_are_dispatched() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let acks = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let observer = {
            let seen = Arc::clone(&seen);
            let acks = Arc::clone(&acks);
            let errors = Arc::clone(&errors);
            GatewayObserver::new()
                .on_message(move |id, message| seen.lock().push((id.clone(), message.id.clone())))
                .on_ack(move |_, _| {
                    acks.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |_, err| errors.lock().push(err.kind()))
        };
        let h = Harness::new(GatewayConfig::default(), |b| b.observer(observer));
        let a = h.connect().await;
        let b = h.connect().await;

        h.dialer(&a).push_message(inbound(&Frame::subscribe("chat")));
        assert!(eventually(|| h.gateway.subscriptions(&a) == vec!["chat".to_string()]).await);

        let message = Message::new("chat", b"yo".to_vec()).with_id("m-1");
        h.dialer(&b).push_message(inbound(&Frame::publish(message)));
        assert!(eventually(|| h.dialer(&a).sent().len() == 1).await);
        assert_eq!(*seen.lock(), vec![(b.clone(), "m-1".to_string())]);
        assert_eq!(published(&h.dialer(&a).sent())[0].source, Some(b.clone()));

        h.dialer(&a).push_message(inbound(&Frame::ack(Ack::received("m-1"))));
        assert!(eventually(|| h.gateway.acknowledgements("m-1").len() == 1).await);
        assert_eq!(h.gateway.acknowledgements("m-1")[0].connection_id, a);
        assert_eq!(acks.load(Ordering::SeqCst), 1);

        h.dialer(&a).push_message(Bytes::from_static(b"\xc1garbage"));
        assert!(eventually(|| errors.lock().contains(&"protocol")).await);

        h.dialer(&a).push_message(inbound(&Frame::unsubscribe("chat")));
        assert!(eventually(|| h.gateway.subscriptions(&a).is_empty()).await);
        assert_eq!(h.gateway.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_backpressure_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut config = GatewayConfig::default();
        config.gateway.backpressure_threshold_bytes = 1024;
        let h = Harness::new(config, |b| {
            b.observer(GatewayObserver::new().on_backpressure(move |id, buffered| {
                sink.lock().push((id.clone(), buffered));
            }))
        });

        let a = h.connect().await;
        let b = h.connect().await;
        h.gateway.subscribe(&a, "bulk").unwrap();
        h.gateway.subscribe(&b, "bulk").unwrap();
        h.dialer(&a).set_buffered_amount(4096);
        h.dialer(&b).set_buffered_amount(512);

        h.gateway
            .broadcast(Message::new("bulk", vec![0u8; 64]))
            .await
            .unwrap();
        assert_eq!(*events.lock(), vec![(a, 4096)]);
    }

    #[tokio::test]
    async fn test_connection_scoped_events() {
        let mut config = GatewayConfig::default();
        config.gateway.backpressure_threshold_bytes = 1024;
        let h = Harness::new(config, |b| b);

        let events = Arc::new(Mutex::new(Vec::new()));
        let scoped = {
            let connects = Arc::clone(&events);
            let acks = Arc::clone(&events);
            let pressure = Arc::clone(&events);
            let disconnects = Arc::clone(&events);
            GatewayObserver::new()
                .on_connect(move |id| connects.lock().push(format!("connect:{id}")))
                .on_ack(move |id, ack| acks.lock().push(format!("ack:{id}:{}", ack.message_id)))
                .on_backpressure(move |id, buffered| {
                    pressure.lock().push(format!("backpressure:{id}:{buffered}"));
                })
                .on_disconnect(move |id, _| disconnects.lock().push(format!("disconnect:{id}")))
        };

        let a = h
            .gateway
            .connect_with_events(None, None, scoped)
            .await
            .unwrap();
        let b = h.connect().await;
        h.gateway.subscribe(&a, "bulk").unwrap();
        h.gateway.subscribe(&b, "bulk").unwrap();
        h.dialer(&a).set_buffered_amount(4096);
        h.dialer(&b).set_buffered_amount(4096);

        h.gateway
            .broadcast(Message::new("bulk", vec![0u8; 64]))
            .await
            .unwrap();
        h.gateway.acknowledge(&a, Ack::received("m-1")).unwrap();
        h.gateway.acknowledge(&b, Ack::received("m-2")).unwrap();
        h.gateway.disconnect(&a).await.unwrap();
        h.gateway.disconnect(&b).await.unwrap();

        assert_eq!(
            *events.lock(),
            vec![
                format!("connect:{a}"),
                format!("backpressure:{a}:4096"),
                format!("ack:{a}:m-1"),
                format!("disconnect:{a}"),
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_channels_and_stats() {
        let h = harness();
        let a = h.connect().await;
        let _b = h.connect().await;
        h.gateway.subscribe(&a, "one").unwrap();
        h.gateway.subscribe(&a, "two").unwrap();
        h.gateway.acknowledge(&a, Ack::received("m-1")).unwrap();

        let stats = h.gateway.stats();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.connected, 2);
        assert_eq!(stats.channels, 2);
        assert_eq!(stats.subscriptions, 2);
        assert_eq!(stats.acknowledgements, 1);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["connections"], 2);
        assert_eq!(json["lookup_misses"], 0);

        h.gateway.reset_channels();
        assert!(h.gateway.subscriptions(&a).is_empty());
        assert_eq!(h.gateway.stats().channels, 0);
        assert_eq!(h.gateway.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_channel_is_rejected() {
        let h = harness();
        let a = h.connect().await;
        assert!(matches!(
            h.gateway.subscribe(&a, ""),
            Err(GatewayError::Channel(ChannelError::InvalidChannel(_)))
        ));
        assert!(matches!(
            h.gateway.create_channel("news", ChannelConfig::default()).and_then(|()| {
                h.gateway.create_channel("news", ChannelConfig::default())
            }),
            Err(GatewayError::Channel(ChannelError::ChannelExists(_)))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let h = harness();
        for _ in 0..3 {
            h.connect().await;
        }
        h.gateway.disconnect_all().await;
        assert_eq!(h.gateway.connection_count(), 0);
        assert!(h.gateway.health_check());
    }
}
