//! In-process transports.
//!
//! Loopback implementations of the socket, data channel and broker seams.
//! Each exposes the remote side so callers can inject traffic and faults,
//! and inspect what the adapter wrote. Used by tests and benchmarks.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::datachannel::{DataChannel, DataChannelEvent, DataChannelLink, PeerConnector};
use crate::observer::CloseInfo;
use crate::pubsub::{PubSubClient, PubSubConfig, PubSubEvent};
use crate::traits::AdapterError;
use crate::websocket::{SocketDialer, SocketEvent, SocketLink, SocketSink, WebSocketConfig};

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Parks connection attempts while held.
struct Gate {
    held: watch::Sender<bool>,
    waiting: AtomicUsize,
}

impl Gate {
    fn hold(&self, held: bool) {
        self.held.send_replace(held);
    }

    fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn pass(&self) {
        let mut released = self.held.subscribe();
        let held = *released.borrow();
        if !held {
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _ = released.wait_for(|held| !*held).await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for Gate {
    fn default() -> Self {
        let (held, _) = watch::channel(false);
        Self {
            held,
            waiting: AtomicUsize::new(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

struct SocketShared {
    gate: Gate,
    dials: AtomicUsize,
    fail_dials: AtomicUsize,
    fail_sends: AtomicUsize,
    fail_pings: AtomicBool,
    auto_pong: AtomicBool,
    pings: AtomicUsize,
    buffered: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
    /// Remote end of the most recent link.
    remote: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
}

/// Dials loopback sockets. Clones share state.
#[derive(Clone)]
pub struct MemorySocketDialer {
    shared: Arc<SocketShared>,
}

impl MemorySocketDialer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SocketShared {
                gate: Gate::default(),
                dials: AtomicUsize::new(0),
                fail_dials: AtomicUsize::new(0),
                fail_sends: AtomicUsize::new(0),
                fail_pings: AtomicBool::new(false),
                auto_pong: AtomicBool::new(true),
                pings: AtomicUsize::new(0),
                buffered: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                remote: Mutex::new(None),
            }),
        }
    }

    /// Refuse the next `n` dials.
    pub fn fail_next_dials(&self, n: usize) {
        self.shared.fail_dials.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` data sends.
    /// Park new dials until released with `hold_dials(false)`.
    pub fn hold_dials(&self, held: bool) {
        self.shared.gate.hold(held);
    }

    /// Dials currently parked.
    #[must_use]
    pub fn pending_dials(&self) -> usize {
        self.shared.gate.waiting()
    }

    pub fn fail_next_sends(&self, n: usize) {
        self.shared.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.shared.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Answer probes with a pong (default on).
    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.auto_pong.store(enabled, Ordering::SeqCst);
    }

    pub fn set_buffered_amount(&self, bytes: usize) {
        self.shared.buffered.store(bytes, Ordering::SeqCst);
    }

    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.shared.dials.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    /// Every data payload written, across all links, in write order.
    #[must_use]
    pub fn sent(&self) -> Vec<Bytes> {
        self.shared.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.shared.sent.lock().clear();
    }

    /// Deliver a message from the remote side. False if no link is open.
    pub fn push_message(&self, data: Bytes) -> bool {
        self.push(SocketEvent::Message(data))
    }

    pub fn push_error(&self, error: impl Into<String>) -> bool {
        self.push(SocketEvent::Error(error.into()))
    }

    /// Close the current link from the remote side.
    pub fn close_remote(&self, code: Option<u16>, reason: &str) -> bool {
        let closed = self.push(SocketEvent::Closed(CloseInfo::remote(code, reason)));
        self.shared.remote.lock().take();
        closed
    }

    fn push(&self, event: SocketEvent) -> bool {
        self.shared
            .remote
            .lock()
            .as_ref()
            .is_some_and(|remote| remote.send(event).is_ok())
    }
}

impl Default for MemorySocketDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SocketDialer for MemorySocketDialer {
    async fn dial(&self, config: &WebSocketConfig) -> Result<SocketLink, AdapterError> {
        self.shared.dials.fetch_add(1, Ordering::SeqCst);
        self.shared.gate.pass().await;
        if take_one(&self.shared.fail_dials) {
            return Err(AdapterError::ConnectFailed(format!(
                "connection refused: {}",
                config.url
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.remote.lock() = Some(tx.clone());

        let sink = MemorySocketSink {
            shared: Arc::clone(&self.shared),
            events: tx,
            open: AtomicBool::new(true),
        };
        Ok(SocketLink {
            sink: Arc::new(sink),
            events: rx,
        })
    }
}

struct MemorySocketSink {
    shared: Arc<SocketShared>,
    events: mpsc::UnboundedSender<SocketEvent>,
    open: AtomicBool,
}

#[async_trait]
impl SocketSink for MemorySocketSink {
    async fn send(&self, data: Bytes) -> Result<(), AdapterError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AdapterError::ConnectionClosed);
        }
        if take_one(&self.shared.fail_sends) {
            return Err(AdapterError::SendFailed("write rejected".to_string()));
        }
        self.shared.sent.lock().push(data);
        Ok(())
    }

    async fn ping(&self, probe: Bytes) -> Result<(), AdapterError> {
        self.shared.pings.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_pings.load(Ordering::SeqCst) {
            return Err(AdapterError::SendFailed("ping rejected".to_string()));
        }
        if self.shared.auto_pong.load(Ordering::SeqCst) {
            let _ = self.events.send(SocketEvent::Pong(probe));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Data channel
// ---------------------------------------------------------------------------

struct PeerShared {
    gate: Gate,
    auto_open: AtomicBool,
    fail_creates: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicBool,
    buffered: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
    remote: Mutex<Option<mpsc::UnboundedSender<DataChannelEvent>>>,
}

/// Creates loopback data channels. Clones share state.
#[derive(Clone)]
pub struct MemoryPeerConnector {
    shared: Arc<PeerShared>,
}

impl MemoryPeerConnector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PeerShared {
                gate: Gate::default(),
                auto_open: AtomicBool::new(true),
                fail_creates: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                buffered: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                remote: Mutex::new(None),
            }),
        }
    }

    /// Open new channels immediately (default on).
    pub fn set_auto_open(&self, enabled: bool) {
        self.shared.auto_open.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_next_creates(&self, n: usize) {
        self.shared.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Park new channel creations until released.
    pub fn hold_creates(&self, held: bool) {
        self.shared.gate.hold(held);
    }

    #[must_use]
    pub fn pending_creates(&self) -> usize {
        self.shared.gate.waiting()
    }

    pub fn set_buffered_amount(&self, bytes: usize) {
        self.shared.buffered.store(bytes, Ordering::SeqCst);
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Whether the adapter closed the latest channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Bytes> {
        self.shared.sent.lock().clone()
    }

    pub fn open(&self) -> bool {
        self.push(DataChannelEvent::Open)
    }

    pub fn push_message(&self, data: Bytes) -> bool {
        self.push(DataChannelEvent::Message(data))
    }

    pub fn push_error(&self, error: impl Into<String>) -> bool {
        self.push(DataChannelEvent::Error(error.into()))
    }

    pub fn close_remote(&self) -> bool {
        let closed = self.push(DataChannelEvent::Close);
        self.shared.remote.lock().take();
        closed
    }

    fn push(&self, event: DataChannelEvent) -> bool {
        self.shared
            .remote
            .lock()
            .as_ref()
            .is_some_and(|remote| remote.send(event).is_ok())
    }
}

impl Default for MemoryPeerConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnector for MemoryPeerConnector {
    async fn create_data_channel(&self, label: &str) -> Result<DataChannelLink, AdapterError> {
        self.shared.gate.pass().await;
        if take_one(&self.shared.fail_creates) {
            return Err(AdapterError::ConnectFailed(format!(
                "peer refused data channel '{label}'"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.shared.auto_open.load(Ordering::SeqCst) {
            let _ = tx.send(DataChannelEvent::Open);
        }
        *self.shared.remote.lock() = Some(tx);
        self.shared.closed.store(false, Ordering::SeqCst);
        self.shared.created.fetch_add(1, Ordering::SeqCst);

        Ok(DataChannelLink {
            channel: Arc::new(MemoryDataChannel {
                shared: Arc::clone(&self.shared),
            }),
            events: rx,
        })
    }
}

struct MemoryDataChannel {
    shared: Arc<PeerShared>,
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    async fn send(&self, data: Bytes) -> Result<(), AdapterError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::ConnectionClosed);
        }
        self.shared.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

struct Subscription {
    topic: String,
    client: u64,
    events: mpsc::UnboundedSender<PubSubEvent>,
}

#[derive(Default)]
struct BrokerShared {
    gate: Gate,
    next_client: AtomicU64,
    fail_connects: AtomicUsize,
    subscriptions: Mutex<Vec<Subscription>>,
    sessions: Mutex<Vec<(u64, String, mpsc::UnboundedSender<PubSubEvent>)>>,
    published: Mutex<Vec<(String, Bytes)>>,
}

/// Loopback broker. Exact-match topics; a client never receives its own
/// publications.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client session handle on this broker.
    #[must_use]
    pub fn client(&self) -> MemoryPubSubClient {
        MemoryPubSubClient {
            broker: self.clone(),
            id: self.shared.next_client.fetch_add(1, Ordering::SeqCst),
            session: Mutex::new(None),
        }
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Park new client connects until released.
    pub fn hold_connects(&self, held: bool) {
        self.shared.gate.hold(held);
    }

    #[must_use]
    pub fn pending_connects(&self) -> usize {
        self.shared.gate.waiting()
    }

    /// Publish from outside any client. Returns the number of deliveries.
    pub fn publish(&self, topic: &str, payload: Bytes) -> usize {
        self.route(None, topic, payload)
    }

    /// Every publication, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.shared.published.lock().clone()
    }

    /// Client ids of open sessions.
    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        self.shared
            .sessions
            .lock()
            .iter()
            .map(|(_, id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.topic == topic)
            .count()
    }

    /// End every session.
    pub fn disconnect_all(&self) {
        let sessions = std::mem::take(&mut *self.shared.sessions.lock());
        self.shared.subscriptions.lock().clear();
        for (_, _, events) in sessions {
            let _ = events.send(PubSubEvent::Closed(Some("broker shutdown".to_string())));
        }
    }

    fn route(&self, sender: Option<u64>, topic: &str, payload: Bytes) -> usize {
        self.shared
            .published
            .lock()
            .push((topic.to_string(), payload.clone()));

        let mut delivered = 0;
        for sub in self.shared.subscriptions.lock().iter() {
            if sub.topic != topic || Some(sub.client) == sender {
                continue;
            }
            let event = PubSubEvent::Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if sub.events.send(event).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn drop_client(&self, client: u64) {
        self.shared.subscriptions.lock().retain(|s| s.client != client);
        self.shared.sessions.lock().retain(|(id, _, _)| *id != client);
    }
}

/// One client session on a [`MemoryBroker`].
pub struct MemoryPubSubClient {
    broker: MemoryBroker,
    id: u64,
    session: Mutex<Option<mpsc::UnboundedSender<PubSubEvent>>>,
}

impl MemoryPubSubClient {
    fn session(&self) -> Result<mpsc::UnboundedSender<PubSubEvent>, AdapterError> {
        self.session
            .lock()
            .clone()
            .filter(|events| !events.is_closed())
            .ok_or(AdapterError::ConnectionClosed)
    }
}

#[async_trait]
impl PubSubClient for MemoryPubSubClient {
    async fn connect(
        &self,
        client_id: &str,
        config: &PubSubConfig,
    ) -> Result<mpsc::UnboundedReceiver<PubSubEvent>, AdapterError> {
        self.broker.shared.gate.pass().await;
        if take_one(&self.broker.shared.fail_connects) {
            return Err(AdapterError::ConnectFailed(format!(
                "broker refused {client_id} at {}",
                config.broker_url
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.broker
            .shared
            .sessions
            .lock()
            .push((self.id, client_id.to_string(), tx.clone()));
        *self.session.lock() = Some(tx);
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), AdapterError> {
        let events = self.session()?;
        self.broker.shared.subscriptions.lock().push(Subscription {
            topic: topic.to_string(),
            client: self.id,
            events,
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), AdapterError> {
        self.session()?;
        self.broker.route(Some(self.id), topic, payload);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.session.lock().take();
        self.broker.drop_client(self.id);
        Ok(())
    }
}
