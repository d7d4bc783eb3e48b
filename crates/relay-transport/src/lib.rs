//! # relay-transport
//!
//! Transport adapter layer for the Relay realtime distribution layer.
//!
//! Every adapter implements [`TransportAdapter`] and shares one lifecycle
//! state machine ([`ConnectionState`]) and one set of callbacks
//! ([`AdapterObserver`]):
//!
//! - **WebSocket** - duplex socket with heartbeat probes and optional reconnect
//! - **Data channel** - peer-to-peer channel; signaling is external
//! - **Pub/sub** - broker client publishing to a fixed topic
//!
//! Each adapter reaches its wire through a small seam trait
//! ([`SocketDialer`], [`PeerConnector`], [`PubSubClient`]). The [`memory`]
//! module provides loopback implementations of all three; with the
//! `websocket` feature, [`TungsteniteDialer`] dials real endpoints.
//!
//! ```rust,ignore
//! use tenvis_relay_transport::{AdapterObserver, TransportAdapter, WebSocketAdapter, WebSocketConfig};
//!
//! let adapter = WebSocketAdapter::new(
//!     ConnectionId::generate(),
//!     WebSocketConfig::new("ws://127.0.0.1:8080/ws"),
//!     Arc::new(TungsteniteDialer),
//! );
//! adapter.set_observer(AdapterObserver::new().on_message(|env| println!("{:?}", env.raw)));
//! adapter.connect().await?;
//! ```

pub mod datachannel;
pub mod memory;
pub mod observer;
pub mod pubsub;
pub mod scheduler;
pub mod state;
pub mod traits;
pub mod websocket;

#[cfg(feature = "websocket")]
pub mod tungstenite;

pub use datachannel::{
    DataChannel, DataChannelAdapter, DataChannelConfig, DataChannelEvent, DataChannelLink,
    PeerConnector,
};
pub use memory::{MemoryBroker, MemoryPeerConnector, MemoryPubSubClient, MemorySocketDialer};
pub use observer::{AdapterObserver, CloseInfo};
pub use pubsub::{PubSubAdapter, PubSubClient, PubSubConfig, PubSubEvent};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TimerTask, TokioScheduler};
pub use state::ConnectionState;
pub use traits::{AdapterError, AdapterFactory, TransportAdapter};
pub use websocket::{
    SocketDialer, SocketEvent, SocketLink, SocketSink, WebSocketAdapter, WebSocketConfig,
    WebSocketFactory,
};

#[cfg(feature = "websocket")]
pub use tungstenite::TungsteniteDialer;
