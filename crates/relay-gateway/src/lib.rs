//! # relay-gateway
//!
//! Connection orchestration for the Relay realtime layer.
//!
//! The [`Gateway`] owns one transport adapter per connection, produced by
//! an [`AdapterFactory`](tenvis_relay_transport::AdapterFactory). It:
//!
//! - routes inbound frames (subscribe, unsubscribe, publish, ack)
//! - fans published messages out to every subscribed connection, retrying
//!   at-least-once sends within the message's retry budget
//! - replays channel offline buffers when a connection's adapter re-opens
//! - reports connection, message, ack, error and backpressure events
//!   through a [`GatewayObserver`]
//!
//! ```rust,ignore
//! use tenvis_relay_gateway::{Gateway, GatewayConfig};
//! use tenvis_relay_transport::{TungsteniteDialer, WebSocketFactory};
//!
//! let config = GatewayConfig::load()?;
//! let factory = WebSocketFactory::new(config.websocket_config(), Arc::new(TungsteniteDialer));
//! let gateway = Gateway::new(config, factory);
//!
//! let id = gateway.connect(None, None).await?;
//! gateway.subscribe(&id, "chat:lobby")?;
//! ```

pub mod config;
pub mod gateway;
pub mod metrics;
pub mod observer;

pub use config::{ChannelsConfig, DeliveryConfig, GatewayConfig, WebSocketSettings};
pub use gateway::{
    AckRecord, Gateway, GatewayBuilder, GatewayError, GatewayStats, PublishReport,
};
pub use observer::{AccessPolicy, AllowAll, GatewayObserver};
