//! Transport adapter contract for Relay.
//!
//! Every adapter, whatever the wire underneath, exposes the same lifecycle,
//! state machine and callbacks so the gateway can stay protocol-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{ConnectionId, Protocol};
use std::sync::Arc;
use thiserror::Error;

use crate::observer::AdapterObserver;
use crate::state::ConnectionState;

/// Adapter errors.
///
/// Every error an adapter returns is also reported to its observer's error
/// callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Operation requires an established connection.
    #[error("Not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// Establishing the connection failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The state machine does not allow the requested move.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Inbound payload exceeds the configured limit.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Operation timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No adapter exists for the protocol.
    #[error("Unsupported protocol: {0}")]
    Unsupported(Protocol),

    /// Transport-specific fault.
    #[error("{0}")]
    Other(String),
}

/// A client-side connection over one transport.
///
/// Adapters are shared behind `Arc` and use interior mutability, so every
/// operation takes `&self`. Inbound data, state changes and faults are
/// delivered through the [`AdapterObserver`] installed with
/// [`TransportAdapter::set_observer`].
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Protocol this adapter speaks.
    fn protocol(&self) -> Protocol;

    /// Identifier stamped on inbound envelopes.
    fn connection_id(&self) -> &ConnectionId;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Establish the connection.
    ///
    /// Resolves once the adapter is connected; on failure the adapter ends
    /// in [`ConnectionState::Failed`].
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Close the connection and stop any heartbeat or reconnect timers.
    async fn disconnect(&self) -> Result<(), AdapterError>;

    /// Send one payload. Payloads from one caller are transmitted in call
    /// order.
    async fn send(&self, data: Bytes) -> Result<(), AdapterError>;

    /// Bytes queued by the transport but not yet written.
    fn buffered_amount(&self) -> usize {
        0
    }

    /// Whether the adapter is connected and able to send.
    fn health_check(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Replace the callbacks. Takes effect for events emitted afterwards.
    fn set_observer(&self, observer: AdapterObserver);
}

/// Creates adapters for the gateway, one per connection.
pub trait AdapterFactory: Send + Sync {
    /// Build an unconnected adapter for `connection_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter can be built, e.g. for a protocol
    /// without an implementation.
    fn create(&self, connection_id: &ConnectionId)
        -> Result<Arc<dyn TransportAdapter>, AdapterError>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&ConnectionId) -> Result<Arc<dyn TransportAdapter>, AdapterError> + Send + Sync,
{
    fn create(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<dyn TransportAdapter>, AdapterError> {
        self(connection_id)
    }
}
