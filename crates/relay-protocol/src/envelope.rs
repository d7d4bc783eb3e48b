//! Raw transport envelopes.
//!
//! Adapters wrap every inbound payload in an [`Envelope`] before the gateway
//! interprets it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{now_millis, ConnectionId};

/// Wire protocol identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Duplex byte-stream socket.
    WebSocket,
    /// Peer-to-peer data channel.
    WebRtc,
    /// Lightweight publish/subscribe broker client.
    Mqtt,
    /// Reserved; no adapter exists yet.
    Quic,
    /// Application-defined transport.
    Custom,
}

impl Protocol {
    /// Get the protocol name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::WebSocket => "websocket",
            Protocol::WebRtc => "webrtc",
            Protocol::Mqtt => "mqtt",
            Protocol::Quic => "quic",
            Protocol::Custom => "custom",
        }
    }

    /// Whether this crate family ships an adapter for the protocol.
    /// `Custom` adapters are supplied by the caller.
    #[must_use]
    pub fn is_implemented(&self) -> bool {
        !matches!(self, Protocol::Quic | Protocol::Custom)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw bytes received by an adapter, before domain interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub protocol: Protocol,
    /// Transport locator, e.g. the socket URL or the broker topic.
    pub transport_uri: Option<String>,
    /// Connection that received the payload.
    pub connection_id: Option<ConnectionId>,
    pub raw: Bytes,
    /// Milliseconds since the Unix epoch at receipt.
    pub received_at: u64,
}

impl Envelope {
    /// Wrap raw bytes received now.
    #[must_use]
    pub fn new(protocol: Protocol, raw: impl Into<Bytes>) -> Self {
        Self {
            protocol,
            transport_uri: None,
            connection_id: None,
            raw: raw.into(),
            received_at: now_millis(),
        }
    }

    #[must_use]
    pub fn with_transport_uri(mut self, uri: impl Into<String>) -> Self {
        self.transport_uri = Some(uri.into());
        self
    }

    #[must_use]
    pub fn with_connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }
}
