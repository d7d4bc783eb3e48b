//! # relay-protocol
//!
//! Data contracts for the Relay realtime distribution layer.
//!
//! This crate defines the values that flow between producers, channels,
//! adapters and the gateway:
//!
//! - `Message` - normalized domain message with QoS, offline, security and
//!   trace metadata
//! - `Envelope` - raw bytes as received by a transport adapter
//! - `Frame` - the unit encoded into one adapter payload
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Frame, Message};
//!
//! let frame = Frame::publish(Message::new("chat:lobby", b"Hello, world!".to_vec()));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;
pub mod ids;
pub mod message;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{Envelope, Protocol};
pub use frames::{Frame, FrameType};
pub use ids::{now_millis, ChannelId, ClientId, ConnectionId, MessageId};
pub use message::{
    Ack, AckStatus, Confidentiality, DeliveryMode, Message, OfflinePolicy, OfflinePolicyKind,
    Priority, Qos, SecurityPolicy, TraceContext,
};
