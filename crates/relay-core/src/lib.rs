//! # relay-core
//!
//! Channels and the channel registry for the Relay realtime layer.
//!
//! - **Channel** - in-process topic: subscriber set, bounded offline buffer,
//!   allow-list check and delivery metrics
//! - **ChannelRegistry** - lazily creates channels and serializes mutations
//!   per channel
//!
//! Channels are adapter agnostic and never see raw bytes; physical delivery
//! is the gateway's job.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌─────────────┐
//! │  Producer   │────▶│ ChannelRegistry │────▶│  Channel    │
//! └─────────────┘     └─────────────────┘     └─────────────┘
//!                                                    │
//!                                                    ▼
//!                                             ┌─────────────┐
//!                                             │   Buffer    │
//!                                             └─────────────┘
//! ```

pub mod channel;
pub mod registry;

pub use channel::{
    validate_channel_name, Channel, ChannelConfig, ChannelMetrics, PublishOutcome,
    DEFAULT_MAX_BUFFER_SIZE,
};
pub use registry::{ChannelError, ChannelRegistry, RegistryStats};
pub use relay_protocol::{ChannelId, Message};
