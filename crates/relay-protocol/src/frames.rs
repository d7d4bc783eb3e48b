//! Frame types carried in adapter payloads.
//!
//! Every transport message holds exactly one frame. Frames are serialized
//! using MessagePack with named fields.

use serde::{Deserialize, Serialize};

use crate::message::{Ack, Message};

/// Frame type identifiers, as used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Subscribe = 0x01,
    Unsubscribe = 0x02,
    Publish = 0x03,
    Ack = 0x04,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Subscribe),
            0x02 => Ok(FrameType::Unsubscribe),
            0x03 => Ok(FrameType::Publish),
            0x04 => Ok(FrameType::Ack),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Subscribe the sending connection to a channel.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Channel name to subscribe to.
        channel: String,
    },

    /// Unsubscribe the sending connection from a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Channel name to unsubscribe from.
        channel: String,
    },

    /// A message published to, or delivered from, a channel.
    #[serde(rename = "publish")]
    Publish {
        /// The message.
        message: Message,
    },

    /// Delivery confirmation.
    #[serde(rename = "ack")]
    Ack {
        /// The acknowledgement.
        ack: Ack,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::Ack { .. } => FrameType::Ack,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Frame::Subscribe {
            channel: channel.into(),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            channel: channel.into(),
        }
    }

    /// Create a new Publish frame.
    #[must_use]
    pub fn publish(message: Message) -> Self {
        Frame::Publish { message }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(ack: Ack) -> Self {
        Frame::Ack { ack }
    }
}
