//! Channel abstraction for Relay.
//!
//! A channel is an in-process topic: a set of subscribers, a bounded
//! offline buffer and delivery metrics. Channels never touch transports;
//! the gateway performs the physical sends.

use indexmap::IndexSet;
use relay_protocol::{now_millis, ChannelId, Message, OfflinePolicy, OfflinePolicyKind, SecurityPolicy};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default offline buffer capacity.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1000;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    // Check for valid ASCII printable characters
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Per-channel configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Offline buffer cap.
    pub max_buffer_size: usize,
    /// Default offline policy, used when a message carries none.
    pub offline: Option<OfflinePolicy>,
    /// Access policy; its allow-list gates subscriptions.
    pub security: Option<SecurityPolicy>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            offline: None,
            security: None,
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_offline(mut self, offline: OfflinePolicy) -> Self {
        self.offline = Some(offline);
        self
    }

    #[must_use]
    pub fn with_security(mut self, security: SecurityPolicy) -> Self {
        self.security = Some(security);
        self
    }

    /// Effective buffer cap. A default offline policy carrying
    /// `max_queue_size` takes precedence over `max_buffer_size`.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.offline
            .as_ref()
            .and_then(|p| p.max_queue_size)
            .unwrap_or(self.max_buffer_size)
    }
}

/// Point-in-time copy of a channel's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub published_messages: u64,
    /// Fan-out accounting: subscriber count summed over publishes.
    pub delivered_messages: u64,
    /// Messages dropped for lack of subscribers or evicted on overflow.
    pub dropped_messages: u64,
    pub buffered_messages: usize,
    pub subscriber_count: usize,
    pub last_published_at: Option<u64>,
}

/// What a single publish did to the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome {
    /// Offline policy that applied to the message.
    pub policy: Option<OfflinePolicyKind>,
    /// Subscribers counted as recipients.
    pub recipients: usize,
    /// Whether the message entered the offline buffer.
    pub buffered: bool,
    /// The oldest buffered message, if it was evicted to make room.
    pub evicted: Option<Arc<Message>>,
    /// Whether the message was dropped (drop policy, nobody subscribed).
    pub dropped: bool,
}

/// A channel for pub/sub messaging.
#[derive(Debug)]
pub struct Channel {
    /// Channel name.
    name: ChannelId,
    config: ChannelConfig,
    /// Subscribed clients, in subscription order.
    subscribers: IndexSet<String>,
    /// Offline buffer, oldest first.
    buffer: VecDeque<Arc<Message>>,
    metrics: ChannelMetrics,
}

impl Channel {
    /// Create a new channel with default configuration.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self::with_config(name, ChannelConfig::default())
    }

    /// Create a new channel with a specific configuration.
    #[must_use]
    pub fn with_config(name: impl Into<ChannelId>, config: ChannelConfig) -> Self {
        Self {
            name: name.into(),
            config,
            subscribers: IndexSet::new(),
            buffer: VecDeque::new(),
            metrics: ChannelMetrics::default(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a client is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, client: &str) -> bool {
        self.subscribers.contains(client)
    }

    /// Subscribe a client to this channel.
    ///
    /// Returns `true` if the client was not already subscribed.
    pub fn subscribe(&mut self, client: impl Into<String>) -> bool {
        let client = client.into();
        let added = self.subscribers.insert(client.clone());
        if added {
            self.metrics.subscriber_count = self.subscribers.len();
            debug!(channel = %self.name, client = %client, "Client subscribed");
        }
        added
    }

    /// Unsubscribe a client from this channel.
    ///
    /// Returns `true` if the client was subscribed.
    pub fn unsubscribe(&mut self, client: &str) -> bool {
        let removed = self.subscribers.shift_remove(client);
        if removed {
            self.metrics.subscriber_count = self.subscribers.len();
            debug!(channel = %self.name, client = %client, "Client unsubscribed");
        }
        removed
    }

    /// Get all subscriber IDs, in subscription order.
    #[must_use]
    pub fn subscribers(&self) -> Vec<String> {
        self.subscribers.iter().cloned().collect()
    }

    /// Check if the channel has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Check whether a client passes the channel's allow-list.
    #[must_use]
    pub fn can_client_access(&self, client: &str) -> bool {
        self.config
            .security
            .as_ref()
            .map_or(true, |security| security.allows(client))
    }

    /// Record a publish: buffering, drop and fan-out accounting.
    ///
    /// Queueing is checked before dropping, and a queued message is still
    /// counted towards delivery for the current subscribers.
    pub fn publish(&mut self, message: impl Into<Arc<Message>>) -> PublishOutcome {
        let message = message.into();
        self.metrics.published_messages += 1;
        self.metrics.last_published_at = Some(now_millis());

        let policy = message
            .offline
            .as_ref()
            .or(self.config.offline.as_ref())
            .map(|p| p.policy);

        let mut outcome = PublishOutcome {
            policy,
            recipients: 0,
            buffered: false,
            evicted: None,
            dropped: false,
        };

        if policy == Some(OfflinePolicyKind::Queue) {
            outcome.evicted = self.enqueue(Arc::clone(&message));
            outcome.buffered = true;
        }

        if policy == Some(OfflinePolicyKind::Drop) && self.subscribers.is_empty() {
            self.metrics.dropped_messages += 1;
            outcome.dropped = true;
            trace!(channel = %self.name, message = %message.id, "Dropped message without subscribers");
            return outcome;
        }

        let recipients = self.subscribers.len();
        self.metrics.delivered_messages += recipients as u64;
        outcome.recipients = recipients;
        trace!(channel = %self.name, message = %message.id, recipients, "Published message");
        outcome
    }

    fn enqueue(&mut self, message: Arc<Message>) -> Option<Arc<Message>> {
        self.buffer.push_back(message);
        let mut evicted = None;
        while self.buffer.len() > self.config.buffer_capacity() {
            evicted = self.buffer.pop_front();
            self.metrics.dropped_messages += 1;
            debug!(channel = %self.name, "Offline buffer full, evicted oldest message");
        }
        self.metrics.buffered_messages = self.buffer.len();
        evicted
    }

    /// Drain the offline buffer, oldest first.
    pub fn flush_buffer(&mut self) -> Vec<Arc<Message>> {
        let drained: Vec<_> = self.buffer.drain(..).collect();
        self.metrics.buffered_messages = 0;
        if !drained.is_empty() {
            debug!(channel = %self.name, count = drained.len(), "Flushed offline buffer");
        }
        drained
    }

    /// Number of messages currently buffered.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Snapshot of the offline buffer without draining it.
    #[must_use]
    pub fn buffered(&self) -> Vec<Arc<Message>> {
        self.buffer.iter().cloned().collect()
    }

    /// Get a copy of the channel metrics.
    #[must_use]
    pub fn metrics(&self) -> ChannelMetrics {
        self.metrics.clone()
    }
}
