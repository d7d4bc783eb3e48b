//! Channel registry for Relay.
//!
//! The registry owns every channel and serializes mutations of a single
//! channel through its map entry; unrelated channels never contend.

use crate::channel::{validate_channel_name, Channel, ChannelConfig, ChannelMetrics, PublishOutcome};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_protocol::{ChannelId, Message};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// A channel with this id is already registered.
    #[error("Channel already exists: {0}")]
    ChannelExists(String),
}

/// Registry of live channels.
///
/// Closures passed to [`ChannelRegistry::with_channel`] run while the
/// channel's entry is locked and must not call back into the registry.
pub struct ChannelRegistry {
    /// Channels indexed by name.
    channels: DashMap<ChannelId, Channel>,
    /// Configuration for lazily created channels.
    defaults: ChannelConfig,
}

impl ChannelRegistry {
    /// Create a registry with default channel configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_defaults(ChannelConfig::default())
    }

    /// Create a registry whose lazily created channels use `defaults`.
    #[must_use]
    pub fn with_defaults(defaults: ChannelConfig) -> Self {
        info!("Creating channel registry with defaults: {:?}", defaults);
        Self {
            channels: DashMap::new(),
            defaults,
        }
    }

    /// Configuration applied to lazily created channels.
    #[must_use]
    pub fn defaults(&self) -> &ChannelConfig {
        &self.defaults
    }

    /// Register a channel with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the channel already exists.
    pub fn create(&self, name: &str, config: ChannelConfig) -> Result<(), ChannelError> {
        validate_channel_name(name).map_err(ChannelError::InvalidChannel)?;

        match self.channels.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ChannelError::ChannelExists(name.to_string())),
            Entry::Vacant(vacant) => {
                debug!(channel = %name, "Creating configured channel");
                vacant.insert(Channel::with_config(name, config));
                Ok(())
            }
        }
    }

    /// Run `f` against a channel, creating it on first reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid.
    pub fn with_channel<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Channel) -> R,
    ) -> Result<R, ChannelError> {
        validate_channel_name(name).map_err(ChannelError::InvalidChannel)?;

        let mut entry = self.channels.entry(name.to_string()).or_insert_with(|| {
            debug!(channel = %name, "Creating new channel");
            Channel::with_config(name, self.defaults.clone())
        });
        Ok(f(entry.value_mut()))
    }

    /// Run `f` against an existing channel; `None` if it is not registered.
    pub fn with_existing<R>(&self, name: &str, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        self.channels
            .get_mut(name)
            .map(|mut entry| f(entry.value_mut()))
    }

    /// Publish a message to its channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the message names an invalid channel.
    pub fn publish(&self, message: impl Into<Arc<Message>>) -> Result<PublishOutcome, ChannelError> {
        let message = message.into();
        let channel = message.channel.clone();
        self.with_channel(&channel, |ch| ch.publish(message))
    }

    /// Subscribe a client to a channel, creating the channel if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid.
    pub fn subscribe(&self, name: &str, client: &str) -> Result<bool, ChannelError> {
        self.with_channel(name, |ch| ch.subscribe(client))
    }

    /// Unsubscribe a client; `None` if the channel does not exist.
    pub fn unsubscribe(&self, name: &str, client: &str) -> Option<bool> {
        self.with_existing(name, |ch| ch.unsubscribe(client))
    }

    /// Unsubscribe a client from all channels.
    ///
    /// Returns the channels it was removed from.
    pub fn unsubscribe_all(&self, client: &str) -> Vec<ChannelId> {
        let removed: Vec<ChannelId> = self
            .channels
            .iter_mut()
            .filter_map(|mut entry| entry.value_mut().unsubscribe(client).then(|| entry.key().clone()))
            .collect();

        debug!(client = %client, channels = removed.len(), "Unsubscribed from all channels");
        removed
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Get the subscribers of a channel.
    #[must_use]
    pub fn subscribers(&self, name: &str) -> Vec<String> {
        self.channels
            .get(name)
            .map(|e| e.subscribers())
            .unwrap_or_default()
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.channels
            .get(name)
            .map(|e| e.subscriber_count())
            .unwrap_or(0)
    }

    /// Metrics of a channel, if registered.
    #[must_use]
    pub fn metrics(&self, name: &str) -> Option<ChannelMetrics> {
        self.channels.get(name).map(|e| e.metrics())
    }

    /// Drain a channel's offline buffer; `None` if it is not registered.
    pub fn flush(&self, name: &str) -> Option<Vec<Arc<Message>>> {
        self.with_existing(name, Channel::flush_buffer)
    }

    /// Get all channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Remove one channel, discarding its subscribers and buffer.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.channels.remove(name).is_some();
        if removed {
            debug!(channel = %name, "Removed channel");
        }
        removed
    }

    /// Drop every channel.
    pub fn reset(&self) {
        let count = self.channels.len();
        self.channels.clear();
        info!(channels = count, "Channel registry reset");
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            channel_count: 0,
            total_subscriptions: 0,
            total_buffered: 0,
        };
        for entry in self.channels.iter() {
            stats.channel_count += 1;
            stats.total_subscriptions += entry.subscriber_count();
            stats.total_buffered += entry.buffered_len();
        }
        stats
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of registered channels.
    pub channel_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
    /// Messages held in offline buffers.
    pub total_buffered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::OfflinePolicy;

    #[test]
    fn test_registry_lazy_creation() {
        let registry = ChannelRegistry::new();
        assert!(!registry.contains("test:channel"));

        assert!(registry.subscribe("test:channel", "conn-1").unwrap());
        assert!(registry.contains("test:channel"));
        assert_eq!(registry.subscriber_count("test:channel"), 1);

        // Channels outlive their last subscriber.
        assert_eq!(registry.unsubscribe("test:channel", "conn-1"), Some(true));
        assert!(registry.contains("test:channel"));
    }

    #[test]
    fn test_registry_unknown_channel() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.unsubscribe("missing", "conn-1"), None);
        assert!(registry.flush("missing").is_none());
        assert!(registry.metrics("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_invalid_channel() {
        let registry = ChannelRegistry::new();

        assert!(registry.subscribe("", "conn-1").is_err());
        assert!(matches!(
            registry.subscribe("$system", "conn-1"),
            Err(ChannelError::InvalidChannel(_))
        ));
        assert!(registry.publish(Message::new("", b"x".to_vec())).is_err());
    }

    #[test]
    fn test_registry_create_is_unique() {
        let registry = ChannelRegistry::new();
        let config = ChannelConfig::default().with_max_buffer_size(5);

        registry.create("configured", config.clone()).unwrap();
        assert!(matches!(
            registry.create("configured", config),
            Err(ChannelError::ChannelExists(_))
        ));

        let cap = registry
            .with_existing("configured", |ch| ch.config().max_buffer_size)
            .unwrap();
        assert_eq!(cap, 5);
    }

    #[test]
    fn test_registry_defaults_apply_to_lazy_channels() {
        let registry =
            ChannelRegistry::with_defaults(ChannelConfig::default().with_offline(OfflinePolicy::queue()));

        let outcome = registry.publish(Message::new("inbox", b"x".to_vec())).unwrap();
        assert!(outcome.buffered);
        assert_eq!(registry.metrics("inbox").unwrap().buffered_messages, 1);

        let flushed = registry.flush("inbox").unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(registry.metrics("inbox").unwrap().buffered_messages, 0);
    }

    #[test]
    fn test_registry_unsubscribe_all() {
        let registry = ChannelRegistry::new();

        registry.subscribe("channel-1", "conn-1").unwrap();
        registry.subscribe("channel-2", "conn-1").unwrap();
        registry.subscribe("channel-2", "conn-2").unwrap();

        let mut removed = registry.unsubscribe_all("conn-1");
        removed.sort();
        assert_eq!(removed, vec!["channel-1", "channel-2"]);
        assert_eq!(registry.subscribers("channel-2"), vec!["conn-2"]);
    }

    #[test]
    fn test_registry_stats_and_reset() {
        let registry =
            ChannelRegistry::with_defaults(ChannelConfig::default().with_offline(OfflinePolicy::queue()));

        registry.subscribe("channel-1", "conn-1").unwrap();
        registry.subscribe("channel-2", "conn-1").unwrap();
        registry.subscribe("channel-1", "conn-2").unwrap();
        registry.publish(Message::new("channel-3", b"x".to_vec())).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.channel_count, 3);
        assert_eq!(stats.total_subscriptions, 3);
        assert_eq!(stats.total_buffered, 1);

        assert!(registry.remove("channel-3"));
        assert!(!registry.remove("channel-3"));

        registry.reset();
        assert!(registry.is_empty());
        assert_eq!(registry.channel_names(), Vec::<String>::new());
    }
}
