//! Gateway configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use relay_protocol::{OfflinePolicy, OfflinePolicyKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tenvis_relay_core::ChannelConfig;
use tenvis_relay_transport::WebSocketConfig;

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Defaults for lazily created channels.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// WebSocket adapter settings.
    #[serde(default)]
    pub websocket: WebSocketSettings,

    /// Fan-out and replay settings.
    #[serde(default)]
    pub gateway: DeliveryConfig,
}

/// Channel defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Offline buffer cap per channel.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Offline policy applied when a message carries none.
    #[serde(default)]
    pub offline_policy: Option<OfflinePolicyKind>,
}

/// WebSocket adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSettings {
    /// Endpoint to dial.
    #[serde(default = "default_url")]
    pub url: String,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Delay before a reconnect attempt in milliseconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Reconnect after the remote side closes.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,

    /// Maximum payload size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Adapter buffered amount above which a backpressure event fires.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold_bytes: usize,

    /// Flush offline buffers to a connection whose adapter re-opens.
    #[serde(default = "default_true")]
    pub replay_on_reconnect: bool,
}

// Default value functions
fn default_max_buffer_size() -> usize {
    std::env::var("RELAY_MAX_BUFFER_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(tenvis_relay_core::DEFAULT_MAX_BUFFER_SIZE)
}

fn default_url() -> String {
    std::env::var("RELAY_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string())
}

fn default_heartbeat_interval() -> u64 {
    10_000 // 10 seconds
}

fn default_reconnect_interval() -> u64 {
    3_000 // 3 seconds
}

fn default_reconnect() -> bool {
    std::env::var("RELAY_RECONNECT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(false)
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_backpressure_threshold() -> usize {
    1024 * 1024 // 1 MB
}

fn default_true() -> bool {
    true
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            offline_policy: None,
        }
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            reconnect_interval_ms: default_reconnect_interval(),
            reconnect: default_reconnect(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold_bytes: default_backpressure_threshold(),
            replay_on_reconnect: true,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: GatewayConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Configuration for channels the registry creates on first reference.
    #[must_use]
    pub fn channel_defaults(&self) -> ChannelConfig {
        let mut config = ChannelConfig::default().with_max_buffer_size(self.channels.max_buffer_size);
        if let Some(kind) = self.channels.offline_policy {
            config = config.with_offline(OfflinePolicy::new(kind));
        }
        config
    }

    /// WebSocket adapter configuration.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        let ws = &self.websocket;
        WebSocketConfig {
            url: ws.url.clone(),
            heartbeat_interval: Duration::from_millis(ws.heartbeat_interval_ms),
            reconnect_interval: Duration::from_millis(ws.reconnect_interval_ms),
            reconnect: ws.reconnect,
            max_message_size: ws.max_message_size,
        }
    }
}
