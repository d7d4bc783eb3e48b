//! The normalized domain message and its policy metadata.
//!
//! A [`Message`] is built by a producer, then shared read-only (usually as
//! `Arc<Message>`) by channels and the gateway. QoS, offline and security
//! policies are carried as metadata; the routing core reads some of them
//! (offline policy, retry hints) but never performs cryptography.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ids::{generate_message_id, now_millis, ClientId, ConnectionId, MessageId};

/// Delivery guarantee requested by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// Best effort, never retried.
    #[default]
    FireAndForget,
    /// The gateway may retry failed sends up to `max_retry` times.
    AtLeastOnce,
    /// Advisory only; treated like at-least-once by the gateway.
    ExactlyOnce,
}

/// Message priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Advisory quality-of-service metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Qos {
    pub delivery: DeliveryMode,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
}

impl Qos {
    /// QoS with the given delivery mode and default priority.
    #[must_use]
    pub fn new(delivery: DeliveryMode) -> Self {
        Self {
            delivery,
            ..Self::default()
        }
    }

    /// Set the maximum number of send retries.
    #[must_use]
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Number of extra send attempts the gateway may make after a failure.
    #[must_use]
    pub fn retry_budget(&self) -> u32 {
        match self.delivery {
            DeliveryMode::FireAndForget => 0,
            DeliveryMode::AtLeastOnce | DeliveryMode::ExactlyOnce => self.max_retry.unwrap_or(0),
        }
    }
}

/// What happens to a message that cannot be delivered immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OfflinePolicyKind {
    /// Count as dropped when nobody is subscribed.
    Drop,
    /// Keep in the channel's bounded buffer for later replay.
    Queue,
    /// Hand off to an external persistence collaborator.
    Persist,
    /// Hand off to an external synchronization collaborator.
    Sync,
}

/// Offline handling policy, set per channel or overridden per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflinePolicy {
    pub policy: OfflinePolicyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_on_reconnect: Option<bool>,
}

impl OfflinePolicy {
    #[must_use]
    pub fn new(policy: OfflinePolicyKind) -> Self {
        Self {
            policy,
            max_queue_size: None,
            persist_key: None,
            replay_on_reconnect: None,
        }
    }

    #[must_use]
    pub fn drop() -> Self {
        Self::new(OfflinePolicyKind::Drop)
    }

    #[must_use]
    pub fn queue() -> Self {
        Self::new(OfflinePolicyKind::Queue)
    }

    #[must_use]
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_persist_key(mut self, key: impl Into<String>) -> Self {
        self.persist_key = Some(key.into());
        self
    }
}

/// Confidentiality classification of a message or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Confidentiality {
    #[default]
    Public,
    Internal,
    Confidential,
    Restricted,
}

/// Security policy carried with a channel or message.
///
/// `encrypted` and `signed` are flags for collaborators that implement the
/// cryptography; the allow-list is enforced by channels.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub level: Confidentiality,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub signed: bool,
    /// Client ids allowed to access the channel; `None` means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_clients: Option<Vec<ClientId>>,
}

impl SecurityPolicy {
    /// Restrict access to the given clients.
    #[must_use]
    pub fn allow_only<I, S>(clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ClientId>,
    {
        Self {
            allowed_clients: Some(clients.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Check whether a client passes the allow-list.
    #[must_use]
    pub fn allows(&self, client: &str) -> bool {
        match &self.allowed_clients {
            None => true,
            Some(allowed) => allowed.iter().any(|c| c == client),
        }
    }
}

/// Distributed tracing context propagated with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

/// A message routed through channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Target channel.
    pub channel: String,
    /// Message payload.
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<Qos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline: Option<OfflinePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
    /// Ordered string headers.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
    /// Connection that published the message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ConnectionId>,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_message_id(),
            channel: channel.into(),
            payload: payload.into(),
            timestamp: now_millis(),
            qos: None,
            security: None,
            offline: None,
            trace: None,
            headers: IndexMap::new(),
            source: None,
        }
    }

    /// Replace the generated ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = Some(qos);
        self
    }

    #[must_use]
    pub fn with_security(mut self, security: SecurityPolicy) -> Self {
        self.security = Some(security);
        self
    }

    #[must_use]
    pub fn with_offline(mut self, offline: OfflinePolicy) -> Self {
        self.offline = Some(offline);
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Append a header. Later values for the same key replace earlier ones
    /// but keep the original position.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Create a message with a source connection.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<ConnectionId>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Extra send attempts allowed by the message QoS.
    #[must_use]
    pub fn retry_budget(&self) -> u32 {
        self.qos.as_ref().map(Qos::retry_budget).unwrap_or(0)
    }
}

/// Outcome reported by a receiver for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckStatus {
    #[default]
    Received,
    Processed,
    Rejected,
}

/// A delivery confirmation for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: MessageId,
    #[serde(default)]
    pub status: AckStatus,
    pub timestamp: u64,
}

impl Ack {
    #[must_use]
    pub fn new(message_id: impl Into<MessageId>, status: AckStatus) -> Self {
        Self {
            message_id: message_id.into(),
            status,
            timestamp: now_millis(),
        }
    }

    /// A `received` acknowledgement stamped now.
    #[must_use]
    pub fn received(message_id: impl Into<MessageId>) -> Self {
        Self::new(message_id, AckStatus::Received)
    }
}
