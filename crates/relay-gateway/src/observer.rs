//! Gateway events and access control.

use relay_protocol::{Ack, ConnectionId, Message};
use std::fmt;
use std::sync::Arc;
use tenvis_relay_transport::CloseInfo;

use crate::gateway::GatewayError;

type ConnectionCallback<T> = Option<Arc<dyn Fn(&ConnectionId, T) + Send + Sync>>;

/// Callbacks invoked by the gateway. Unset callbacks are skipped.
///
/// Callbacks run inline on adapter and dispatch tasks and must not call
/// back into the gateway synchronously.
#[derive(Clone, Default)]
pub struct GatewayObserver {
    on_connect: Option<Arc<dyn Fn(&ConnectionId) + Send + Sync>>,
    on_disconnect: Option<Arc<dyn Fn(&ConnectionId, &CloseInfo) + Send + Sync>>,
    on_message: Option<Arc<dyn Fn(&ConnectionId, &Message) + Send + Sync>>,
    on_ack: Option<Arc<dyn Fn(&ConnectionId, &Ack) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(Option<&ConnectionId>, &GatewayError) + Send + Sync>>,
    on_backpressure: ConnectionCallback<usize>,
}

impl GatewayObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection opened, including after an adapter reconnect.
    #[must_use]
    pub fn on_connect(mut self, f: impl Fn(&ConnectionId) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_disconnect(
        mut self,
        f: impl Fn(&ConnectionId, &CloseInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// A message published by a connection, before fan-out.
    #[must_use]
    pub fn on_message(mut self, f: impl Fn(&ConnectionId, &Message) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_ack(mut self, f: impl Fn(&ConnectionId, &Ack) + Send + Sync + 'static) -> Self {
        self.on_ack = Some(Arc::new(f));
        self
    }

    /// Adapter faults, undecodable frames and rejected operations.
    #[must_use]
    pub fn on_error(
        mut self,
        f: impl Fn(Option<&ConnectionId>, &GatewayError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// An adapter's buffered amount after a send, when above the threshold.
    #[must_use]
    pub fn on_backpressure(mut self, f: impl Fn(&ConnectionId, usize) + Send + Sync + 'static) -> Self {
        self.on_backpressure = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_connect(&self, id: &ConnectionId) {
        if let Some(f) = &self.on_connect {
            f(id);
        }
    }

    pub(crate) fn emit_disconnect(&self, id: &ConnectionId, info: &CloseInfo) {
        if let Some(f) = &self.on_disconnect {
            f(id, info);
        }
    }

    pub(crate) fn emit_message(&self, id: &ConnectionId, message: &Message) {
        if let Some(f) = &self.on_message {
            f(id, message);
        }
    }

    pub(crate) fn emit_ack(&self, id: &ConnectionId, ack: &Ack) {
        if let Some(f) = &self.on_ack {
            f(id, ack);
        }
    }

    pub(crate) fn emit_error(&self, id: Option<&ConnectionId>, error: &GatewayError) {
        if let Some(f) = &self.on_error {
            f(id, error);
        }
    }

    pub(crate) fn emit_backpressure(&self, id: &ConnectionId, buffered: usize) {
        if let Some(f) = &self.on_backpressure {
            f(id, buffered);
        }
    }
}

impl fmt::Debug for GatewayObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayObserver")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_ack", &self.on_ack.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_backpressure", &self.on_backpressure.is_some())
            .finish()
    }
}

/// Decides whether a client may subscribe to a channel.
///
/// Checked before the channel's own allow-list. The client is the id given
/// to [`crate::Gateway::connect`], or the connection id when none was given.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, client: &str, channel: &str) -> bool;
}

impl<F> AccessPolicy for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn allows(&self, client: &str, channel: &str) -> bool {
        self(client, channel)
    }
}

/// Lets every client subscribe anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _client: &str, _channel: &str) -> bool {
        true
    }
}
