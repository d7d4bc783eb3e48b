//! Adapter callbacks.

use relay_protocol::Envelope;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::state::ConnectionState;
use crate::traits::AdapterError;

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code reported by the transport, if any.
    pub code: Option<u16>,
    pub reason: String,
    /// True when the local side asked for the close.
    pub local: bool,
}

impl CloseInfo {
    /// Close requested through [`crate::TransportAdapter::disconnect`].
    #[must_use]
    pub fn local() -> Self {
        Self {
            code: Some(1000),
            reason: "client disconnect".to_string(),
            local: true,
        }
    }

    /// Close initiated by the remote side or the network.
    #[must_use]
    pub fn remote(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            local: false,
        }
    }
}

type Callback<T> = Option<Arc<dyn Fn(T) + Send + Sync>>;

/// Callbacks invoked by an adapter. Unset callbacks are skipped.
///
/// Callbacks run on the adapter's task; they should hand work off rather
/// than block.
#[derive(Clone, Default)]
pub struct AdapterObserver {
    on_open: Callback<()>,
    on_message: Callback<Envelope>,
    on_error: Option<Arc<dyn Fn(&AdapterError) + Send + Sync>>,
    on_close: Callback<CloseInfo>,
    on_heartbeat: Callback<Duration>,
    on_state_change: Option<Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>>,
}

impl AdapterObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection established (including after a reconnect).
    #[must_use]
    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(move |()| f()));
        self
    }

    /// Inbound payload.
    #[must_use]
    pub fn on_message(mut self, f: impl Fn(Envelope) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&AdapterError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_close(mut self, f: impl Fn(CloseInfo) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Heartbeat round trip, probe to reply.
    #[must_use]
    pub fn on_heartbeat(mut self, f: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.on_heartbeat = Some(Arc::new(f));
        self
    }

    /// Every state transition, as `(from, to)`.
    #[must_use]
    pub fn on_state_change(
        mut self,
        f: impl Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    pub fn emit_open(&self) {
        if let Some(f) = &self.on_open {
            f(());
        }
    }

    pub fn emit_message(&self, envelope: Envelope) {
        if let Some(f) = &self.on_message {
            f(envelope);
        }
    }

    pub fn emit_error(&self, error: &AdapterError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    pub fn emit_close(&self, info: CloseInfo) {
        if let Some(f) = &self.on_close {
            f(info);
        }
    }

    pub fn emit_heartbeat(&self, latency: Duration) {
        if let Some(f) = &self.on_heartbeat {
            f(latency);
        }
    }

    pub fn emit_state_change(&self, from: ConnectionState, to: ConnectionState) {
        if let Some(f) = &self.on_state_change {
            f(from, to);
        }
    }
}

impl fmt::Debug for AdapterObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterObserver")
            .field("on_open", &self.on_open.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_heartbeat", &self.on_heartbeat.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}
