//! Connection lifecycle shared by all adapters.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use relay_protocol::{ConnectionId, Envelope, Protocol};
use std::fmt;
use tracing::{debug, warn};

use crate::observer::AdapterObserver;
use crate::traits::AdapterError;

/// Lifecycle state of an adapter.
///
/// ```text
/// idle ──connect──▶ connecting ──open──▶ connected ──close──▶ disconnected
///                        │                                       │    ▲
///                        └──error──▶ failed        reconnect ────┘    │
///                                                  reconnecting ──────┘ (cancelled)
/// ```
///
/// `disconnected`, `failed` and `reconnecting` may move back to
/// `connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Idle | Disconnected | Failed | Reconnecting, Connecting)
                | (Connecting, Connected | Failed | Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Reconnecting)
                | (Reconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State, identity and callbacks common to every adapter implementation.
pub(crate) struct AdapterCore {
    protocol: Protocol,
    connection_id: ConnectionId,
    state: Mutex<ConnectionState>,
    observer: RwLock<AdapterObserver>,
}

impl AdapterCore {
    pub(crate) fn new(protocol: Protocol, connection_id: ConnectionId) -> Self {
        Self {
            protocol,
            connection_id,
            state: Mutex::new(ConnectionState::Idle),
            observer: RwLock::new(AdapterObserver::default()),
        }
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Snapshot of the callbacks; never invoke them under a lock.
    pub(crate) fn observer(&self) -> AdapterObserver {
        self.observer.read().clone()
    }

    pub(crate) fn set_observer(&self, observer: AdapterObserver) {
        *self.observer.write() = observer;
    }

    /// Move to `next`, notifying the observer. Returns the previous state.
    pub(crate) fn transition(
        &self,
        next: ConnectionState,
    ) -> Result<ConnectionState, AdapterError> {
        let previous = {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                return Err(AdapterError::InvalidTransition {
                    from: *state,
                    to: next,
                });
            }
            std::mem::replace(&mut *state, next)
        };

        debug!(
            connection = %self.connection_id,
            protocol = %self.protocol,
            "State {} -> {}",
            previous,
            next
        );
        self.observer().emit_state_change(previous, next);
        Ok(previous)
    }

    /// Move to `next` only when the current state is one of `from`.
    pub(crate) fn transition_from(
        &self,
        from: &[ConnectionState],
        next: ConnectionState,
    ) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if !from.contains(&*state) || !state.can_transition_to(next) {
                return false;
            }
            std::mem::replace(&mut *state, next)
        };

        debug!(
            connection = %self.connection_id,
            protocol = %self.protocol,
            "State {} -> {}",
            previous,
            next
        );
        self.observer().emit_state_change(previous, next);
        true
    }

    /// Report an error to the observer and hand it back for returning.
    pub(crate) fn fail(&self, error: AdapterError) -> AdapterError {
        warn!(
            connection = %self.connection_id,
            protocol = %self.protocol,
            "Adapter error: {}",
            error
        );
        self.observer().emit_error(&error);
        error
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), AdapterError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(self.fail(AdapterError::NotConnected(state))),
        }
    }

    pub(crate) fn envelope(&self, raw: Bytes, transport_uri: &str) -> Envelope {
        Envelope::new(self.protocol, raw)
            .with_transport_uri(transport_uri)
            .with_connection(self.connection_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ConnectionState::*;

    #[test]
    fn test_allowed_transitions() {
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Reconnecting.can_transition_to(Disconnected));
        assert!(Failed.can_transition_to(Connecting));

        assert!(!Idle.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Reconnecting));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[test]
    fn test_core_transition_notifies() {
        let core = AdapterCore::new(Protocol::WebSocket, ConnectionId::from("conn-1"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        core.set_observer(
            AdapterObserver::new().on_state_change(move |from, to| sink.lock().push((from, to))),
        );

        assert_eq!(core.transition(Connecting).unwrap(), Idle);
        assert!(matches!(
            core.transition(Reconnecting),
            Err(AdapterError::InvalidTransition {
                from: Connecting,
                to: Reconnecting
            })
        ));
        assert!(!core.transition_from(&[Connected], Disconnected));
        assert!(core.transition_from(&[Connecting], Connected));

        assert_eq!(*seen.lock(), vec![(Idle, Connecting), (Connecting, Connected)]);
        assert_eq!(core.state(), Connected);
    }

    #[test]
    fn test_ensure_connected_reports_error() {
        let core = AdapterCore::new(Protocol::Mqtt, ConnectionId::from("conn-1"));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        core.set_observer(AdapterObserver::new().on_error(move |e| sink.lock().push(e.clone())));

        assert_eq!(
            core.ensure_connected(),
            Err(AdapterError::NotConnected(Idle))
        );
        assert_eq!(*errors.lock(), vec![AdapterError::NotConnected(Idle)]);
    }
}
