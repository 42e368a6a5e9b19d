//! Connection states and the guarded transition table.

use std::fmt;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::error::FailureReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    StreamNegotiating,
    SecurityNegotiating,
    Authenticating,
    BindingResource,
    Connected,
    Disconnecting,
    Disconnected,
    Failed(FailureReason),
}

impl ConnectionState {
    /// End of an attempt; only a new attempt leaves these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed(_))
    }

    /// Between `Connecting` and `BindingResource`.
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::StreamNegotiating
                | ConnectionState::SecurityNegotiating
                | ConnectionState::Authenticating
                | ConnectionState::BindingResource
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::StreamNegotiating => "stream_negotiating",
            ConnectionState::SecurityNegotiating => "security_negotiating",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::BindingResource => "binding_resource",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed(_) => "failed",
        }
    }

    fn can_transition_to(&self, to: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (Idle | Disconnected | Failed(_), Connecting) => true,
            (Connecting, StreamNegotiating) => true,
            (StreamNegotiating, SecurityNegotiating | Authenticating) => true,
            (SecurityNegotiating, Authenticating) => true,
            (Authenticating, BindingResource) => true,
            (BindingResource, Connected) => true,
            (from, Disconnecting) => from.is_negotiating() || *from == Connected,
            (Disconnecting, Disconnected) => true,
            (from, Failed(_)) => from.is_negotiating() || matches!(from, Connected | Disconnecting),
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Owner of the current state. Transitions are checked and applied under the
/// watch channel's lock, and every applied one is broadcast in order.
pub(crate) struct StateMachine {
    conn_id: u64,
    current: watch::Sender<ConnectionState>,
    changes: broadcast::Sender<StateChange>,
}

impl StateMachine {
    pub(crate) fn new(conn_id: u64) -> Self {
        let (current, _) = watch::channel(ConnectionState::Idle);
        let (changes, _) = broadcast::channel(64);
        Self {
            conn_id,
            current,
            changes,
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.current.borrow().clone()
    }

    /// Apply `to` if the table allows it from the current state.
    pub(crate) fn transition(&self, to: ConnectionState) -> bool {
        let conn_id = self.conn_id;
        let changes = &self.changes;
        self.current.send_if_modified(|current| {
            if !current.can_transition_to(&to) {
                debug!(conn_id, from = %current, to = %to, "Transition refused");
                return false;
            }
            let from = std::mem::replace(current, to.clone());
            info!(conn_id, from = %from, to = %to, "Connection state changed");
            let _ = changes.send(StateChange { from, to });
            true
        })
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }
}
