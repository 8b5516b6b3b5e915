use crate::gate::protocol::Inbound;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ConnectedUnauthenticated,
    Authenticated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectedUnauthenticated => "connected (unauthenticated)",
            ConnectionState::Authenticated => "authenticated",
        };
        f.write_str(name)
    }
}

/// Everything that can move the link between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    LinkUp,
    /// A connect attempt failed; the attempt is over.
    ConnectFailed,
    Inbound(Inbound),
    TransportError,
    Disconnect,
}

impl ConnectionState {
    /// Single transition function for the link. Events that make no sense in
    /// the current state leave it unchanged.
    pub fn on(self, event: &LinkEvent) -> ConnectionState {
        use ConnectionState::*;

        match (self, event) {
            (_, LinkEvent::TransportError) | (_, LinkEvent::Disconnect) => Disconnected,

            (Disconnected, LinkEvent::ConnectRequested) => Connecting,
            (Connecting, LinkEvent::LinkUp) => ConnectedUnauthenticated,
            (Connecting, LinkEvent::ConnectFailed) => Disconnected,

            (ConnectedUnauthenticated, LinkEvent::Inbound(Inbound::AuthSuccess)) => Authenticated,
            (ConnectedUnauthenticated, LinkEvent::Inbound(Inbound::AuthFailed)) => ConnectedUnauthenticated,
            // The controller forgot us (e.g. it rebooted); the handshake must be redone.
            (Authenticated, LinkEvent::Inbound(Inbound::NotAuthenticated)) => ConnectedUnauthenticated,

            (state, _) => state,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectedUnauthenticated | ConnectionState::Authenticated
        )
    }
}
