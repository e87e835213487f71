//! Connection state machine, mode, side and TLS security level enums.
//!
//! State transitions form a strict lattice ending in [`ConnState::Closed`]:
//!
//! ```text
//! Init -> HandshakeWait1 -> WaitType -> Active (-> LoggedIn)
//!      \-> HelloWait ----------------/
//! any state -> Closed
//! ```
//!
//! `HelloWait` is the client-side counterpart of the server's `HandshakeWait1`/`WaitType` pair;
//! `HandshakeWait2` from the original numbering is unused and intentionally not modeled.

/// The lifecycle state of a single connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Freshly accepted/connected, no packets exchanged yet.
    Init,
    /// Server: waiting for the client to complete the handshake.
    HandshakeWait1,
    /// Server: waiting for the client to declare its connection type.
    WaitType,
    /// Client: waiting for the server's `Hello`.
    HelloWait,
    /// Handshake complete, ordinary traffic flows.
    Active,
    /// Active and additionally authenticated, application-defined meaning.
    LoggedIn,
    /// Terminal. No further transitions; the connection record may be reaped.
    Closed,
}

impl ConnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed)
    }
}

/// Application-level operating mode, set after the connection type handshake completes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    #[default]
    NotSet,
    Closed,
    Ping,
    Play,
    Chat,
}

/// Which end of the connection this record represents.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

/// TLS security level, ordered from least to most secure. Gates admit a packet only when the
/// connection's level is at least the gate's configured minimum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsSecLevel {
    /// No TLS in use. Default.
    None,
    /// Socket wrapped in TLS, but with no further guarantees than `None`.
    Wrapped,
    /// TLS with encryption enabled (stdlib default cipher suite guarantees).
    Encrypted,
    /// Server certificate verified, including hostname.
    ServerAuth,
    /// Both peer certificates verified, including hostname.
    BothAuth,
}

impl Default for TlsSecLevel {
    fn default() -> Self {
        TlsSecLevel::None
    }
}

/// Tracks the previous and current state of a connection so transition-edge logic (like firing
/// `on_close` exactly once) can act on the edge rather than the current state alone.
#[derive(Debug)]
pub struct StateCell {
    previous: ConnState,
    current: ConnState,
}

impl StateCell {
    pub fn new(initial: ConnState) -> Self {
        Self {
            previous: initial,
            current: initial,
        }
    }

    pub fn get(&self) -> ConnState {
        self.current
    }

    /// Transitions to `next`, returning the state that was current *before* the transition.
    ///
    /// Callers that need to run close-only logic must compare the returned previous state, not
    /// `next`: checking `next == Closed` alone would re-fire on every subsequent transition
    /// attempt on an already-closed connection.
    pub fn transition(&mut self, next: ConnState) -> ConnState {
        let previous = self.current;
        self.previous = previous;
        self.current = next;
        previous
    }

    /// True exactly on the transition edge into `Closed` (i.e. the connection was not already
    /// closed before this transition).
    pub fn just_closed(&self, previous: ConnState) -> bool {
        self.current == ConnState::Closed && previous != ConnState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_seclevel_ordering() {
        assert!(TlsSecLevel::None < TlsSecLevel::Wrapped);
        assert!(TlsSecLevel::Wrapped < TlsSecLevel::Encrypted);
        assert!(TlsSecLevel::Encrypted < TlsSecLevel::ServerAuth);
        assert!(TlsSecLevel::ServerAuth < TlsSecLevel::BothAuth);
    }

    #[test]
    fn test_on_close_fires_exactly_once() {
        let mut cell = StateCell::new(ConnState::Active);

        let prev = cell.transition(ConnState::Closed);
        assert!(cell.just_closed(prev));

        // Attempting to "close" again must not look like a fresh close edge.
        let prev = cell.transition(ConnState::Closed);
        assert!(!cell.just_closed(prev));
    }

    #[test]
    fn test_terminal_state() {
        assert!(ConnState::Closed.is_terminal());
        assert!(!ConnState::Active.is_terminal());
    }
}
