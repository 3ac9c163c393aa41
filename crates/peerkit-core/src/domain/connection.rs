//! Connection state for a single known peer.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!            found / invitation            transport "connected"
//! (none) ──► Unknown ──► Connecting ──────────────────────► Connected
//!              ▲             │                                 │
//!              │             └──────► NotConnected ◄───────────┘
//!              │                         (lost link or stale probe)
//!              └──── browser lost the peer (state is no longer trusted)
//! ```
//!
//! `Unknown` means "we know the peer exists but have not confirmed its
//! connection ourselves".  A peer the transport still reports as connected
//! while its record is `Unknown` is exactly the ambiguous case that triggers
//! a liveness probe.

use std::fmt;
use std::time::Instant;

use tracing::debug;

use super::identity::{DiscoveryToken, PeerIdentity};

/// Connection state as tracked by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Known, but no confirmed state.
    Unknown,
    /// Handshake in progress.
    Connecting,
    /// Session established and confirmed.
    Connected,
    /// Link down, or the liveness probe went unanswered.
    NotConnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "unknown"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::NotConnected => write!(f, "not_connected"),
        }
    }
}

/// The state enumeration reported by the transport provider.
///
/// The transport delivers states as raw codes.  Any code outside this
/// enumeration is an invariant violation that requires a session reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    NotConnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl TryFrom<u8> for TransportState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(TransportState::NotConnected),
            1 => Ok(TransportState::Connecting),
            2 => Ok(TransportState::Connected),
            _ => Err(()),
        }
    }
}

impl From<TransportState> for ConnectionState {
    fn from(state: TransportState) -> Self {
        match state {
            TransportState::NotConnected => ConnectionState::NotConnected,
            TransportState::Connecting => ConnectionState::Connecting,
            TransportState::Connected => ConnectionState::Connected,
        }
    }
}

/// Everything the session manager knows about one peer.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub identity: PeerIdentity,
    /// Token from the peer's discovery info; absent until it has been advertised.
    pub discovery_token: Option<DiscoveryToken>,
    pub state: ConnectionState,
    pub last_seen_at: Instant,
    /// Whether the browser currently sees this peer.
    pub found: bool,
    /// An invitation we issued to this peer has not completed yet.
    pub invitation_pending: bool,
    /// Nonce of the outstanding liveness ping, if any.
    pub pending_probe: Option<u64>,
}

impl ConnectionRecord {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            discovery_token: None,
            state: ConnectionState::Unknown,
            last_seen_at: Instant::now(),
            found: false,
            invitation_pending: false,
            pending_probe: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen_at = Instant::now();
    }

    pub fn transition_to(&mut self, new_state: ConnectionState) {
        if self.state != new_state {
            debug!(
                peer = %self.identity.id(),
                from = %self.state,
                to = %new_state,
                "peer state transition"
            );
        }
        self.state = new_state;
    }

    /// `true` when the transport lists the peer as active but the record does
    /// not vouch for the link: `Unknown`, or `NotConnected` after a failed
    /// probe or a dropped link the transport has not cleaned up.
    pub fn needs_liveness_check(&self, transport_active: bool) -> bool {
        transport_active
            && matches!(
                self.state,
                ConnectionState::Unknown | ConnectionState::NotConnected
            )
            && self.pending_probe.is_none()
    }

    /// Decides whether the local peer (holding `my_token`) must invite this peer.
    ///
    /// `transport_active` is whether the transport already lists the peer in
    /// its active set.
    pub fn should_invite(&self, my_token: &DiscoveryToken, transport_active: bool) -> bool {
        let Some(their_token) = &self.discovery_token else {
            return false;
        };
        self.found
            && my_token.should_invite(their_token)
            && !transport_active
            && self.state != ConnectionState::Connecting
            && !self.invitation_pending
    }

    pub fn should_accept_invitation(&self, transport_active: bool) -> bool {
        !transport_active && self.state != ConnectionState::Connecting
    }
}
