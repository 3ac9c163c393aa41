//! The seam between the session manager and the peer transport provider.
//!
//! The provider is whatever actually moves bytes between nearby devices
//! (Bluetooth, Wi-Fi Direct, or the in-process hub used by tests).  It is
//! consumed through the [`PeerTransport`] trait for outbound calls and an
//! unbounded channel of [`TransportEvent`]s for everything it reports back.
//!
//! # Testability
//!
//! In unit tests `PeerTransport` is replaced by the mockall-generated
//! `MockPeerTransport`, so arbitration and send rules can be checked without
//! any transport at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerkit_core::{PeerId, PeerIdentity, TransportState};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Delivery guarantee requested for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Reliable,
    Unreliable,
}

/// Error type reported by a transport provider.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("invitation to {0} timed out")]
    InvitationTimedOut(PeerId),
    #[error("transport rejected the operation: {0}")]
    Rejected(String),
    #[error("transport has been disconnected")]
    Closed,
}

/// Events delivered by the transport provider, in the order they occurred.
#[derive(Debug)]
pub enum TransportEvent {
    /// The browser found a peer advertising the same service.
    PeerFound {
        peer: PeerIdentity,
        discovery_info: HashMap<String, String>,
    },
    /// The browser no longer sees the peer.
    PeerLost { peer: PeerIdentity },
    /// The session state of a peer changed.
    ///
    /// `code` is the raw state code; see [`TransportState`] for the defined values.
    StateChanged { peer: PeerIdentity, code: u8 },
    /// A payload arrived from a peer.
    DataReceived { peer: PeerIdentity, data: Vec<u8> },
    /// A peer invited us to connect.  Send `true` on `reply` to accept.
    Invitation {
        peer: PeerIdentity,
        reply: oneshot::Sender<bool>,
    },
}

impl TransportEvent {
    pub fn state_changed(peer: PeerIdentity, state: TransportState) -> Self {
        TransportEvent::StateChanged {
            peer,
            code: state as u8,
        }
    }
}

/// Outbound operations of the peer transport provider.
///
/// Implementations must be cheap to call from async code: everything except
/// [`invite`](PeerTransport::invite) is expected to return promptly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Starts advertising `identity` with the given discovery info.
    fn advertise(&self, identity: &PeerIdentity, discovery_info: HashMap<String, String>);

    /// Starts browsing for other peers of the same service.
    fn browse(&self);

    /// Stops advertising and browsing.  Existing connections stay up.
    fn stop(&self);

    /// Invites `peer` to connect and waits up to `timeout` for the answer.
    ///
    /// Returns `Ok(false)` if the peer declined.
    async fn invite(&self, peer: PeerId, timeout: Duration) -> Result<bool, TransportError>;

    /// Sends `data` to each of `peers`.
    fn send(&self, data: &[u8], peers: &[PeerId], mode: SendMode) -> Result<(), TransportError>;

    /// Peers the transport currently holds an open session with, in its own order.
    fn active_peers(&self) -> Vec<PeerId>;

    /// Tears down every session and stops advertising and browsing.
    fn disconnect(&self);
}

/// Builds a transport bound to one local identity.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        identity: &PeerIdentity,
        service_name: &str,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>);
}
