//! peerkit library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod application;
pub mod infrastructure;

pub use application::host_election::{HostElection, HostRole};
pub use application::observers::{DataHandler, HostObserver, ObserverHandle, PeerObserver};
pub use application::session_manager::{SessionError, SessionManager, SessionSettings};
pub use application::transport::{
    PeerTransport, SendMode, TransportError, TransportEvent, TransportFactory,
};
pub use infrastructure::context::NetworkContext;
