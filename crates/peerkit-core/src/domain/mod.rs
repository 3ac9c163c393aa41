//! Domain entities for PeerKit.
//!
//! Everything here is pure data plus the small rules that belong to the data
//! itself (who invites whom, whether an invitation may be accepted).  There is
//! no I/O and no locking; the session manager in the `peerkit` crate owns the
//! mutable collections.

use std::time::{SystemTime, UNIX_EPOCH};

/// Per-peer connection state and the record the session manager keeps.
pub mod connection;

/// Peer identifiers, identities, and discovery tokens.
pub mod identity;

/// Returns the current wall-clock time as fractional seconds since the Unix epoch.
///
/// Used for discovery tokens and host start times, both of which must be
/// comparable across devices.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
