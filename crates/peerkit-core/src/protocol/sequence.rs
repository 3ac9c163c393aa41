//! Nonces for liveness probes.
//!
//! A pong only confirms a connection if it echoes the nonce of the ping that
//! is still outstanding for that peer, so a late pong from an earlier probe
//! can never confirm a later one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe source of non-zero probe nonces.
///
/// # Examples
///
/// ```rust
/// use peerkit_core::protocol::ProbeNonces;
///
/// let nonces = ProbeNonces::new();
/// assert_eq!(nonces.next(), 1);
/// assert_eq!(nonces.next(), 2);
/// ```
#[derive(Debug)]
pub struct ProbeNonces {
    inner: AtomicU64,
}

impl ProbeNonces {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns the next nonce, skipping zero on wrap-around.
    pub fn next(&self) -> u64 {
        loop {
            let nonce = self.inner.fetch_add(1, Ordering::Relaxed);
            if nonce != 0 {
                return nonce;
            }
        }
    }
}

impl Default for ProbeNonces {
    fn default() -> Self {
        Self::new()
    }
}
