//! Application layer: session management and host election.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure data and rules, in `peerkit-core`) and the infrastructure (the
//! concrete transport, file storage, process wiring).
//!
//! Code in this layer:
//!
//! - **Orchestrates** domain objects to fulfil a goal (e.g., "keep exactly
//!   one invitation in flight per peer pair").
//! - **Depends on abstractions** such as [`transport::PeerTransport`] rather
//!   than a concrete radio or socket, so tests can substitute a mock.
//! - **Contains no OS calls and no file system access**.
//!
//! # Sub-modules
//!
//! - **`transport`** – The seam to the peer transport provider: the
//!   `PeerTransport` trait and the events it delivers.
//!
//! - **`observers`** – Weak observer registries with explicit unregister
//!   handles, plus the observer traits themselves.
//!
//! - **`session_manager`** – The per-peer connection table, invitation glare
//!   arbitration, liveness probes, and routing of inbound data by event name.
//!
//! - **`host_election`** – Agrees on a single host among the connected peers
//!   using the `announceHost` message and start-time comparison.

pub mod host_election;
pub mod observers;
pub mod session_manager;
pub mod transport;
