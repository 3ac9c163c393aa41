//! # peerkit-core
//!
//! Shared foundation for PeerKit: the value types that identify devices on a
//! local peer network, the per-peer connection record, and the JSON wire
//! protocol used for every message exchanged between peers.
//!
//! This crate has no dependency on any transport, runtime, or OS API.
//!
//! # Architecture overview (for beginners)
//!
//! PeerKit lets a handful of nearby devices find each other, connect, and
//! agree on a single "host" without a server.  The work is split in two:
//!
//! - **`domain`** – Plain data: [`PeerIdentity`], [`DiscoveryToken`] (used to
//!   decide which of two peers sends the connection invitation), and the
//!   [`ConnectionRecord`] the session manager keeps for every known peer.
//!
//! - **`protocol`** – How messages look on the wire.  Every payload is a JSON
//!   object tagged with an `"eventName"` so the receiver can route it to the
//!   right handler without knowing anything else about it.
//!
//! The `peerkit` crate builds the session manager and the host election
//! service on top of these types.

pub mod domain;
pub mod protocol;

pub use domain::connection::{ConnectionRecord, ConnectionState, TransportState};
pub use domain::identity::{DiscoveryToken, PeerId, PeerIdentity, DISCOVERY_INFO_KEY};
pub use domain::epoch_seconds;
pub use protocol::codec::{decode_event, encode_event, event_name, ProtocolError};
pub use protocol::messages::{
    HostEvent, HostEventKind, ProbeKind, ProbeMessage, CATCH_ALL_EVENT, HOST_SELECTOR_EVENT,
    LOOPBACK_EVENT,
};
