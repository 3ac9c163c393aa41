//! Event payloads exchanged between peers.
//!
//! Each payload is serialized inside the envelope produced by
//! [`crate::protocol::codec::encode_event`], which adds the `"eventName"`
//! routing field.  Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

/// Event name of host election messages.
pub const HOST_SELECTOR_EVENT: &str = "host-selector";

/// Event name of liveness probe messages.
pub const LOOPBACK_EVENT: &str = "loopback-test";

/// Handlers registered under this name receive every inbound payload.
pub const CATCH_ALL_EVENT: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostEventKind {
    AnnounceHost,
}

/// Host election message.
///
/// Wire form: `{"eventName":"host-selector","kind":"announceHost","hostStartTime":1715000000.5}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEvent {
    pub kind: HostEventKind,
    /// Epoch seconds at which the sender became host.
    pub host_start_time: f64,
}

impl HostEvent {
    pub fn announce(host_start_time: f64) -> Self {
        Self {
            kind: HostEventKind::AnnounceHost,
            host_start_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeKind {
    Ping,
    Pong,
}

/// Liveness probe; a pong echoes the nonce of the ping it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMessage {
    pub kind: ProbeKind,
    pub nonce: u64,
}

impl ProbeMessage {
    pub fn ping(nonce: u64) -> Self {
        Self {
            kind: ProbeKind::Ping,
            nonce,
        }
    }

    pub fn pong(nonce: u64) -> Self {
        Self {
            kind: ProbeKind::Pong,
            nonce,
        }
    }

    /// Builds the answer to this probe, if it is a ping.
    pub fn reply(&self) -> Option<Self> {
        match self.kind {
            ProbeKind::Ping => Some(Self::pong(self.nonce)),
            ProbeKind::Pong => None,
        }
    }
}
