use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::epoch_seconds;

/// Key under which a peer advertises its [`DiscoveryToken`] in discovery info.
pub const DISCOVERY_INFO_KEY: &str = "discoveryId";

/// Opaque token identifying one device.
///
/// A fresh id is minted for self at startup (or loaded from the stored
/// identity) and again on every session reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Mints a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable identity of a device on the peer network.
///
/// Two identities are equal when their ids are equal; the display name and
/// the `is_self` flag do not take part in comparison or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    id: PeerId,
    display_name: String,
    is_self: bool,
}

impl PeerIdentity {
    /// Creates the identity of the local device with a freshly minted id.
    pub fn local(display_name: impl Into<String>) -> Self {
        Self::with_id(PeerId::new(), display_name, true)
    }

    /// Creates the identity of a remote device observed by the transport.
    pub fn remote(id: PeerId, display_name: impl Into<String>) -> Self {
        Self::with_id(id, display_name, false)
    }

    pub fn with_id(id: PeerId, display_name: impl Into<String>, is_self: bool) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            is_self,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_self(&self) -> bool {
        self.is_self
    }

    /// Returns this identity as seen from another device.
    pub fn as_remote(&self) -> Self {
        Self::remote(self.id, self.display_name.clone())
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Per-session comparable value used only to break invitation glare.
///
/// When two peers discover each other, the one holding the lexicographically
/// smaller token is the sole inviter for that pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscoveryToken(String);

impl DiscoveryToken {
    /// Generates a token of the form `"<epoch seconds> <uuid>"`.
    pub fn generate() -> Self {
        Self(format!("{} {}", epoch_seconds(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the holder of `self` must invite the holder of `other`.
    pub fn should_invite(&self, other: &DiscoveryToken) -> bool {
        self.0 < other.0
    }
}

impl From<String> for DiscoveryToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DiscoveryToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for DiscoveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
