//! In-process peer transport.
//!
//! A [`MemoryHub`] plays the role of the radio: every peer that joins it
//! with the same service name can discover, invite, and message the others.
//! Each joined peer gets a [`MemoryTransport`] plus the receiving end of its
//! event channel, exactly as a real provider would hand them out.
//!
//! # Fault injection
//!
//! Real transports misbehave in two ways the session layer must survive,
//! and the hub can reproduce both:
//!
//! - [`MemoryHub::suspend`] makes a peer go silent without a disconnect: the
//!   others stop seeing it in discovery, but their transports keep listing it
//!   as active and everything sent to it is dropped.
//! - [`MemoryHub::inject_state`] delivers an arbitrary raw state code,
//!   including codes outside the defined enumeration.
//!
//! Delivery is always reliable and in order; [`SendMode`] is accepted and
//! ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use peerkit_core::{PeerId, PeerIdentity, TransportState};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::application::transport::{
    PeerTransport, SendMode, TransportError, TransportEvent, TransportFactory,
};

struct Member {
    identity: PeerIdentity,
    service: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    discovery_info: Option<HashMap<String, String>>,
    browsing: bool,
    suspended: bool,
    /// Peers with an open session, in the order they connected.
    sessions: Vec<PeerId>,
    invitations_sent: usize,
}

impl Member {
    fn emit(&self, event: TransportEvent) {
        // A closed receiver means the owning session is gone.
        if self.events.send(event).is_err() {
            trace!(peer = %self.identity.id(), "dropping event for closed session");
        }
    }

    fn visible(&self) -> bool {
        self.discovery_info.is_some() && !self.suspended
    }
}

#[derive(Default)]
struct HubState {
    members: HashMap<PeerId, Member>,
}

impl HubState {
    /// Other members in the same service as `id`.
    fn neighbours(&self, id: PeerId) -> Vec<PeerId> {
        let Some(me) = self.members.get(&id) else {
            return Vec::new();
        };
        self.members
            .values()
            .filter(|m| m.identity.id() != id && m.service == me.service)
            .map(|m| m.identity.id())
            .collect()
    }

    /// Tells `observer` that `subject` was found, if the observer is browsing.
    fn announce_found(&self, observer: PeerId, subject: PeerId) {
        let (Some(observer), Some(subject)) =
            (self.members.get(&observer), self.members.get(&subject))
        else {
            return;
        };
        if let (true, Some(info)) = (observer.browsing, &subject.discovery_info) {
            observer.emit(TransportEvent::PeerFound {
                peer: subject.identity.as_remote(),
                discovery_info: info.clone(),
            });
        }
    }

    fn announce_lost(&self, observer: PeerId, subject: &PeerIdentity) {
        if let Some(observer) = self.members.get(&observer) {
            if observer.browsing {
                observer.emit(TransportEvent::PeerLost {
                    peer: subject.as_remote(),
                });
            }
        }
    }

    fn emit_state(&self, at: PeerId, about: PeerId, state: TransportState) {
        let (Some(at), Some(about)) = (self.members.get(&at), self.members.get(&about)) else {
            return;
        };
        at.emit(TransportEvent::state_changed(about.identity.as_remote(), state));
    }
}

/// A shared in-process medium.  Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer to the hub.  It stays invisible until it advertises.
    pub fn join(
        &self,
        identity: &PeerIdentity,
        service_name: &str,
    ) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        self.lock().members.insert(
            identity.id(),
            Member {
                identity: identity.clone(),
                service: service_name.to_string(),
                events,
                discovery_info: None,
                browsing: false,
                suspended: false,
                sessions: Vec::new(),
                invitations_sent: 0,
            },
        );
        debug!(peer = %identity, service = service_name, "joined memory hub");
        let transport = Arc::new(MemoryTransport {
            hub: self.clone(),
            id: identity.id(),
        });
        (transport, rx)
    }

    /// Number of invitations `id` has sent since it joined.
    pub fn invitations_from(&self, id: PeerId) -> usize {
        self.lock()
            .members
            .get(&id)
            .map_or(0, |m| m.invitations_sent)
    }

    /// Makes `id` go silent without telling anyone it disconnected.
    pub fn suspend(&self, id: PeerId) {
        let mut state = self.lock();
        let Some(member) = state.members.get_mut(&id) else {
            return;
        };
        member.suspended = true;
        let identity = member.identity.clone();
        for other in state.neighbours(id) {
            state.announce_lost(other, &identity);
        }
        debug!(peer = %identity, "suspended");
    }

    /// Re-delivers discovery of `id` to its neighbours, even while suspended.
    ///
    /// This is what a browser does when a stale advertisement resurfaces.
    pub fn rediscover(&self, id: PeerId) {
        let state = self.lock();
        let Some(member) = state.members.get(&id) else {
            return;
        };
        let (Some(info), identity) = (member.discovery_info.clone(), member.identity.as_remote())
        else {
            return;
        };
        for other in state.neighbours(id) {
            if let Some(observer) = state.members.get(&other).filter(|m| m.browsing) {
                observer.emit(TransportEvent::PeerFound {
                    peer: identity.clone(),
                    discovery_info: info.clone(),
                });
            }
        }
    }

    /// Ends a suspension and makes `id` discoverable again.
    pub fn resume(&self, id: PeerId) {
        let mut state = self.lock();
        let Some(member) = state.members.get_mut(&id) else {
            return;
        };
        member.suspended = false;
        for other in state.neighbours(id) {
            state.announce_found(other, id);
        }
    }

    /// Delivers a raw state code about `about` to `at`.
    pub fn inject_state(&self, at: PeerId, about: &PeerIdentity, code: u8) {
        if let Some(member) = self.lock().members.get(&at) {
            member.emit(TransportEvent::StateChanged {
                peer: about.as_remote(),
                code,
            });
        }
    }

    /// Delivers `data` to `at` as if `from` had sent it.
    pub fn inject_data(&self, at: PeerId, from: &PeerIdentity, data: Vec<u8>) {
        if let Some(member) = self.lock().members.get(&at) {
            member.emit(TransportEvent::DataReceived {
                peer: from.as_remote(),
                data,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransportFactory for MemoryHub {
    fn create(
        &self,
        identity: &PeerIdentity,
        service_name: &str,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport, events) = self.join(identity, service_name);
        (transport, events)
    }
}

/// One peer's handle onto a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    id: PeerId,
}

impl MemoryTransport {
    pub fn id(&self) -> PeerId {
        self.id
    }

    fn connect(&self, peer: PeerId) {
        let mut state = self.hub.lock();
        for (a, b) in [(self.id, peer), (peer, self.id)] {
            if let Some(member) = state.members.get_mut(&a) {
                if !member.sessions.contains(&b) {
                    member.sessions.push(b);
                }
            }
        }
        state.emit_state(self.id, peer, TransportState::Connected);
        state.emit_state(peer, self.id, TransportState::Connected);
    }

    fn invite_failed(&self, peer: PeerId) {
        self.hub
            .lock()
            .emit_state(self.id, peer, TransportState::NotConnected);
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn advertise(&self, identity: &PeerIdentity, discovery_info: HashMap<String, String>) {
        let mut state = self.hub.lock();
        let Some(member) = state.members.get_mut(&self.id) else {
            return;
        };
        member.discovery_info = Some(discovery_info);
        if member.suspended {
            return;
        }
        debug!(peer = %identity, "advertising");
        for other in state.neighbours(self.id) {
            state.announce_found(other, self.id);
        }
    }

    fn browse(&self) {
        let mut state = self.hub.lock();
        let Some(member) = state.members.get_mut(&self.id) else {
            return;
        };
        member.browsing = true;
        for other in state.neighbours(self.id) {
            if state.members.get(&other).is_some_and(Member::visible) {
                state.announce_found(self.id, other);
            }
        }
    }

    fn stop(&self) {
        let mut state = self.hub.lock();
        let Some(member) = state.members.get_mut(&self.id) else {
            return;
        };
        let was_visible = member.visible();
        member.discovery_info = None;
        member.browsing = false;
        let identity = member.identity.clone();
        if was_visible {
            for other in state.neighbours(self.id) {
                state.announce_lost(other, &identity);
            }
        }
    }

    async fn invite(&self, peer: PeerId, timeout: Duration) -> Result<bool, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let delivered = {
            let mut state = self.hub.lock();
            let inviter = match state.members.get_mut(&self.id) {
                Some(member) => {
                    member.invitations_sent += 1;
                    member.identity.as_remote()
                }
                None => return Err(TransportError::Closed),
            };
            let target = state
                .members
                .get(&peer)
                .ok_or(TransportError::Unreachable(peer))?;
            state.emit_state(self.id, peer, TransportState::Connecting);
            if target.suspended {
                false
            } else {
                target.emit(TransportEvent::Invitation {
                    peer: inviter,
                    reply: reply_tx,
                });
                true
            }
        };

        if !delivered {
            tokio::time::sleep(timeout).await;
            self.invite_failed(peer);
            return Err(TransportError::InvitationTimedOut(peer));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(true)) => {
                self.connect(peer);
                Ok(true)
            }
            Ok(Ok(false)) => {
                self.invite_failed(peer);
                Ok(false)
            }
            Ok(Err(_)) => {
                self.invite_failed(peer);
                Err(TransportError::Rejected(
                    "invitation dropped without an answer".to_string(),
                ))
            }
            Err(_) => {
                self.invite_failed(peer);
                Err(TransportError::InvitationTimedOut(peer))
            }
        }
    }

    fn send(&self, data: &[u8], peers: &[PeerId], _mode: SendMode) -> Result<(), TransportError> {
        let state = self.hub.lock();
        let me = state.members.get(&self.id).ok_or(TransportError::Closed)?;
        if let Some(missing) = peers.iter().find(|p| !me.sessions.contains(p)) {
            return Err(TransportError::NotConnected(*missing));
        }
        if me.suspended {
            return Ok(());
        }
        for peer in peers {
            match state.members.get(peer) {
                Some(target) if !target.suspended => target.emit(TransportEvent::DataReceived {
                    peer: me.identity.as_remote(),
                    data: data.to_vec(),
                }),
                _ => trace!(peer = %peer, "payload lost on a dead link"),
            }
        }
        Ok(())
    }

    fn active_peers(&self) -> Vec<PeerId> {
        self.hub
            .lock()
            .members
            .get(&self.id)
            .map(|m| m.sessions.clone())
            .unwrap_or_default()
    }

    fn disconnect(&self) {
        let mut state = self.hub.lock();
        let Some(me) = state.members.get(&self.id) else {
            return;
        };
        let identity = me.identity.clone();
        let was_visible = me.visible();
        for other in state.neighbours(self.id) {
            if was_visible {
                state.announce_lost(other, &identity);
            }
            let had_session = state
                .members
                .get_mut(&other)
                .map(|m| {
                    let before = m.sessions.len();
                    m.sessions.retain(|p| *p != self.id);
                    m.sessions.len() != before
                })
                .unwrap_or(false);
            if had_session {
                state.emit_state(other, self.id, TransportState::NotConnected);
            }
        }
        // Dropping the member closes its event channel.
        state.members.remove(&self.id);
        debug!(peer = %identity, "left memory hub");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
