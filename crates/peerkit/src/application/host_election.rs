//! HostElection: agrees on a single host among the connected peers.
//!
//! # Protocol (for beginners)
//!
//! There is no voting round.  A peer becomes host by calling
//! [`HostElection::make_me_host`], which records the moment it did so and
//! tells every connected peer with an `announceHost` message:
//!
//! ```text
//! {"eventName":"host-selector","kind":"announceHost","hostStartTime":1715000000.5}
//! ```
//!
//! A peer receiving the announcement accepts the sender as host.  If two
//! peers claim the role at the same time, each receives the other's claim
//! and the one that became host **earlier** keeps it:
//!
//! ```text
//! A (host since 50)                       B (host since 100)
//! ─────────────────                       ──────────────────
//! announceHost(50) ─────────────────────► 50 < 100 → demote, host = A
//! ◄──────────────────── announceHost(100)
//! 50 < 100 → keep role,
//! re-announce to B only ────────────────► host = A (unchanged)
//! ```
//!
//! Equal start times are settled by the lower [`PeerId`].
//!
//! When the host leaves the connected set every remaining peer falls back
//! to "no host".  Choosing a new one is left to the application.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use peerkit_core::{decode_event, epoch_seconds, HostEvent, PeerId, PeerIdentity, HOST_SELECTOR_EVENT};
use tracing::{debug, error, info, warn};

use super::observers::{DataHandler, HostObserver, ObserverHandle, ObserverRegistry, PeerObserver};
use super::session_manager::{SessionError, SessionManager};
use super::transport::SendMode;

/// The local view of who is host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRole {
    NoHost,
    IAmHost,
    PeerIsHost(PeerIdentity),
}

#[derive(Debug, Default)]
struct HostState {
    host: Option<PeerIdentity>,
    /// Set only while the local peer is host.
    host_start_time: Option<f64>,
    /// Peers that already received a targeted announcement since they joined.
    announced_to: HashSet<PeerId>,
}

/// Runs the host election on top of one [`SessionManager`].
pub struct HostElection {
    session: Arc<SessionManager>,
    state: Mutex<HostState>,
    host_observers: ObserverRegistry<dyn HostObserver>,
    peer_registration: ObserverHandle,
    data_registration: ObserverHandle,
}

impl HostElection {
    /// Creates the service and subscribes it to `session`'s peer updates and
    /// `host-selector` payloads.  Both subscriptions end when it is dropped.
    pub fn attach(session: Arc<SessionManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let as_observer: Weak<dyn PeerObserver> = weak.clone();
            let as_handler: Weak<dyn DataHandler> = weak.clone();
            let peer_registration = session.add_peer_observer(as_observer);
            let data_registration = session.on_receive(HOST_SELECTOR_EVENT, as_handler);
            Self {
                session,
                state: Mutex::new(HostState::default()),
                host_observers: ObserverRegistry::new(),
                peer_registration,
                data_registration,
            }
        })
    }

    /// Claims the host role now and announces it to every connected peer.
    pub fn make_me_host(&self) {
        self.make_me_host_at(epoch_seconds());
    }

    /// Claims the host role with an explicit start time (epoch seconds).
    pub fn make_me_host_at(&self, host_start_time: f64) {
        let me = self.session.my_identity().clone();
        let connected: Vec<PeerId> = self.session.connected_peers().iter().map(|p| p.id()).collect();

        let changed = {
            let mut state = self.lock_state();
            let changed = state.host.as_ref() != Some(&me);
            state.host = Some(me.clone());
            state.host_start_time = Some(host_start_time);
            state.announced_to = connected.iter().copied().collect();
            changed
        };

        info!(host_start_time, peers = connected.len(), "claiming host role");
        if let Err(e) = self.announce(host_start_time, &[]) {
            warn!(error = %e, "failed to broadcast host announcement");
        }
        if changed {
            self.notify_host_updated(Some(&me));
        }
    }

    pub fn host(&self) -> Option<PeerIdentity> {
        self.lock_state().host.clone()
    }

    pub fn role(&self) -> HostRole {
        match self.lock_state().host.clone() {
            None => HostRole::NoHost,
            Some(host) if host.id() == self.my_id() => HostRole::IAmHost,
            Some(host) => HostRole::PeerIsHost(host),
        }
    }

    pub fn is_host(&self) -> bool {
        self.role() == HostRole::IAmHost
    }

    /// Epoch seconds at which the local peer became host, while it is host.
    pub fn host_start_time(&self) -> Option<f64> {
        self.lock_state().host_start_time
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn add_host_observer(&self, observer: Weak<dyn HostObserver>) -> ObserverHandle {
        self.host_observers.register(observer)
    }

    pub fn remove_host_observer(&self, handle: ObserverHandle) -> bool {
        self.host_observers.unregister(handle)
    }

    // ── Protocol ──────────────────────────────────────────────────────────────

    fn host_announced(&self, data: &[u8], from: &PeerIdentity) {
        let event: HostEvent = match decode_event(data, HOST_SELECTOR_EVENT) {
            Ok(event) => event,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed host announcement");
                return;
            }
        };

        let reachable = self
            .session
            .connected_peers()
            .iter()
            .any(|p| p.id() == from.id());
        if !reachable {
            let err = SessionError::UnreachableHostAnnouncement { peer: from.id() };
            error!(error = %err, "rejecting host announcement");
            self.update_host(None);
            return;
        }

        let my_id = self.my_id();
        let keep_role = {
            let mut state = self.lock_state();
            let local_start = match &state.host {
                Some(host) if host.id() == my_id => state.host_start_time,
                _ => None,
            };
            match local_start {
                Some(mine) if local_wins(mine, my_id, event.host_start_time, from.id()) => {
                    state.announced_to.insert(from.id());
                    Some(mine)
                }
                _ => None,
            }
        };

        match keep_role {
            Some(mine) => {
                info!(
                    peer = %from,
                    mine,
                    theirs = event.host_start_time,
                    "rejecting later host claim; re-announcing"
                );
                if let Err(e) = self.announce(mine, &[from.id()]) {
                    warn!(peer = %from, error = %e, "failed to re-announce host");
                }
            }
            None => self.update_host(Some(from.clone())),
        }
    }

    fn connectivity_changed(&self, peer: &PeerIdentity) {
        let connected = self
            .session
            .connected_peers()
            .iter()
            .any(|p| p.id() == peer.id());
        let my_id = self.my_id();

        let mut announce = None;
        let mut host_lost = false;
        {
            let mut state = self.lock_state();
            if !connected {
                state.announced_to.remove(&peer.id());
            }
            match state.host.as_ref().map(PeerIdentity::id) {
                Some(host) if host == my_id => {
                    if connected && state.announced_to.insert(peer.id()) {
                        announce = state.host_start_time;
                    }
                }
                Some(host) if host == peer.id() && !connected => {
                    state.host = None;
                    state.host_start_time = None;
                    host_lost = true;
                }
                _ => {}
            }
        }

        if let Some(start) = announce {
            debug!(peer = %peer, "announcing host role to joining peer");
            if let Err(e) = self.announce(start, &[peer.id()]) {
                warn!(peer = %peer, error = %e, "failed to announce host to joining peer");
                self.lock_state().announced_to.remove(&peer.id());
            }
        }
        if host_lost {
            info!(peer = %peer, "host left the connected set");
            self.notify_host_updated(None);
        }
    }

    fn update_host(&self, new_host: Option<PeerIdentity>) {
        let my_id = self.my_id();
        let changed = {
            let mut state = self.lock_state();
            if state.host == new_host {
                false
            } else {
                if new_host.as_ref().map(PeerIdentity::id) != Some(my_id) {
                    state.host_start_time = None;
                    state.announced_to.clear();
                }
                state.host = new_host.clone();
                true
            }
        };

        if changed {
            match &new_host {
                Some(host) => info!(host = %host, "host changed"),
                None => info!("no host"),
            }
            self.notify_host_updated(new_host.as_ref());
        }
    }

    fn announce(&self, host_start_time: f64, to: &[PeerId]) -> Result<(), SessionError> {
        self.session.send_event(
            HOST_SELECTOR_EVENT,
            &HostEvent::announce(host_start_time),
            to,
            SendMode::Reliable,
        )
    }

    fn notify_host_updated(&self, host: Option<&PeerIdentity>) {
        for observer in self.host_observers.snapshot() {
            observer.host_updated(host);
        }
    }

    fn my_id(&self) -> PeerId {
        self.session.my_identity().id()
    }

    fn lock_state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The earlier claim wins; identical start times go to the lower id.
fn local_wins(mine: f64, my_id: PeerId, theirs: f64, their_id: PeerId) -> bool {
    mine < theirs || (mine == theirs && my_id < their_id)
}

impl PeerObserver for HostElection {
    fn peer_updated(&self, peer: &PeerIdentity) {
        self.connectivity_changed(peer);
    }
}

impl DataHandler for HostElection {
    fn data_received(&self, data: &[u8], from: &PeerIdentity) {
        self.host_announced(data, from);
    }
}

impl Drop for HostElection {
    fn drop(&mut self) {
        self.session.remove_peer_observer(self.peer_registration);
        self.session.remove_data_handler(self.data_registration);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
