//! SessionManager: per-peer connection table, invitation arbitration and
//! liveness probes.
//!
//! # How a connection forms (for beginners)
//!
//! Both sides of a pair browse and advertise at the same time, so both see
//! each other at roughly the same moment.  If both invited, the transport
//! would end up with two half-open handshakes ("glare").  Each side therefore
//! advertises a [`DiscoveryToken`] and only the side with the smaller token
//! invites:
//!
//! ```text
//! A (token "a1")                          B (token "b2")
//! ──────────────                          ──────────────
//! found B, token "b2" → "a1" < "b2"       found A, token "a1" → wait
//! invite(B) ────────────────────────────► Invitation(A) → accept
//! StateChanged(B, connected)              StateChanged(A, connected)
//! ```
//!
//! # Liveness probes
//!
//! A transport can keep reporting a peer as connected after the link has
//! silently died.  When a peer is rediscovered while the transport lists it
//! as active but this manager does not hold it as `Connected` or
//! `Connecting`, a single `loopback-test` ping is sent.  A matching pong
//! confirms the connection; otherwise the peer is demoted to `NotConnected`
//! when the timer fires.  A demoted peer is probed again the next time it is
//! discovered, so a link that comes back is recovered.
//!
//! # Locking
//!
//! The whole table sits behind one `Mutex`.  The lock is never held while
//! calling the transport, an observer, or a data handler.  All decisions are
//! made under the lock and acted on after it is released.
//!
//! Every input (transport events and probe expiry) is fed through one pump
//! task per session, so updates for a given peer are delivered in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use peerkit_core::protocol::ProbeNonces;
use peerkit_core::{
    decode_event, encode_event, event_name, ConnectionRecord, ConnectionState, DiscoveryToken,
    PeerId, PeerIdentity, ProbeKind, ProbeMessage, ProtocolError, TransportState,
    DISCOVERY_INFO_KEY, LOOPBACK_EVENT,
};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::observers::{DataHandler, ObserverHandle, ObserverRegistry, PeerObserver};
use super::transport::{PeerTransport, SendMode, TransportError, TransportEvent};

/// Error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A targeted send had no reachable recipient.
    #[error("no reachable peer for this send")]
    TransportUnavailable,

    /// A liveness probe went unanswered.
    #[error("peer {peer} did not answer the liveness probe")]
    StaleConnection { peer: PeerId },

    /// A host announcement came from a peer that is not connected.
    #[error("host announcement from unreachable peer {peer}")]
    UnreachableHostAnnouncement { peer: PeerId },

    /// The transport reported a state code outside its enumeration.
    #[error("transport reported undefined state code {code} for peer {peer}")]
    InvariantViolation { peer: PeerId, code: u8 },

    #[error("session has already been started")]
    AlreadyStarted,

    #[error("a tokio runtime is required to run a session")]
    NoRuntime,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Timeouts applied by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub invite_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            invite_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Inputs serialized through the session pump.
#[derive(Debug)]
enum SessionInput {
    Transport(TransportEvent),
    ProbeExpired { peer: PeerId, nonce: u64 },
}

/// Owns the connection table for one session.
pub struct SessionManager {
    weak_self: Weak<SessionManager>,
    identity: PeerIdentity,
    token: DiscoveryToken,
    settings: SessionSettings,
    transport: Arc<dyn PeerTransport>,
    peers: Mutex<HashMap<PeerId, ConnectionRecord>>,
    peer_observers: ObserverRegistry<dyn PeerObserver>,
    data_handlers: ObserverRegistry<dyn DataHandler>,
    nonces: ProbeNonces,
    input_tx: mpsc::UnboundedSender<SessionInput>,
    input_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionInput>>>,
    runtime: Handle,
    halted: AtomicBool,
}

impl SessionManager {
    /// Creates a manager with a freshly generated discovery token.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoRuntime`] when called outside a tokio runtime.
    pub fn new(
        identity: PeerIdentity,
        settings: SessionSettings,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, SessionError> {
        Self::with_discovery_token(identity, DiscoveryToken::generate(), settings, transport)
    }

    /// Creates a manager that advertises `token`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoRuntime`] when called outside a tokio runtime.
    pub fn with_discovery_token(
        identity: PeerIdentity,
        token: DiscoveryToken,
        settings: SessionSettings,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, SessionError> {
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Ok(Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            identity,
            token,
            settings,
            transport,
            peers: Mutex::new(HashMap::new()),
            peer_observers: ObserverRegistry::new(),
            data_handlers: ObserverRegistry::new(),
            nonces: ProbeNonces::new(),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            runtime,
            halted: AtomicBool::new(false),
        }))
    }

    /// Advertises, starts browsing, and spawns the pump consuming `events`.
    ///
    /// The pump holds only a weak reference to the manager and ends when the
    /// manager is dropped, when `events` closes, or with
    /// [`SessionError::InvariantViolation`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyStarted`] on a second call.
    pub fn start(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<JoinHandle<Result<(), SessionError>>, SessionError> {
        let mut input_rx = self
            .input_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::AlreadyStarted)?;

        let discovery_info =
            HashMap::from([(DISCOVERY_INFO_KEY.to_string(), self.token.as_str().to_string())]);
        self.transport.advertise(&self.identity, discovery_info);
        self.transport.browse();
        info!(
            peer = %self.identity.id(),
            name = self.identity.display_name(),
            token = %self.token,
            "session started"
        );

        let weak = Arc::downgrade(self);
        Ok(self.runtime.spawn(async move {
            loop {
                let input = tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => SessionInput::Transport(event),
                        None => break,
                    },
                    Some(internal) = input_rx.recv() => internal,
                };
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.process(input)?;
            }
            debug!("session pump finished");
            Ok(())
        }))
    }

    fn process(&self, input: SessionInput) -> Result<(), SessionError> {
        match input {
            SessionInput::Transport(event) => self.handle_event(event),
            SessionInput::ProbeExpired { peer, nonce } => {
                self.expire_probe(peer, nonce);
                Ok(())
            }
        }
    }

    /// Applies one transport event to the connection table.
    ///
    /// The pump calls this for every event; it is public so callers driving
    /// the manager without a pump can feed events directly.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvariantViolation`] for an undefined state
    /// code.  The manager ignores every event after that.
    pub fn handle_event(&self, event: TransportEvent) -> Result<(), SessionError> {
        if self.is_halted() {
            debug!("session halted; dropping transport event");
            return Ok(());
        }
        match event {
            TransportEvent::PeerFound {
                peer,
                discovery_info,
            } => self.peer_found(&peer, &discovery_info),
            TransportEvent::PeerLost { peer } => self.peer_lost(&peer),
            TransportEvent::StateChanged { peer, code } => self.state_changed(&peer, code)?,
            TransportEvent::DataReceived { peer, data } => self.data_received(&peer, &data),
            TransportEvent::Invitation { peer, reply } => self.invitation_received(&peer, reply),
        }
        Ok(())
    }

    // ── Transport event handlers ──────────────────────────────────────────────

    fn peer_found(&self, peer: &PeerIdentity, discovery_info: &HashMap<String, String>) {
        if peer.id() == self.identity.id() {
            return;
        }
        let token = discovery_info
            .get(DISCOVERY_INFO_KEY)
            .map(|t| DiscoveryToken::from(t.as_str()));
        let active = self.is_transport_active(peer.id());

        let (identity, invite, probe) = {
            let mut peers = self.lock_peers();
            let record = peers
                .entry(peer.id())
                .or_insert_with(|| ConnectionRecord::new(peer.as_remote()));
            record.found = true;
            record.touch();
            if token.is_some() {
                record.discovery_token = token;
            }

            let probe = if record.needs_liveness_check(active) {
                let nonce = self.nonces.next();
                record.pending_probe = Some(nonce);
                Some(nonce)
            } else {
                None
            };

            let invite = record.should_invite(&self.token, active);
            if invite {
                record.invitation_pending = true;
            }
            (record.identity.clone(), invite, probe)
        };

        debug!(peer = %identity, "peer found");
        self.notify_peer_updated(&identity);
        if invite {
            self.spawn_invitation(identity.id());
        }
        if let Some(nonce) = probe {
            self.start_probe(identity.id(), nonce);
        }
    }

    fn peer_lost(&self, peer: &PeerIdentity) {
        let identity = {
            let mut peers = self.lock_peers();
            peers.get_mut(&peer.id()).map(|record| {
                record.found = false;
                record.transition_to(ConnectionState::Unknown);
                record.touch();
                record.identity.clone()
            })
        };

        if let Some(identity) = identity {
            debug!(peer = %identity, "peer lost");
            self.notify_peer_updated(&identity);
        }
    }

    fn state_changed(&self, peer: &PeerIdentity, code: u8) -> Result<(), SessionError> {
        let state = match TransportState::try_from(code) {
            Ok(state) => state,
            Err(()) => {
                self.halted.store(true, Ordering::SeqCst);
                let err = SessionError::InvariantViolation {
                    peer: peer.id(),
                    code,
                };
                error!(error = %err, "halting session");
                return Err(err);
            }
        };

        let active = state == TransportState::NotConnected && self.is_transport_active(peer.id());
        let (identity, invite) = {
            let mut peers = self.lock_peers();
            let record = peers
                .entry(peer.id())
                .or_insert_with(|| ConnectionRecord::new(peer.as_remote()));
            record.transition_to(state.into());
            record.touch();

            let mut invite = false;
            match state {
                TransportState::Connected => record.pending_probe = None,
                TransportState::NotConnected => {
                    invite = record.should_invite(&self.token, active);
                    if invite {
                        record.invitation_pending = true;
                    }
                }
                TransportState::Connecting => {}
            }
            (record.identity.clone(), invite)
        };

        info!(peer = %identity, state = %ConnectionState::from(state), "peer state changed");
        self.notify_peer_updated(&identity);
        if invite {
            self.spawn_invitation(identity.id());
        }
        Ok(())
    }

    fn data_received(&self, peer: &PeerIdentity, data: &[u8]) {
        let from = {
            let mut peers = self.lock_peers();
            match peers.get_mut(&peer.id()) {
                Some(record) => {
                    record.touch();
                    record.identity.clone()
                }
                None => peer.as_remote(),
            }
        };

        let name = match event_name(data) {
            Ok(name) => name.unwrap_or_default(),
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping undecodable payload");
                return;
            }
        };

        if name == LOOPBACK_EVENT {
            self.probe_received(&from, data);
            return;
        }

        if self.data_handlers.dispatch(&name, data, &from) == 0 {
            debug!(peer = %from, event = %name, "no handler for payload");
        }
    }

    fn invitation_received(&self, peer: &PeerIdentity, reply: oneshot::Sender<bool>) {
        let active = self.is_transport_active(peer.id());
        let accept = {
            let mut peers = self.lock_peers();
            let record = peers
                .entry(peer.id())
                .or_insert_with(|| ConnectionRecord::new(peer.as_remote()));
            record.touch();
            record.should_accept_invitation(active)
        };

        info!(peer = %peer, accept, "invitation received");
        if reply.send(accept).is_err() {
            debug!(peer = %peer, "inviter stopped waiting for our answer");
        }
    }

    // ── Invitations ───────────────────────────────────────────────────────────

    fn spawn_invitation(&self, peer: PeerId) {
        info!(peer = %peer, "inviting peer");
        let weak = self.weak_self.clone();
        let transport = Arc::clone(&self.transport);
        let timeout = self.settings.invite_timeout;
        self.runtime.spawn(async move {
            let result = transport.invite(peer, timeout).await;
            if let Some(manager) = weak.upgrade() {
                manager.invitation_finished(peer, result);
            }
        });
    }

    fn invitation_finished(&self, peer: PeerId, result: Result<bool, TransportError>) {
        if let Some(record) = self.lock_peers().get_mut(&peer) {
            record.invitation_pending = false;
        }
        match result {
            Ok(true) => debug!(peer = %peer, "invitation accepted"),
            Ok(false) => info!(peer = %peer, "invitation declined"),
            Err(e) => warn!(peer = %peer, error = %e, "invitation failed"),
        }
    }

    // ── Liveness probes ───────────────────────────────────────────────────────

    fn start_probe(&self, peer: PeerId, nonce: u64) {
        debug!(peer = %peer, nonce, "probing connection the transport reports as active");
        match encode_event(LOOPBACK_EVENT, &ProbeMessage::ping(nonce)) {
            Ok(ping) => {
                if let Err(e) = self.transport.send(&ping, &[peer], SendMode::Reliable) {
                    warn!(peer = %peer, error = %e, "failed to send liveness ping");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode liveness ping"),
        }

        let input_tx = self.input_tx.clone();
        let timeout = self.settings.probe_timeout;
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            // The receiver is gone once the session is dropped.
            let _ = input_tx.send(SessionInput::ProbeExpired { peer, nonce });
        });
    }

    fn probe_received(&self, from: &PeerIdentity, data: &[u8]) {
        let probe: ProbeMessage = match decode_event(data, LOOPBACK_EVENT) {
            Ok(probe) => probe,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed liveness probe");
                return;
            }
        };

        match probe.kind {
            ProbeKind::Ping => {
                if let Some(pong) = probe.reply() {
                    if let Err(e) =
                        self.send_event(LOOPBACK_EVENT, &pong, &[from.id()], SendMode::Reliable)
                    {
                        warn!(peer = %from, error = %e, "failed to answer liveness ping");
                    }
                }
            }
            ProbeKind::Pong => {
                let confirmed = {
                    let mut peers = self.lock_peers();
                    match peers.get_mut(&from.id()) {
                        Some(record) if record.pending_probe == Some(probe.nonce) => {
                            record.pending_probe = None;
                            record.transition_to(ConnectionState::Connected);
                            true
                        }
                        _ => false,
                    }
                };
                if confirmed {
                    info!(peer = %from, "liveness probe confirmed connection");
                    self.notify_peer_updated(from);
                } else {
                    debug!(peer = %from, nonce = probe.nonce, "ignoring unexpected pong");
                }
            }
        }
    }

    fn expire_probe(&self, peer: PeerId, nonce: u64) {
        let identity = {
            let mut peers = self.lock_peers();
            match peers.get_mut(&peer) {
                Some(record) if record.pending_probe == Some(nonce) => {
                    record.pending_probe = None;
                    record.transition_to(ConnectionState::NotConnected);
                    Some(record.identity.clone())
                }
                _ => None,
            }
        };

        if let Some(identity) = identity {
            let err = SessionError::StaleConnection { peer };
            warn!(error = %err, "demoting peer");
            self.notify_peer_updated(&identity);
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Confirmed peers the transport also reports as active, in the
    /// transport's order.  Self is never included.
    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        let active = self.transport.active_peers();
        let peers = self.lock_peers();
        active
            .iter()
            .filter_map(|id| peers.get(id))
            .filter(|record| record.state == ConnectionState::Connected)
            .map(|record| record.identity.clone())
            .collect()
    }

    /// Every record in the table, for diagnostics.
    pub fn all_peers(&self) -> Vec<ConnectionRecord> {
        self.lock_peers().values().cloned().collect()
    }

    pub fn connection_state(&self, peer: PeerId) -> Option<ConnectionState> {
        self.lock_peers().get(&peer).map(|record| record.state)
    }

    pub fn my_identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn discovery_token(&self) -> &DiscoveryToken {
        &self.token
    }

    /// `true` after an invariant violation stopped this session.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Sends `payload` to `to`, or to every connected peer when `to` is empty.
    ///
    /// A broadcast with nobody connected sends nothing and succeeds.
    ///
    /// # Errors
    ///
    /// - [`SessionError::TransportUnavailable`] if none of `to` is active.
    /// - [`SessionError::Transport`] if the transport rejects the payload.
    pub fn send(&self, payload: &[u8], to: &[PeerId], mode: SendMode) -> Result<(), SessionError> {
        let targets: Vec<PeerId> = if to.is_empty() {
            let connected: Vec<PeerId> = self.connected_peers().iter().map(|p| p.id()).collect();
            if connected.is_empty() {
                debug!("broadcast with no connected peers; nothing sent");
                return Ok(());
            }
            connected
        } else {
            let active = self.transport.active_peers();
            let reachable: Vec<PeerId> =
                to.iter().copied().filter(|id| active.contains(id)).collect();
            if reachable.is_empty() {
                let err = SessionError::TransportUnavailable;
                warn!(error = %err, recipients = to.len(), "send dropped");
                return Err(err);
            }
            reachable
        };

        self.transport.send(payload, &targets, mode).map_err(|e| {
            warn!(error = %e, "transport rejected send");
            SessionError::from(e)
        })
    }

    /// Wraps `payload` in an envelope tagged `event_name` and sends it.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send); also [`SessionError::Protocol`] if encoding fails.
    pub fn send_event<T: Serialize + ?Sized>(
        &self,
        event_name: &str,
        payload: &T,
        to: &[PeerId],
        mode: SendMode,
    ) -> Result<(), SessionError> {
        let bytes = encode_event(event_name, payload)?;
        self.send(&bytes, to, mode)
    }

    // ── Registration ──────────────────────────────────────────────────────────

    pub fn add_peer_observer(&self, observer: Weak<dyn PeerObserver>) -> ObserverHandle {
        self.peer_observers.register(observer)
    }

    pub fn remove_peer_observer(&self, handle: ObserverHandle) -> bool {
        self.peer_observers.unregister(handle)
    }

    /// Routes inbound payloads tagged `event_name` to `handler`.
    ///
    /// Register under [`peerkit_core::CATCH_ALL_EVENT`] to receive every payload.
    pub fn on_receive(
        &self,
        event_name: impl Into<String>,
        handler: Weak<dyn DataHandler>,
    ) -> ObserverHandle {
        self.data_handlers.register_topic(event_name, handler)
    }

    pub fn remove_data_handler(&self, handle: ObserverHandle) -> bool {
        self.data_handlers.unregister(handle)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn notify_peer_updated(&self, peer: &PeerIdentity) {
        for observer in self.peer_observers.snapshot() {
            observer.peer_updated(peer);
        }
    }

    fn is_transport_active(&self, peer: PeerId) -> bool {
        self.transport.active_peers().contains(&peer)
    }

    fn lock_peers(&self) -> MutexGuard<'_, HashMap<PeerId, ConnectionRecord>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("identity", &self.identity)
            .field("token", &self.token)
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
