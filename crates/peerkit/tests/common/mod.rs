//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use peerkit::infrastructure::storage::config::AppConfig;
use peerkit::infrastructure::transport::memory::{MemoryHub, MemoryTransport};
use peerkit::{
    HostObserver, NetworkContext, PeerObserver, SessionManager, SessionSettings,
};
use peerkit_core::{DiscoveryToken, PeerId, PeerIdentity};

pub const DEADLINE: Duration = Duration::from_secs(5);

/// Short timeouts so failure paths resolve quickly.
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        invite_timeout: Duration::from_millis(300),
        probe_timeout: Duration::from_millis(100),
    }
}

/// Polls `done` until it holds or [`DEADLINE`] passes.
pub async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while !done() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Joins `hub` as `name` with a fixed discovery token and starts the pump.
pub fn start_manager(hub: &MemoryHub, name: &str, token: &str) -> Arc<SessionManager> {
    start_manager_with_transport(hub, name, token).0
}

/// Like [`start_manager`], also returning the transport so a test can
/// disconnect the peer.
pub fn start_manager_with_transport(
    hub: &MemoryHub,
    name: &str,
    token: &str,
) -> (Arc<SessionManager>, Arc<MemoryTransport>) {
    let identity = PeerIdentity::local(name);
    let (transport, events) = hub.join(&identity, "test-service");
    let manager = SessionManager::with_discovery_token(
        identity,
        DiscoveryToken::from(token),
        fast_settings(),
        transport.clone(),
    )
    .expect("create manager");
    manager.start(events).expect("start manager");
    (manager, transport)
}

/// Starts a context on `hub` with fast timeouts.
pub fn start_context(hub: &MemoryHub) -> Arc<NetworkContext> {
    let mut config = AppConfig::default();
    config.session.service_name = "test-service".to_string();
    config.session.invite_timeout_ms = 300;
    config.session.probe_timeout_ms = 100;
    NetworkContext::start(config, None, Arc::new(hub.clone())).expect("start context")
}

pub fn connected_ids(manager: &SessionManager) -> Vec<PeerId> {
    manager.connected_peers().iter().map(|p| p.id()).collect()
}

/// Records every peer and host notification it receives.
#[derive(Default)]
pub struct Recorder {
    pub peers: Mutex<Vec<PeerId>>,
    pub hosts: Mutex<Vec<Option<PeerId>>>,
}

impl Recorder {
    pub fn peer_updates_for(&self, id: PeerId) -> usize {
        self.peers.lock().unwrap().iter().filter(|p| **p == id).count()
    }

    pub fn host_updates(&self) -> Vec<Option<PeerId>> {
        self.hosts.lock().unwrap().clone()
    }
}

impl PeerObserver for Recorder {
    fn peer_updated(&self, peer: &PeerIdentity) {
        self.peers.lock().unwrap().push(peer.id());
    }
}

impl HostObserver for Recorder {
    fn host_updated(&self, host: Option<&PeerIdentity>) {
        self.hosts.lock().unwrap().push(host.map(|h| h.id()));
    }
}

pub fn as_peer_observer(recorder: &Arc<Recorder>) -> Arc<dyn PeerObserver> {
    recorder.clone()
}

pub fn as_host_observer(recorder: &Arc<Recorder>) -> Arc<dyn HostObserver> {
    recorder.clone()
}
