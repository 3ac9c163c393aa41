//! NetworkContext: the process-scoped access point to the current session.
//!
//! A session is one [`SessionManager`] with its [`HostElection`] and
//! transport.  The context owns exactly one session at a time and replaces
//! it wholesale on [`NetworkContext::reset_session`]:
//!
//! ```text
//! reset_session()
//!  ├─ abort the old pump, stop advertising and browsing, disconnect
//!  ├─ drop the old manager and election (in-flight invitations and probes
//!  │  lose their weak reference and are abandoned)
//!  ├─ mint a new PeerId and discovery token, persist the identity
//!  └─ build and start the new session
//! ```
//!
//! Application observers and data handlers register with the context, not
//! with a session, so they survive resets.  The context forwards to them
//! from whichever session is current.
//!
//! A watchdog task awaits each session's pump.  If the pump ends with
//! [`SessionError::InvariantViolation`] the context resets itself.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use peerkit_core::{
    event_name, ConnectionRecord, ConnectionState, PeerId, PeerIdentity, CATCH_ALL_EVENT,
};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::application::host_election::HostElection;
use crate::application::observers::{
    DataHandler, HostObserver, ObserverHandle, ObserverRegistry, PeerObserver,
};
use crate::application::session_manager::{SessionError, SessionManager};
use crate::application::transport::{PeerTransport, SendMode, TransportFactory};
use crate::infrastructure::storage::config::{save_config_to, AppConfig, ConfigError, IdentityEntry};

const DEFAULT_DISPLAY_NAME: &str = "peer";

/// Error type for context lifecycle operations.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct ActiveSession {
    manager: Arc<SessionManager>,
    election: Arc<HostElection>,
    transport: Arc<dyn PeerTransport>,
    pump: AbortHandle,
}

impl ActiveSession {
    /// Withdraws from discovery, then closes every transport session.
    fn tear_down(&self) {
        self.pump.abort();
        self.transport.stop();
        self.transport.disconnect();
    }
}

/// Owns the current session and the application-level observer lists.
pub struct NetworkContext {
    weak_self: Weak<NetworkContext>,
    runtime: Handle,
    config: Mutex<AppConfig>,
    config_path: Option<PathBuf>,
    factory: Arc<dyn TransportFactory>,
    session: RwLock<Option<ActiveSession>>,
    generation: AtomicU64,
    peer_observers: ObserverRegistry<dyn PeerObserver>,
    host_observers: ObserverRegistry<dyn HostObserver>,
    data_handlers: ObserverRegistry<dyn DataHandler>,
}

impl NetworkContext {
    /// Restores (or creates and persists) the self identity and starts the
    /// first session.
    ///
    /// With `config_path` set, the identity is written back to that file
    /// whenever it changes; without it nothing is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Session`] with [`SessionError::NoRuntime`]
    /// outside a tokio runtime, and [`ContextError::Config`] if the identity
    /// cannot be saved.
    pub fn start(
        config: AppConfig,
        config_path: Option<PathBuf>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>, ContextError> {
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let stored = config.identity.as_ref().map(IdentityEntry::to_identity);

        let context = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            runtime,
            config: Mutex::new(config),
            config_path,
            factory,
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            peer_observers: ObserverRegistry::new(),
            host_observers: ObserverRegistry::new(),
            data_handlers: ObserverRegistry::new(),
        });

        let identity = match stored {
            Some(identity) => identity,
            None => {
                let identity = PeerIdentity::local(DEFAULT_DISPLAY_NAME);
                context.persist_identity(&identity)?;
                identity
            }
        };
        context.install_session(identity)?;
        Ok(context)
    }

    /// Tears down the current session and starts a fresh one under a new
    /// identity.  Returns the new identity.
    ///
    /// The display name is kept unless `new_display_name` is given.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if the identity cannot be persisted or the new
    /// session cannot start.  The context has no session in that case.
    pub fn reset_session(
        &self,
        new_display_name: Option<String>,
    ) -> Result<PeerIdentity, ContextError> {
        let had_host = self.host().is_some();
        if let Some(old) = self.take_session() {
            info!(peer = %old.manager.my_identity(), "resetting session");
            old.tear_down();
        }
        if had_host {
            self.notify_host(None);
        }

        let display_name = new_display_name.unwrap_or_else(|| {
            self.lock_config()
                .identity
                .as_ref()
                .map(|entry| entry.display_name.clone())
                .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string())
        });
        let identity = PeerIdentity::local(display_name);
        self.persist_identity(&identity)?;
        self.install_session(identity.clone())?;
        Ok(identity)
    }

    /// Disconnects and drops the current session.
    pub fn shutdown(&self) {
        if let Some(old) = self.take_session() {
            info!(peer = %old.manager.my_identity(), "shutting down session");
            old.tear_down();
        }
    }

    fn install_session(&self, identity: PeerIdentity) -> Result<(), ContextError> {
        let (settings, service_name) = {
            let config = self.lock_config();
            (config.session.settings(), config.session.service_name.clone())
        };

        let (transport, events) = self.factory.create(&identity, &service_name);
        let manager = SessionManager::new(identity, settings, Arc::clone(&transport))?;
        let election = HostElection::attach(Arc::clone(&manager));

        let as_peer_observer: Weak<dyn PeerObserver> = self.weak_self.clone();
        let as_handler: Weak<dyn DataHandler> = self.weak_self.clone();
        let as_host_observer: Weak<dyn HostObserver> = self.weak_self.clone();
        manager.add_peer_observer(as_peer_observer);
        manager.on_receive(CATCH_ALL_EVENT, as_handler);
        election.add_host_observer(as_host_observer);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pump = manager.start(events)?;

        // Stored before the watchdog exists so a reset it triggers always
        // replaces this session rather than racing with it.
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(ActiveSession {
            manager,
            election,
            transport,
            pump: pump.abort_handle(),
        });
        self.spawn_watchdog(pump, generation);
        Ok(())
    }

    fn spawn_watchdog(&self, pump: JoinHandle<Result<(), SessionError>>, generation: u64) {
        let weak = self.weak_self.clone();
        self.runtime.spawn(async move {
            match pump.await {
                Ok(Err(err @ SessionError::InvariantViolation { .. })) => {
                    error!(error = %err, generation, "session pump stopped");
                    let Some(context) = weak.upgrade() else {
                        return;
                    };
                    if context.generation() != generation {
                        return;
                    }
                    if let Err(e) = context.reset_session(None) {
                        error!(error = %e, "automatic session reset failed");
                    }
                }
                Ok(Err(err)) => warn!(error = %err, generation, "session pump failed"),
                Ok(Ok(())) => debug!(generation, "session pump ended"),
                Err(e) if e.is_cancelled() => debug!(generation, "session pump aborted"),
                Err(e) => error!(error = %e, generation, "session pump panicked"),
            }
        });
    }

    fn persist_identity(&self, identity: &PeerIdentity) -> Result<(), ConfigError> {
        let mut config = self.lock_config();
        config.identity = Some(IdentityEntry::from_identity(identity));
        if let Some(path) = &self.config_path {
            save_config_to(&config, path)?;
            debug!(path = %path.display(), "stored identity");
        }
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Counts sessions started by this context, including the current one.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<Arc<SessionManager>> {
        self.read_session(|s| Arc::clone(&s.manager))
    }

    pub fn election(&self) -> Option<Arc<HostElection>> {
        self.read_session(|s| Arc::clone(&s.election))
    }

    /// The current self identity; also available between sessions once a
    /// session has been started.
    pub fn my_identity(&self) -> Option<PeerIdentity> {
        self.session()
            .map(|m| m.my_identity().clone())
            .or_else(|| self.lock_config().identity.as_ref().map(IdentityEntry::to_identity))
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.session()
            .map(|m| m.connected_peers())
            .unwrap_or_default()
    }

    pub fn all_peers(&self) -> Vec<ConnectionRecord> {
        self.session().map(|m| m.all_peers()).unwrap_or_default()
    }

    pub fn connection_state(&self, peer: PeerId) -> Option<ConnectionState> {
        self.session().and_then(|m| m.connection_state(peer))
    }

    pub fn host(&self) -> Option<PeerIdentity> {
        self.election().and_then(|e| e.host())
    }

    pub fn is_host(&self) -> bool {
        self.election().is_some_and(|e| e.is_host())
    }

    pub fn make_me_host(&self) {
        match self.election() {
            Some(election) => election.make_me_host(),
            None => warn!("make_me_host called without a session"),
        }
    }

    /// Sends a tagged payload through the current session.
    ///
    /// # Errors
    ///
    /// [`SessionError::TransportUnavailable`] when there is no session, plus
    /// everything [`SessionManager::send_event`] returns.
    pub fn send_event<T: Serialize + ?Sized>(
        &self,
        event_name: &str,
        payload: &T,
        to: &[PeerId],
        mode: SendMode,
    ) -> Result<(), SessionError> {
        self.session()
            .ok_or(SessionError::TransportUnavailable)?
            .send_event(event_name, payload, to, mode)
    }

    // ── Registration ──────────────────────────────────────────────────────────

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

    pub fn add_peer_observer(&self, observer: Weak<dyn PeerObserver>) -> ObserverHandle {
        self.peer_observers.register(observer)
    }

    pub fn remove_peer_observer(&self, handle: ObserverHandle) -> bool {
        self.peer_observers.unregister(handle)
    }

    pub fn add_host_observer(&self, observer: Weak<dyn HostObserver>) -> ObserverHandle {
        self.host_observers.register(observer)
    }

    pub fn remove_host_observer(&self, handle: ObserverHandle) -> bool {
        self.host_observers.unregister(handle)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn read_session<R>(&self, f: impl FnOnce(&ActiveSession) -> R) -> Option<R> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(f)
    }

    fn take_session(&self) -> Option<ActiveSession> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn notify_host(&self, host: Option<&PeerIdentity>) {
        for observer in self.host_observers.snapshot() {
            observer.host_updated(host);
        }
    }

    fn lock_config(&self) -> MutexGuard<'_, AppConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerObserver for NetworkContext {
    fn peer_updated(&self, peer: &PeerIdentity) {
        for observer in self.peer_observers.snapshot() {
            observer.peer_updated(peer);
        }
    }
}

impl HostObserver for NetworkContext {
    fn host_updated(&self, host: Option<&PeerIdentity>) {
        self.notify_host(host);
    }
}

impl DataHandler for NetworkContext {
    fn data_received(&self, data: &[u8], from: &PeerIdentity) {
        // The session already dropped payloads without a readable tag.
        let name = event_name(data).ok().flatten().unwrap_or_default();
        self.data_handlers.dispatch(&name, data, from);
    }
}

impl Drop for NetworkContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::transport::{MockPeerTransport, TransportEvent};
    use crate::infrastructure::transport::memory::MemoryHub;
    use mockall::Sequence;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn start_context(hub: &MemoryHub, config: AppConfig, path: Option<PathBuf>) -> Arc<NetworkContext> {
        NetworkContext::start(config, path, Arc::new(hub.clone())).expect("start context")
    }

    #[tokio::test]
    async fn test_start_uses_stored_identity() {
        // Arrange
        let stored = PeerIdentity::local("alice");
        let config = AppConfig {
            identity: Some(IdentityEntry::from_identity(&stored)),
            ..AppConfig::default()
        };

        // Act
        let context = start_context(&MemoryHub::new(), config, None);

        // Assert
        let me = context.my_identity().unwrap();
        assert_eq!(me, stored);
        assert_eq!(me.display_name(), "alice");
        assert_eq!(context.generation(), 1);
    }

    #[tokio::test]
    async fn test_start_without_identity_persists_a_new_one() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("peerkit_ctx_{}", Uuid::new_v4()));
        let path = dir.join("config.toml");

        // Act
        let context = start_context(&MemoryHub::new(), AppConfig::default(), Some(path.clone()));

        // Assert
        let saved = crate::infrastructure::storage::config::load_config_from(&path).unwrap();
        let entry = saved.identity.expect("identity written on first start");
        assert_eq!(entry.peer_id, context.my_identity().unwrap().id().as_uuid());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_reset_session_mints_new_identity_and_keeps_name() {
        // Arrange
        let config = AppConfig {
            identity: Some(IdentityEntry::from_identity(&PeerIdentity::local("bob"))),
            ..AppConfig::default()
        };
        let context = start_context(&MemoryHub::new(), config, None);
        let before = context.my_identity().unwrap();
        let old_token = context.session().unwrap().discovery_token().clone();

        // Act
        let after = context.reset_session(None).unwrap();

        // Assert
        assert_ne!(after.id(), before.id());
        assert_eq!(after.display_name(), "bob");
        assert_eq!(context.my_identity().unwrap(), after);
        assert_ne!(context.session().unwrap().discovery_token(), &old_token);
        assert_eq!(context.generation(), 2);
    }

    #[tokio::test]
    async fn test_reset_session_applies_new_display_name() {
        let context = start_context(&MemoryHub::new(), AppConfig::default(), None);

        let after = context.reset_session(Some("carol".to_string())).unwrap();

        assert_eq!(after.display_name(), "carol");
    }

    #[tokio::test]
    async fn test_invariant_violation_triggers_reset() {
        // Arrange
        let hub = MemoryHub::new();
        let context = start_context(&hub, AppConfig::default(), None);
        let before = context.my_identity().unwrap();
        let stranger = PeerIdentity::local("stranger");

        // Act
        hub.inject_state(before.id(), &stranger, 42);
        for _ in 0..50 {
            if context.generation() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Assert
        assert_eq!(context.generation(), 2);
        assert_ne!(context.my_identity().unwrap().id(), before.id());
    }

    /// Hands out mocks that require `stop` before `disconnect`.
    struct OrderedTeardownFactory;

    impl TransportFactory for OrderedTeardownFactory {
        fn create(
            &self,
            _identity: &PeerIdentity,
            _service_name: &str,
        ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
            let mut transport = MockPeerTransport::new();
            transport.expect_advertise().return_const(());
            transport.expect_browse().return_const(());
            transport.expect_active_peers().returning(Vec::new);
            let mut seq = Sequence::new();
            transport
                .expect_stop()
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
            transport
                .expect_disconnect()
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
            let (_events_tx, events) = mpsc::unbounded_channel();
            (Arc::new(transport), events)
        }
    }

    #[tokio::test]
    async fn test_teardown_stops_discovery_before_disconnecting() {
        // Arrange
        let context =
            NetworkContext::start(AppConfig::default(), None, Arc::new(OrderedTeardownFactory))
                .expect("start context");

        // Act: one reset and one shutdown each tear down a session
        context.reset_session(None).expect("reset");
        context.shutdown();

        // Assert
        assert!(context.session().is_none());
        assert_eq!(context.generation(), 2);
    }

    #[tokio::test]
    async fn test_context_without_session_reports_empty_state() {
        let context = start_context(&MemoryHub::new(), AppConfig::default(), None);
        context.shutdown();

        assert!(context.connected_peers().is_empty());
        assert!(context.host().is_none());
        assert!(!context.is_host());
        assert!(matches!(
            context.send_event("chat", &serde_json::json!({}), &[], SendMode::Reliable),
            Err(SessionError::TransportUnavailable)
        ));
    }
}
