//! Public façade over the encrypted session engine
//!
//! [`EncryptionService`] is the surface the transport and UI layers talk to.
//! It wires the validator and rate limiter in front of the session manager,
//! owns the callback registry and the periodic rekey task, and exposes the
//! fingerprint tables. All operations are synchronous and bounded; only the
//! rekey timer runs in the background.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::crypto::{fingerprint, IdentityVault};
use crate::error::{Error, Result};
use crate::keystore::SecureStore;
use crate::protocol::PeerId;
use crate::security::{MessageValidator, RateLimitConfig, RateLimiter, SizeLimits};
use crate::session::{RekeyPolicy, SessionManager, SessionPhase};

/// Fired for every registered observer when a peer authenticates; carries the
/// peer id and the fingerprint of its static key
pub type PeerAuthenticatedHandler = Arc<dyn Fn(&PeerId, &str) + Send + Sync>;

/// Fired when traffic is requested for a peer without an established session
/// or when a session must be rekeyed; single slot
pub type HandshakeRequiredHandler = Arc<dyn Fn(&PeerId) + Send + Sync>;

/// Service configuration aggregating the per-subsystem knobs
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub rate_limits: RateLimitConfig,
    pub size_limits: SizeLimits,
    pub rekey_policy: RekeyPolicy,
    /// Period of the background rekey check
    pub rekey_check_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitConfig::default(),
            size_limits: SizeLimits::default(),
            rekey_policy: RekeyPolicy::default(),
            rekey_check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Observers {
    peer_authenticated: Vec<PeerAuthenticatedHandler>,
    handshake_required: Option<HandshakeRequiredHandler>,
}

/// Encryption service coordinating identity, sessions, admission control and
/// caller notifications
pub struct EncryptionService {
    identity: Arc<IdentityVault>,
    sessions: Arc<SessionManager>,
    rate_limiter: RateLimiter,
    validator: MessageValidator,
    observers: Arc<RwLock<Observers>>,
    rekey_check_interval: Duration,
    rekey_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EncryptionService {
    /// Build a service bound to `local_peer_id`, loading (or creating) the
    /// device identity from `store`.
    pub fn new(
        store: Arc<dyn SecureStore>,
        local_peer_id: PeerId,
        config: ServiceConfig,
    ) -> Result<Self> {
        let identity = Arc::new(IdentityVault::load_or_create(store)?);
        let sessions = Arc::new(SessionManager::new(
            local_peer_id,
            identity.clone(),
            config.rekey_policy,
        ));

        let observers = Arc::new(RwLock::new(Observers::default()));
        let observer_ref = observers.clone();
        sessions.set_established_handler(Arc::new(move |peer, remote_static| {
            let fp = fingerprint(remote_static);
            let handlers: Vec<PeerAuthenticatedHandler> =
                observer_ref.read().peer_authenticated.clone();
            for handler in handlers {
                handler(peer, &fp);
            }
        }));

        Ok(Self {
            identity,
            sessions,
            rate_limiter: RateLimiter::new(config.rate_limits),
            validator: MessageValidator::new(config.size_limits),
            observers,
            rekey_check_interval: config.rekey_check_interval,
            rekey_task: Mutex::new(None),
        })
    }

    /// The device identity vault (fingerprint, signing, wipe)
    pub fn identity(&self) -> &Arc<IdentityVault> {
        &self.identity
    }

    /// Our own static-key fingerprint
    pub fn fingerprint(&self) -> Result<String> {
        self.identity.fingerprint()
    }

    /// Register an authentication observer; all registered handlers fire on
    /// every successful establishment.
    pub fn register_peer_authenticated_handler(&self, handler: PeerAuthenticatedHandler) {
        self.observers.write().peer_authenticated.push(handler);
    }

    /// Set the single handshake-required handler, replacing any previous one
    pub fn set_handshake_required_handler(&self, handler: HandshakeRequiredHandler) {
        self.observers.write().handshake_required = Some(handler);
    }

    fn notify_handshake_required(&self, peer: &PeerId) {
        let handler = self.observers.read().handshake_required.clone();
        if let Some(handler) = handler {
            handler(peer);
        }
    }

    /// Encrypt `data` for `peer`.
    ///
    /// Fails with [`Error::HandshakeRequired`] (after signalling the
    /// handshake-required observer) when no established session exists.
    pub fn encrypt(&self, data: &[u8], peer: &PeerId) -> Result<Vec<u8>> {
        self.validator.validate_transport_message(data)?;
        if !self.rate_limiter.allow_message(peer) {
            return Err(Error::RateLimitExceeded(peer.to_string()));
        }
        if !self.sessions.has_established_session(peer) {
            self.notify_handshake_required(peer);
            return Err(Error::HandshakeRequired(peer.to_string()));
        }
        self.sessions.encrypt(peer, data)
    }

    /// Decrypt `data` from `peer`
    pub fn decrypt(&self, data: &[u8], peer: &PeerId) -> Result<Vec<u8>> {
        self.validator.validate_transport_message(data)?;
        if !self.rate_limiter.allow_message(peer) {
            return Err(Error::RateLimitExceeded(peer.to_string()));
        }
        self.sessions.decrypt(peer, data)
    }

    /// Begin a handshake with `peer`, returning msg1 for transmission
    pub fn initiate_handshake(&self, peer: &PeerId) -> Result<Vec<u8>> {
        self.validator.validate_peer_id(peer)?;
        if !self.rate_limiter.allow_handshake(peer) {
            return Err(Error::RateLimitExceeded(peer.to_string()));
        }
        self.sessions.initiate_handshake(peer)
    }

    /// Feed an inbound handshake message, returning the reply to transmit if
    /// one is due
    pub fn process_handshake_message(
        &self,
        peer: &PeerId,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.validator.validate_peer_id(peer)?;
        self.validator.validate_handshake_message(message)?;
        if !self.rate_limiter.allow_handshake(peer) {
            return Err(Error::RateLimitExceeded(peer.to_string()));
        }
        self.sessions.process_handshake(peer, message)
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.has_session(peer)
    }

    pub fn has_established_session(&self, peer: &PeerId) -> bool {
        self.sessions.has_established_session(peer)
    }

    pub fn session_phase(&self, peer: &PeerId) -> Option<SessionPhase> {
        self.sessions.session_phase(peer)
    }

    /// The peer's authenticated static key, once established
    pub fn remote_static_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.sessions.remote_static_key(peer)
    }

    /// Fingerprint of a peer's authenticated static key
    pub fn peer_fingerprint(&self, peer: &PeerId) -> Option<String> {
        self.sessions.fingerprint_for_peer(peer)
    }

    /// Reverse fingerprint lookup
    pub fn peer_for_fingerprint(&self, fp: &str) -> Option<PeerId> {
        self.sessions.peer_for_fingerprint(fp)
    }

    /// Evict a peer's session and drop its fingerprint mapping
    pub fn remove_peer(&self, peer: &PeerId) {
        self.sessions.remove_session(peer);
        self.rate_limiter.remove_peer(peer);
    }

    /// Panic response: drop every session, fingerprint mapping and rate
    /// bucket. The identity vault is untouched; wiping it is the separate
    /// [`EncryptionService::clear_persistent_identity`].
    pub fn clear_ephemeral_for_panic(&self) {
        self.sessions.remove_all_sessions();
        self.rate_limiter.reset_all();
        info!("Ephemeral state cleared");
    }

    /// Wipe the persistent identity keys and stop the rekey task
    pub fn clear_persistent_identity(&self) {
        self.stop_rekey_timer();
        self.identity.wipe();
    }

    /// Spawn the periodic rekey check on the current tokio runtime.
    ///
    /// The task holds only a weak reference; dropping the service stops it.
    pub fn start_rekey_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.rekey_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick of a tokio interval fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.rekey_tick();
            }
        });

        let mut task = self.rekey_task.lock();
        if let Some(old) = task.replace(handle) {
            old.abort();
        }
    }

    /// Stop the background rekey task if running
    pub fn stop_rekey_timer(&self) {
        if let Some(task) = self.rekey_task.lock().take() {
            task.abort();
        }
    }

    /// One pass of the rekey check: every session past its forward-secrecy
    /// budget is reset to a fresh Initiator handshake and the transport is
    /// signalled to deliver a new msg1.
    pub fn rekey_tick(&self) {
        for peer in self.sessions.sessions_needing_rekey() {
            match self.sessions.initiate_rekey(&peer) {
                Ok(_msg1) => {
                    info!(peer = %peer, "Session due for rekey");
                    self.notify_handshake_required(&peer);
                }
                Err(e) => warn!(peer = %peer, error = %e, "Rekey initiation failed"),
            }
        }
    }

    /// Validator counters for diagnostics
    pub fn validation_violations(&self) -> u64 {
        self.validator.violation_count()
    }

    /// Rate-limiter counters for diagnostics
    pub fn rate_limit_violations(&self) -> u64 {
        self.rate_limiter.violation_count()
    }
}

impl Drop for EncryptionService {
    fn drop(&mut self) {
        if let Some(task) = self.rekey_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    fn service(id: &str) -> EncryptionService {
        EncryptionService::new(
            Arc::new(MemoryKeyStore::new()),
            PeerId::new(id),
            ServiceConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_encrypt_without_session_signals_handshake_required() {
        let a = service("aaaa1111");
        let signalled = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = signalled.clone();
        a.set_handshake_required_handler(Arc::new(move |peer| {
            sink.lock().push(peer.clone());
        }));

        let err = a.encrypt(b"hello", &PeerId::new("bbbb2222")).unwrap_err();
        assert!(matches!(err, Error::HandshakeRequired(_)));
        assert_eq!(signalled.lock().as_slice(), &[PeerId::new("bbbb2222")]);
    }

    #[test]
    fn test_invalid_peer_id_rejected_before_rate_limiting() {
        let a = service("aaaa1111");
        assert!(matches!(
            a.initiate_handshake(&PeerId::new("")),
            Err(Error::InvalidPeerId(_))
        ));
        assert_eq!(a.rate_limit_violations(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let a = service("aaaa1111");
        let peer = PeerId::new("bbbb2222");
        let oversized = vec![0u8; SizeLimits::default().max_transport_message + 1];
        assert!(matches!(
            a.encrypt(&oversized, &peer),
            Err(Error::MessageTooLarge { .. })
        ));

        let oversized_handshake = vec![0u8; SizeLimits::default().max_handshake_message + 1];
        assert!(matches!(
            a.process_handshake_message(&peer, &oversized_handshake),
            Err(Error::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_handshake_rate_limit_enforced() {
        let a = service("aaaa1111");
        let peer = PeerId::new("bbbb2222");

        let burst = RateLimitConfig::default().handshake_burst;
        for _ in 0..burst {
            // Each attempt replaces the previous in-flight handshake
            a.initiate_handshake(&peer).unwrap();
        }
        assert!(matches!(
            a.initiate_handshake(&peer),
            Err(Error::RateLimitExceeded(_))
        ));
    }

    #[test]
    fn test_identity_is_stable_across_restarts() {
        let store = Arc::new(MemoryKeyStore::new());
        let first = EncryptionService::new(
            store.clone(),
            PeerId::new("aaaa1111"),
            ServiceConfig::default(),
        )
        .unwrap();
        let fp = first.fingerprint().unwrap();
        drop(first);

        let second =
            EncryptionService::new(store, PeerId::new("aaaa1111"), ServiceConfig::default())
                .unwrap();
        assert_eq!(second.fingerprint().unwrap(), fp);
    }
}
