//! Session management for the encrypted mesh
//!
//! This module owns the peer-to-session map and everything that mutates it:
//! - Handshake initiation and inbound handshake routing
//! - Simultaneous-handshake tie-breaking
//! - Transport encrypt/decrypt once a session is established
//! - Periodic rekey bookkeeping and the fingerprint index

pub mod noise;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::crypto::{fingerprint, IdentityVault};
use crate::error::{Error, Result};
use crate::protocol::PeerId;

pub use noise::{
    NoiseRole, NoiseSession, RekeyPolicy, SessionPhase, NOISE_MSG1_LEN, NOISE_MSG2_LEN,
    NOISE_MSG3_LEN, NOISE_PATTERN, NOISE_TAG_LEN,
};

/// Invoked on every successful establishment with the peer and its static key
pub type SessionEstablishedHandler = Arc<dyn Fn(&PeerId, &[u8; 32]) + Send + Sync>;

/// Bidirectional PeerId <-> Fingerprint index over established peers
#[derive(Default)]
struct FingerprintIndex {
    by_peer: HashMap<PeerId, String>,
    by_fingerprint: HashMap<String, PeerId>,
}

impl FingerprintIndex {
    /// Insert a binding, evicting any stale entries so the mapping stays a
    /// bijection.
    fn insert(&mut self, peer: &PeerId, fp: String) {
        if let Some(old_fp) = self.by_peer.remove(peer) {
            self.by_fingerprint.remove(&old_fp);
        }
        if let Some(old_peer) = self.by_fingerprint.remove(&fp) {
            self.by_peer.remove(&old_peer);
        }
        self.by_peer.insert(peer.clone(), fp.clone());
        self.by_fingerprint.insert(fp, peer.clone());
    }

    fn remove_peer(&mut self, peer: &PeerId) {
        if let Some(fp) = self.by_peer.remove(peer) {
            self.by_fingerprint.remove(&fp);
        }
    }

    fn clear(&mut self) {
        self.by_peer.clear();
        self.by_fingerprint.clear();
    }
}

/// What to do with an inbound handshake message
enum HandshakeAction {
    /// Start (or restart) a Responder session for this msg1
    Respond,
    /// Advance the existing session with this message
    Advance,
    /// Drop the message; we won the simultaneous-handshake tie-break
    Ignore,
}

/// Coordinator for all per-peer Noise sessions.
///
/// The session map sits behind one reader-writer lock with short critical
/// sections; the establishment handler runs outside the lock so handlers may
/// call back into the manager.
pub struct SessionManager {
    local_peer_id: PeerId,
    identity: Arc<IdentityVault>,
    rekey_policy: RekeyPolicy,
    sessions: RwLock<HashMap<PeerId, NoiseSession>>,
    index: RwLock<FingerprintIndex>,
    on_established: RwLock<Option<SessionEstablishedHandler>>,
}

impl SessionManager {
    pub fn new(
        local_peer_id: PeerId,
        identity: Arc<IdentityVault>,
        rekey_policy: RekeyPolicy,
    ) -> Self {
        Self {
            local_peer_id,
            identity,
            rekey_policy,
            sessions: RwLock::new(HashMap::new()),
            index: RwLock::new(FingerprintIndex::default()),
            on_established: RwLock::new(None),
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Register the handler fired once per successful establishment
    pub fn set_established_handler(&self, handler: SessionEstablishedHandler) {
        *self.on_established.write() = Some(handler);
    }

    /// Start a handshake with `peer` as Initiator, returning msg1.
    ///
    /// An established session is only replaced when its rekey budget is
    /// exhausted; a mid-handshake session is replaced by the fresh attempt.
    pub fn initiate_handshake(&self, peer: &PeerId) -> Result<Vec<u8>> {
        let mut sessions = self.sessions.write();

        let expected = match sessions.get(peer) {
            Some(existing) if existing.is_established() => {
                if !existing.needs_rekey(&self.rekey_policy) {
                    return Err(Error::AlreadyEstablished(peer.to_string()));
                }
                existing.remote_static_key()
            }
            // Carry an in-flight rekey pin into the fresh attempt
            Some(existing) => existing
                .remote_static_key()
                .or_else(|| existing.expected_remote_static()),
            None => None,
        };

        let keypair = self.identity.noise_keypair()?;
        let mut session = NoiseSession::new_initiator(&keypair)?;
        if let Some(key) = expected {
            session.expect_remote_static(key);
        }
        let msg1 = session.write_handshake_message()?;
        sessions.insert(peer.clone(), session);

        info!(peer = %peer, "Handshake initiated");
        Ok(msg1)
    }

    /// Route an inbound handshake message, returning the reply to transmit
    /// (None when the handshake completed on this side or the message was
    /// dropped by the tie-break).
    pub fn process_handshake(&self, peer: &PeerId, message: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut established: Option<[u8; 32]> = None;

        let reply = {
            let mut sessions = self.sessions.write();
            let is_msg1 = message.len() == NOISE_MSG1_LEN;

            let action = match sessions.get(peer).map(|s| (s.phase(), s.role())) {
                None => {
                    if !is_msg1 {
                        return Err(Error::HandshakeFailure(
                            "No handshake in progress".to_string(),
                        ));
                    }
                    HandshakeAction::Respond
                }
                Some((SessionPhase::Failed, _)) => {
                    sessions.remove(peer);
                    if !is_msg1 {
                        return Err(Error::HandshakeFailure(
                            "Session previously failed".to_string(),
                        ));
                    }
                    HandshakeAction::Respond
                }
                Some((SessionPhase::Established, _)) => {
                    if !is_msg1 {
                        return Err(Error::HandshakeFailure(
                            "Unexpected handshake message for established session".to_string(),
                        ));
                    }
                    // The peer restarted or began a rekey; renegotiate
                    debug!(peer = %peer, "Re-handshake over established session");
                    HandshakeAction::Respond
                }
                Some((SessionPhase::Handshaking(_), role)) => {
                    if !is_msg1 {
                        HandshakeAction::Advance
                    } else if role == NoiseRole::Initiator && self.local_peer_id < *peer {
                        // Simultaneous handshake: the lexicographically
                        // smaller peer id stays Initiator
                        debug!(peer = %peer, "Dropping colliding msg1, keeping Initiator role");
                        HandshakeAction::Ignore
                    } else {
                        HandshakeAction::Respond
                    }
                }
            };

            match action {
                HandshakeAction::Ignore => None,
                HandshakeAction::Respond => {
                    let keypair = self.identity.noise_keypair()?;
                    let mut session = NoiseSession::new_responder(&keypair)?;
                    session.read_handshake_message(message)?;
                    let reply = session.write_handshake_message()?;
                    sessions.insert(peer.clone(), session);
                    Some(reply)
                }
                HandshakeAction::Advance => {
                    let session = sessions
                        .get_mut(peer)
                        .ok_or(Error::SessionNotEstablished)?;

                    if let Err(e) = session.read_handshake_message(message) {
                        warn!(peer = %peer, error = %e, "Handshake failed, evicting session");
                        sessions.remove(peer);
                        self.index.write().remove_peer(peer);
                        return Err(e);
                    }

                    if session.is_established() {
                        established = session.remote_static_key();
                        None
                    } else {
                        let reply = match session.write_handshake_message() {
                            Ok(reply) => reply,
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "Handshake failed, evicting session");
                                sessions.remove(peer);
                                self.index.write().remove_peer(peer);
                                return Err(e);
                            }
                        };
                        if session.is_established() {
                            established = session.remote_static_key();
                        }
                        Some(reply)
                    }
                }
            }
        };

        if let Some(remote_static) = established {
            self.finish_establishment(peer, &remote_static);
        }
        Ok(reply)
    }

    /// Index bookkeeping and handler dispatch after an establishment; runs
    /// outside the session lock.
    fn finish_establishment(&self, peer: &PeerId, remote_static: &[u8; 32]) {
        let fp = fingerprint(remote_static);
        self.index.write().insert(peer, fp.clone());
        info!(peer = %peer, fingerprint = %fp, "Handshake completed");

        let handler = self.on_established.read().clone();
        if let Some(handler) = handler {
            handler(peer, remote_static);
        }
    }

    /// Encrypt for an established session
    pub fn encrypt(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(peer) {
            Some(session) if session.is_established() => match session.encrypt(plaintext) {
                Ok(ciphertext) => Ok(ciphertext),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Encryption failed fatally, evicting session");
                    sessions.remove(peer);
                    drop(sessions);
                    self.index.write().remove_peer(peer);
                    Err(e)
                }
            },
            _ => Err(Error::HandshakeRequired(peer.to_string())),
        }
    }

    /// Decrypt from an established session
    pub fn decrypt(&self, peer: &PeerId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(peer) {
            Some(session) if session.is_established() => session.decrypt(ciphertext),
            Some(session) if session.phase() == SessionPhase::Failed => {
                sessions.remove(peer);
                drop(sessions);
                self.index.write().remove_peer(peer);
                Err(Error::SessionNotEstablished)
            }
            _ => Err(Error::SessionNotEstablished),
        }
    }

    /// Replace the session with a fresh Initiator attempt, pinning the
    /// previously authenticated static key. Returns msg1 for the caller to
    /// transmit.
    pub fn initiate_rekey(&self, peer: &PeerId) -> Result<Vec<u8>> {
        let mut sessions = self.sessions.write();
        let existing = sessions.get(peer).ok_or(Error::SessionNotEstablished)?;
        let expected = existing.remote_static_key();

        let keypair = self.identity.noise_keypair()?;
        let mut session = NoiseSession::new_initiator(&keypair)?;
        if let Some(key) = expected {
            session.expect_remote_static(key);
        }
        let msg1 = session.write_handshake_message()?;
        sessions.insert(peer.clone(), session);

        info!(peer = %peer, "Rekey initiated");
        Ok(msg1)
    }

    /// Snapshot of peers whose sessions exceeded the rekey budget
    pub fn sessions_needing_rekey(&self) -> Vec<PeerId> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, session)| session.needs_rekey(&self.rekey_policy))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.read().contains_key(peer)
    }

    pub fn has_established_session(&self, peer: &PeerId) -> bool {
        self.sessions
            .read()
            .get(peer)
            .map(NoiseSession::is_established)
            .unwrap_or(false)
    }

    pub fn session_phase(&self, peer: &PeerId) -> Option<SessionPhase> {
        self.sessions.read().get(peer).map(NoiseSession::phase)
    }

    /// The peer's authenticated static key, once established
    pub fn remote_static_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.sessions
            .read()
            .get(peer)
            .and_then(NoiseSession::remote_static_key)
    }

    pub fn fingerprint_for_peer(&self, peer: &PeerId) -> Option<String> {
        self.index.read().by_peer.get(peer).cloned()
    }

    pub fn peer_for_fingerprint(&self, fp: &str) -> Option<PeerId> {
        self.index.read().by_fingerprint.get(fp).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn remove_session(&self, peer: &PeerId) {
        self.sessions.write().remove(peer);
        self.index.write().remove_peer(peer);
        debug!(peer = %peer, "Session removed");
    }

    pub fn remove_all_sessions(&self) {
        self.sessions.write().clear();
        self.index.write().clear();
        info!("All sessions removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(id: &str) -> SessionManager {
        let vault = Arc::new(
            IdentityVault::load_or_create(Arc::new(MemoryKeyStore::new())).unwrap(),
        );
        SessionManager::new(PeerId::new(id), vault, RekeyPolicy::default())
    }

    /// Drive a full handshake initiated by `a`
    fn run_handshake(a: &SessionManager, b: &SessionManager) {
        let a_id = a.local_peer_id().clone();
        let b_id = b.local_peer_id().clone();

        let msg1 = a.initiate_handshake(&b_id).unwrap();
        let msg2 = b.process_handshake(&a_id, &msg1).unwrap().unwrap();
        let msg3 = a.process_handshake(&b_id, &msg2).unwrap().unwrap();
        assert!(b.process_handshake(&a_id, &msg3).unwrap().is_none());
    }

    #[test]
    fn test_basic_handshake() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");

        run_handshake(&a, &b);

        assert!(a.has_established_session(&PeerId::new("bbbb2222")));
        assert!(b.has_established_session(&PeerId::new("aaaa1111")));

        let fp_of_b = a.fingerprint_for_peer(&PeerId::new("bbbb2222")).unwrap();
        assert_eq!(fp_of_b.len(), 64);
        assert_eq!(
            a.peer_for_fingerprint(&fp_of_b),
            Some(PeerId::new("bbbb2222"))
        );
    }

    #[test]
    fn test_established_handler_fires_once() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        a.set_established_handler(Arc::new(move |_peer, _key| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        run_handshake(&a, &b);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_encrypt_decrypt_through_managers() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        run_handshake(&a, &b);

        let ciphertext = a.encrypt(&PeerId::new("bbbb2222"), b"hello").unwrap();
        assert!(ciphertext.len() >= 21);
        let plaintext = b.decrypt(&PeerId::new("aaaa1111"), &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_encrypt_without_session_requires_handshake() {
        let a = manager("aaaa1111");
        assert!(matches!(
            a.encrypt(&PeerId::new("bbbb2222"), b"hi"),
            Err(Error::HandshakeRequired(_))
        ));
    }

    #[test]
    fn test_decrypt_without_session() {
        let a = manager("aaaa1111");
        assert!(matches!(
            a.decrypt(&PeerId::new("bbbb2222"), &[0u8; 32]),
            Err(Error::SessionNotEstablished)
        ));
    }

    #[test]
    fn test_initiate_on_healthy_session_rejected() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        run_handshake(&a, &b);

        assert!(matches!(
            a.initiate_handshake(&PeerId::new("bbbb2222")),
            Err(Error::AlreadyEstablished(_))
        ));
    }

    #[test]
    fn test_simultaneous_handshake_tie_break() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        let a_id = PeerId::new("aaaa1111");
        let b_id = PeerId::new("bbbb2222");

        // Both initiate before seeing the other's msg1
        let a_msg1 = a.initiate_handshake(&b_id).unwrap();
        let b_msg1 = b.initiate_handshake(&a_id).unwrap();

        // aaaa1111 < bbbb2222: A keeps its Initiator attempt
        assert!(a.process_handshake(&b_id, &b_msg1).unwrap().is_none());
        assert_eq!(a.session_phase(&b_id), Some(SessionPhase::Handshaking(1)));

        // B yields and becomes Responder for A's msg1
        let msg2 = b.process_handshake(&a_id, &a_msg1).unwrap().unwrap();
        assert_eq!(b.session_phase(&a_id), Some(SessionPhase::Handshaking(2)));

        let msg3 = a.process_handshake(&b_id, &msg2).unwrap().unwrap();
        assert!(b.process_handshake(&a_id, &msg3).unwrap().is_none());

        assert!(a.has_established_session(&b_id));
        assert!(b.has_established_session(&a_id));

        // Converged to one working channel
        let ct = a.encrypt(&b_id, b"converged").unwrap();
        assert_eq!(b.decrypt(&a_id, &ct).unwrap(), b"converged");
    }

    #[test]
    fn test_rekey_establishes_fresh_ciphers() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        let a_id = PeerId::new("aaaa1111");
        let b_id = PeerId::new("bbbb2222");
        run_handshake(&a, &b);

        let stale = a.encrypt(&b_id, b"before rekey").unwrap();

        let msg1 = a.initiate_rekey(&b_id).unwrap();
        let msg2 = b.process_handshake(&a_id, &msg1).unwrap().unwrap();
        let msg3 = a.process_handshake(&b_id, &msg2).unwrap().unwrap();
        assert!(b.process_handshake(&a_id, &msg3).unwrap().is_none());

        assert!(a.has_established_session(&b_id));
        // Ciphertext from the old epoch no longer decrypts
        assert!(b.decrypt(&a_id, &stale).is_err());
        // Fresh traffic flows
        let ct = a.encrypt(&b_id, b"after rekey").unwrap();
        assert_eq!(b.decrypt(&a_id, &ct).unwrap(), b"after rekey");
    }

    #[test]
    fn test_rekey_pin_rejects_new_identity() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        let a_id = PeerId::new("aaaa1111");
        let b_id = PeerId::new("bbbb2222");
        run_handshake(&a, &b);

        // B loses its identity and comes back with fresh keys
        let b_reborn = manager("bbbb2222");

        let msg1 = a.initiate_rekey(&b_id).unwrap();
        let msg2 = b_reborn.process_handshake(&a_id, &msg1).unwrap().unwrap();

        // A learns a different static key than the pinned one
        assert!(matches!(
            a.process_handshake(&b_id, &msg2),
            Err(Error::HandshakeFailure(_))
        ));
        assert!(!a.has_session(&b_id));
    }

    #[test]
    fn test_sessions_needing_rekey_snapshot() {
        let vault = Arc::new(
            IdentityVault::load_or_create(Arc::new(MemoryKeyStore::new())).unwrap(),
        );
        let a = SessionManager::new(
            PeerId::new("aaaa1111"),
            vault,
            RekeyPolicy {
                max_messages: 1,
                max_bytes: u64::MAX,
                max_age: std::time::Duration::from_secs(3600),
            },
        );
        let b = manager("bbbb2222");
        let b_id = PeerId::new("bbbb2222");
        run_handshake(&a, &b);

        assert!(a.sessions_needing_rekey().is_empty());
        a.encrypt(&b_id, b"spend the budget").unwrap();
        assert_eq!(a.sessions_needing_rekey(), vec![b_id]);
    }

    #[test]
    fn test_peer_restart_renegotiates() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        let a_id = PeerId::new("aaaa1111");
        let b_id = PeerId::new("bbbb2222");
        run_handshake(&a, &b);

        // B restarts and initiates from scratch toward A
        let b_restarted = manager("bbbb2222");
        let msg1 = b_restarted.initiate_handshake(&a_id).unwrap();
        let msg2 = a.process_handshake(&b_id, &msg1).unwrap().unwrap();
        let msg3 = b_restarted.process_handshake(&a_id, &msg2).unwrap().unwrap();
        assert!(a.process_handshake(&b_id, &msg3).unwrap().is_none());

        let ct = a.encrypt(&b_id, b"welcome back").unwrap();
        assert_eq!(
            b_restarted.decrypt(&a_id, &ct).unwrap(),
            b"welcome back"
        );
    }

    #[test]
    fn test_remove_session_drops_index() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        let b_id = PeerId::new("bbbb2222");
        run_handshake(&a, &b);

        let fp = a.fingerprint_for_peer(&b_id).unwrap();
        a.remove_session(&b_id);

        assert!(!a.has_session(&b_id));
        assert!(a.fingerprint_for_peer(&b_id).is_none());
        assert!(a.peer_for_fingerprint(&fp).is_none());
    }

    #[test]
    fn test_remove_all_sessions() {
        let a = manager("aaaa1111");
        let b = manager("bbbb2222");
        let c = manager("cccc3333");
        run_handshake(&a, &b);
        run_handshake(&a, &c);

        assert_eq!(a.session_count(), 2);
        a.remove_all_sessions();
        assert_eq!(a.session_count(), 0);
        assert!(a
            .fingerprint_for_peer(&PeerId::new("bbbb2222"))
            .is_none());
    }

    #[test]
    fn test_non_msg1_without_session_rejected() {
        let a = manager("aaaa1111");
        assert!(matches!(
            a.process_handshake(&PeerId::new("bbbb2222"), &[0u8; 96]),
            Err(Error::HandshakeFailure(_))
        ));
    }

    #[test]
    fn test_at_most_one_session_per_peer() {
        let a = manager("aaaa1111");
        let b_id = PeerId::new("bbbb2222");

        a.initiate_handshake(&b_id).unwrap();
        // A second attempt replaces, never duplicates
        a.initiate_handshake(&b_id).unwrap();
        assert_eq!(a.session_count(), 1);
    }
}
