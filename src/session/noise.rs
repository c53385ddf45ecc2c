//! Per-peer Noise XX state machine
//!
//! Three-message pattern (e / e,ee,s,es / s,se) giving mutual authentication
//! and forward secrecy. A session is either mid-handshake or in transport
//! mode, never both; transport mode owns the send and receive cipher states
//! with their 64-bit nonces. Counters feed the rekey policy so no cipher
//! state lives past a conservative fraction of its AEAD budget.

use snow::Builder;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::crypto::NoiseKeyPair;
use crate::error::{Error, Result};

/// Noise protocol pattern: Noise_XX_25519_ChaChaPoly_SHA256
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Handshake message sizes with empty payloads
pub const NOISE_MSG1_LEN: usize = 32;
pub const NOISE_MSG2_LEN: usize = 96;
pub const NOISE_MSG3_LEN: usize = 64;

/// ChaCha20-Poly1305 authentication tag length
pub const NOISE_TAG_LEN: usize = 16;

/// Scratch buffer for handshake messages (largest is msg2 at 96 bytes)
const HANDSHAKE_BUF_LEN: usize = 1024;

/// Consecutive decryption failures tolerated before the session is failed.
/// A single spurious or replayed frame must not kill a live session.
const MAX_CONSECUTIVE_DECRYPT_FAILURES: u32 = 8;

/// Which side of the handshake this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseRole {
    Initiator,
    Responder,
}

/// Observable session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Mid-handshake; the step counts messages processed so far
    Handshaking(u8),
    Established,
    Failed,
}

/// Forward-secrecy budget: a session past any of these thresholds must be
/// rekeyed.
#[derive(Debug, Clone)]
pub struct RekeyPolicy {
    pub max_messages: u64,
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_messages: 10_000,
            max_bytes: 1 << 30, // 1 GiB
            max_age: Duration::from_secs(3600),
        }
    }
}

enum SessionState {
    Handshaking {
        state: Box<snow::HandshakeState>,
        step: u8,
    },
    Transport {
        state: Box<snow::TransportState>,
    },
    Failed,
}

/// One peer's Noise session: handshake working state or transport ciphers,
/// plus the counters that drive rekey.
pub struct NoiseSession {
    role: NoiseRole,
    state: SessionState,
    remote_static: Option<[u8; 32]>,
    /// Pinned during rekey: the re-handshake must authenticate this key
    expected_remote: Option<[u8; 32]>,
    handshake_hash: Option<[u8; 32]>,
    created_at: Instant,
    last_activity: Instant,
    bytes_sent: u64,
    messages_sent: u64,
    consecutive_decrypt_failures: u32,
}

impl NoiseSession {
    pub fn new_initiator(local_keypair: &NoiseKeyPair) -> Result<Self> {
        Self::new(local_keypair, NoiseRole::Initiator)
    }

    pub fn new_responder(local_keypair: &NoiseKeyPair) -> Result<Self> {
        Self::new(local_keypair, NoiseRole::Responder)
    }

    fn new(local_keypair: &NoiseKeyPair, role: NoiseRole) -> Result<Self> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|e| Error::Crypto(format!("Invalid noise params: {}", e)))?;
        let local_private_bytes = local_keypair.private_bytes();
        let builder = Builder::new(params).local_private_key(&local_private_bytes)?;
        let handshake = match role {
            NoiseRole::Initiator => builder.build_initiator()?,
            NoiseRole::Responder => builder.build_responder()?,
        };

        let now = Instant::now();
        Ok(Self {
            role,
            state: SessionState::Handshaking {
                state: Box::new(handshake),
                step: 0,
            },
            remote_static: None,
            expected_remote: None,
            handshake_hash: None,
            created_at: now,
            last_activity: now,
            bytes_sent: 0,
            messages_sent: 0,
            consecutive_decrypt_failures: 0,
        })
    }

    pub fn role(&self) -> NoiseRole {
        self.role
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.state {
            SessionState::Handshaking { step, .. } => SessionPhase::Handshaking(*step),
            SessionState::Transport { .. } => SessionPhase::Established,
            SessionState::Failed => SessionPhase::Failed,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Transport { .. })
    }

    /// The peer's static key learned during the handshake
    pub fn remote_static_key(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    /// Channel-binding hash of the completed handshake
    pub fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.handshake_hash
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Pin the static key this session must re-authenticate (set on rekey)
    pub fn expect_remote_static(&mut self, key: [u8; 32]) {
        self.expected_remote = Some(key);
    }

    /// The pinned static key, if any
    pub fn expected_remote_static(&self) -> Option<[u8; 32]> {
        self.expected_remote
    }

    /// Mark the session unusable
    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
    }

    /// Produce the next outbound handshake message
    pub fn write_handshake_message(&mut self) -> Result<Vec<u8>> {
        let SessionState::Handshaking { state, step } = &mut self.state else {
            return Err(Error::HandshakeFailure(
                "Not in handshake phase".to_string(),
            ));
        };

        let mut buffer = vec![0u8; HANDSHAKE_BUF_LEN];
        let message = match state.write_message(&[], &mut buffer) {
            Ok(len) => {
                buffer.truncate(len);
                *step += 1;
                buffer
            }
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(Error::HandshakeFailure(format!(
                    "Failed to write handshake message: {}",
                    e
                )));
            }
        };

        self.promote_if_finished()?;
        self.last_activity = Instant::now();
        Ok(message)
    }

    /// Consume an inbound handshake message, returning its payload
    pub fn read_handshake_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let SessionState::Handshaking { state, step } = &mut self.state else {
            return Err(Error::HandshakeFailure(
                "Not in handshake phase".to_string(),
            ));
        };

        let mut buffer = vec![0u8; HANDSHAKE_BUF_LEN];
        let payload = match state.read_message(message, &mut buffer) {
            Ok(len) => {
                buffer.truncate(len);
                *step += 1;
                buffer
            }
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(Error::HandshakeFailure(format!(
                    "Failed to read handshake message: {}",
                    e
                )));
            }
        };

        self.check_pinned_remote()?;
        self.promote_if_finished()?;
        self.last_activity = Instant::now();
        Ok(payload)
    }

    /// Enforce the rekey pin as soon as the remote static key is learned
    fn check_pinned_remote(&mut self) -> Result<()> {
        let Some(expected) = self.expected_remote else {
            return Ok(());
        };
        let learned: Option<Vec<u8>> = match &self.state {
            SessionState::Handshaking { state, .. } => {
                state.get_remote_static().map(|key| key.to_vec())
            }
            _ => None,
        };
        if let Some(remote) = learned {
            if remote != expected.as_slice() {
                warn!("Rekey handshake authenticated a different static key");
                self.state = SessionState::Failed;
                return Err(Error::HandshakeFailure(
                    "Remote static key changed across rekey".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Move to transport mode once the handshake has finished, capturing the
    /// remote static key and handshake hash on the way.
    fn promote_if_finished(&mut self) -> Result<()> {
        let finished = matches!(
            &self.state,
            SessionState::Handshaking { state, .. } if state.is_handshake_finished()
        );
        if !finished {
            return Ok(());
        }

        let old_state = std::mem::replace(&mut self.state, SessionState::Failed);
        let SessionState::Handshaking { state, .. } = old_state else {
            unreachable!("checked above");
        };

        let remote_static = match state.get_remote_static() {
            Some(key) if key.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(key);
                out
            }
            _ => {
                return Err(Error::HandshakeFailure(
                    "Handshake finished without remote static key".to_string(),
                ))
            }
        };

        let hash_slice = state.get_handshake_hash();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hash_slice[..32]);

        let transport = state.into_transport_mode().map_err(|e| {
            Error::HandshakeFailure(format!("Failed to enter transport mode: {}", e))
        })?;

        self.remote_static = Some(remote_static);
        self.handshake_hash = Some(hash);
        self.state = SessionState::Transport {
            state: Box::new(transport),
        };
        debug!(role = ?self.role, "Noise session established");
        Ok(())
    }

    /// Encrypt one transport message, appending the tag and bumping the send
    /// nonce. Cipher errors (including nonce exhaustion) are fatal for the
    /// session.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            SessionState::Transport { state } => {
                let mut buffer = vec![0u8; plaintext.len() + NOISE_TAG_LEN];
                let len = match state.write_message(plaintext, &mut buffer) {
                    Ok(len) => len,
                    Err(e) => {
                        self.state = SessionState::Failed;
                        return Err(Error::HandshakeFailure(format!(
                            "Transport encryption failed: {}",
                            e
                        )));
                    }
                };
                buffer.truncate(len);
                self.messages_sent += 1;
                self.bytes_sent += buffer.len() as u64;
                self.last_activity = Instant::now();
                Ok(buffer)
            }
            _ => Err(Error::SessionNotEstablished),
        }
    }

    /// Decrypt one transport message, verifying the tag and bumping the
    /// receive nonce. A bad frame only rejects that frame; a run of them
    /// fails the session.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            SessionState::Transport { state } => {
                if ciphertext.len() < NOISE_TAG_LEN {
                    self.consecutive_decrypt_failures += 1;
                    return Err(Error::DecryptionFailure);
                }
                let mut buffer = vec![0u8; ciphertext.len()];
                match state.read_message(ciphertext, &mut buffer) {
                    Ok(len) => {
                        buffer.truncate(len);
                        self.consecutive_decrypt_failures = 0;
                        self.last_activity = Instant::now();
                        Ok(buffer)
                    }
                    Err(_) => {
                        self.consecutive_decrypt_failures += 1;
                        if self.consecutive_decrypt_failures >= MAX_CONSECUTIVE_DECRYPT_FAILURES {
                            warn!(
                                failures = self.consecutive_decrypt_failures,
                                "Too many consecutive decryption failures, failing session"
                            );
                            self.state = SessionState::Failed;
                        }
                        Err(Error::DecryptionFailure)
                    }
                }
            }
            _ => Err(Error::SessionNotEstablished),
        }
    }

    /// Whether the session has exceeded its forward-secrecy budget
    pub fn needs_rekey(&self, policy: &RekeyPolicy) -> bool {
        self.is_established()
            && (self.messages_sent >= policy.max_messages
                || self.bytes_sent >= policy.max_bytes
                || self.created_at.elapsed() >= policy.max_age)
    }
}
