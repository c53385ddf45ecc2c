//! Device identity: persistent keypairs and the vault that owns them
//!
//! Every device carries two long-term keypairs with the same lifecycle but
//! distinct roles: a Curve25519 key-agreement pair that anchors Noise
//! handshakes, and an Ed25519 pair that signs announces and routed packets.
//! Keeping them separate lets announces be authenticated independently of
//! transport encryption.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::keystore::{SecureStore, ED25519_SIGNING_KEY_TAG, NOISE_STATIC_KEY_TAG};

/// Ed25519 signature length in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Compute the fingerprint of a 32-byte public key: lowercase hex of its
/// SHA-256 digest. Fingerprints are the stable, user-visible peer identity.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Curve25519 static keypair for Noise key agreement
#[derive(Clone)]
pub struct NoiseKeyPair {
    private: [u8; 32],
    public: [u8; 32],
}

impl NoiseKeyPair {
    pub fn generate() -> Result<Self> {
        let mut private = [0u8; 32];
        getrandom::getrandom(&mut private)
            .map_err(|e| Error::Crypto(format!("Failed to generate random bytes: {}", e)))?;
        Ok(Self::from_bytes(private))
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret).to_bytes();
        Self {
            private: private_bytes,
            public,
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.private
    }
}

impl Drop for NoiseKeyPair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

/// Ed25519 signing keypair
#[derive(Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    pub fn generate() -> Result<Self> {
        let mut secret_bytes = [0u8; 32];
        getrandom::getrandom(&mut secret_bytes)
            .map_err(|e| Error::Crypto(format!("Failed to generate random bytes: {}", e)))?;
        let keypair = Self::from_bytes(secret_bytes);
        secret_bytes.zeroize();
        Ok(keypair)
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&private_bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

struct VaultKeys {
    noise: NoiseKeyPair,
    signing: SigningKeyPair,
}

/// Owner of the device's long-term keypairs.
///
/// Loads both keypairs from the secure store on startup, generating and
/// persisting fresh ones on a miss. After [`IdentityVault::wipe`] every
/// key-dependent operation fails until a new vault is created.
pub struct IdentityVault {
    store: Arc<dyn SecureStore>,
    keys: RwLock<Option<VaultKeys>>,
    persisted: AtomicBool,
}

impl IdentityVault {
    /// Load existing keys from the store or create and persist fresh ones.
    ///
    /// A store write failure downgrades the vault to ephemeral operation
    /// rather than failing startup; [`IdentityVault::is_persisted`] reports
    /// the outcome. Random-generation failure is fatal.
    pub fn load_or_create(store: Arc<dyn SecureStore>) -> Result<Self> {
        let mut persisted = true;

        let noise = match store.get(NOISE_STATIC_KEY_TAG) {
            Some(bytes) if bytes.len() == 32 => {
                let mut private = [0u8; 32];
                private.copy_from_slice(&bytes);
                info!("Loaded static key-agreement key from store");
                NoiseKeyPair::from_bytes(private)
            }
            existing => {
                if existing.is_some() {
                    warn!("Stored static key is malformed, regenerating");
                }
                let keypair = NoiseKeyPair::generate()?;
                if !store.put(NOISE_STATIC_KEY_TAG, &keypair.private_bytes()) {
                    warn!("Failed to persist static key, continuing with ephemeral identity");
                    persisted = false;
                } else {
                    info!("Created and persisted static key-agreement key");
                }
                keypair
            }
        };

        let signing = match store.get(ED25519_SIGNING_KEY_TAG) {
            Some(bytes) if bytes.len() == 32 => {
                let mut private = [0u8; 32];
                private.copy_from_slice(&bytes);
                info!("Loaded signing key from store");
                let keypair = SigningKeyPair::from_bytes(private);
                private.zeroize();
                keypair
            }
            existing => {
                if existing.is_some() {
                    warn!("Stored signing key is malformed, regenerating");
                }
                let keypair = SigningKeyPair::generate()?;
                if !store.put(ED25519_SIGNING_KEY_TAG, &keypair.private_bytes()) {
                    warn!("Failed to persist signing key, continuing with ephemeral identity");
                    persisted = false;
                } else {
                    info!("Created and persisted signing key");
                }
                keypair
            }
        };

        Ok(Self {
            store,
            keys: RwLock::new(Some(VaultKeys { noise, signing })),
            persisted: AtomicBool::new(persisted),
        })
    }

    /// Whether both keys made it into the backing store
    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Relaxed)
    }

    /// Public half of the static key-agreement keypair
    pub fn static_public(&self) -> Result<[u8; 32]> {
        let keys = self.keys.read();
        keys.as_ref()
            .map(|k| k.noise.public_bytes())
            .ok_or_else(|| Error::KeyError("Identity has been wiped".to_string()))
    }

    /// Public half of the signing keypair
    pub fn signing_public(&self) -> Result<[u8; 32]> {
        let keys = self.keys.read();
        keys.as_ref()
            .map(|k| k.signing.public_bytes())
            .ok_or_else(|| Error::KeyError("Identity has been wiped".to_string()))
    }

    /// Fingerprint of our own static public key
    pub fn fingerprint(&self) -> Result<String> {
        Ok(fingerprint(&self.static_public()?))
    }

    /// Detached Ed25519 signature over `message`
    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        let keys = self.keys.read();
        keys.as_ref()
            .map(|k| k.signing.sign(message))
            .ok_or_else(|| Error::KeyError("Identity has been wiped".to_string()))
    }

    /// Verify a detached Ed25519 signature against an arbitrary public key
    pub fn verify(signature: &[u8], message: &[u8], public_key: &[u8; 32]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        verifying_key
            .verify(message, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }

    /// Noise keypair handle for building handshake states
    pub(crate) fn noise_keypair(&self) -> Result<NoiseKeyPair> {
        let keys = self.keys.read();
        keys.as_ref()
            .map(|k| k.noise.clone())
            .ok_or_else(|| Error::KeyError("Identity has been wiped".to_string()))
    }

    /// Delete both keys from the store and drop them from memory.
    ///
    /// Subsequent operations fail until a fresh vault is created.
    pub fn wipe(&self) {
        let static_deleted = self.store.delete(NOISE_STATIC_KEY_TAG);
        let signing_deleted = self.store.delete(ED25519_SIGNING_KEY_TAG);
        *self.keys.write() = None;
        info!(static_deleted, signing_deleted, "Identity keys wiped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    /// Store whose writes always fail, for persistence-degradation tests
    struct ReadOnlyStore;

    impl SecureStore for ReadOnlyStore {
        fn get(&self, _tag: &str) -> Option<Vec<u8>> {
            None
        }
        fn put(&self, _tag: &str, _value: &[u8]) -> bool {
            false
        }
        fn delete(&self, _tag: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_create_then_load_same_identity() {
        let store = Arc::new(MemoryKeyStore::new());

        let first = IdentityVault::load_or_create(store.clone()).unwrap();
        let second = IdentityVault::load_or_create(store).unwrap();

        assert_eq!(
            first.static_public().unwrap(),
            second.static_public().unwrap()
        );
        assert_eq!(
            first.signing_public().unwrap(),
            second.signing_public().unwrap()
        );
        assert!(first.is_persisted());
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let store = Arc::new(MemoryKeyStore::new());
        let vault = IdentityVault::load_or_create(store).unwrap();

        let fp = vault.fingerprint().unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(fp, fingerprint(&vault.static_public().unwrap()));
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let store = Arc::new(MemoryKeyStore::new());
        let vault = IdentityVault::load_or_create(store).unwrap();

        let message = b"announce me";
        let signature = vault.sign(message).unwrap();
        let public = vault.signing_public().unwrap();

        assert!(IdentityVault::verify(&signature, message, &public));
        assert!(!IdentityVault::verify(&signature, b"announce you", &public));
    }

    #[test]
    fn test_wipe_disables_operations() {
        let store = Arc::new(MemoryKeyStore::new());
        let vault = IdentityVault::load_or_create(store.clone()).unwrap();

        vault.wipe();

        assert!(vault.static_public().is_err());
        assert!(vault.sign(b"data").is_err());
        assert!(store.get(NOISE_STATIC_KEY_TAG).is_none());
        assert!(store.get(ED25519_SIGNING_KEY_TAG).is_none());
    }

    #[test]
    fn test_wipe_then_recreate_rotates_identity() {
        let store = Arc::new(MemoryKeyStore::new());
        let first = IdentityVault::load_or_create(store.clone()).unwrap();
        let old_public = first.static_public().unwrap();
        first.wipe();

        let second = IdentityVault::load_or_create(store).unwrap();
        assert_ne!(second.static_public().unwrap(), old_public);
    }

    #[test]
    fn test_persistence_failure_is_non_fatal() {
        let vault = IdentityVault::load_or_create(Arc::new(ReadOnlyStore)).unwrap();

        assert!(!vault.is_persisted());
        // Still fully usable in-memory
        let signature = vault.sign(b"ephemeral").unwrap();
        assert!(IdentityVault::verify(
            &signature,
            b"ephemeral",
            &vault.signing_public().unwrap()
        ));
    }

    #[test]
    fn test_malformed_stored_key_regenerated() {
        let store = Arc::new(MemoryKeyStore::new());
        store.put(NOISE_STATIC_KEY_TAG, &[1u8; 7]);

        let vault = IdentityVault::load_or_create(store.clone()).unwrap();
        assert!(vault.static_public().is_ok());
        assert_eq!(store.get(NOISE_STATIC_KEY_TAG).unwrap().len(), 32);
    }
}
