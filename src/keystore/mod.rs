//! Pluggable secure key storage
//!
//! The identity vault persists its long-term keys through the [`SecureStore`]
//! trait so platforms can back it with whatever secure enclave or keychain
//! they have. Two implementations ship with the core: an in-memory store for
//! tests and ephemeral deployments, and a file-backed store with restrictive
//! permissions for desktop targets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::warn;

/// Store tag for the Curve25519 static key-agreement private key
pub const NOISE_STATIC_KEY_TAG: &str = "noiseStaticKey";

/// Store tag for the Ed25519 signing private key
pub const ED25519_SIGNING_KEY_TAG: &str = "ed25519SigningKey";

/// Abstract secure key-value store keyed by tag.
///
/// Implementations must be safe for concurrent access. `put` and `delete`
/// report success as a boolean rather than an error so callers can degrade
/// to ephemeral operation when the backing store is unavailable.
pub trait SecureStore: Send + Sync {
    fn get(&self, tag: &str) -> Option<Vec<u8>>;
    fn put(&self, tag: &str, value: &[u8]) -> bool;
    fn delete(&self, tag: &str) -> bool;
}

/// In-memory store; contents vanish with the process
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemoryKeyStore {
    fn get(&self, tag: &str) -> Option<Vec<u8>> {
        self.entries.read().get(tag).cloned()
    }

    fn put(&self, tag: &str, value: &[u8]) -> bool {
        self.entries
            .write()
            .insert(tag.to_string(), value.to_vec());
        true
    }

    fn delete(&self, tag: &str) -> bool {
        self.entries.write().remove(tag).is_some()
    }
}

/// File-backed store writing one file per tag under a private directory
pub struct FileKeyStore {
    storage_path: PathBuf,
}

impl FileKeyStore {
    /// Open a store rooted at `storage_path`, creating the directory with
    /// owner-only permissions when missing.
    pub fn new(storage_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&storage_path, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { storage_path })
    }

    fn path_for(&self, tag: &str) -> PathBuf {
        self.storage_path.join(format!("{}.key", tag))
    }
}

impl SecureStore for FileKeyStore {
    fn get(&self, tag: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path_for(tag)).ok()
    }

    fn put(&self, tag: &str, value: &[u8]) -> bool {
        let path = self.path_for(tag);
        if let Err(e) = std::fs::write(&path, value) {
            warn!(tag, error = %e, "Failed to persist key material");
            return false;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            {
                warn!(tag, error = %e, "Failed to restrict key file permissions");
            }
        }

        true
    }

    fn delete(&self, tag: &str) -> bool {
        std::fs::remove_file(self.path_for(tag)).is_ok()
    }
}
