//! BitChat core - encrypted peer-to-peer sessions over a Bluetooth mesh
//!
//! This library implements the session engine of the BitChat protocol:
//! device identity, the Noise XX handshake lifecycle per peer, announce and
//! packet signing, and the admission checks that gate all of it. Transports
//! and UI layers sit on top and talk to [`EncryptionService`].

pub mod crypto;
pub mod error;
pub mod keystore;
pub mod protocol;
pub mod security;
pub mod service;
pub mod session;

// Re-export commonly used types
pub use crypto::{fingerprint, Announcement, IdentityVault, PacketSigner};
pub use error::{Error, Result};
pub use keystore::{FileKeyStore, MemoryKeyStore, SecureStore};
pub use protocol::{PeerId, RoutedPacket};
pub use service::{EncryptionService, ServiceConfig};
pub use session::{NoiseRole, RekeyPolicy, SessionManager, SessionPhase};
