//! Canonical announce binding and its signature
//!
//! An announce binds a peer's routing id, static key, signing key, nickname
//! and timestamp under one Ed25519 signature. Signing and verification both
//! operate on the exact byte layout below; any deviation breaks
//! interoperability with deployed peers.
//!
//! ```text
//!   1 byte   context_len
//!   N bytes  context        ("bitchat-announce-v1")
//!   8 bytes  peer_id        (canonical routing id)
//!  32 bytes  noise_static_public
//!  32 bytes  ed25519_public
//!   1 byte   nickname_len
//!   N bytes  nickname_utf8  (truncated to 255 bytes)
//!   8 bytes  timestamp_ms   (big-endian)
//! ```

use crate::crypto::identity::{IdentityVault, SIGNATURE_LEN};
use crate::error::Result;
use crate::protocol::PeerId;

/// Domain-separation context for announce signatures
pub const ANNOUNCE_CONTEXT: &[u8] = b"bitchat-announce-v1";

/// The fields bound together by an announce signature
#[derive(Debug, Clone)]
pub struct Announcement {
    pub peer_id: PeerId,
    pub noise_public: [u8; 32],
    pub signing_public: [u8; 32],
    pub nickname: String,
    pub timestamp_ms: u64,
}

impl Announcement {
    /// Serialize to the canonical signing layout.
    ///
    /// The context and nickname are length-prefixed once each; no other
    /// delimiters appear in the stream.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let context_len = ANNOUNCE_CONTEXT.len().min(255);
        let nickname_bytes = self.nickname.as_bytes();
        let nickname_len = nickname_bytes.len().min(255);

        let mut out = Vec::with_capacity(1 + context_len + 8 + 32 + 32 + 1 + nickname_len + 8);
        out.push(context_len as u8);
        out.extend_from_slice(&ANNOUNCE_CONTEXT[..context_len]);
        out.extend_from_slice(&self.peer_id.routing_bytes());
        out.extend_from_slice(&self.noise_public);
        out.extend_from_slice(&self.signing_public);
        out.push(nickname_len as u8);
        out.extend_from_slice(&nickname_bytes[..nickname_len]);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out
    }

    /// Sign the canonical form with the vault's Ed25519 key
    pub fn sign(&self, vault: &IdentityVault) -> Result<[u8; SIGNATURE_LEN]> {
        vault.sign(&self.canonical_bytes())
    }

    /// Verify a signature over the canonical form against the announcer's
    /// Ed25519 public key
    pub fn verify(&self, signature: &[u8], signing_public: &[u8; 32]) -> bool {
        IdentityVault::verify(signature, &self.canonical_bytes(), signing_public)
    }
}
