//! Routed packet signing over the canonical zero-signature form
//!
//! Signatures cover every header field of a packet without self-reference:
//! the packet is serialized with its signature field set to zero bytes of
//! the declared length, and the Ed25519 signature is computed over those
//! bytes. Verification rebuilds the identical form. The Ed25519 signing key
//! is used for both directions; the Curve25519 key never signs anything.

use std::sync::Arc;

use crate::crypto::identity::{IdentityVault, SIGNATURE_LEN};
use crate::error::Result;
use crate::protocol::RoutedPacket;

/// Signs and verifies routed packets with the device's Ed25519 identity
pub struct PacketSigner {
    vault: Arc<IdentityVault>,
}

impl PacketSigner {
    pub fn new(vault: Arc<IdentityVault>) -> Self {
        Self { vault }
    }

    /// Sign `packet` in place, setting its signature field.
    ///
    /// The signature field is first sized to the declared signature length
    /// so the canonical form matches what verifiers reconstruct.
    pub fn sign_packet(&self, packet: &mut RoutedPacket) -> Result<()> {
        packet.signature = vec![0u8; SIGNATURE_LEN];
        let canonical = packet.canonical_bytes_for_signing();
        packet.signature = self.vault.sign(&canonical)?.to_vec();
        Ok(())
    }

    /// Verify a signed packet against the sender's Ed25519 public key
    pub fn verify_packet(packet: &RoutedPacket, signing_public: &[u8; 32]) -> bool {
        if packet.signature.len() != SIGNATURE_LEN {
            return false;
        }
        let canonical = packet.canonical_bytes_for_signing();
        IdentityVault::verify(&packet.signature, &canonical, signing_public)
    }
}
