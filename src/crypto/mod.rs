//! Cryptographic foundations for BitChat
//!
//! This module provides:
//! - Persistent device identity (Curve25519 + Ed25519 keypairs)
//! - Public-key fingerprints
//! - Canonical announce binding and signing
//! - Routed packet signing

pub mod announce;
pub mod identity;
pub mod packet_sign;

pub use announce::{Announcement, ANNOUNCE_CONTEXT};
pub use identity::{fingerprint, IdentityVault, NoiseKeyPair, SigningKeyPair, SIGNATURE_LEN};
pub use packet_sign::PacketSigner;
