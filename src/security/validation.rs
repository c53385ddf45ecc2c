//! Stateless validation of peer identifiers and frame sizes
//!
//! Frames arrive reassembled from BLE fragments, so the ceilings here bound
//! what the fragmentation layer may hand us, not a single radio packet.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::protocol::PeerId;

/// Size and shape limits enforced at the service boundary
#[derive(Debug, Clone)]
pub struct SizeLimits {
    /// Maximum peer id length in characters
    pub max_peer_id_len: usize,
    /// Maximum handshake frame size
    pub max_handshake_message: usize,
    /// Maximum transport frame size
    pub max_transport_message: usize,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            max_peer_id_len: 64,
            // 244-byte BLE payload times a 16-fragment reassembly budget
            max_handshake_message: 4096,
            // Noise maximum message length
            max_transport_message: 65535,
        }
    }
}

/// Validator with bounds checking and violation accounting
pub struct MessageValidator {
    limits: SizeLimits,
    validation_count: AtomicU64,
    violation_count: AtomicU64,
}

impl MessageValidator {
    pub fn new(limits: SizeLimits) -> Self {
        Self {
            limits,
            validation_count: AtomicU64::new(0),
            violation_count: AtomicU64::new(0),
        }
    }

    pub fn validation_count(&self) -> u64 {
        self.validation_count.load(Ordering::Relaxed)
    }

    pub fn violation_count(&self) -> u64 {
        self.violation_count.load(Ordering::Relaxed)
    }

    fn record(&self, valid: bool) {
        self.validation_count.fetch_add(1, Ordering::Relaxed);
        if !valid {
            self.violation_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reject empty, oversized, or control-character peer ids
    pub fn validate_peer_id(&self, peer: &PeerId) -> Result<()> {
        let id = peer.as_str();
        let valid = !id.is_empty()
            && id.len() <= self.limits.max_peer_id_len
            && id.chars().all(|c| !c.is_control());
        self.record(valid);

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidPeerId(id.chars().take(80).collect()))
        }
    }

    pub fn validate_handshake_message(&self, message: &[u8]) -> Result<()> {
        self.validate_size(message.len(), self.limits.max_handshake_message)
    }

    pub fn validate_transport_message(&self, message: &[u8]) -> Result<()> {
        self.validate_size(message.len(), self.limits.max_transport_message)
    }

    fn validate_size(&self, size: usize, limit: usize) -> Result<()> {
        let valid = size <= limit;
        self.record(valid);
        if valid {
            Ok(())
        } else {
            Err(Error::MessageTooLarge { size, limit })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> MessageValidator {
        MessageValidator::new(SizeLimits::default())
    }

    #[test]
    fn test_peer_id_bounds() {
        let validator = validator();

        assert!(validator.validate_peer_id(&PeerId::new("aaaa1111")).is_ok());
        assert!(validator.validate_peer_id(&PeerId::new("")).is_err());
        assert!(validator
            .validate_peer_id(&PeerId::new("a".repeat(64)))
            .is_ok());
        assert!(validator
            .validate_peer_id(&PeerId::new("a".repeat(65)))
            .is_err());
        assert!(validator
            .validate_peer_id(&PeerId::new("ab\u{0}cd"))
            .is_err());
    }

    #[test]
    fn test_handshake_size_boundary() {
        let validator = validator();
        let limit = SizeLimits::default().max_handshake_message;

        assert!(validator
            .validate_handshake_message(&vec![0u8; limit])
            .is_ok());
        let err = validator
            .validate_handshake_message(&vec![0u8; limit + 1])
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
    }

    #[test]
    fn test_transport_size_boundary() {
        let validator = validator();
        let limit = SizeLimits::default().max_transport_message;

        assert!(validator
            .validate_transport_message(&vec![0u8; limit])
            .is_ok());
        assert!(validator
            .validate_transport_message(&vec![0u8; limit + 1])
            .is_err());
    }

    #[test]
    fn test_violation_accounting() {
        let validator = validator();
        validator.validate_peer_id(&PeerId::new("ok")).unwrap();
        let _ = validator.validate_peer_id(&PeerId::new(""));

        assert_eq!(validator.validation_count(), 2);
        assert_eq!(validator.violation_count(), 1);
    }
}
