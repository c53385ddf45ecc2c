//! Error types and handling for BitChat

use thiserror::Error;

/// Result type alias for BitChat operations
pub type Result<T> = std::result::Result<T, Error>;

/// BitChat error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Rate limit exceeded for peer {0}")]
    RateLimitExceeded(String),

    #[error("Handshake required with peer {0}")]
    HandshakeRequired(String),

    #[error("Session not established")]
    SessionNotEstablished,

    #[error("Session already established with peer {0}")]
    AlreadyEstablished(String),

    #[error("Handshake failure: {0}")]
    HandshakeFailure(String),

    #[error("Decryption failure")]
    DecryptionFailure,

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),
}
