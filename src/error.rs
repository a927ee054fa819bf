//! Error types for the mesh node
//!
//! Failures are discriminated unions rather than strings so callers can
//! match on the kind. Decode, crypto and fragment errors stay local to the
//! ingress pipeline; only send-time errors surface to callers.

use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Top-level mesh service errors
#[derive(Debug, Error)]
pub enum MeshError {
    /// Transport cannot start; fatal at startup, retryable later
    #[error("bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    /// Decode failure; dropped silently and counted
    #[error("invalid packet: {0}")]
    InvalidPacket(#[from] ProtocolError),

    /// Cryptographic failure while handling a packet
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Target nickname is not known to the peer table
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The transport rejected a frame
    #[error("send failed: {0}")]
    SendFailed(String),

    /// An internal queue was closed while enqueueing
    #[error("queue closed")]
    QueueClosed,

    /// The service is shutting down
    #[error("shutdown in progress")]
    ShuttingDown,
}

/// Wire codec and fragment errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than its declared sub-lengths
    #[error("truncated packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Fragment payload too short or malformed
    #[error("invalid fragment payload")]
    InvalidFragment,

    /// Payload exceeds the u32 length field
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Cryptographic operation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material of the wrong size or shape
    #[error("invalid key: {0}")]
    KeyInvalid(String),

    /// Cipher refused the plaintext
    #[error("encryption failed")]
    EncryptionFailed,

    /// Authenticator or tag mismatch while opening a box
    #[error("decryption failed")]
    DecryptionFailed,

    /// Signature did not verify against the given key
    #[error("signature verification failed")]
    SignatureInvalid,

    /// No session has been established with the peer yet
    #[error("no shared secret for peer")]
    NoSharedSecret,

    /// Key persistence failed
    #[error("key storage: {0}")]
    Storage(String),
}

impl MeshError {
    /// Whether the operation may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::SendFailed(_)
                | MeshError::BluetoothUnavailable(_)
                | MeshError::Crypto(CryptoError::NoSharedSecret)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::Truncated { needed: 13, available: 4 };
        assert_eq!(err.to_string(), "truncated packet: need 13 bytes, have 4");
    }

    #[test]
    fn test_is_retryable() {
        assert!(MeshError::SendFailed("radio busy".into()).is_retryable());
        assert!(MeshError::Crypto(CryptoError::NoSharedSecret).is_retryable());
        assert!(!MeshError::PeerNotFound("bob".into()).is_retryable());
        assert!(!MeshError::Crypto(CryptoError::DecryptionFailed).is_retryable());
    }
}
