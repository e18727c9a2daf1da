use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key generation timed out after {0:?}")]
    KeyGenerationTimeout(Duration),

    /// Wrapped key or recovered key had the wrong shape. Raised before any
    /// private-key operation when the wrapped length is wrong.
    #[error("malformed key exchange: {0}")]
    KeyExchangeFormat(String),

    #[error("session key unwrap failed: {0}")]
    KeyExchangeCrypto(String),

    #[error("no session key established with {0}")]
    SessionKeyMissing(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("local key pair has not been generated")]
    IdentityNotReady,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}
