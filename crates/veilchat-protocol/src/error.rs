use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too large: {0} bytes (max 65536)")]
    MessageTooLarge(usize),

    #[error("malformed PEM block: {0}")]
    Pem(#[from] pem::PemError),

    #[error("armor label mismatch: expected {expected:?}, got {got:?}")]
    ArmorLabelMismatch { expected: String, got: String },

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
