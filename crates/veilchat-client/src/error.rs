use thiserror::Error;

use veilchat_crypto::CryptoError;
use veilchat_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}
