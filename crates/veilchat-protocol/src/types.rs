use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Usernames are the peer identity on the relay.
pub type Username = String;

/// A participant as advertised by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub username: Username,
    /// Armored SPKI public key (`-----BEGIN PUBLIC KEY-----` block).
    pub public_key: String,
}

/// An encrypted message as carried over the relay.
///
/// Each field is base64-encoded on its own; the three are never
/// concatenated before transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub ciphertext: String,
    pub nonce: String,
    pub tag: String,
}

impl WireEnvelope {
    /// Encode raw envelope parts.
    pub fn from_parts(ciphertext: &[u8], nonce: &[u8], tag: &[u8]) -> Self {
        Self {
            ciphertext: STANDARD.encode(ciphertext),
            nonce: STANDARD.encode(nonce),
            tag: STANDARD.encode(tag),
        }
    }

    /// Decode into `(ciphertext, nonce, tag)`.
    pub fn decode_parts(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), ProtocolError> {
        Ok((
            STANDARD.decode(&self.ciphertext)?,
            STANDARD.decode(&self.nonce)?,
            STANDARD.decode(&self.tag)?,
        ))
    }
}
