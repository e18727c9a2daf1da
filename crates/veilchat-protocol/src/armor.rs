//! PEM blocks for keys on the wire.
//!
//! Output uses LF line endings wrapped at 64 columns. Input is accepted with
//! any line layout, including a single unwrapped line, so keys exported by
//! other implementations decode as long as the label matches.

use pem::{EncodeConfig, LineEnding, Pem};

use crate::error::ProtocolError;

/// Label for SPKI-encoded public keys.
pub const PUBLIC_KEY_LABEL: &str = "PUBLIC KEY";

/// Label for RSA-OAEP wrapped session keys.
pub const WRAPPED_KEY_LABEL: &str = "WRAPPED SESSION KEY";

/// Encode `data` as a PEM block with the given label.
pub fn encode(label: &str, data: &[u8]) -> String {
    let block = Pem::new(label, data);
    pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Decode a PEM block, requiring `label` as its tag.
pub fn decode(label: &str, text: &str) -> Result<Vec<u8>, ProtocolError> {
    let block = pem::parse(text.trim())?;
    if block.tag() != label {
        return Err(ProtocolError::ArmorLabelMismatch {
            expected: label.to_string(),
            got: block.tag().to_string(),
        });
    }
    Ok(block.into_contents())
}
