//! AES-128-GCM message protection.
//!
//! Every call to [`encrypt`] draws a fresh 96-bit nonce from the system RNG.
//! The tag is split from the ciphertext so the envelope can carry the
//! nonce, ciphertext and tag as independent fields.

use std::fmt;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use veilchat_protocol::WireEnvelope;

use crate::error::CryptoError;

/// AES-128 key size.
pub const SESSION_KEY_LEN: usize = 16;

/// GCM nonce size.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag size.
pub const TAG_LEN: usize = 16;

/// A symmetric key shared with exactly one peer.
///
/// The raw bytes never leave this crate except wrapped under a peer's
/// public key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_LEN],
}

impl SessionKey {
    /// Generate a fresh random session key.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; SESSION_KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| CryptoError::KeyGeneration("RNG failed".into()))?;
        Ok(Self { bytes })
    }

    /// Build a key from recovered bytes, rejecting any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SESSION_KEY_LEN {
            return Err(CryptoError::KeyExchangeFormat(format!(
                "recovered session key is {} bytes, expected {}",
                bytes.len(),
                SESSION_KEY_LEN
            )));
        }
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.bytes
    }

    fn to_aead_key(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_128_GCM, &self.bytes)
            .map_err(|_| CryptoError::Encryption("invalid key".into()))?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// One protected message: nonce, ciphertext and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl EncryptedEnvelope {
    /// Base64-encode each field for transport.
    pub fn to_wire(&self) -> WireEnvelope {
        WireEnvelope::from_parts(&self.ciphertext, &self.nonce, &self.tag)
    }

    /// Decode a transport envelope, checking nonce and tag sizes.
    pub fn from_wire(wire: &WireEnvelope) -> Result<Self, CryptoError> {
        let (ciphertext, nonce, tag) = wire
            .decode_parts()
            .map_err(|e| CryptoError::Decryption(format!("malformed envelope: {e}")))?;

        let nonce: [u8; NONCE_LEN] = nonce.as_slice().try_into().map_err(|_| {
            CryptoError::Decryption(format!("nonce is {} bytes, expected {NONCE_LEN}", nonce.len()))
        })?;
        let tag: [u8; TAG_LEN] = tag.as_slice().try_into().map_err(|_| {
            CryptoError::Decryption(format!("tag is {} bytes, expected {TAG_LEN}", tag.len()))
        })?;

        Ok(Self {
            nonce,
            ciphertext,
            tag,
        })
    }
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<EncryptedEnvelope, CryptoError> {
    let rng = SystemRandom::new();
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce)
        .map_err(|_| CryptoError::Encryption("RNG failed".into()))?;

    let aead_key = key.to_aead_key()?;
    let mut in_out = plaintext.to_vec();
    let tag = aead_key
        .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Encryption("seal failed".into()))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());

    Ok(EncryptedEnvelope {
        nonce,
        ciphertext: in_out,
        tag: tag_bytes,
    })
}

/// Authenticate and decrypt an envelope.
///
/// Returns nothing but an error if the tag does not verify.
pub fn decrypt(envelope: &EncryptedEnvelope, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let aead_key = key
        .to_aead_key()
        .map_err(|_| CryptoError::Decryption("invalid key".into()))?;

    let mut in_out = Zeroizing::new(Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN));
    in_out.extend_from_slice(&envelope.ciphertext);
    in_out.extend_from_slice(&envelope.tag);

    let plaintext = aead_key
        .open_in_place(
            Nonce::assume_unique_for_key(envelope.nonce),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Decryption("invalid key or tampered data".into()))?;

    Ok(plaintext.to_vec())
}
