//! veilchat cryptographic layer.
//!
//! This crate provides:
//! - Identity key management (RSA-2048, generated once per login, never persisted)
//! - Session-key wrapping and unwrapping (RSA-OAEP with SHA-256)
//! - Authenticated message encryption (AES-128-GCM, random 96-bit nonces)
//! - The per-peer session key store

pub mod cipher;
pub mod error;
pub mod identity;
pub mod session_keys;

pub use cipher::{decrypt, encrypt, EncryptedEnvelope, SessionKey, NONCE_LEN, SESSION_KEY_LEN, TAG_LEN};
pub use error::CryptoError;
pub use identity::{
    decode_wrapped_key, wrap_session_key, IdentityManager, PublicKeyRecord,
    DEFAULT_KEYGEN_TIMEOUT, RSA_MODULUS_BITS, WRAPPED_KEY_LEN,
};
pub use session_keys::SessionKeyStore;
