//! Local identity key pair and session-key wrapping.
//!
//! Each login generates a fresh RSA-2048 key pair. It lives only in memory
//! and is dropped on logout. The private half is used for exactly one thing:
//! unwrapping session keys that peers sealed under our public key.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use veilchat_protocol::armor::{self, PUBLIC_KEY_LABEL, WRAPPED_KEY_LABEL};

use crate::cipher::SessionKey;
use crate::error::CryptoError;

/// Modulus size of identity keys.
pub const RSA_MODULUS_BITS: usize = 2048;

/// Size of an OAEP ciphertext under a 2048-bit key.
pub const WRAPPED_KEY_LEN: usize = RSA_MODULUS_BITS / 8;

/// Default upper bound on key pair generation.
pub const DEFAULT_KEYGEN_TIMEOUT: Duration = Duration::from_secs(10);

/// A public key as announced on the wire, plus its parsed form.
#[derive(Debug, Clone)]
pub struct PublicKeyRecord {
    pem: String,
    key: RsaPublicKey,
}

impl PublicKeyRecord {
    /// Parse an armored SPKI public key received from a peer.
    ///
    /// The body may be wrapped at any width, including a single line.
    pub fn parse(pem: &str) -> Result<Self, CryptoError> {
        let der = armor::decode(PUBLIC_KEY_LABEL, pem)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        if key.size() * 8 < RSA_MODULUS_BITS {
            return Err(CryptoError::InvalidPublicKey(format!(
                "modulus is {} bits, need at least {RSA_MODULUS_BITS}",
                key.size() * 8
            )));
        }
        Ok(Self {
            pem: pem.trim().to_string(),
            key,
        })
    }

    fn from_key(key: RsaPublicKey) -> Result<Self, CryptoError> {
        let pem = key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(format!("public key export: {e}")))?;
        Ok(Self { pem, key })
    }

    /// The armored encoding, as sent in `Join` and `PeerJoined`.
    pub fn as_pem(&self) -> &str {
        &self.pem
    }

    /// Ciphertext size a wrap under this key produces.
    pub fn wrapped_len(&self) -> usize {
        self.key.size()
    }
}

impl PartialEq for PublicKeyRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PublicKeyRecord {}

struct KeyPair {
    private: RsaPrivateKey,
    public: PublicKeyRecord,
}

/// Holds the local key pair for one session.
///
/// The lock is only held long enough to clone the `Arc`; RSA work never
/// runs under it.
#[derive(Default)]
pub struct IdentityManager {
    key_pair: RwLock<Option<Arc<KeyPair>>>,
}

impl IdentityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh key pair, replacing any previous one.
    ///
    /// Generation runs on the blocking pool. If it does not finish within
    /// `bound`, `KeyGenerationTimeout` is returned and nothing is installed;
    /// the previous key pair (if any) is left untouched.
    pub async fn generate_key_pair(&self, bound: Duration) -> Result<PublicKeyRecord, CryptoError> {
        self.generate_with(bound, || {
            RsaPrivateKey::new(&mut OsRng, RSA_MODULUS_BITS)
                .map_err(|e| CryptoError::KeyGeneration(e.to_string()))
        })
        .await
    }

    async fn generate_with<F>(&self, bound: Duration, keygen: F) -> Result<PublicKeyRecord, CryptoError>
    where
        F: FnOnce() -> Result<RsaPrivateKey, CryptoError> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(keygen);
        let private = match tokio::time::timeout(bound, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                return Err(CryptoError::KeyGeneration(format!("keygen task failed: {join_err}")))
            }
            Err(_) => {
                warn!(?bound, "identity key generation timed out");
                return Err(CryptoError::KeyGenerationTimeout(bound));
            }
        };

        let public = PublicKeyRecord::from_key(RsaPublicKey::from(&private))?;
        let pair = Arc::new(KeyPair {
            private,
            public: public.clone(),
        });

        *self.write_lock() = Some(pair);
        info!(bits = RSA_MODULUS_BITS, "identity key pair installed");
        Ok(public)
    }

    pub fn is_ready(&self) -> bool {
        self.read_lock().is_some()
    }

    /// The local public key, if a key pair has been generated.
    pub fn public_key(&self) -> Option<PublicKeyRecord> {
        self.read_lock().as_ref().map(|pair| pair.public.clone())
    }

    /// Expected size of a wrapped key addressed to us.
    pub fn wrapped_key_len(&self) -> Option<usize> {
        self.read_lock().as_ref().map(|pair| pair.private.size())
    }

    /// Drop the key pair. Used on logout.
    pub fn clear(&self) {
        if self.write_lock().take().is_some() {
            debug!("identity key pair discarded");
        }
    }

    /// Recover a session key a peer wrapped under our public key.
    ///
    /// A recovered key of the wrong size is rejected and never returned.
    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<SessionKey, CryptoError> {
        let recovered = self.unwrap_key_material(wrapped)?;
        SessionKey::from_slice(&recovered)
    }

    /// Raw OAEP decryption of a wrapped key.
    ///
    /// The ciphertext length is checked before the private key is touched.
    pub fn unwrap_key_material(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let pair = self
            .read_lock()
            .as_ref()
            .cloned()
            .ok_or(CryptoError::IdentityNotReady)?;

        let expected = pair.private.size();
        if wrapped.len() != expected {
            return Err(CryptoError::KeyExchangeFormat(format!(
                "wrapped key is {} bytes, expected {expected}",
                wrapped.len()
            )));
        }

        pair.private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::KeyExchangeCrypto(e.to_string()))
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<KeyPair>>> {
        self.key_pair.read().unwrap_or_else(|poisoned| {
            warn!("identity lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<KeyPair>>> {
        self.key_pair.write().unwrap_or_else(|poisoned| {
            warn!("identity lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Seal `key` under a peer's public key and armor the result.
pub fn wrap_session_key(peer: &PublicKeyRecord, key: &SessionKey) -> Result<String, CryptoError> {
    let wrapped = peer
        .key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.expose())
        .map_err(|e| CryptoError::Encryption(format!("session key wrap: {e}")))?;
    Ok(armor::encode(WRAPPED_KEY_LABEL, &wrapped))
}

/// Strip the armor from a received wrapped key.
pub fn decode_wrapped_key(text: &str) -> Result<Vec<u8>, CryptoError> {
    armor::decode(WRAPPED_KEY_LABEL, text).map_err(|e| CryptoError::KeyExchangeFormat(e.to_string()))
}
