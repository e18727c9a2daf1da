//! Per-peer session key table.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::cipher::{self, EncryptedEnvelope, SessionKey};
use crate::error::CryptoError;

/// Maps peer username to the session key established with that peer.
///
/// Each slot is replaced as a whole, so a concurrent `get` sees either the
/// old key or the new one.
#[derive(Default)]
pub struct SessionKeyStore {
    keys: DashMap<String, Arc<SessionKey>>,
}

impl SessionKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &str) -> Option<Arc<SessionKey>> {
        self.keys.get(peer).map(|entry| Arc::clone(entry.value()))
    }

    /// Install a key for `peer`, overwriting any previous one.
    pub fn put(&self, peer: &str, key: SessionKey) {
        if self.keys.insert(peer.to_string(), Arc::new(key)).is_some() {
            debug!(peer = %peer, "session key replaced");
        } else {
            debug!(peer = %peer, "session key installed");
        }
    }

    pub fn remove(&self, peer: &str) -> bool {
        self.keys.remove(peer).is_some()
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.keys.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drop every key. Used on logout.
    pub fn clear(&self) {
        self.keys.clear();
    }

    /// The key for `peer`, or `SessionKeyMissing`.
    pub fn require(&self, peer: &str) -> Result<Arc<SessionKey>, CryptoError> {
        self.get(peer)
            .ok_or_else(|| CryptoError::SessionKeyMissing(peer.to_string()))
    }

    pub fn encrypt_for(&self, peer: &str, plaintext: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
        let key = self.require(peer)?;
        cipher::encrypt(plaintext, &key)
    }

    pub fn decrypt_from(&self, peer: &str, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
        let key = self.require(peer)?;
        cipher::decrypt(envelope, &key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let store = SessionKeyStore::new();
        assert!(store.get("bob").is_none());

        store.put("bob", SessionKey::generate().unwrap());
        assert!(store.contains("bob"));
        assert_eq!(store.len(), 1);

        assert!(store.remove("bob"));
        assert!(!store.remove("bob"));
        assert!(store.is_empty());
    }

    #[test]
    fn put_overwrites_existing_key() {
        let store = SessionKeyStore::new();
        store.put("bob", SessionKey::from_slice(&[1u8; 16]).unwrap());
        let envelope = store.encrypt_for("bob", b"old").unwrap();

        store.put("bob", SessionKey::from_slice(&[2u8; 16]).unwrap());
        assert_eq!(store.len(), 1);
        assert!(matches!(
            store.decrypt_from("bob", &envelope),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn held_key_survives_overwrite() {
        let store = SessionKeyStore::new();
        store.put("bob", SessionKey::from_slice(&[1u8; 16]).unwrap());
        let held = store.get("bob").unwrap();
        store.put("bob", SessionKey::from_slice(&[2u8; 16]).unwrap());

        let envelope = cipher::encrypt(b"still valid", &held).unwrap();
        assert_eq!(cipher::decrypt(&envelope, &held).unwrap(), b"still valid");
    }

    #[test]
    fn missing_key_is_reported_per_peer() {
        let store = SessionKeyStore::new();
        store.put("carol", SessionKey::generate().unwrap());
        match store.encrypt_for("bob", b"hi") {
            Err(CryptoError::SessionKeyMissing(peer)) => assert_eq!(peer, "bob"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(store.encrypt_for("carol", b"hi").is_ok());
    }

    #[test]
    fn clear_drops_everything() {
        let store = SessionKeyStore::new();
        store.put("bob", SessionKey::generate().unwrap());
        store.put("carol", SessionKey::generate().unwrap());
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_put_and_get() {
        let store = Arc::new(SessionKeyStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        store.put("bob", SessionKey::from_slice(&[i; 16]).unwrap());
                        let key = store.get("bob").unwrap();
                        let envelope = cipher::encrypt(b"x", &key).unwrap();
                        assert_eq!(cipher::decrypt(&envelope, &key).unwrap(), b"x");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 1);
    }
}
