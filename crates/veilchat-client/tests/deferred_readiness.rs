//! Exchange requested before the local key pair exists, driven with real
//! RSA identities and a recording transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use veilchat_client::{
    ClientError, ExchangeConfig, ExchangeEvent, ExchangeState, KeyExchangeCoordinator, Transport,
};
use veilchat_crypto::{IdentityManager, SessionKeyStore, DEFAULT_KEYGEN_TIMEOUT};
use veilchat_protocol::ClientMessage;

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<ClientMessage>>,
}

impl Outbox {
    fn take(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl Transport for Outbox {
    async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

struct Party {
    identity: Arc<IdentityManager>,
    outbox: Arc<Outbox>,
    keys: Arc<SessionKeyStore>,
    coordinator: KeyExchangeCoordinator<IdentityManager, Outbox>,
    events: mpsc::UnboundedReceiver<ExchangeEvent>,
}

impl Party {
    fn new(name: &str) -> Self {
        let identity = Arc::new(IdentityManager::new());
        let outbox = Arc::new(Outbox::default());
        let keys = Arc::new(SessionKeyStore::new());
        let (coordinator, events) = KeyExchangeCoordinator::new(
            name,
            Arc::clone(&identity),
            Arc::clone(&outbox),
            Arc::clone(&keys),
            &ExchangeConfig::default(),
        );
        Self {
            identity,
            outbox,
            keys,
            coordinator,
            events,
        }
    }

    /// Feed back the next completion from the blocking pool.
    async fn pump(&mut self) {
        let event = self.events.recv().await.expect("coordinator dropped");
        self.coordinator.handle_event(event).await.unwrap();
    }
}

#[tokio::test]
async fn deferred_request_completes_after_identity_is_ready() {
    let mut alice = Party::new("alice");
    let mut bob = Party::new("bob");

    let bob_public = bob.identity.generate_key_pair(DEFAULT_KEYGEN_TIMEOUT).await.unwrap();

    alice
        .coordinator
        .initiate_exchange("bob", bob_public)
        .await
        .unwrap();
    assert!(alice.outbox.take().is_empty());
    assert!(alice.coordinator.pending("bob").unwrap().awaiting_identity);
    assert_eq!(alice.coordinator.pending("bob").unwrap().attempts, 0);

    let alice_public = alice
        .identity
        .generate_key_pair(DEFAULT_KEYGEN_TIMEOUT)
        .await
        .unwrap();
    alice.coordinator.on_identity_ready().await.unwrap();

    let sent = alice.outbox.take();
    assert!(matches!(
        sent.as_slice(),
        [ClientMessage::RequestKeyExchange { to }] if to == "bob"
    ));
    assert_eq!(alice.coordinator.state("bob"), ExchangeState::Requested);

    bob.coordinator.register_peer("alice", alice_public);
    bob.coordinator.on_exchange_requested("alice").await.unwrap();
    bob.pump().await;
    assert_eq!(bob.coordinator.state("alice"), ExchangeState::Established);

    let wrapped = match bob.outbox.take().pop() {
        Some(ClientMessage::WrappedKey { to, wrapped_key }) => {
            assert_eq!(to, "alice");
            wrapped_key
        }
        other => panic!("expected WrappedKey, got {other:?}"),
    };

    alice.coordinator.on_wrapped_key("bob", wrapped).await.unwrap();
    assert_eq!(alice.coordinator.state("bob"), ExchangeState::AwaitingUnwrap);
    alice.pump().await;
    assert_eq!(alice.coordinator.state("bob"), ExchangeState::Established);
    assert!(alice.coordinator.pending("bob").is_none());

    let envelope = alice.keys.encrypt_for("bob", b"hello").unwrap();
    assert_eq!(bob.keys.decrypt_from("alice", &envelope).unwrap(), b"hello");

    let reply = bob.keys.encrypt_for("alice", b"hi alice").unwrap();
    assert_eq!(alice.keys.decrypt_from("bob", &reply).unwrap(), b"hi alice");
}

#[tokio::test]
async fn wrapped_key_received_before_identity_is_unwrapped_later() {
    let mut alice = Party::new("alice");
    let bob = Party::new("bob");

    // The key is wrapped for a pair alice discards before it arrives.
    let alice_public = alice
        .identity
        .generate_key_pair(DEFAULT_KEYGEN_TIMEOUT)
        .await
        .unwrap();
    let (_, wrapped) = veilchat_client::ExchangeCrypto::wrap_fresh_key(&*bob.identity, &alice_public)
        .unwrap();
    alice.identity.clear();

    alice.coordinator.on_wrapped_key("bob", wrapped).await.unwrap();
    let pending = alice.coordinator.pending("bob").unwrap();
    assert!(pending.awaiting_identity);
    assert_eq!(pending.attempts, 0);
    assert!(!alice.coordinator.is_retry_scheduled("bob"));

    alice
        .identity
        .generate_key_pair(DEFAULT_KEYGEN_TIMEOUT)
        .await
        .unwrap();
    alice.coordinator.on_identity_ready().await.unwrap();
    alice.pump().await;

    // Resumed against the new pair, so the unwrap fails and counts.
    assert_eq!(alice.coordinator.state("bob"), ExchangeState::Failed(1));
    assert!(alice.coordinator.is_retry_scheduled("bob"));
    assert!(!alice.keys.contains("bob"));
}
