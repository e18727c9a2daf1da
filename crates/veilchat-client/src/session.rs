//! The per-login actor.
//!
//! One task owns the identity, the session key store, the exchange
//! coordinator and the conversation log. It multiplexes relay traffic,
//! exchange completions and user commands with `tokio::select!`, so no state
//! is shared across tasks except through the stores' own locks.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use veilchat_crypto::{
    CryptoError, EncryptedEnvelope, IdentityManager, PublicKeyRecord, SessionKeyStore,
};
use veilchat_protocol::{ClientMessage, PeerInfo, ServerMessage, WireEnvelope};

use crate::config::ExchangeConfig;
use crate::conversation::{ConversationStore, Message};
use crate::error::ClientError;
use crate::exchange::{ExchangeEvent, ExchangeNotice, KeyExchangeCoordinator};
use crate::transport::Transport;

#[derive(Debug)]
pub enum SessionCommand {
    Send { to: String, text: String },
    MarkRead { peer: String },
    Logout,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Key pair generated and presence announced.
    IdentityReady,
    Joined { peers: Vec<String> },
    JoinRejected { reason: String },
    PeerOnline { peer: String },
    PeerOffline { peer: String },
    SecureChannelReady { peer: String },
    KeyExchangeAbandoned { peer: String, attempts: u8, reason: String },
    MessageReceived { message: Message },
    MessageSent { message: Message },
    SendFailed { peer: String, reason: String },
    DecryptFailed { peer: String, reason: String },
    /// Non-fatal error reported by the relay.
    TransportError { description: String },
    Fatal { reason: String },
    Disconnected,
    LoggedOut,
}

/// Caller's side of a running session.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    conversations: Arc<ConversationStore>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn send_message(&self, to: &str, text: &str) -> Result<(), ClientError> {
        self.command(SessionCommand::Send {
            to: to.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn mark_read(&self, peer: &str) -> Result<(), ClientError> {
        self.command(SessionCommand::MarkRead {
            peer: peer.to_string(),
        })
        .await
    }

    /// Next event, or `None` once the session has stopped.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    /// Log out and wait for the actor to finish.
    pub async fn logout(self) {
        let _ = self.commands.send(SessionCommand::Logout).await;
        if let Err(e) = self.task.await {
            error!("session task failed: {}", e);
        }
    }

    async fn command(&self, command: SessionCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

pub struct Session<T: Transport> {
    username: String,
    identity: Arc<IdentityManager>,
    keys: Arc<SessionKeyStore>,
    transport: Arc<T>,
    coordinator: KeyExchangeCoordinator<IdentityManager, T>,
    conversations: Arc<ConversationStore>,
    events: mpsc::UnboundedSender<SessionEvent>,
    keygen_timeout: Duration,
}

impl<T: Transport> Session<T> {
    /// Start the actor.
    ///
    /// If `identity` has no key pair yet one is generated first; presence is
    /// announced once it exists. `inbound` carries relay messages and its
    /// closing ends the session.
    pub fn spawn(
        username: impl Into<String>,
        identity: Arc<IdentityManager>,
        transport: Arc<T>,
        inbound: mpsc::Receiver<ServerMessage>,
        config: &ExchangeConfig,
    ) -> SessionHandle {
        let username = username.into();
        let keys = Arc::new(SessionKeyStore::new());
        let conversations = Arc::new(ConversationStore::new());
        let (coordinator, exchange_events) = KeyExchangeCoordinator::new(
            username.clone(),
            Arc::clone(&identity),
            Arc::clone(&transport),
            Arc::clone(&keys),
            config,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(64);

        let session = Self {
            username,
            identity,
            keys,
            transport,
            coordinator,
            conversations: Arc::clone(&conversations),
            events: events_tx,
            keygen_timeout: config.keygen_timeout(),
        };
        let task = tokio::spawn(session.run(inbound, commands_rx, exchange_events));

        SessionHandle {
            commands: commands_tx,
            events: events_rx,
            conversations,
            task,
        }
    }

    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<ServerMessage>,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut exchange_events: mpsc::UnboundedReceiver<ExchangeEvent>,
    ) {
        let (keygen_tx, mut keygen_rx) = oneshot::channel();
        let mut keygen_pending = true;
        {
            let identity = Arc::clone(&self.identity);
            let bound = self.keygen_timeout;
            tokio::spawn(async move {
                let result = match identity.public_key() {
                    Some(public) => Ok(public),
                    None => identity.generate_key_pair(bound).await,
                };
                let _ = keygen_tx.send(result);
            });
        }

        loop {
            let flow = tokio::select! {
                result = &mut keygen_rx, if keygen_pending => {
                    keygen_pending = false;
                    match result {
                        Ok(Ok(public)) => self.on_identity_ready(public).await,
                        Ok(Err(e)) => self.fatal(e.to_string()),
                        Err(_) => self.fatal("key generation task dropped".into()),
                    }
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => self.on_server_message(msg).await,
                    None => {
                        info!("relay connection closed");
                        self.emit(SessionEvent::Disconnected);
                        ControlFlow::Break(())
                    }
                },
                Some(event) = exchange_events.recv() => {
                    if let Err(e) = self.coordinator.handle_event(event).await {
                        warn!("key exchange send failed: {}", e);
                    }
                    ControlFlow::Continue(())
                }
                command = commands.recv() => match command {
                    Some(SessionCommand::Logout) | None => {
                        self.logout().await;
                        ControlFlow::Break(())
                    }
                    Some(command) => {
                        self.on_command(command).await;
                        ControlFlow::Continue(())
                    }
                },
            };
            self.flush_notices();
            if flow.is_break() {
                break;
            }
        }

        self.coordinator.reset();
        self.keys.clear();
        debug!("session actor stopped");
    }

    async fn on_identity_ready(&mut self, public: PublicKeyRecord) -> ControlFlow<()> {
        if let Err(e) = self.transport.announce(&self.username, public.as_pem()).await {
            return self.fatal(format!("failed to announce presence: {e}"));
        }
        info!(username = %self.username, "presence announced");
        self.emit(SessionEvent::IdentityReady);

        if let Err(e) = self.coordinator.on_identity_ready().await {
            warn!("failed to resume deferred exchanges: {}", e);
        }
        ControlFlow::Continue(())
    }

    async fn on_server_message(&mut self, msg: ServerMessage) -> ControlFlow<()> {
        match msg {
            ServerMessage::Joined { peers } => {
                info!(peers = peers.len(), "joined relay");
                let names = peers.iter().map(|p| p.username.clone()).collect();
                self.emit(SessionEvent::Joined { peers: names });
                for peer in peers {
                    self.peer_joined(peer).await;
                }
            }
            ServerMessage::JoinRejected { reason } => {
                warn!(reason = %reason, "join rejected");
                self.emit(SessionEvent::JoinRejected { reason });
                return ControlFlow::Break(());
            }
            ServerMessage::PeerJoined { peer } => {
                self.emit(SessionEvent::PeerOnline {
                    peer: peer.username.clone(),
                });
                self.peer_joined(peer).await;
            }
            ServerMessage::PeerLeft { username } => {
                info!(peer = %username, "peer left");
                self.coordinator.peer_left(&username);
                self.emit(SessionEvent::PeerOffline { peer: username });
            }
            ServerMessage::KeyExchangeRequested { from } => {
                if let Err(e) = self.coordinator.on_exchange_requested(&from).await {
                    warn!(peer = %from, "failed to answer key exchange: {}", e);
                }
            }
            ServerMessage::WrappedKey { from, wrapped_key } => {
                if let Err(e) = self.coordinator.on_wrapped_key(&from, wrapped_key).await {
                    warn!(peer = %from, "failed to process wrapped key: {}", e);
                }
            }
            ServerMessage::Message {
                from,
                envelope,
                timestamp,
            } => self.on_message(from, &envelope, timestamp),
            ServerMessage::Error { message } => {
                warn!(error = %message, "relay reported an error");
                self.emit(SessionEvent::TransportError {
                    description: message,
                });
            }
        }
        ControlFlow::Continue(())
    }

    async fn peer_joined(&mut self, peer: PeerInfo) {
        if peer.username == self.username {
            return;
        }
        let public_key = match PublicKeyRecord::parse(&peer.public_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(peer = %peer.username, error = %e, "ignoring peer with unusable public key");
                return;
            }
        };
        if let Err(e) = self
            .coordinator
            .initiate_exchange(&peer.username, public_key)
            .await
        {
            warn!(peer = %peer.username, "failed to request key exchange: {}", e);
        }
    }

    fn on_message(&mut self, from: String, envelope: &WireEnvelope, timestamp: u64) {
        match self.open(&from, envelope) {
            Ok(body) => {
                let message = Message::incoming(&from, &self.username, body, timestamp);
                self.conversations.append(&from, message.clone());
                self.emit(SessionEvent::MessageReceived { message });
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping undecryptable message");
                self.emit(SessionEvent::DecryptFailed {
                    peer: from,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn open(&self, from: &str, wire: &WireEnvelope) -> Result<String, ClientError> {
        let envelope = EncryptedEnvelope::from_wire(wire)?;
        let plaintext = self.keys.decrypt_from(from, &envelope)?;
        let body = String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".into()))?;
        Ok(body)
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send { to, text } => self.send_text(to, text).await,
            SessionCommand::MarkRead { peer } => self.conversations.mark_read(&peer),
            SessionCommand::Logout => {}
        }
    }

    async fn send_text(&mut self, to: String, text: String) {
        let result = match self.keys.encrypt_for(&to, text.as_bytes()) {
            Ok(envelope) => {
                self.transport
                    .send(ClientMessage::SendMessage {
                        to: to.clone(),
                        envelope: envelope.to_wire(),
                    })
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                let message = Message::outgoing(&self.username, &to, text);
                self.conversations.append(&to, message.clone());
                self.emit(SessionEvent::MessageSent { message });
            }
            Err(e) => {
                warn!(peer = %to, error = %e, "message not sent");
                self.emit(SessionEvent::SendFailed {
                    peer: to,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn logout(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            debug!("disconnect during logout: {}", e);
        }
        self.coordinator.reset();
        self.keys.clear();
        self.identity.clear();
        self.conversations.clear();
        info!(username = %self.username, "logged out");
        self.emit(SessionEvent::LoggedOut);
    }

    fn flush_notices(&mut self) {
        for notice in self.coordinator.drain_notices() {
            let event = match notice {
                ExchangeNotice::Established { peer } => SessionEvent::SecureChannelReady { peer },
                ExchangeNotice::Abandoned {
                    peer,
                    attempts,
                    reason,
                } => SessionEvent::KeyExchangeAbandoned {
                    peer,
                    attempts,
                    reason: reason.to_string(),
                },
            };
            self.emit(event);
        }
    }

    fn fatal(&mut self, reason: String) -> ControlFlow<()> {
        error!(reason = %reason, "session failed");
        self.emit(SessionEvent::Fatal { reason });
        ControlFlow::Break(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use veilchat_crypto::{SessionKey, DEFAULT_KEYGEN_TIMEOUT};

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<ClientMessage>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    async fn started() -> (
        SessionHandle,
        Arc<RecordingTransport>,
        Arc<IdentityManager>,
        mpsc::Sender<ServerMessage>,
    ) {
        let identity = Arc::new(IdentityManager::new());
        identity.generate_key_pair(DEFAULT_KEYGEN_TIMEOUT).await.unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let mut handle = Session::spawn(
            "alice",
            Arc::clone(&identity),
            Arc::clone(&transport),
            inbound_rx,
            &ExchangeConfig::default(),
        );
        assert!(matches!(handle.next_event().await, Some(SessionEvent::IdentityReady)));
        (handle, transport, identity, inbound_tx)
    }

    #[tokio::test]
    async fn announces_presence_once_ready() {
        let (_handle, transport, identity, _inbound) = started().await;
        let sent = transport.sent.lock().unwrap();
        match &sent[0] {
            ClientMessage::Join {
                username,
                public_key,
                ..
            } => {
                assert_eq!(username, "alice");
                assert_eq!(public_key, identity.public_key().unwrap().as_pem());
            }
            other => panic!("expected Join, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_without_session_key_fails_for_that_peer_only() {
        let (mut handle, transport, _identity, _inbound) = started().await;
        handle.send_message("bob", "hi").await.unwrap();

        match handle.next_event().await.unwrap() {
            SessionEvent::SendFailed { peer, reason } => {
                assert_eq!(peer, "bob");
                assert!(reason.contains("no session key"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(handle.conversations().history("bob").is_empty());
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn relay_error_is_not_fatal() {
        let (mut handle, _transport, _identity, inbound) = started().await;
        inbound
            .send(ServerMessage::Error {
                message: "unknown peer: zed".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            handle.next_event().await,
            Some(SessionEvent::TransportError { .. })
        ));

        inbound
            .send(ServerMessage::PeerLeft {
                username: "zed".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            handle.next_event().await,
            Some(SessionEvent::PeerOffline { .. })
        ));
    }

    #[tokio::test]
    async fn undecryptable_message_is_reported() {
        let (mut handle, _transport, _identity, inbound) = started().await;
        let key = SessionKey::generate().unwrap();
        let envelope = veilchat_crypto::encrypt(b"hi", &key).unwrap().to_wire();
        inbound
            .send(ServerMessage::Message {
                from: "bob".into(),
                envelope,
                timestamp: 1,
            })
            .await
            .unwrap();

        match handle.next_event().await.unwrap() {
            SessionEvent::DecryptFailed { peer, .. } => assert_eq!(peer, "bob"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(handle.conversations().history("bob").is_empty());
    }

    #[tokio::test]
    async fn join_rejection_ends_session() {
        let (mut handle, _transport, _identity, inbound) = started().await;
        inbound
            .send(ServerMessage::JoinRejected {
                reason: "username already taken".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            handle.next_event().await,
            Some(SessionEvent::JoinRejected { .. })
        ));
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn logout_discards_identity() {
        let (handle, transport, identity, _inbound) = started().await;
        handle.logout().await;
        assert!(!identity.is_ready());
        assert!(matches!(
            transport.sent.lock().unwrap().last(),
            Some(ClientMessage::Disconnect)
        ));
    }

    #[tokio::test]
    async fn closed_relay_reports_disconnect() {
        let (mut handle, _transport, _identity, inbound) = started().await;
        drop(inbound);
        assert!(matches!(handle.next_event().await, Some(SessionEvent::Disconnected)));
        assert!(handle.next_event().await.is_none());
    }
}
