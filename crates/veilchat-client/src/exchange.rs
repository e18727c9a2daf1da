//! Pairwise session key negotiation.
//!
//! For every peer the coordinator runs a small state machine:
//!
//! ```text
//! Idle -> Requested -> AwaitingUnwrap -> Established
//!              \-> Failed(n) -> Requested ...  -> Abandoned
//! ```
//!
//! The requester sends `RequestKeyExchange`. The responder generates a fresh
//! session key, wraps it under the requester's public key, installs it and
//! replies with `WrappedKey`. The requester unwraps and installs.
//!
//! RSA work runs on the blocking pool; results come back to the owning actor
//! as [`ExchangeEvent`]s together with a generation number, so a result that
//! was overtaken (peer left, newer attempt started) is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use veilchat_crypto::{
    decode_wrapped_key, wrap_session_key, CryptoError, IdentityManager, PublicKeyRecord,
    SessionKey, SessionKeyStore,
};
use veilchat_protocol::ClientMessage;

use crate::config::ExchangeConfig;
use crate::error::ClientError;
use crate::retry::RetryScheduler;
use crate::transport::Transport;

/// The asymmetric operations the coordinator needs.
pub trait ExchangeCrypto: Send + Sync + 'static {
    /// Whether the local key pair exists.
    fn is_ready(&self) -> bool;

    /// Size a wrapped key addressed to us must have.
    fn wrapped_key_len(&self) -> Option<usize>;

    /// Decrypt a wrapped key with the local private key.
    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// Generate a fresh session key and wrap it for `peer`.
    fn wrap_fresh_key(&self, peer: &PublicKeyRecord) -> Result<(SessionKey, String), CryptoError> {
        let key = SessionKey::generate()?;
        let wrapped = wrap_session_key(peer, &key)?;
        Ok((key, wrapped))
    }
}

impl ExchangeCrypto for IdentityManager {
    fn is_ready(&self) -> bool {
        IdentityManager::is_ready(self)
    }

    fn wrapped_key_len(&self) -> Option<usize> {
        IdentityManager::wrapped_key_len(self)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.unwrap_key_material(wrapped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Requested,
    AwaitingUnwrap,
    Established,
    /// Number of failed unwraps so far; a retry is scheduled.
    Failed(u8),
    Abandoned,
}

/// What to do when a pending exchange is resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    /// Send (or re-send) a key exchange request.
    Request,
    /// Unwrap a wrapped key that has not been processed yet.
    Unwrap { wrapped: String },
}

/// An exchange that has not completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExchange {
    /// Failed unwraps so far.
    pub attempts: u8,
    pub action: PendingAction,
    /// Queued until the local key pair exists. Does not count as a failure.
    pub awaiting_identity: bool,
}

/// Completion of asynchronous exchange work, posted back to the actor.
pub enum ExchangeEvent {
    RetryDue {
        peer: String,
        generation: u64,
    },
    UnwrapFinished {
        peer: String,
        generation: u64,
        result: Result<Zeroizing<Vec<u8>>, CryptoError>,
    },
    WrapFinished {
        peer: String,
        generation: u64,
        result: Result<(SessionKey, String), CryptoError>,
    },
}

/// Outcomes the session surfaces to the user.
#[derive(Debug, Clone)]
pub enum ExchangeNotice {
    Established {
        peer: String,
    },
    /// Terminal: raised once, no automatic retries follow.
    Abandoned {
        peer: String,
        attempts: u8,
        reason: CryptoError,
    },
}

struct PeerExchange {
    public_key: Option<PublicKeyRecord>,
    state: ExchangeState,
    pending: Option<PendingExchange>,
    generation: u64,
}

impl PeerExchange {
    fn new() -> Self {
        Self {
            public_key: None,
            state: ExchangeState::Idle,
            pending: None,
            generation: 0,
        }
    }

    fn attempts(&self) -> u8 {
        self.pending.as_ref().map_or(0, |p| p.attempts)
    }

    fn is_deferred(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| p.awaiting_identity)
    }
}

pub struct KeyExchangeCoordinator<C: ExchangeCrypto, T: Transport> {
    local: String,
    crypto: Arc<C>,
    transport: Arc<T>,
    keys: Arc<SessionKeyStore>,
    max_attempts: u8,
    peers: HashMap<String, PeerExchange>,
    retries: RetryScheduler,
    events: mpsc::UnboundedSender<ExchangeEvent>,
    notices: VecDeque<ExchangeNotice>,
    next_generation: u64,
}

impl<C: ExchangeCrypto, T: Transport> KeyExchangeCoordinator<C, T> {
    /// Build a coordinator for the local user `local`.
    ///
    /// The returned receiver must be drained by the owner and every event
    /// handed back through [`handle_event`](Self::handle_event).
    pub fn new(
        local: impl Into<String>,
        crypto: Arc<C>,
        transport: Arc<T>,
        keys: Arc<SessionKeyStore>,
        config: &ExchangeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ExchangeEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            local: local.into(),
            crypto,
            transport,
            keys,
            max_attempts: config.max_attempts.max(1),
            peers: HashMap::new(),
            retries: RetryScheduler::new(config.retry_delay(), events.clone()),
            events,
            notices: VecDeque::new(),
            next_generation: 0,
        };
        (coordinator, events_rx)
    }

    pub fn state(&self, peer: &str) -> ExchangeState {
        self.peers
            .get(peer)
            .map_or(ExchangeState::Idle, |entry| entry.state)
    }

    pub fn pending(&self, peer: &str) -> Option<&PendingExchange> {
        self.peers.get(peer).and_then(|entry| entry.pending.as_ref())
    }

    pub fn is_retry_scheduled(&self, peer: &str) -> bool {
        self.retries.is_scheduled(peer)
    }

    /// Take the notices produced since the last call.
    pub fn drain_notices(&mut self) -> Vec<ExchangeNotice> {
        self.notices.drain(..).collect()
    }

    /// Remember a peer's announced public key without starting an exchange.
    pub fn register_peer(&mut self, peer: &str, public_key: PublicKeyRecord) {
        self.entry(peer).public_key = Some(public_key);
    }

    /// Start an exchange with `peer`.
    ///
    /// Ignored while one is already in flight or established. From
    /// `Abandoned` this starts over with a fresh retry budget. Without a
    /// local key pair the request is queued until
    /// [`on_identity_ready`](Self::on_identity_ready).
    pub async fn initiate_exchange(
        &mut self,
        peer: &str,
        public_key: PublicKeyRecord,
    ) -> Result<(), ClientError> {
        self.register_peer(peer, public_key);

        let entry = self.entry(peer);
        if entry.is_deferred() {
            debug!(peer = %peer, "exchange already queued for identity");
            return Ok(());
        }
        match entry.state {
            ExchangeState::Idle | ExchangeState::Abandoned => {}
            state => {
                debug!(peer = %peer, ?state, "exchange already in progress, ignoring");
                return Ok(());
            }
        }
        entry.state = ExchangeState::Idle;
        entry.pending = None;

        self.send_request(peer, 0).await
    }

    /// Responder side: a peer asked us for a session key.
    pub async fn on_exchange_requested(&mut self, from: &str) -> Result<(), ClientError> {
        let we_answer_ties = self.local.as_str() < from;

        let Some(entry) = self.peers.get(from) else {
            warn!(peer = %from, "key exchange request from unknown peer");
            return Ok(());
        };
        let Some(public_key) = entry.public_key.clone() else {
            warn!(peer = %from, "key exchange request but no public key on record");
            return Ok(());
        };
        if matches!(
            entry.state,
            ExchangeState::Requested | ExchangeState::AwaitingUnwrap
        ) && !we_answer_ties
        {
            debug!(peer = %from, "simultaneous request, waiting for the peer's wrapped key");
            return Ok(());
        }

        let generation = self.bump(from);
        let crypto = Arc::clone(&self.crypto);
        let events = self.events.clone();
        let peer = from.to_string();
        tokio::task::spawn_blocking(move || {
            let result = crypto.wrap_fresh_key(&public_key);
            let _ = events.send(ExchangeEvent::WrapFinished {
                peer,
                generation,
                result,
            });
        });
        debug!(peer = %from, "wrapping fresh session key");
        Ok(())
    }

    /// Requester side: a wrapped session key arrived.
    ///
    /// Format problems are detected before the private key is used and
    /// count as a failed attempt like any unwrap failure. Keys arriving for
    /// an abandoned peer are dropped; only a new
    /// [`initiate_exchange`](Self::initiate_exchange) restarts it.
    pub async fn on_wrapped_key(&mut self, from: &str, armored: String) -> Result<(), ClientError> {
        if self.state(from) == ExchangeState::Abandoned {
            debug!(peer = %from, "exchange abandoned, dropping wrapped key");
            return Ok(());
        }
        if !self.crypto.is_ready() {
            let entry = self.entry(from);
            let attempts = entry.attempts();
            entry.pending = Some(PendingExchange {
                attempts,
                action: PendingAction::Unwrap { wrapped: armored },
                awaiting_identity: true,
            });
            debug!(peer = %from, "identity not ready, wrapped key queued");
            return Ok(());
        }

        self.retries.cancel(from);

        let wrapped = match decode_wrapped_key(&armored) {
            Ok(wrapped) => wrapped,
            Err(e) => {
                self.exchange_failed(from, e);
                return Ok(());
            }
        };
        let expected = self.crypto.wrapped_key_len();
        if expected != Some(wrapped.len()) {
            let e = CryptoError::KeyExchangeFormat(format!(
                "wrapped key is {} bytes, expected {}",
                wrapped.len(),
                expected.unwrap_or_default()
            ));
            self.exchange_failed(from, e);
            return Ok(());
        }

        let generation = self.bump(from);
        let entry = self.entry(from);
        let attempts = entry.attempts();
        entry.state = ExchangeState::AwaitingUnwrap;
        entry.pending = Some(PendingExchange {
            attempts,
            action: PendingAction::Unwrap { wrapped: armored },
            awaiting_identity: false,
        });

        let crypto = Arc::clone(&self.crypto);
        let events = self.events.clone();
        let peer = from.to_string();
        tokio::task::spawn_blocking(move || {
            let result = crypto.unwrap_key(&wrapped);
            let _ = events.send(ExchangeEvent::UnwrapFinished {
                peer,
                generation,
                result,
            });
        });
        Ok(())
    }

    /// Resume everything that was queued while the key pair was missing.
    pub async fn on_identity_ready(&mut self) -> Result<(), ClientError> {
        let deferred: Vec<(String, PendingExchange)> = self
            .peers
            .iter()
            .filter_map(|(peer, entry)| {
                entry
                    .pending
                    .as_ref()
                    .filter(|pending| pending.awaiting_identity)
                    .map(|pending| (peer.clone(), pending.clone()))
            })
            .collect();

        for (peer, pending) in deferred {
            info!(peer = %peer, "resuming deferred key exchange");
            match pending.action {
                PendingAction::Request => self.send_request(&peer, pending.attempts).await?,
                PendingAction::Unwrap { wrapped } => self.on_wrapped_key(&peer, wrapped).await?,
            }
        }
        Ok(())
    }

    /// Feed back the completion of a retry timer or a crypto task.
    pub async fn handle_event(&mut self, event: ExchangeEvent) -> Result<(), ClientError> {
        match event {
            ExchangeEvent::RetryDue { peer, generation } => {
                if !self.is_current(&peer, generation) {
                    return Ok(());
                }
                self.retries.fired(&peer);
                let attempts = match self.state(&peer) {
                    ExchangeState::Failed(attempts) => attempts,
                    _ => return Ok(()),
                };
                self.send_request(&peer, attempts).await
            }
            ExchangeEvent::UnwrapFinished {
                peer,
                generation,
                result,
            } => {
                if !self.is_current(&peer, generation) {
                    debug!(peer = %peer, "dropping stale unwrap result");
                    return Ok(());
                }
                match result.and_then(|raw| SessionKey::from_slice(&raw)) {
                    Ok(key) => self.establish(&peer, key),
                    Err(e) => self.exchange_failed(&peer, e),
                }
                Ok(())
            }
            ExchangeEvent::WrapFinished {
                peer,
                generation,
                result,
            } => {
                if !self.is_current(&peer, generation) {
                    debug!(peer = %peer, "dropping stale wrapped key");
                    return Ok(());
                }
                match result {
                    Ok((key, wrapped_key)) => {
                        self.establish(&peer, key);
                        self.transport
                            .send(ClientMessage::WrappedKey {
                                to: peer,
                                wrapped_key,
                            })
                            .await
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to wrap session key");
                        // Counts against our own attempt, which the wrap superseded.
                        if matches!(
                            self.state(&peer),
                            ExchangeState::Requested
                                | ExchangeState::AwaitingUnwrap
                                | ExchangeState::Failed(_)
                        ) {
                            self.exchange_failed(&peer, e);
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    /// The peer disconnected: forget its key, pending work and timer.
    pub fn peer_left(&mut self, peer: &str) {
        self.retries.cancel(peer);
        self.peers.remove(peer);
        if self.keys.remove(peer) {
            info!(peer = %peer, "session key invalidated");
        }
    }

    /// Drop all exchange state. Used on logout.
    pub fn reset(&mut self) {
        self.retries.cancel_all();
        self.peers.clear();
        self.notices.clear();
    }

    async fn send_request(&mut self, peer: &str, attempts: u8) -> Result<(), ClientError> {
        if !self.crypto.is_ready() {
            self.entry(peer).pending = Some(PendingExchange {
                attempts,
                action: PendingAction::Request,
                awaiting_identity: true,
            });
            debug!(peer = %peer, "identity not ready, exchange request deferred");
            return Ok(());
        }

        self.bump(peer);
        let entry = self.entry(peer);
        entry.state = ExchangeState::Requested;
        entry.pending = Some(PendingExchange {
            attempts,
            action: PendingAction::Request,
            awaiting_identity: false,
        });
        info!(peer = %peer, attempt = attempts + 1, "requesting key exchange");

        self.transport
            .send(ClientMessage::RequestKeyExchange {
                to: peer.to_string(),
            })
            .await
    }

    fn establish(&mut self, peer: &str, key: SessionKey) {
        self.keys.put(peer, key);
        self.retries.cancel(peer);
        let entry = self.entry(peer);
        entry.state = ExchangeState::Established;
        entry.pending = None;
        info!(peer = %peer, "secure channel established");
        self.notices.push_back(ExchangeNotice::Established {
            peer: peer.to_string(),
        });
    }

    fn exchange_failed(&mut self, peer: &str, reason: CryptoError) {
        let max_attempts = self.max_attempts;
        let entry = self.entry(peer);
        if entry.state == ExchangeState::Abandoned {
            debug!(peer = %peer, error = %reason, "exchange already abandoned");
            return;
        }
        let attempts = entry.attempts().saturating_add(1);

        if attempts < max_attempts {
            entry.state = ExchangeState::Failed(attempts);
            entry.pending = Some(PendingExchange {
                attempts,
                action: PendingAction::Request,
                awaiting_identity: false,
            });
            warn!(peer = %peer, attempt = attempts, error = %reason, "key exchange failed, retrying");
            let generation = self.bump(peer);
            self.retries.schedule(peer, generation);
        } else {
            entry.state = ExchangeState::Abandoned;
            entry.pending = None;
            self.retries.cancel(peer);
            error!(peer = %peer, attempts, error = %reason, "key exchange abandoned");
            self.notices.push_back(ExchangeNotice::Abandoned {
                peer: peer.to_string(),
                attempts,
                reason,
            });
        }
    }

    fn entry(&mut self, peer: &str) -> &mut PeerExchange {
        self.peers
            .entry(peer.to_string())
            .or_insert_with(PeerExchange::new)
    }

    fn bump(&mut self, peer: &str) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.entry(peer).generation = generation;
        generation
    }

    fn is_current(&self, peer: &str, generation: u64) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|entry| entry.generation == generation)
    }
}
