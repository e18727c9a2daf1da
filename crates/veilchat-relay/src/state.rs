use std::fmt;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use veilchat_protocol::codec::encode_server_msg;
use veilchat_protocol::{PeerInfo, ServerMessage};

use crate::config::RelayConfig;

pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 20;

/// A joined peer as the relay sees it.
pub struct Peer {
    /// Armored public key, passed through unread.
    pub public_key: String,
    /// Sender for pushing frames to this peer's writer task.
    pub tx: mpsc::Sender<Vec<u8>>,
}

/// Why a `Join` was refused. The display text is sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    VersionMismatch { client: u32, relay: u32 },
    InvalidUsername,
    UsernameTaken,
    MissingPublicKey,
    Full,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionMismatch { client, relay } => {
                write!(f, "protocol version mismatch: client={client}, relay={relay}")
            }
            Self::InvalidUsername => write!(
                f,
                "username must be {MIN_USERNAME_LEN}-{MAX_USERNAME_LEN} ASCII letters or digits"
            ),
            Self::UsernameTaken => write!(f, "username already taken"),
            Self::MissingPublicKey => write!(f, "public key is required"),
            Self::Full => write!(f, "relay is full"),
        }
    }
}

pub fn validate_username(username: &str) -> Result<(), Rejection> {
    let len = username.len();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len)
        || !username.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(Rejection::InvalidUsername);
    }
    Ok(())
}

/// Shared relay state.
///
/// Joins and departures are serialized by `membership` so every peer sees
/// a consistent roster: a joiner's `Joined` snapshot and the `PeerJoined`
/// broadcast to everyone else happen as one step. Nothing awaits another
/// peer's queue while the lock is held.
pub struct RelayState {
    peers: DashMap<String, Peer>,
    membership: Mutex<()>,
    pub max_users: u32,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            peers: DashMap::new(),
            membership: Mutex::new(()),
            max_users: config.max_users,
        }
    }

    pub fn user_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_username_taken(&self, username: &str) -> bool {
        self.peers.contains_key(username)
    }

    /// Everyone online except `except`.
    pub fn roster(&self, except: &str) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .filter(|entry| entry.key() != except)
            .map(|entry| PeerInfo {
                username: entry.key().clone(),
                public_key: entry.public_key.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.username.cmp(&b.username));
        peers
    }

    /// Admit a peer.
    ///
    /// `Joined` is queued on `tx` before the peer becomes visible, so nothing
    /// another peer forwards to it can overtake its roster. The peer is
    /// routable before anyone hears of it.
    pub async fn join(
        &self,
        username: &str,
        public_key: &str,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<Result<(), Rejection>> {
        if let Err(rejection) = validate_username(username) {
            return Ok(Err(rejection));
        }
        if public_key.trim().is_empty() {
            return Ok(Err(Rejection::MissingPublicKey));
        }

        let _guard = self.membership.lock().await;
        if self.is_username_taken(username) {
            return Ok(Err(Rejection::UsernameTaken));
        }
        if self.user_count() >= self.max_users as usize {
            return Ok(Err(Rejection::Full));
        }

        let peers = self.roster(username);
        send_msg(&tx, &ServerMessage::Joined { peers }).await?;

        self.peers.insert(
            username.to_string(),
            Peer {
                public_key: public_key.to_string(),
                tx,
            },
        );
        let info = PeerInfo {
            username: username.to_string(),
            public_key: public_key.to_string(),
        };
        self.broadcast(&ServerMessage::PeerJoined { peer: info }, username);
        Ok(Ok(()))
    }

    /// Remove a peer and tell everyone else. Returns false if it was not joined.
    pub async fn leave(&self, username: &str) -> bool {
        let _guard = self.membership.lock().await;
        if self.peers.remove(username).is_none() {
            return false;
        }
        let msg = ServerMessage::PeerLeft {
            username: username.to_string(),
        };
        self.broadcast(&msg, username);
        true
    }

    /// Queue `msg` for `to`. Returns false if `to` is not online.
    pub async fn forward(&self, to: &str, msg: &ServerMessage) -> bool {
        // Clone the sender so no map shard is held across the await.
        let Some(tx) = self.peers.get(to).map(|peer| peer.tx.clone()) else {
            return false;
        };
        if let Err(e) = send_msg(&tx, msg).await {
            debug!(peer = %to, "forward failed: {}", e);
        }
        true
    }

    /// Queue `msg` for everyone except `except` without waiting. A peer
    /// whose queue is full misses the frame.
    fn broadcast(&self, msg: &ServerMessage, except: &str) {
        let data = match encode_server_msg(msg) {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to encode broadcast: {}", e);
                return;
            }
        };
        for entry in self.peers.iter().filter(|entry| entry.key() != except) {
            match entry.tx.try_send(data.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %entry.key(), "send queue full, dropping broadcast");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(peer = %entry.key(), "broadcast to closed connection");
                }
            }
        }
    }
}

pub async fn send_msg(tx: &mpsc::Sender<Vec<u8>>, msg: &ServerMessage) -> Result<()> {
    let data = encode_server_msg(msg)?;
    tx.send(data)
        .await
        .map_err(|_| anyhow::anyhow!("TCP send channel closed"))?;
    Ok(())
}
