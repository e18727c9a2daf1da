//! In-process relay used by the integration tests.
//!
//! Routes client messages between named sessions the same way the TCP relay
//! does, without sockets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use veilchat_client::{ClientError, SessionEvent, SessionHandle, Transport};
use veilchat_protocol::{ClientMessage, PeerInfo, ServerMessage};

pub struct RouterTransport {
    from: String,
    outbox: mpsc::UnboundedSender<Routed>,
}

#[async_trait]
impl Transport for RouterTransport {
    async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.outbox
            .send(Routed::Client {
                from: self.from.clone(),
                msg,
            })
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

enum Routed {
    Connect {
        username: String,
        inbox: mpsc::Sender<ServerMessage>,
    },
    Client {
        from: String,
        msg: ClientMessage,
    },
}

pub struct Relay {
    outbox: mpsc::UnboundedSender<Routed>,
}

impl Relay {
    pub fn start() -> Self {
        Self::spawn(false)
    }

    /// A relay that flips one bit of every forwarded ciphertext.
    pub fn start_tampering() -> Self {
        Self::spawn(true)
    }

    fn spawn(tamper: bool) -> Self {
        let (outbox, rx) = mpsc::unbounded_channel();
        tokio::spawn(route(rx, tamper));
        Self { outbox }
    }

    pub fn connect(&self, username: &str) -> (Arc<RouterTransport>, mpsc::Receiver<ServerMessage>) {
        let (inbox, inbound) = mpsc::channel(256);
        let _ = self.outbox.send(Routed::Connect {
            username: username.to_string(),
            inbox,
        });
        let transport = Arc::new(RouterTransport {
            from: username.to_string(),
            outbox: self.outbox.clone(),
        });
        (transport, inbound)
    }
}

async fn route(mut rx: mpsc::UnboundedReceiver<Routed>, tamper: bool) {
    let mut inboxes: HashMap<String, mpsc::Sender<ServerMessage>> = HashMap::new();
    let mut joined: Vec<PeerInfo> = Vec::new();
    let mut clock = 0u64;

    while let Some(routed) = rx.recv().await {
        let (from, msg) = match routed {
            Routed::Connect { username, inbox } => {
                inboxes.insert(username, inbox);
                continue;
            }
            Routed::Client { from, msg } => (from, msg),
        };

        let deliver = |to: &str, msg: ServerMessage| {
            let inbox = inboxes.get(to).cloned();
            async move {
                if let Some(inbox) = inbox {
                    let _ = inbox.send(msg).await;
                }
            }
        };
        let is_online = |name: &str| joined.iter().any(|p| p.username == name);

        match msg {
            ClientMessage::Join {
                username,
                public_key,
                ..
            } => {
                let peer = PeerInfo {
                    username: username.clone(),
                    public_key,
                };
                deliver(
                    &username,
                    ServerMessage::Joined {
                        peers: joined.clone(),
                    },
                )
                .await;
                for other in &joined {
                    deliver(&other.username, ServerMessage::PeerJoined { peer: peer.clone() }).await;
                }
                joined.push(peer);
            }
            ClientMessage::RequestKeyExchange { to } if is_online(&to) => {
                deliver(&to, ServerMessage::KeyExchangeRequested { from }).await;
            }
            ClientMessage::WrappedKey { to, wrapped_key } if is_online(&to) => {
                deliver(
                    &to,
                    ServerMessage::WrappedKey {
                        from,
                        wrapped_key,
                    },
                )
                .await;
            }
            ClientMessage::SendMessage { to, mut envelope } if is_online(&to) => {
                if tamper {
                    envelope.ciphertext = flip_first_bit(&envelope.ciphertext);
                }
                clock += 1;
                deliver(
                    &to,
                    ServerMessage::Message {
                        from,
                        envelope,
                        timestamp: clock,
                    },
                )
                .await;
            }
            ClientMessage::Disconnect => {
                joined.retain(|p| p.username != from);
                for other in &joined {
                    deliver(
                        &other.username,
                        ServerMessage::PeerLeft {
                            username: from.clone(),
                        },
                    )
                    .await;
                }
                inboxes.remove(&from);
            }
            other => {
                deliver(
                    &from,
                    ServerMessage::Error {
                        message: format!("cannot route {other:?}"),
                    },
                )
                .await;
            }
        }
    }
}

fn flip_first_bit(b64: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let mut bytes = STANDARD.decode(b64).unwrap_or_default();
    if let Some(first) = bytes.first_mut() {
        *first ^= 0x01;
    }
    STANDARD.encode(bytes)
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_for<F>(handle: &mut SessionHandle, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match handle.next_event().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("session stopped while waiting"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}
