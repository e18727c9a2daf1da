use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from client to relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Announce presence. Must be the first message on a connection.
    Join {
        username: Username,
        /// Armored public key advertised to every other peer.
        public_key: String,
        /// Protocol version for forward compatibility.
        protocol_version: u32,
    },

    /// Ask `to` to generate a session key and wrap it under our public key.
    RequestKeyExchange { to: Username },

    /// Responder delivering a wrapped session key to the requester.
    WrappedKey {
        to: Username,
        /// Armored RSA-OAEP ciphertext of the session key.
        wrapped_key: String,
    },

    /// Deliver an encrypted message to a peer.
    SendMessage { to: Username, envelope: WireEnvelope },

    /// Client is disconnecting gracefully.
    Disconnect,
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join accepted. Carries every other peer currently online.
    Joined { peers: Vec<PeerInfo> },

    /// Join refused (bad username, duplicate, relay full, version mismatch).
    JoinRejected { reason: String },

    /// A new peer announced itself.
    PeerJoined { peer: PeerInfo },

    /// A peer disconnected.
    PeerLeft { username: Username },

    /// `from` asks us to respond with a wrapped session key.
    KeyExchangeRequested { from: Username },

    /// `from` answered a key exchange request with a wrapped session key.
    WrappedKey { from: Username, wrapped_key: String },

    /// An encrypted message from a peer.
    Message {
        from: Username,
        envelope: WireEnvelope,
        /// Relay receive time in unix milliseconds.
        timestamp: u64,
    },

    /// Non-fatal relay-side error (e.g. unknown target).
    Error { message: String },
}
