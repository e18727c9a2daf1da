//! Wire protocol shared by the veilchat client and relay.
//!
//! The relay only ever sees what is defined here: usernames, armored public
//! keys, armored wrapped session keys and base64 envelope fields. None of it
//! can be turned into plaintext without a peer's private key.

pub mod armor;
pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
pub use messages::{ClientMessage, ServerMessage};
pub use types::{PeerInfo, WireEnvelope};
