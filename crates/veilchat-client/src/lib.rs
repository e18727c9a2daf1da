//! veilchat client core.
//!
//! - [`exchange`]: per-peer hybrid key exchange with bounded retries
//! - [`conversation`]: per-peer plaintext history and unread flags
//! - [`session`]: the actor tying identity, keys, exchange and relay together
//! - [`transport`]: the relay connection

pub mod config;
pub mod conversation;
pub mod error;
pub mod exchange;
pub mod retry;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, ExchangeConfig};
pub use conversation::{ConversationStore, Direction, Message};
pub use error::ClientError;
pub use exchange::{
    ExchangeCrypto, ExchangeEvent, ExchangeNotice, ExchangeState, KeyExchangeCoordinator,
    PendingAction, PendingExchange,
};
pub use session::{Session, SessionCommand, SessionEvent, SessionHandle};
pub use transport::{Connection, Transport};
