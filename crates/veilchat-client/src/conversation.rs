//! Per-peer message history with unread tracking.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One plaintext message. Never leaves this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub body: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub direction: Direction,
}

impl Message {
    pub fn incoming(from: &str, to: &str, body: String, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: from.to_string(),
            receiver: to.to_string(),
            body,
            timestamp,
            direction: Direction::Incoming,
        }
    }

    pub fn outgoing(from: &str, to: &str, body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: from.to_string(),
            receiver: to.to_string(),
            body,
            timestamp: now_millis(),
            direction: Direction::Outgoing,
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
struct Conversation {
    messages: Vec<Message>,
    unread: bool,
}

/// Append-only message logs keyed by peer.
///
/// Appends to one peer take that peer's shard lock only, so they are atomic
/// with respect to `history` for the same peer.
#[derive(Default)]
pub struct ConversationStore {
    conversations: DashMap<String, Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` to the log for `peer`. Incoming messages mark the
    /// conversation unread.
    pub fn append(&self, peer: &str, message: Message) {
        let mut conversation = self.conversations.entry(peer.to_string()).or_default();
        if message.direction == Direction::Incoming {
            conversation.unread = true;
        }
        conversation.messages.push(message);
    }

    /// Snapshot of the log for `peer`, oldest first.
    pub fn history(&self, peer: &str) -> Vec<Message> {
        self.conversations
            .get(peer)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn mark_read(&self, peer: &str) {
        if let Some(mut conversation) = self.conversations.get_mut(peer) {
            conversation.unread = false;
        }
    }

    pub fn is_unread(&self, peer: &str) -> bool {
        self.conversations.get(peer).is_some_and(|c| c.unread)
    }

    /// Peers with unread messages, sorted by name.
    pub fn unread_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .conversations
            .iter()
            .filter(|entry| entry.value().unread)
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.conversations.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    pub fn clear(&self) {
        self.conversations.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn history_keeps_order() {
        let store = ConversationStore::new();
        store.append("bob", Message::outgoing("alice", "bob", "one".into()));
        store.append("bob", Message::incoming("bob", "alice", "two".into(), 5));
        store.append("bob", Message::outgoing("alice", "bob", "three".into()));

        let bodies: Vec<String> = store.history("bob").into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, ["one", "two", "three"]);
    }

    #[test]
    fn history_is_restartable() {
        let store = ConversationStore::new();
        store.append("bob", Message::incoming("bob", "alice", "hi".into(), 1));
        assert_eq!(store.history("bob"), store.history("bob"));
        assert!(store.history("nobody").is_empty());
    }

    #[test]
    fn incoming_marks_unread_until_read() {
        let store = ConversationStore::new();
        store.append("bob", Message::outgoing("alice", "bob", "hey".into()));
        assert!(!store.is_unread("bob"));

        store.append("bob", Message::incoming("bob", "alice", "yo".into(), 1));
        store.append("carol", Message::incoming("carol", "alice", "hi".into(), 2));
        assert_eq!(store.unread_peers(), ["bob", "carol"]);

        store.mark_read("bob");
        assert!(!store.is_unread("bob"));
        assert_eq!(store.unread_peers(), ["carol"]);
        assert_eq!(store.history("bob").len(), 2);
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Message::outgoing("alice", "bob", "x".into());
        let b = Message::outgoing("alice", "bob", "x".into());
        assert_ne!(a.id, b.id);
        assert_eq!(a.direction, Direction::Outgoing);
        assert!(a.timestamp > 0);
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let store = Arc::new(ConversationStore::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        store.append("bob", Message::incoming("bob", "alice", format!("{t}-{i}"), i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.history("bob").len(), 1000);
    }
}
