//! Persistence collaborator for processed messages.
//!
//! Everything stored here is display-ready: outgoing messages as the user
//! wrote them, incoming messages after the incoming chain. History is never
//! fed back through the pipeline.

use std::sync::{Mutex, PoisonError};

use protocol::{ChatId, ChatMessage, UserId};

/// Which conversation a stored message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conversation {
    Direct(UserId),
    Chat(ChatId),
}

impl Conversation {
    /// The conversation `message` belongs to, as seen by `me`.
    pub fn of(message: &ChatMessage, me: UserId) -> Option<Self> {
        match message.chat_id {
            Some(chat) => Some(Conversation::Chat(chat)),
            None => message.peer_of(me).map(Conversation::Direct),
        }
    }
}

/// Receives every message that cleared the pipeline.
pub trait MessageStore: Send + Sync {
    fn persist(&self, message: &ChatMessage);

    /// Stored messages for a conversation, oldest first.
    fn history(&self, me: UserId, conversation: Conversation) -> Vec<ChatMessage>;
}

/// In-memory message log.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<ChatMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored message, oldest first.
    pub fn all(&self) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MessageStore for MemoryMessageStore {
    fn persist(&self, message: &ChatMessage) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
    }

    fn history(&self, me: UserId, conversation: Conversation) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| Conversation::of(m, me) == Some(conversation))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_filters_by_conversation() {
        let store = MemoryMessageStore::new();
        store.persist(&ChatMessage::direct(1, 2, "to bob"));
        store.persist(&ChatMessage::direct(2, 1, "from bob"));
        store.persist(&ChatMessage::direct(1, 3, "to carol"));
        store.persist(&ChatMessage::to_chat(1, 10, "group"));

        let with_bob = store.history(1, Conversation::Direct(2));
        let texts: Vec<_> = with_bob
            .iter()
            .map(|m| m.content.as_text().unwrap())
            .collect();
        assert_eq!(texts, vec!["to bob", "from bob"]);

        assert_eq!(store.history(1, Conversation::Chat(10)).len(), 1);
        assert_eq!(store.len(), 4);
    }
}
