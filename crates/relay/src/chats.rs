//! Chat membership collaborator.
//!
//! Membership lives outside the relay proper; handlers re-read it from the
//! [`ChatStore`] on every membership change instead of caching it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use protocol::messages::{ChatInfo, ChatKind};
use protocol::{ChatId, UserId};
use thiserror::Error;

/// Errors returned by chat store operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("chat not found: {0}")]
    NotFound(ChatId),

    #[error("user {user_id} is not a member of chat {chat_id}")]
    NotMember { chat_id: ChatId, user_id: UserId },

    #[error("user {user_id} is already a member of chat {chat_id}")]
    AlreadyMember { chat_id: ChatId, user_id: UserId },

    #[error("invalid chat: {0}")]
    Invalid(String),

    #[error("chat store unavailable: {0}")]
    Unavailable(String),
}

/// Storage of chats and their members.
pub trait ChatStore: Send + Sync {
    /// Create a chat owned by `owner` with `members` besides the owner.
    fn create_chat(
        &self,
        owner: UserId,
        kind: ChatKind,
        name: Option<String>,
        members: &[UserId],
    ) -> Result<ChatInfo, ChatError>;

    /// Look up a chat.
    fn chat(&self, chat_id: ChatId) -> Result<ChatInfo, ChatError>;

    /// Current members of a chat.
    fn members(&self, chat_id: ChatId) -> Result<Vec<UserId>, ChatError> {
        self.chat(chat_id).map(|chat| chat.members)
    }

    /// Add a member and return the updated chat.
    fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatInfo, ChatError>;

    /// Remove a member and return the updated chat.
    fn remove_member(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatInfo, ChatError>;
}

#[derive(Debug, Clone)]
struct ChatRecord {
    kind: ChatKind,
    name: Option<String>,
    owner_id: UserId,
    members: BTreeSet<UserId>,
}

impl ChatRecord {
    fn info(&self, chat_id: ChatId) -> ChatInfo {
        ChatInfo {
            chat_id,
            kind: self.kind,
            name: self.name.clone(),
            owner_id: self.owner_id,
            members: self.members.iter().copied().collect(),
        }
    }
}

/// Chat store holding everything in memory.
#[derive(Debug)]
pub struct MemoryChatStore {
    chats: RwLock<HashMap<ChatId, ChatRecord>>,
    next_id: AtomicI64,
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self {
            chats: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn update<F>(&self, chat_id: ChatId, f: F) -> Result<ChatInfo, ChatError>
    where
        F: FnOnce(&mut ChatRecord) -> Result<(), ChatError>,
    {
        let mut chats = self
            .chats
            .write()
            .map_err(|_| ChatError::Unavailable("failed to acquire write lock".to_string()))?;
        let record = chats.get_mut(&chat_id).ok_or(ChatError::NotFound(chat_id))?;
        f(record)?;
        Ok(record.info(chat_id))
    }
}

impl ChatStore for MemoryChatStore {
    fn create_chat(
        &self,
        owner: UserId,
        kind: ChatKind,
        name: Option<String>,
        members: &[UserId],
    ) -> Result<ChatInfo, ChatError> {
        let mut set: BTreeSet<UserId> = members.iter().copied().collect();
        set.insert(owner);

        if kind == ChatKind::Private && set.len() != 2 {
            return Err(ChatError::Invalid(format!(
                "a private chat has exactly two members, got {}",
                set.len()
            )));
        }

        let chat_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = ChatRecord {
            kind,
            name,
            owner_id: owner,
            members: set,
        };
        let info = record.info(chat_id);

        self.chats
            .write()
            .map_err(|_| ChatError::Unavailable("failed to acquire write lock".to_string()))?
            .insert(chat_id, record);

        tracing::debug!(chat_id, owner, kind = ?kind, "Chat created");
        Ok(info)
    }

    fn chat(&self, chat_id: ChatId) -> Result<ChatInfo, ChatError> {
        let chats = self
            .chats
            .read()
            .map_err(|_| ChatError::Unavailable("failed to acquire read lock".to_string()))?;
        chats
            .get(&chat_id)
            .map(|record| record.info(chat_id))
            .ok_or(ChatError::NotFound(chat_id))
    }

    fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatInfo, ChatError> {
        self.update(chat_id, |record| {
            if !record.members.insert(user_id) {
                return Err(ChatError::AlreadyMember { chat_id, user_id });
            }
            Ok(())
        })
    }

    fn remove_member(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatInfo, ChatError> {
        self.update(chat_id, |record| {
            if !record.members.remove(&user_id) {
                return Err(ChatError::NotMember { chat_id, user_id });
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_group() {
        let store = MemoryChatStore::new();
        let chat = store
            .create_chat(1, ChatKind::Group, Some("team".to_string()), &[3, 2, 3])
            .unwrap();
        assert_eq!(chat.owner_id, 1);
        assert_eq!(chat.members, vec![1, 2, 3]);
        assert_eq!(store.chat(chat.chat_id).unwrap(), chat);
    }

    #[test]
    fn test_private_chat_needs_two_members() {
        let store = MemoryChatStore::new();
        assert!(store.create_chat(1, ChatKind::Private, None, &[2]).is_ok());
        assert!(matches!(
            store.create_chat(1, ChatKind::Private, None, &[]),
            Err(ChatError::Invalid(_))
        ));
        assert!(matches!(
            store.create_chat(1, ChatKind::Private, None, &[2, 3]),
            Err(ChatError::Invalid(_))
        ));
    }

    #[test]
    fn test_add_and_remove_member() {
        let store = MemoryChatStore::new();
        let chat = store.create_chat(1, ChatKind::Group, None, &[]).unwrap();

        let updated = store.add_member(chat.chat_id, 2).unwrap();
        assert_eq!(updated.members, vec![1, 2]);
        assert_eq!(
            store.add_member(chat.chat_id, 2),
            Err(ChatError::AlreadyMember {
                chat_id: chat.chat_id,
                user_id: 2
            })
        );

        let updated = store.remove_member(chat.chat_id, 2).unwrap();
        assert_eq!(updated.members, vec![1]);
        assert_eq!(
            store.remove_member(chat.chat_id, 2),
            Err(ChatError::NotMember {
                chat_id: chat.chat_id,
                user_id: 2
            })
        );
    }

    #[test]
    fn test_unknown_chat() {
        let store = MemoryChatStore::new();
        assert_eq!(store.chat(99), Err(ChatError::NotFound(99)));
        assert_eq!(store.members(99), Err(ChatError::NotFound(99)));
        assert_eq!(store.add_member(99, 1), Err(ChatError::NotFound(99)));
    }
}
