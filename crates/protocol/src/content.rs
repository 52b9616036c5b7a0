//! Chat message content.
//!
//! A chat message carries one of three kinds of content: text typed by a
//! user, a secure-channel handshake frame, or ciphertext. Handshake and
//! ciphertext frames travel through the same relay path as ordinary text so
//! the relay never needs to know whether two peers have a session key. The
//! display path must never render anything but [`MessageContent::PlainText`].

use serde::{Deserialize, Serialize};

use crate::messages::{ChatId, UserId};

/// A message authored by a user, as sent to and relayed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Chat the message belongs to, if any.
    pub chat_id: Option<ChatId>,
    /// Author of the message.
    pub sender_id: UserId,
    /// Single recipient for direct messages.
    pub recipient_id: Option<UserId>,
    /// What the message carries.
    pub content: MessageContent,
    /// Author's unix time in milliseconds.
    pub sent_at: u64,
}

impl ChatMessage {
    /// A direct text message to a single peer.
    pub fn direct(sender_id: UserId, recipient_id: UserId, text: impl Into<String>) -> Self {
        Self {
            chat_id: None,
            sender_id,
            recipient_id: Some(recipient_id),
            content: MessageContent::text(text),
            sent_at: now_millis(),
        }
    }

    /// A text message to every member of a chat.
    pub fn to_chat(sender_id: UserId, chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id: Some(chat_id),
            sender_id,
            recipient_id: None,
            content: MessageContent::text(text),
            sent_at: now_millis(),
        }
    }

    /// The peer on the other end of a direct message, seen from `me`.
    pub fn peer_of(&self, me: UserId) -> Option<UserId> {
        let recipient = self.recipient_id?;
        if self.sender_id == me {
            Some(recipient)
        } else if recipient == me {
            Some(self.sender_id)
        } else {
            None
        }
    }
}

/// Payload of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Human-readable text.
    PlainText { text: String },
    /// Secure channel control frame; never displayed.
    Handshake(Handshake),
    /// Text encrypted under a per-peer session key.
    Ciphertext {
        #[serde(with = "base64_bytes")]
        nonce: Vec<u8>,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::PlainText { text: text.into() }
    }

    /// The text if this content is displayable.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::PlainText { text } => Some(text),
            _ => None,
        }
    }
}

/// In-band key exchange frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Handshake {
    /// Sender has no key for the recipient and offers its public key.
    KeyRequest {
        #[serde(with = "base64_bytes")]
        public_key: Vec<u8>,
    },
    /// Reply to a key request with the responder's public key.
    PubKey {
        #[serde(with = "base64_bytes")]
        public_key: Vec<u8>,
    },
    /// A fresh session key sealed to the recipient's public key.
    Session {
        #[serde(with = "base64_bytes")]
        sealed_key: Vec<u8>,
    },
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_json_shape() {
        let json = serde_json::to_value(MessageContent::text("hi")).unwrap();
        assert_eq!(json["type"], "plain_text");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn test_handshake_json_shape() {
        let content = MessageContent::Handshake(Handshake::KeyRequest {
            public_key: vec![1, 2, 3],
        });
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["type"], "handshake");
        assert_eq!(json["phase"], "key_request");
        assert_eq!(json["public_key"], "AQID");

        let back: MessageContent = serde_json::from_value(json).unwrap();
        assert_eq!(back, content);
        assert!(back.as_text().is_none());
    }

    #[test]
    fn test_ciphertext_roundtrip() {
        let content = MessageContent::Ciphertext {
            nonce: vec![0; 12],
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let json = serde_json::to_string(&content).unwrap();
        let back: MessageContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn test_text_that_looks_like_a_tag_stays_text() {
        let content = MessageContent::text(r#"{"type":"handshake","phase":"session"}"#);
        let json = serde_json::to_string(&content).unwrap();
        let back: MessageContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_text(), Some(r#"{"type":"handshake","phase":"session"}"#));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let json = r#"{"type":"ciphertext","nonce":"***","data":""}"#;
        assert!(serde_json::from_str::<MessageContent>(json).is_err());
    }

    #[test]
    fn test_peer_of() {
        let message = ChatMessage::direct(1, 2, "hi");
        assert_eq!(message.peer_of(1), Some(2));
        assert_eq!(message.peer_of(2), Some(1));
        assert_eq!(message.peer_of(3), None);

        let group = ChatMessage::to_chat(1, 9, "hi all");
        assert_eq!(group.peer_of(1), None);
    }
}
