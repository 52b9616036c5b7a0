//! Envelope and message body definitions for the chat relay.
//!
//! Every packet exchanged on the relay port is an [`Envelope`]. The envelope
//! itself is MessagePack-encoded; its `payload` is a JSON document whose shape
//! is determined by the envelope [`Kind`]. Keeping the payload opaque at the
//! envelope level lets the relay forward bodies it does not need to inspect.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::content::ChatMessage;
use crate::error::{ProtocolError, Result};
use crate::framing::next_sequence_id;

/// Numeric identifier of a user account.
pub type UserId = i64;

/// Numeric identifier of a chat.
pub type ChatId = i64;

/// Discriminant of an envelope, encoded as a single byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Kind {
    // Session kinds
    /// Create an account and log in.
    Register = 1,
    /// Log in with existing credentials.
    Login = 2,
    /// Revoke the current session.
    Logout = 3,

    // Control kinds
    /// Keepalive request.
    Ping = 4,
    /// Keepalive reply.
    Pong = 5,
    /// Successful reply to a request; echoes the request sequence id.
    Response = 6,
    /// Failed reply to a request; echoes the request sequence id.
    Error = 7,

    // Message kinds
    /// Client asks the relay to deliver a chat message.
    SendMessage = 10,
    /// Relay delivers a chat message to a recipient.
    MessageReceived = 11,

    // Membership kinds
    /// Create a private or group chat.
    CreateChat = 20,
    /// Join a group chat.
    JoinChat = 21,
    /// Leave a chat.
    LeaveChat = 22,
    /// Remove another member from a group chat.
    KickMember = 23,
    /// Add another user to a group chat.
    InviteMember = 24,
    /// Fetch the current members of a chat.
    ListMembers = 25,
    /// Relay notifies members that the membership of a chat changed.
    ChatUpdated = 26,

    // Transfer kinds
    /// Relay notifies a recipient that a staged file can be downloaded.
    FileAvailable = 30,
    /// Query the status of a bulk transfer.
    TransferQuery = 31,
}

impl Kind {
    /// Kinds accepted from a connection that has not authenticated yet.
    pub fn is_session_opener(self) -> bool {
        matches!(self, Kind::Register | Kind::Login)
    }
}

impl From<Kind> for u8 {
    fn from(kind: Kind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for Kind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        let kind = match value {
            1 => Kind::Register,
            2 => Kind::Login,
            3 => Kind::Logout,
            4 => Kind::Ping,
            5 => Kind::Pong,
            6 => Kind::Response,
            7 => Kind::Error,
            10 => Kind::SendMessage,
            11 => Kind::MessageReceived,
            20 => Kind::CreateChat,
            21 => Kind::JoinChat,
            22 => Kind::LeaveChat,
            23 => Kind::KickMember,
            24 => Kind::InviteMember,
            25 => Kind::ListMembers,
            26 => Kind::ChatUpdated,
            30 => Kind::FileAvailable,
            31 => Kind::TransferQuery,
            other => return Err(ProtocolError::UnknownKind(other)),
        };
        Ok(kind)
    }
}

/// The framed unit of communication between client and relay.
///
/// `sequence_id` identifies a request for response correlation; replies
/// produced with [`Envelope::reply`] echo it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// What the payload contains.
    pub kind: Kind,
    /// Process-wide monotonic id, echoed by replies.
    pub sequence_id: i64,
    /// Sender as claimed by the client, or the origin user for relayed pushes.
    pub user_id: UserId,
    /// Session token, required on every request after login.
    pub session_token: Option<String>,
    /// JSON body for the kind.
    pub payload: String,
}

impl Envelope {
    /// Create an envelope with a fresh sequence id.
    pub fn new(kind: Kind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            sequence_id: next_sequence_id(),
            user_id: 0,
            session_token: None,
            payload: payload.into(),
        }
    }

    /// Create an envelope whose payload is the JSON form of `body`.
    pub fn with_body<T: Serialize>(kind: Kind, body: &T) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_string(body)?))
    }

    /// Attach the sender identity and session token.
    pub fn authenticated(mut self, user_id: UserId, token: impl Into<String>) -> Self {
        self.user_id = user_id;
        self.session_token = Some(token.into());
        self
    }

    /// Set the originating user without a token (used for relayed pushes).
    pub fn from_user(mut self, user_id: UserId) -> Self {
        self.user_id = user_id;
        self
    }

    /// Build a reply that echoes this envelope's sequence id.
    pub fn reply(&self, kind: Kind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            sequence_id: self.sequence_id,
            user_id: 0,
            session_token: None,
            payload: payload.into(),
        }
    }

    /// Build a reply carrying a JSON body.
    pub fn reply_with<T: Serialize>(&self, kind: Kind, body: &T) -> Result<Self> {
        Ok(self.reply(kind, serde_json::to_string(body)?))
    }

    /// Parse the payload as the body type for this kind.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload).map_err(|e| {
            ProtocolError::Deserialization(format!("{:?} payload: {}", self.kind, e))
        })
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ============================================================================
// Session Bodies
// ============================================================================

/// Username and password for `Register` and `Login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Reply to a successful `Register` or `Login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResult {
    /// The authenticated user.
    pub user_id: UserId,
    /// Token to place in every subsequent envelope.
    pub session_token: String,
}

// ============================================================================
// Chat Bodies
// ============================================================================

/// Whether a chat is a two-party conversation or an open group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
}

/// Request body for `CreateChat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateChat {
    pub kind: ChatKind,
    pub name: Option<String>,
    /// Initial members besides the creator.
    pub members: Vec<UserId>,
}

/// A chat and its current membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub owner_id: UserId,
    pub members: Vec<UserId>,
}

/// Request body naming a chat (`JoinChat`, `LeaveChat`, `ListMembers`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRef {
    pub chat_id: ChatId,
}

/// Request body naming a chat member (`KickMember`, `InviteMember`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub chat_id: ChatId,
    pub user_id: UserId,
}

/// What happened to a chat's membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Created,
    Joined,
    Left,
    Kicked,
    Invited,
}

/// Body of a `ChatUpdated` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub chat_id: ChatId,
    pub change: MembershipChange,
    /// The member whose status changed.
    pub user_id: UserId,
    /// Who caused the change.
    pub actor_id: UserId,
    /// Membership after the change.
    pub members: Vec<UserId>,
}

/// Reply to `SendMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Number of recipients the message was written to.
    pub delivered: u32,
}

/// Request body for `SendMessage` and push body for `MessageReceived`.
pub type MessageBody = ChatMessage;

// ============================================================================
// Transfer Bodies
// ============================================================================

/// Lifecycle of a bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Upload staged, waiting for the recipient.
    Pending,
    /// Bytes are currently moving.
    InProgress,
    /// The single permitted download finished.
    Completed,
    /// The upload was refused (for example, too large).
    Rejected,
    /// The staged file was swept before anyone downloaded it.
    Cancelled,
    /// A short read or write interrupted the transfer.
    Failed,
}

impl TransferStatus {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Rejected | TransferStatus::Cancelled
        )
    }
}

/// Body of a `FileAvailable` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAvailable {
    pub transfer_id: String,
    pub sender_id: UserId,
    pub chat_id: Option<ChatId>,
    pub file_name: String,
    pub file_size: u64,
}

/// Request body for `TransferQuery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferQuery {
    pub transfer_id: String,
}

/// Reply to `TransferQuery`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub file_size: u64,
    pub bytes_transferred: u64,
}

// ============================================================================
// Control Bodies
// ============================================================================

/// Keepalive body shared by `Ping` and `Pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender's unix time in milliseconds.
    pub timestamp: u64,
}

/// Body of an `Error` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Whether the client may retry on the same connection.
    pub recoverable: bool,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// The envelope needs a valid session and none was presented.
    SessionRequired,
    /// Bad credentials.
    Unauthorized,
    /// Resource not found.
    NotFound,
    /// Invalid request or parameters.
    InvalidRequest,
    /// The caller may not perform this operation.
    PermissionDenied,
    /// Resource already exists.
    AlreadyExists,
    /// Server-side error.
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MessageContent;

    fn roundtrip(envelope: &Envelope) -> Envelope {
        let bytes = envelope.to_msgpack().expect("serialization failed");
        Envelope::from_msgpack(&bytes).expect("deserialization failed")
    }

    #[test]
    fn test_kind_byte_values() {
        assert_eq!(u8::from(Kind::Register), 1);
        assert_eq!(u8::from(Kind::SendMessage), 10);
        assert_eq!(u8::from(Kind::TransferQuery), 31);
        for byte in 0..=u8::MAX {
            if let Ok(kind) = Kind::try_from(byte) {
                assert_eq!(u8::from(kind), byte);
            }
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(matches!(Kind::try_from(0), Err(ProtocolError::UnknownKind(0))));
        assert!(matches!(Kind::try_from(99), Err(ProtocolError::UnknownKind(99))));
    }

    #[test]
    fn test_session_openers() {
        assert!(Kind::Login.is_session_opener());
        assert!(Kind::Register.is_session_opener());
        assert!(!Kind::SendMessage.is_session_opener());
        assert!(!Kind::Logout.is_session_opener());
    }

    #[test]
    fn test_envelope_roundtrip_with_token() {
        let envelope = Envelope::new(Kind::JoinChat, r#"{"chat_id":7}"#).authenticated(42, "tok");
        let decoded = roundtrip(&envelope);
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.session_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_envelope_roundtrip_without_token() {
        let envelope = Envelope::new(Kind::Ping, "");
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn test_new_envelopes_get_increasing_ids() {
        let a = Envelope::new(Kind::Ping, "");
        let b = Envelope::new(Kind::Ping, "");
        assert!(b.sequence_id > a.sequence_id);
        assert!(a.sequence_id > 0);
    }

    #[test]
    fn test_reply_echoes_sequence_id() {
        let request = Envelope::new(Kind::Login, "{}");
        let reply = request.reply(Kind::Response, "{}");
        assert_eq!(reply.sequence_id, request.sequence_id);
        assert_eq!(reply.kind, Kind::Response);
    }

    #[test]
    fn test_body_roundtrip() {
        let creds = Credentials {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let envelope = Envelope::with_body(Kind::Login, &creds).unwrap();
        let decoded: Credentials = roundtrip(&envelope).body().unwrap();
        assert_eq!(decoded, creds);
    }

    #[test]
    fn test_message_body_roundtrip() {
        let message = ChatMessage {
            chat_id: Some(3),
            sender_id: 1,
            recipient_id: None,
            content: MessageContent::text("hello, 世界"),
            sent_at: 1_700_000_000_000,
        };
        let envelope = Envelope::with_body(Kind::SendMessage, &message).unwrap();
        let decoded: ChatMessage = roundtrip(&envelope).body().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_body_wrong_shape() {
        let envelope = Envelope::new(Kind::Login, r#"{"chat_id":1}"#);
        let result: Result<Credentials> = envelope.body();
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_error_body_roundtrip() {
        let body = ErrorBody {
            code: ErrorCode::SessionRequired,
            message: "log in first".to_string(),
            recoverable: true,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("session_required"));
        let decoded: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_transfer_status_terminal() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Pending.is_terminal());
        assert!(!TransferStatus::Failed.is_terminal());
    }

    #[test]
    fn test_unknown_kind_in_msgpack_is_malformed() {
        let envelope = Envelope::new(Kind::Ping, "");
        let mut bytes = envelope.to_msgpack().unwrap();
        // Struct encodes as a fixarray; the kind is the first element.
        assert_eq!(bytes[1], u8::from(Kind::Ping));
        bytes[1] = 99;
        let result = Envelope::from_msgpack(&bytes);
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }
}
