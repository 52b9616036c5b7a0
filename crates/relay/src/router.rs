//! Message router dispatching authenticated envelopes to handlers.
//!
//! Handlers never hold a connection: they look recipients up in the
//! [`ConnectionRegistry`] at send time. Membership-changing handlers re-read
//! the member list from the [`ChatStore`] and notify the membership as it
//! stood at the moment of the change, so a kicked member still receives its
//! own removal notice.

use std::sync::Arc;

use protocol::messages::{
    Ack, ChatInfo, ChatKind, ChatRef, CreateChat, Credentials, Heartbeat, LoginResult,
    MemberRef, MembershipChange, MembershipEvent, TransferInfo, TransferQuery,
};
use protocol::{ChatMessage, Envelope, ErrorBody, ErrorCode, Kind, ProtocolError, UserId};
use tracing::{debug, info, warn};

use crate::chats::{ChatError, ChatStore};
use crate::files::{TransferRecord, TransferStore};
use crate::identity::{IdentityError, IdentityProvider};
use crate::registry::{ConnectionRegistry, PacketWriter};

/// Result type for router operations.
pub type RouterResult = Result<Option<Envelope>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The envelope needs an authenticated session.
    #[error("session required: log in first")]
    SessionRequired,

    /// Account or credential error.
    #[error("authentication error: {0}")]
    Identity(#[from] IdentityError),

    /// Chat store error.
    #[error("chat error: {0}")]
    Chat(#[from] ChatError),

    /// Referenced user or transfer does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Permission denied error.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProtocolError> for RouterError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Deserialization(msg) => RouterError::InvalidRequest(msg),
            other => RouterError::Internal(other.to_string()),
        }
    }
}

impl RouterError {
    /// Convert the error to the body of an `Error` envelope.
    pub fn to_error_body(&self) -> ErrorBody {
        let (code, recoverable) = match self {
            RouterError::SessionRequired => (ErrorCode::SessionRequired, true),
            RouterError::Identity(e) => match e {
                IdentityError::InvalidCredentials => (ErrorCode::Unauthorized, true),
                IdentityError::UsernameTaken(_) => (ErrorCode::AlreadyExists, true),
                IdentityError::InvalidUsername(_) => (ErrorCode::InvalidRequest, true),
            },
            RouterError::Chat(e) => match e {
                ChatError::NotFound(_) => (ErrorCode::NotFound, false),
                ChatError::NotMember { .. } => (ErrorCode::PermissionDenied, false),
                ChatError::AlreadyMember { .. } => (ErrorCode::AlreadyExists, false),
                ChatError::Invalid(_) => (ErrorCode::InvalidRequest, false),
                ChatError::Unavailable(_) => (ErrorCode::InternalError, true),
            },
            RouterError::NotFound(_) => (ErrorCode::NotFound, false),
            RouterError::InvalidRequest(_) => (ErrorCode::InvalidRequest, false),
            RouterError::PermissionDenied(_) => (ErrorCode::PermissionDenied, false),
            RouterError::Internal(_) => (ErrorCode::InternalError, true),
        };

        ErrorBody {
            code,
            message: self.to_string(),
            recoverable,
        }
    }

    /// Build the `Error` reply to `request`.
    pub fn to_envelope(&self, request: &Envelope) -> Envelope {
        let body = self.to_error_body();
        request
            .reply_with(Kind::Error, &body)
            .unwrap_or_else(|_| request.reply(Kind::Error, body.message))
    }
}

/// An authenticated session bound to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
}

/// Message router that dispatches envelopes to the appropriate handler.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    identity: Arc<dyn IdentityProvider>,
    chats: Arc<dyn ChatStore>,
    transfers: Arc<TransferStore>,
}

impl MessageRouter {
    /// Create a new message router with the given collaborators.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        identity: Arc<dyn IdentityProvider>,
        chats: Arc<dyn ChatStore>,
        transfers: Arc<TransferStore>,
    ) -> Self {
        Self {
            registry,
            identity,
            chats,
            transfers,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle `Register` or `Login` and register `writer` for the user.
    ///
    /// Returns the reply and the new session.
    pub fn open_session(
        &self,
        envelope: &Envelope,
        writer: &Arc<PacketWriter>,
    ) -> Result<(Envelope, Session), RouterError> {
        let creds: Credentials = envelope.body()?;
        let user_id = match envelope.kind {
            Kind::Register => self.identity.register(&creds.username, &creds.password)?,
            Kind::Login => self.identity.authenticate(&creds.username, &creds.password)?,
            other => {
                return Err(RouterError::InvalidRequest(format!(
                    "{:?} does not open a session",
                    other
                )))
            }
        };

        let token = self.identity.create_session(user_id);
        if let Some(previous) = self.registry.register(user_id, writer.clone(), token.clone()) {
            if previous.connection_id() != writer.id() {
                info!(user_id, "Login replaced an existing connection");
            }
            self.identity.revoke_session(previous.session_token());
        }
        info!(user_id, connection_id = writer.id(), "Session opened");

        let reply = envelope.reply_with(
            Kind::Response,
            &LoginResult {
                user_id,
                session_token: token.clone(),
            },
        )?;
        Ok((reply, Session { user_id, token }))
    }

    /// True if `token` still identifies `session` with both the identity
    /// backend and the registry.
    pub fn is_session_valid(&self, session: &Session, token: Option<&str>) -> bool {
        let Some(token) = token else {
            return false;
        };
        token == session.token
            && self.identity.validate_session(token) == Some(session.user_id)
            && self.registry.is_current_session(session.user_id, token)
    }

    /// Revoke `session` and drop its registry entry.
    pub fn close_session(&self, session: &Session, connection_id: u64) {
        self.identity.revoke_session(&session.token);
        self.registry
            .unregister_connection(session.user_id, connection_id);
    }

    /// Route an envelope from an authenticated session.
    pub async fn route(&self, envelope: &Envelope, session: &Session) -> RouterResult {
        debug!(kind = ?envelope.kind, sequence = envelope.sequence_id, user_id = session.user_id, "Routing envelope");
        self.registry.touch(session.user_id);

        match envelope.kind {
            Kind::Ping => self.handle_ping(envelope),
            Kind::SendMessage => self.handle_send_message(envelope, session).await,
            Kind::CreateChat => self.handle_create_chat(envelope, session).await,
            Kind::JoinChat => self.handle_join_chat(envelope, session).await,
            Kind::LeaveChat => self.handle_leave_chat(envelope, session).await,
            Kind::KickMember => self.handle_kick_member(envelope, session).await,
            Kind::InviteMember => self.handle_invite_member(envelope, session).await,
            Kind::ListMembers => self.handle_list_members(envelope, session),
            Kind::TransferQuery => self.handle_transfer_query(envelope, session),
            Kind::Register | Kind::Login | Kind::Logout => Err(RouterError::InvalidRequest(
                format!("{:?} is handled by the connection loop", envelope.kind),
            )),
            Kind::Pong => {
                debug!("Received pong");
                Ok(None)
            }
            Kind::Error => {
                warn!(payload = %envelope.payload, "Received error from client");
                Ok(None)
            }
            Kind::Response
            | Kind::MessageReceived
            | Kind::ChatUpdated
            | Kind::FileAvailable => Err(RouterError::InvalidRequest(format!(
                "{:?} is sent by the relay, not to it",
                envelope.kind
            ))),
        }
    }

    // =========================================================================
    // Control Handlers
    // =========================================================================

    fn handle_ping(&self, envelope: &Envelope) -> RouterResult {
        let ping: Heartbeat = envelope.body()?;
        Ok(Some(envelope.reply_with(Kind::Pong, &ping)?))
    }

    // =========================================================================
    // Message Handlers
    // =========================================================================

    async fn handle_send_message(&self, envelope: &Envelope, session: &Session) -> RouterResult {
        let mut message: ChatMessage = envelope.body()?;
        message.sender_id = session.user_id;

        let recipients = match (message.chat_id, message.recipient_id) {
            (Some(chat_id), _) => {
                let chat = self.chats.chat(chat_id)?;
                require_member(&chat, session.user_id)?;
                except(&chat.members, session.user_id)
            }
            (None, Some(recipient)) => {
                if !self.identity.user_exists(recipient) {
                    return Err(RouterError::NotFound(format!("user {}", recipient)));
                }
                vec![recipient]
            }
            (None, None) => {
                return Err(RouterError::InvalidRequest(
                    "message needs a chat or a recipient".to_string(),
                ))
            }
        };

        let push = Envelope::with_body(Kind::MessageReceived, &message)?.from_user(session.user_id);
        let delivered = self.registry.broadcast(&push, &recipients).await;
        debug!(
            sender_id = session.user_id,
            recipients = recipients.len(),
            delivered,
            "Message relayed"
        );

        Ok(Some(envelope.reply_with(
            Kind::Response,
            &Ack {
                delivered: delivered as u32,
            },
        )?))
    }

    // =========================================================================
    // Membership Handlers
    // =========================================================================

    async fn handle_create_chat(&self, envelope: &Envelope, session: &Session) -> RouterResult {
        let req: CreateChat = envelope.body()?;
        if let Some(unknown) = req.members.iter().find(|id| !self.identity.user_exists(**id)) {
            return Err(RouterError::NotFound(format!("user {}", unknown)));
        }

        let chat = self
            .chats
            .create_chat(session.user_id, req.kind, req.name, &req.members)?;
        info!(chat_id = chat.chat_id, owner = session.user_id, "Chat created");

        self.announce(
            &chat,
            MembershipChange::Created,
            session.user_id,
            session.user_id,
            &except(&chat.members, session.user_id),
        )
        .await;
        Ok(Some(envelope.reply_with(Kind::Response, &chat)?))
    }

    async fn handle_join_chat(&self, envelope: &Envelope, session: &Session) -> RouterResult {
        let req: ChatRef = envelope.body()?;
        require_group(&self.chats.chat(req.chat_id)?)?;

        let chat = self.chats.add_member(req.chat_id, session.user_id)?;
        self.announce(
            &chat,
            MembershipChange::Joined,
            session.user_id,
            session.user_id,
            &except(&chat.members, session.user_id),
        )
        .await;
        Ok(Some(envelope.reply_with(Kind::Response, &chat)?))
    }

    async fn handle_leave_chat(&self, envelope: &Envelope, session: &Session) -> RouterResult {
        let req: ChatRef = envelope.body()?;
        let chat = self.chats.remove_member(req.chat_id, session.user_id)?;
        self.announce(
            &chat,
            MembershipChange::Left,
            session.user_id,
            session.user_id,
            &chat.members,
        )
        .await;
        Ok(Some(envelope.reply_with(Kind::Response, &chat)?))
    }

    async fn handle_kick_member(&self, envelope: &Envelope, session: &Session) -> RouterResult {
        let req: MemberRef = envelope.body()?;
        let before = self.chats.chat(req.chat_id)?;
        require_group(&before)?;
        if before.owner_id != session.user_id {
            return Err(RouterError::PermissionDenied(
                "only the chat owner can remove members".to_string(),
            ));
        }
        if req.user_id == session.user_id {
            return Err(RouterError::InvalidRequest(
                "use LeaveChat to leave your own chat".to_string(),
            ));
        }

        let after = self.chats.remove_member(req.chat_id, req.user_id)?;
        info!(chat_id = req.chat_id, user_id = req.user_id, "Member kicked");

        // Everyone who was a member when the kick happened, the kicked user included.
        let notify = except(&before.members, session.user_id);
        self.announce(
            &after,
            MembershipChange::Kicked,
            req.user_id,
            session.user_id,
            &notify,
        )
        .await;
        Ok(Some(envelope.reply_with(Kind::Response, &after)?))
    }

    async fn handle_invite_member(&self, envelope: &Envelope, session: &Session) -> RouterResult {
        let req: MemberRef = envelope.body()?;
        let chat = self.chats.chat(req.chat_id)?;
        require_group(&chat)?;
        require_member(&chat, session.user_id)?;
        if !self.identity.user_exists(req.user_id) {
            return Err(RouterError::NotFound(format!("user {}", req.user_id)));
        }

        let chat = self.chats.add_member(req.chat_id, req.user_id)?;
        self.announce(
            &chat,
            MembershipChange::Invited,
            req.user_id,
            session.user_id,
            &except(&chat.members, session.user_id),
        )
        .await;
        Ok(Some(envelope.reply_with(Kind::Response, &chat)?))
    }

    fn handle_list_members(&self, envelope: &Envelope, session: &Session) -> RouterResult {
        let req: ChatRef = envelope.body()?;
        let chat = self.chats.chat(req.chat_id)?;
        require_member(&chat, session.user_id)?;
        Ok(Some(envelope.reply_with(Kind::Response, &chat)?))
    }

    async fn announce(
        &self,
        chat: &ChatInfo,
        change: MembershipChange,
        user_id: UserId,
        actor_id: UserId,
        recipients: &[UserId],
    ) {
        let event = MembershipEvent {
            chat_id: chat.chat_id,
            change,
            user_id,
            actor_id,
            members: chat.members.clone(),
        };
        match Envelope::with_body(Kind::ChatUpdated, &event) {
            Ok(push) => {
                let delivered = self
                    .registry
                    .broadcast(&push.from_user(actor_id), recipients)
                    .await;
                debug!(chat_id = chat.chat_id, change = ?change, delivered, "Membership change announced");
            }
            Err(e) => warn!(error = %e, "Failed to encode membership event"),
        }
    }

    // =========================================================================
    // Transfer Handlers
    // =========================================================================

    fn handle_transfer_query(&self, envelope: &Envelope, session: &Session) -> RouterResult {
        let req: TransferQuery = envelope.body()?;
        let not_found = || RouterError::NotFound(format!("transfer {}", req.transfer_id));
        let record = self.transfers.get(&req.transfer_id).ok_or_else(not_found)?;

        let involved = record.sender_id == session.user_id
            || record.receiver_id == session.user_id
            || record
                .chat_id
                .and_then(|id| self.chats.chat(id).ok())
                .is_some_and(|chat| chat.members.contains(&session.user_id));
        if !involved {
            return Err(not_found());
        }

        Ok(Some(envelope.reply_with(
            Kind::Response,
            &TransferInfo {
                transfer_id: record.transfer_id,
                status: record.status,
                file_size: record.file_size,
                bytes_transferred: record.bytes_transferred,
            },
        )?))
    }

    /// Users who should hear about a staged upload.
    ///
    /// Group chats notify every current member except the sender; private
    /// chats and direct transfers notify the named target.
    pub fn file_recipients(&self, record: &TransferRecord) -> Vec<UserId> {
        if let Some(chat_id) = record.chat_id {
            match self.chats.chat(chat_id) {
                Ok(chat) if chat.kind == ChatKind::Group => {
                    return except(&chat.members, record.sender_id);
                }
                Ok(_) => {}
                Err(e) => warn!(chat_id, error = %e, "Upload names an unknown chat"),
            }
        }
        vec![record.receiver_id]
    }

    /// Forward a "file available" notice for a staged upload.
    ///
    /// Returns the number of recipients reached.
    pub async fn notify_file_available(&self, record: &TransferRecord) -> usize {
        let recipients = self.file_recipients(record);
        let body = protocol::messages::FileAvailable {
            transfer_id: record.transfer_id.clone(),
            sender_id: record.sender_id,
            chat_id: record.chat_id,
            file_name: record.file_name.clone(),
            file_size: record.file_size,
        };
        let push = match Envelope::with_body(Kind::FileAvailable, &body) {
            Ok(push) => push.from_user(record.sender_id),
            Err(e) => {
                warn!(error = %e, "Failed to encode file-available notice");
                return 0;
            }
        };

        let delivered = self.registry.broadcast(&push, &recipients).await;
        info!(
            transfer_id = %record.transfer_id,
            recipients = recipients.len(),
            delivered,
            "File availability announced"
        );
        delivered
    }
}

fn except(members: &[UserId], user_id: UserId) -> Vec<UserId> {
    members.iter().copied().filter(|id| *id != user_id).collect()
}

fn require_member(chat: &ChatInfo, user_id: UserId) -> Result<(), RouterError> {
    if chat.members.contains(&user_id) {
        Ok(())
    } else {
        Err(RouterError::Chat(ChatError::NotMember {
            chat_id: chat.chat_id,
            user_id,
        }))
    }
}

fn require_group(chat: &ChatInfo) -> Result<(), RouterError> {
    if chat.kind == ChatKind::Group {
        Ok(())
    } else {
        Err(RouterError::PermissionDenied(format!(
            "chat {} is private",
            chat.chat_id
        )))
    }
}
