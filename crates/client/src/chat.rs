//! High-level chat client: pipeline, persistence and relay requests.
//!
//! Outgoing messages run the outgoing chain before they are sent; frames
//! injected by transforms follow the main message and skip the chain.
//! Relayed messages run the incoming chain, and whatever survives is
//! persisted and returned for display.

use std::sync::Arc;

use protocol::messages::{
    Ack, ChatInfo, ChatKind, ChatRef, CreateChat, FileAvailable, MemberRef, MembershipEvent,
    TransferInfo, TransferQuery,
};
use protocol::{ChatId, ChatMessage, Envelope, Kind, UserId};

use crate::connection::RelayConnection;
use crate::error::{ClientError, Result};
use crate::pipeline::{Pipeline, PipelineContext};
use crate::store::{Conversation, MessageStore};

/// Result of sending a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A transform dropped the message; nothing was transmitted.
    Dropped,
    /// The relay accepted the message.
    Sent { delivered: u32 },
}

/// Something the relay pushed that the application should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message(ChatMessage),
    Membership(MembershipEvent),
    File(FileAvailable),
}

pub struct ChatClient {
    connection: Arc<RelayConnection>,
    pipeline: Arc<Pipeline>,
    store: Arc<dyn MessageStore>,
}

impl ChatClient {
    pub fn new(
        connection: Arc<RelayConnection>,
        pipeline: Arc<Pipeline>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            connection,
            pipeline,
            store,
        }
    }

    pub fn connection(&self) -> &Arc<RelayConnection> {
        &self.connection
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    fn me(&self) -> Result<UserId> {
        self.connection.user_id().ok_or(ClientError::NotAuthenticated)
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Run `message` through the outgoing chain and send it.
    ///
    /// The sender is always the logged-in user. The message is persisted as
    /// authored once the relay accepts it.
    pub async fn send(&self, mut message: ChatMessage) -> Result<SendOutcome> {
        let me = self.me()?;
        message.sender_id = me;
        let authored = message.clone();

        let mut ctx = PipelineContext::new(me);
        let Some(outgoing) = self.pipeline.run_outgoing(message, &mut ctx) else {
            return Ok(SendOutcome::Dropped);
        };

        let ack: Ack = match self.connection.request(Kind::SendMessage, &outgoing).await {
            Ok(ack) => ack,
            Err(e) => {
                for frame in ctx.take_injected() {
                    self.pipeline.report_undelivered(&frame);
                }
                return Err(e);
            }
        };
        self.flush_injected(ctx.take_injected()).await;
        self.store.persist(&authored);
        Ok(SendOutcome::Sent {
            delivered: ack.delivered,
        })
    }

    pub async fn send_direct(&self, to: UserId, text: &str) -> Result<SendOutcome> {
        self.send(ChatMessage::direct(self.me()?, to, text)).await
    }

    pub async fn send_to_chat(&self, chat_id: ChatId, text: &str) -> Result<SendOutcome> {
        self.send(ChatMessage::to_chat(self.me()?, chat_id, text)).await
    }

    /// Handle one pushed envelope.
    ///
    /// Returns `None` for messages suppressed by the incoming chain and for
    /// kinds the client does not surface.
    pub async fn process_incoming(&self, envelope: &Envelope) -> Result<Option<ChatEvent>> {
        match envelope.kind {
            Kind::MessageReceived => {
                let message: ChatMessage = envelope.body()?;
                let mut ctx = PipelineContext::new(self.me()?);
                let shown = self.pipeline.run_incoming(message, &mut ctx);
                self.flush_injected(ctx.take_injected()).await;

                Ok(shown.map(|message| {
                    self.store.persist(&message);
                    ChatEvent::Message(message)
                }))
            }
            Kind::ChatUpdated => Ok(Some(ChatEvent::Membership(envelope.body()?))),
            Kind::FileAvailable => Ok(Some(ChatEvent::File(envelope.body()?))),
            other => {
                tracing::debug!(kind = ?other, "Ignoring pushed envelope");
                Ok(None)
            }
        }
    }

    /// Send frames injected by transforms, bypassing the outgoing chain.
    ///
    /// A frame that fails or reaches nobody is reported back to the
    /// pipeline, so the transform that injected it can start over.
    pub async fn flush_injected(&self, frames: Vec<ChatMessage>) {
        for frame in frames {
            let result: Result<Ack> = self.connection.request(Kind::SendMessage, &frame).await;
            match result {
                Ok(ack) if ack.delivered > 0 => continue,
                Ok(_) => {
                    tracing::debug!(recipient = ?frame.recipient_id, "Injected frame not delivered");
                }
                Err(e) => {
                    tracing::warn!(
                        recipient = ?frame.recipient_id,
                        error = %e,
                        "Failed to send injected frame"
                    );
                }
            }
            self.pipeline.report_undelivered(&frame);
        }
    }

    /// Stored messages of a conversation. Never re-run through the pipeline.
    pub fn history(&self, conversation: Conversation) -> Result<Vec<ChatMessage>> {
        Ok(self.store.history(self.me()?, conversation))
    }

    // ========================================================================
    // Chats
    // ========================================================================

    pub async fn create_chat(
        &self,
        kind: ChatKind,
        name: Option<&str>,
        members: Vec<UserId>,
    ) -> Result<ChatInfo> {
        let body = CreateChat {
            kind,
            name: name.map(str::to_string),
            members,
        };
        self.connection.request(Kind::CreateChat, &body).await
    }

    pub async fn join_chat(&self, chat_id: ChatId) -> Result<ChatInfo> {
        self.connection
            .request(Kind::JoinChat, &ChatRef { chat_id })
            .await
    }

    pub async fn leave_chat(&self, chat_id: ChatId) -> Result<ChatInfo> {
        self.connection
            .request(Kind::LeaveChat, &ChatRef { chat_id })
            .await
    }

    pub async fn kick_member(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatInfo> {
        self.connection
            .request(Kind::KickMember, &MemberRef { chat_id, user_id })
            .await
    }

    pub async fn invite_member(&self, chat_id: ChatId, user_id: UserId) -> Result<ChatInfo> {
        self.connection
            .request(Kind::InviteMember, &MemberRef { chat_id, user_id })
            .await
    }

    pub async fn list_members(&self, chat_id: ChatId) -> Result<ChatInfo> {
        self.connection
            .request(Kind::ListMembers, &ChatRef { chat_id })
            .await
    }

    /// Status of a bulk transfer visible to this user.
    pub async fn transfer_status(&self, transfer_id: &str) -> Result<TransferInfo> {
        let body = TransferQuery {
            transfer_id: transfer_id.to_string(),
        };
        self.connection.request(Kind::TransferQuery, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FnTransform;
    use crate::store::MemoryMessageStore;
    use protocol::messages::{Credentials, LoginResult};
    use protocol::{MessageContent, PacketCodec};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct FakeRelay {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        codec: PacketCodec,
    }

    impl FakeRelay {
        async fn recv(&mut self) -> Envelope {
            self.codec.read_envelope(&mut self.reader).await.unwrap()
        }

        async fn send(&mut self, envelope: &Envelope) {
            self.codec
                .write_envelope(&mut self.writer, envelope)
                .await
                .unwrap();
        }

        /// Answer the next request, which must be a `SendMessage`.
        async fn ack(&mut self) -> ChatMessage {
            self.ack_delivered(1).await
        }

        async fn ack_delivered(&mut self, delivered: u32) -> ChatMessage {
            let request = self.recv().await;
            assert_eq!(request.kind, Kind::SendMessage);
            self.send(&request.reply_with(Kind::Response, &Ack { delivered }).unwrap())
                .await;
            request.body().unwrap()
        }
    }

    async fn logged_in(
        user_id: UserId,
        pipeline: Pipeline,
    ) -> (ChatClient, Arc<MemoryMessageStore>, FakeRelay) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(ours);
        let (connection, _push) =
            RelayConnection::from_parts(read_half, write_half, PacketCodec::new());
        let (reader, writer) = tokio::io::split(theirs);
        let mut relay = FakeRelay {
            reader,
            writer,
            codec: PacketCodec::new(),
        };

        let login = async {
            let request = relay.recv().await;
            let _: Credentials = request.body().unwrap();
            let result = LoginResult {
                user_id,
                session_token: "tok".to_string(),
            };
            relay
                .send(&request.reply_with(Kind::Response, &result).unwrap())
                .await;
        };
        let (result, ()) = tokio::join!(connection.login("user", "pw"), login);
        result.unwrap();

        let store = Arc::new(MemoryMessageStore::new());
        let client = ChatClient::new(Arc::new(connection), Arc::new(pipeline), store.clone());
        (client, store, relay)
    }

    fn relayed(message: &ChatMessage) -> Envelope {
        Envelope::with_body(Kind::MessageReceived, message)
            .unwrap()
            .from_user(message.sender_id)
    }

    #[tokio::test]
    async fn test_send_persists_authored_message() {
        let pipeline = Pipeline::new();
        pipeline.register_outgoing(Arc::new(FnTransform::new(
            "upper",
            |mut m: ChatMessage, _: &mut PipelineContext| {
                let text = m.content.as_text().unwrap_or_default().to_uppercase();
                m.content = MessageContent::text(text);
                Ok(Some(m))
            },
        )));
        let (client, store, mut relay) = logged_in(1, pipeline).await;

        let (outcome, wire) = tokio::join!(client.send_direct(2, "hi"), relay.ack());
        assert_eq!(outcome.unwrap(), SendOutcome::Sent { delivered: 1 });
        assert_eq!(wire.content.as_text(), Some("HI"));
        assert_eq!(wire.sender_id, 1);

        let history = client.history(Conversation::Direct(2)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content.as_text(), Some("hi"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_message_is_not_sent_or_stored() {
        let pipeline = Pipeline::new();
        pipeline.register_outgoing(Arc::new(FnTransform::new(
            "filter",
            |m: ChatMessage, ctx: &mut PipelineContext| {
                ctx.inject(ChatMessage::direct(ctx.local_user(), 2, "side"));
                if m.content.as_text() == Some("blocked") {
                    Ok(None)
                } else {
                    Ok(Some(m))
                }
            },
        )));
        let (client, store, _relay) = logged_in(1, pipeline).await;

        let outcome = client.send_direct(2, "blocked").await.unwrap();
        assert_eq!(outcome, SendOutcome::Dropped);
        assert!(store.is_empty());
        assert_eq!(client.connection().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_frames_follow_main_message() {
        let pipeline = Pipeline::new();
        pipeline.register_outgoing(Arc::new(FnTransform::new(
            "inject",
            |m: ChatMessage, ctx: &mut PipelineContext| {
                ctx.inject(ChatMessage::direct(ctx.local_user(), 2, "side"));
                Ok(Some(m))
            },
        )));
        let (client, _store, mut relay) = logged_in(1, pipeline).await;

        let relay_side = async {
            let first = relay.ack().await;
            let second = relay.ack().await;
            (first, second)
        };
        let (outcome, (first, second)) = tokio::join!(client.send_direct(2, "main"), relay_side);
        outcome.unwrap();
        assert_eq!(first.content.as_text(), Some("main"));
        assert_eq!(second.content.as_text(), Some("side"));
    }

    /// Injects one side frame per message and records the frames reported lost.
    #[derive(Default)]
    struct SideChannel {
        lost: std::sync::Mutex<Vec<String>>,
    }

    impl crate::pipeline::Transform for SideChannel {
        fn name(&self) -> &str {
            "side-channel"
        }

        fn apply(
            &self,
            message: ChatMessage,
            ctx: &mut PipelineContext,
        ) -> anyhow::Result<Option<ChatMessage>> {
            ctx.inject(ChatMessage::direct(ctx.local_user(), 2, "side"));
            Ok(Some(message))
        }

        fn undelivered(&self, frame: &ChatMessage) {
            let text = frame.content.as_text().unwrap_or_default().to_string();
            self.lost.lock().unwrap().push(text);
        }
    }

    #[tokio::test]
    async fn test_undelivered_injected_frame_is_reported() {
        let side = Arc::new(SideChannel::default());
        let pipeline = Pipeline::new();
        pipeline.register_outgoing(side.clone());
        let (client, _store, mut relay) = logged_in(1, pipeline).await;

        // Recipient offline: the relay accepts both frames but reaches nobody.
        let relay_side = async {
            relay.ack_delivered(0).await;
            relay.ack_delivered(0).await;
        };
        let (outcome, ()) = tokio::join!(client.send_direct(2, "main"), relay_side);
        assert_eq!(outcome.unwrap(), SendOutcome::Sent { delivered: 0 });
        assert_eq!(*side.lost.lock().unwrap(), vec!["side".to_string()]);

        // Delivered frames are not reported.
        let relay_side = async {
            relay.ack().await;
            relay.ack().await;
        };
        let (outcome, ()) = tokio::join!(client.send_direct(2, "main"), relay_side);
        outcome.unwrap();
        assert_eq!(side.lost.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_reports_injected_frames() {
        let side = Arc::new(SideChannel::default());
        let pipeline = Pipeline::new();
        pipeline.register_outgoing(side.clone());
        let (client, store, mut relay) = logged_in(1, pipeline).await;

        let relay_side = async {
            let request = relay.recv().await;
            let body = protocol::ErrorBody {
                code: protocol::ErrorCode::InvalidRequest,
                message: "no".to_string(),
                recoverable: true,
            };
            relay
                .send(&request.reply_with(Kind::Error, &body).unwrap())
                .await;
        };
        let (outcome, ()) = tokio::join!(client.send_direct(2, "main"), relay_side);
        assert!(matches!(outcome, Err(ClientError::Rejected { .. })));
        assert_eq!(*side.lost.lock().unwrap(), vec!["side".to_string()]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_incoming_suppressed_message_is_not_stored() {
        let pipeline = Pipeline::new();
        pipeline.register_incoming(Arc::new(FnTransform::new(
            "hide-control",
            |m: ChatMessage, _: &mut PipelineContext| {
                if m.content.as_text() == Some("ctl") {
                    Ok(None)
                } else {
                    Ok(Some(m))
                }
            },
        )));
        let (client, store, _relay) = logged_in(2, pipeline).await;

        let hidden = relayed(&ChatMessage::direct(1, 2, "ctl"));
        assert_eq!(client.process_incoming(&hidden).await.unwrap(), None);

        let shown = relayed(&ChatMessage::direct(1, 2, "hello"));
        let event = client.process_incoming(&shown).await.unwrap().unwrap();
        assert!(matches!(event, ChatEvent::Message(ref m) if m.content.as_text() == Some("hello")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_membership_and_file_pushes_surface() {
        let (client, _store, _relay) = logged_in(2, Pipeline::new()).await;

        let event = MembershipEvent {
            chat_id: 5,
            change: protocol::messages::MembershipChange::Kicked,
            user_id: 2,
            actor_id: 1,
            members: vec![1],
        };
        let envelope = Envelope::with_body(Kind::ChatUpdated, &event).unwrap();
        assert_eq!(
            client.process_incoming(&envelope).await.unwrap(),
            Some(ChatEvent::Membership(event))
        );

        let file = FileAvailable {
            transfer_id: "t".to_string(),
            sender_id: 1,
            chat_id: None,
            file_name: "f.bin".to_string(),
            file_size: 3,
        };
        let envelope = Envelope::with_body(Kind::FileAvailable, &file).unwrap();
        assert_eq!(
            client.process_incoming(&envelope).await.unwrap(),
            Some(ChatEvent::File(file))
        );
    }

    #[tokio::test]
    async fn test_send_requires_login() {
        let (ours, _theirs) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(ours);
        let (connection, _push) =
            RelayConnection::from_parts(read_half, write_half, PacketCodec::new());
        let client = ChatClient::new(
            Arc::new(connection),
            Arc::new(Pipeline::new()),
            Arc::new(MemoryMessageStore::new()),
        );

        assert!(matches!(
            client.send_direct(2, "hi").await,
            Err(ClientError::NotAuthenticated)
        ));
    }
}
