//! End-to-end integration tests for the chat relay.
//!
//! These tests run a real relay on ephemeral ports and drive it with the
//! client library:
//! - Login and session enforcement
//! - Message relaying and membership notifications
//! - Bulk file transfer
//! - Secure channel handshake and message filtering

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use client::{
    ChatClient, ChatEvent, ClientError, FileTarget, MemoryMessageStore, MemoryStorage, PeerPhase,
    Pipeline, PipelineContext, RelayConnection, SecureChannel, SendOutcome, TransferClient,
};
use client::{Conversation, FnTransform};
use relay::config::Config;
use relay::orchestrator::{OrchestratorState, RelayOrchestrator};
use relay::protocol::messages::{ChatKind, MembershipChange};
use relay::protocol::{ChatMessage, Envelope, ErrorCode, Kind, TransferStatus, UserId};
use tempfile::TempDir;
use tokio::sync::mpsc;

const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

fn create_test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.packet_port = 0;
    config.server.file_port = Some(0);
    config.transfer.staging_dir = temp_dir.path().join("staging");
    config
}

async fn start_relay() -> (RelayOrchestrator, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut orchestrator = RelayOrchestrator::new(create_test_config(&temp_dir));
    orchestrator.start().await.unwrap();
    (orchestrator, temp_dir)
}

/// A logged-in user with its push stream.
struct TestUser {
    id: UserId,
    chat: ChatClient,
    pushes: mpsc::UnboundedReceiver<Envelope>,
}

impl TestUser {
    async fn join(addr: SocketAddr, name: &str, pipeline: Pipeline) -> Self {
        Self::open(addr, name, pipeline, true).await
    }

    async fn open(addr: SocketAddr, name: &str, pipeline: Pipeline, register: bool) -> Self {
        let (connection, pushes) = RelayConnection::connect(addr).await.unwrap();
        let login = if register {
            connection.register(name, "correct horse").await.unwrap()
        } else {
            connection.login(name, "correct horse").await.unwrap()
        };
        let chat = ChatClient::new(
            Arc::new(connection),
            Arc::new(pipeline),
            Arc::new(MemoryMessageStore::new()),
        );
        Self {
            id: login.user_id,
            chat,
            pushes,
        }
    }

    async fn plain(addr: SocketAddr, name: &str) -> Self {
        Self::join(addr, name, Pipeline::new()).await
    }

    async fn secure(addr: SocketAddr, name: &str) -> (Self, SecureChannel) {
        Self::open_secure(addr, name, true).await
    }

    async fn secure_login(addr: SocketAddr, name: &str) -> (Self, SecureChannel) {
        Self::open_secure(addr, name, false).await
    }

    async fn open_secure(addr: SocketAddr, name: &str, register: bool) -> (Self, SecureChannel) {
        let channel = SecureChannel::load(&MemoryStorage::new()).unwrap();
        let pipeline = Pipeline::new();
        pipeline.load(&channel);
        (Self::open(addr, name, pipeline, register).await, channel)
    }

    async fn next_push(&mut self) -> Envelope {
        tokio::time::timeout(PUSH_TIMEOUT, self.pushes.recv())
            .await
            .expect("timed out waiting for push")
            .expect("push channel closed")
    }

    /// Process pushes until one produces a visible event.
    async fn next_event(&mut self) -> ChatEvent {
        loop {
            let envelope = self.next_push().await;
            if let Some(event) = self.chat.process_incoming(&envelope).await.unwrap() {
                return event;
            }
        }
    }

    async fn next_text(&mut self) -> String {
        match self.next_event().await {
            ChatEvent::Message(message) => message.content.as_text().unwrap().to_string(),
            other => panic!("expected a message, got {:?}", other),
        }
    }

    /// Process exactly one push; returns what was shown, if anything.
    async fn process_one(&mut self) -> Option<ChatEvent> {
        let envelope = self.next_push().await;
        self.chat.process_incoming(&envelope).await.unwrap()
    }
}

// =============================================================================
// Session Tests
// =============================================================================

#[tokio::test]
async fn test_orchestrator_runs_and_stops() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);
    assert!(orchestrator.packet_addr().is_some());
    assert!(orchestrator.file_addr().is_some());

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
}

#[tokio::test]
async fn test_register_login_and_ping() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let (first, _pushes) = RelayConnection::connect(addr).await.unwrap();
    let registered = first.register("alice", "pw-alice").await.unwrap();
    first.close().await;

    let (second, _pushes) = RelayConnection::connect(addr).await.unwrap();
    let login = second.login("alice", "pw-alice").await.unwrap();
    assert_eq!(login.user_id, registered.user_id);
    assert_ne!(login.session_token, registered.session_token);
    assert!(second.ping().await.is_ok());

    let (third, _pushes) = RelayConnection::connect(addr).await.unwrap();
    let err = third.login("alice", "wrong").await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Unauthorized));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_without_session_is_rejected() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let (connection, _pushes) = RelayConnection::connect(addr).await.unwrap();
    let message = ChatMessage::direct(1, 2, "hi");
    let request = Envelope::with_body(Kind::SendMessage, &message).unwrap();
    let err = connection.call(request).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::SessionRequired));

    // The connection stays usable.
    connection.register("late", "pw").await.unwrap();
    assert!(connection.ping().await.is_ok());

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_unregisters_user() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let alice = TestUser::plain(addr, "alice").await;
    let bob = TestUser::plain(addr, "bob").await;
    assert_eq!(orchestrator.connection_count(), 2);

    bob.chat.connection().close().await;
    drop(bob);

    let deadline = tokio::time::Instant::now() + PUSH_TIMEOUT;
    while orchestrator.connection_count() != 1 {
        assert!(tokio::time::Instant::now() < deadline, "bob never unregistered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    drop(alice);

    orchestrator.stop().await.unwrap();
}

// =============================================================================
// Messaging Tests
// =============================================================================

#[tokio::test]
async fn test_direct_message_is_relayed() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let alice = TestUser::plain(addr, "alice").await;
    let mut bob = TestUser::plain(addr, "bob").await;

    let outcome = alice.chat.send_direct(bob.id, "hello bob").await.unwrap();
    assert_eq!(outcome, SendOutcome::Sent { delivered: 1 });

    let push = bob.next_push().await;
    assert_eq!(push.kind, Kind::MessageReceived);
    let event = bob.chat.process_incoming(&push).await.unwrap().unwrap();
    let ChatEvent::Message(message) = event else {
        panic!("expected a message");
    };
    assert_eq!(message.sender_id, alice.id);
    assert_eq!(message.content.as_text(), Some("hello bob"));

    assert_eq!(
        bob.chat.history(Conversation::Direct(alice.id)).unwrap().len(),
        1
    );
    assert_eq!(
        alice.chat.history(Conversation::Direct(bob.id)).unwrap().len(),
        1
    );

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_group_message_reaches_other_members() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let alice = TestUser::plain(addr, "alice").await;
    let mut bob = TestUser::plain(addr, "bob").await;
    let mut carol = TestUser::plain(addr, "carol").await;

    let chat = alice
        .chat
        .create_chat(ChatKind::Group, Some("team"), vec![bob.id, carol.id])
        .await
        .unwrap();
    assert!(matches!(bob.next_event().await, ChatEvent::Membership(_)));
    assert!(matches!(carol.next_event().await, ChatEvent::Membership(_)));

    let outcome = alice.chat.send_to_chat(chat.chat_id, "standup").await.unwrap();
    assert_eq!(outcome, SendOutcome::Sent { delivered: 2 });
    assert_eq!(bob.next_text().await, "standup");
    assert_eq!(carol.next_text().await, "standup");

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_kick_notifies_kicked_member() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let alice = TestUser::plain(addr, "alice").await;
    let mut bob = TestUser::plain(addr, "bob").await;
    let mut carol = TestUser::plain(addr, "carol").await;

    let chat = alice
        .chat
        .create_chat(ChatKind::Group, Some("team"), vec![bob.id, carol.id])
        .await
        .unwrap();
    bob.next_event().await;
    carol.next_event().await;

    let bob_id = bob.id;
    let after = alice.chat.kick_member(chat.chat_id, bob_id).await.unwrap();
    assert!(!after.members.contains(&bob_id));

    for user in [&mut bob, &mut carol] {
        let ChatEvent::Membership(event) = user.next_event().await else {
            panic!("expected a membership event");
        };
        assert_eq!(event.chat_id, chat.chat_id);
        assert_eq!(event.change, MembershipChange::Kicked);
        assert_eq!(event.user_id, bob_id);
        assert_eq!(event.actor_id, alice.id);
    }

    // Only the owner may kick.
    let err = carol.chat.kick_member(chat.chat_id, alice.id).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::PermissionDenied));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_filtered_message_is_not_transmitted() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let pipeline = Pipeline::new();
    pipeline.register_outgoing(Arc::new(FnTransform::new(
        "block-list",
        |message: ChatMessage, _: &mut PipelineContext| {
            if message.content.as_text() == Some("forbidden") {
                Ok(None)
            } else {
                Ok(Some(message))
            }
        },
    )));
    let alice = TestUser::join(addr, "alice", pipeline).await;
    let mut bob = TestUser::plain(addr, "bob").await;

    let outcome = alice.chat.send_direct(bob.id, "forbidden").await.unwrap();
    assert_eq!(outcome, SendOutcome::Dropped);

    alice.chat.send_direct(bob.id, "allowed").await.unwrap();
    assert_eq!(bob.next_text().await, "allowed");
    assert!(bob.pushes.try_recv().is_err());

    orchestrator.stop().await.unwrap();
}

// =============================================================================
// File Transfer Tests
// =============================================================================

#[tokio::test]
async fn test_five_mebibyte_transfer_downloads_once() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();
    let files = TransferClient::new(orchestrator.file_addr().unwrap());

    let alice = TestUser::plain(addr, "alice").await;
    let mut bob = TestUser::plain(addr, "bob").await;

    let data: Vec<u8> = (0..5 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let transfer_id = files
        .upload_bytes(alice.id, FileTarget::User(bob.id), "archive.bin", &data)
        .await
        .unwrap();

    let ChatEvent::File(notice) = bob.next_event().await else {
        panic!("expected a file notice");
    };
    assert_eq!(notice.transfer_id, transfer_id);
    assert_eq!(notice.sender_id, alice.id);
    assert_eq!(notice.file_size, data.len() as u64);

    let info = alice.chat.transfer_status(&transfer_id).await.unwrap();
    assert_eq!(info.status, TransferStatus::Pending);

    let file = files.download(&transfer_id).await.unwrap().unwrap();
    assert_eq!(file.file_name, "archive.bin");
    assert_eq!(file.data.len(), data.len());
    assert!(file.data == data);

    assert!(files.download(&transfer_id).await.unwrap().is_none());

    // The relay marks completion once its final write returns.
    let deadline = tokio::time::Instant::now() + PUSH_TIMEOUT;
    loop {
        let info = bob.chat.transfer_status(&transfer_id).await.unwrap();
        if info.status == TransferStatus::Completed {
            assert_eq!(info.bytes_transferred, data.len() as u64);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "transfer never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(files.download("no-such-transfer").await.unwrap().is_none());

    orchestrator.stop().await.unwrap();
}

// =============================================================================
// Secure Channel Tests
// =============================================================================

#[tokio::test]
async fn test_secure_channel_handshake_over_relay() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let (mut alice, alice_channel) = TestUser::secure(addr, "alice").await;
    let (mut bob, bob_channel) = TestUser::secure(addr, "bob").await;

    // First message goes out in plaintext, followed by a key request.
    alice.chat.send_direct(bob.id, "hi").await.unwrap();
    let Some(ChatEvent::Message(first)) = bob.process_one().await else {
        panic!("expected the plaintext greeting");
    };
    assert_eq!(first.content.as_text(), Some("hi"));

    // Key request: consumed, answered with bob's public key.
    assert!(bob.process_one().await.is_none());
    assert_eq!(bob_channel.phase(alice.id), PeerPhase::PublicKeyKnown);

    // Public key: consumed, answered with a sealed session key.
    assert!(alice.process_one().await.is_none());
    assert_eq!(alice_channel.phase(bob.id), PeerPhase::SessionEstablished);

    // Session key: consumed.
    assert!(bob.process_one().await.is_none());
    assert_eq!(bob_channel.phase(alice.id), PeerPhase::SessionEstablished);

    alice.chat.send_direct(bob.id, "hi again").await.unwrap();
    let push = bob.next_push().await;
    let raw: ChatMessage = push.body().unwrap();
    assert!(raw.content.as_text().is_none(), "relay saw plaintext");

    let Some(ChatEvent::Message(decrypted)) = bob.chat.process_incoming(&push).await.unwrap()
    else {
        panic!("expected the decrypted message");
    };
    assert_eq!(decrypted.content.as_text(), Some("hi again"));

    bob.chat.send_direct(alice.id, "welcome").await.unwrap();
    assert_eq!(alice.next_text().await, "welcome");

    // History holds display text only.
    let history = bob.chat.history(Conversation::Direct(alice.id)).unwrap();
    let texts: Vec<_> = history
        .iter()
        .map(|m| m.content.as_text().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["hi", "hi again", "welcome"]);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_key_request_to_offline_peer_is_repeated() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let (mut alice, alice_channel) = TestUser::secure(addr, "alice").await;
    let (bob, _) = TestUser::secure(addr, "bob").await;
    let bob_id = bob.id;
    bob.chat.connection().close().await;
    drop(bob);

    let deadline = tokio::time::Instant::now() + PUSH_TIMEOUT;
    while orchestrator.connection_count() != 1 {
        assert!(tokio::time::Instant::now() < deadline, "bob never unregistered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let outcome = alice.chat.send_direct(bob_id, "hi").await.unwrap();
    assert_eq!(outcome, SendOutcome::Sent { delivered: 0 });
    assert_eq!(alice_channel.phase(bob_id), PeerPhase::NoKey);

    let (mut bob, bob_channel) = TestUser::secure_login(addr, "bob").await;
    assert_eq!(bob.id, bob_id);

    alice.chat.send_direct(bob_id, "again").await.unwrap();
    assert_eq!(bob.next_text().await, "again");
    assert!(bob.process_one().await.is_none());
    assert_eq!(bob_channel.phase(alice.id), PeerPhase::PublicKeyKnown);
    assert!(alice.process_one().await.is_none());
    assert!(bob.process_one().await.is_none());
    assert_eq!(bob_channel.phase(alice.id), PeerPhase::SessionEstablished);

    alice.chat.send_direct(bob_id, "third").await.unwrap();
    let push = bob.next_push().await;
    let raw: ChatMessage = push.body().unwrap();
    assert!(raw.content.as_text().is_none(), "relay saw plaintext");
    let Some(ChatEvent::Message(decrypted)) = bob.chat.process_incoming(&push).await.unwrap()
    else {
        panic!("expected the decrypted message");
    };
    assert_eq!(decrypted.content.as_text(), Some("third"));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_timeout_surfaces_as_client_error() {
    let (mut orchestrator, _temp_dir) = start_relay().await;
    let addr = orchestrator.packet_addr().unwrap();

    let (connection, _pushes) = RelayConnection::connect(addr).await.unwrap();
    let connection = connection.with_timeout(Duration::from_millis(200));
    connection.register("alice", "pw").await.unwrap();

    // Pong is a reply kind; the relay answers it with nothing.
    let request = connection
        .authenticate(Envelope::new(Kind::Pong, "{}"))
        .unwrap();
    let err = connection.call(request).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));
    assert_eq!(connection.pending_count(), 0);

    orchestrator.stop().await.unwrap();
}
