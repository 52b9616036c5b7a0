//! Opportunistic end-to-end encryption for direct messages.
//!
//! The key exchange rides on ordinary chat messages:
//!
//! 1. With no key for peer P, the first message to P goes out in plaintext,
//!    followed by a `KeyRequest` carrying our public key.
//! 2. P answers with `PubKey`.
//! 3. On `PubKey`, we generate a session key, seal it to P's public key and
//!    send it as `Session`. Both sides now encrypt every direct message.
//!
//! If both peers start at the same moment, each may generate a key. The
//! key chosen by the peer with the lower user id wins; the other key is
//! kept for decryption until it is no longer seen.
//!
//! Handshake frames are consumed here and never reach the display path.
//! Undecryptable ciphertext is replaced with a placeholder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use protocol::crypto::seal_session_key;
use protocol::{ChatMessage, Handshake, KeyPair, MessageContent, SessionKey, UserId};

use crate::error::Result;
use crate::pipeline::{Pipeline, PipelineContext, Plugin, Transform};
use crate::storage::Storage;

/// Storage key for the persisted secret key.
pub const IDENTITY_KEY: &str = "secure_channel.identity";

/// Shown in place of ciphertext when no session key exists for the sender.
pub const KEY_UNAVAILABLE: &str = "[encrypted message: key unavailable]";

/// Shown in place of ciphertext that fails authentication.
pub const DECRYPT_FAILED: &str = "[encrypted message: could not be decrypted]";

/// Handshake progress with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerPhase {
    /// Nothing exchanged yet.
    #[default]
    NoKey,
    /// We sent our public key and wait for theirs.
    KeyRequested,
    /// We hold the peer's public key and wait for a session key.
    PublicKeyKnown,
    /// A session key is in place.
    SessionEstablished,
}

#[derive(Debug, Default)]
struct PeerState {
    phase: PeerPhase,
    peer_public: Option<Vec<u8>>,
    session_key: Option<SessionKey>,
    /// Key replaced during a simultaneous exchange, still accepted on receive.
    fallback_key: Option<SessionKey>,
    /// Whether the current session key was generated locally.
    initiated_by_me: bool,
}

/// Per-user secure channel state shared by the outgoing and incoming transforms.
#[derive(Clone)]
pub struct SecureChannel {
    key_pair: Arc<KeyPair>,
    peers: Arc<Mutex<HashMap<UserId, PeerState>>>,
}

impl SecureChannel {
    /// Load the key pair from `storage`, generating and storing one on first use.
    ///
    /// A stored value that cannot be decoded is replaced with a fresh key.
    pub fn load(storage: &dyn Storage) -> Result<Self> {
        let restored = match storage.get(IDENTITY_KEY)? {
            Some(encoded) => match decode_key_pair(&encoded) {
                Some(key_pair) => Some(key_pair),
                None => {
                    tracing::warn!("Stored secure channel key is invalid, generating a new one");
                    None
                }
            },
            None => None,
        };

        let key_pair = match restored {
            Some(key_pair) => key_pair,
            None => {
                let key_pair = KeyPair::generate();
                storage.set(IDENTITY_KEY, &BASE64.encode(key_pair.secret_bytes()))?;
                tracing::info!("Generated secure channel key pair");
                key_pair
            }
        };
        Ok(Self::with_key_pair(key_pair))
    }

    pub fn with_key_pair(key_pair: KeyPair) -> Self {
        Self {
            key_pair: Arc::new(key_pair),
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn public_key(&self) -> [u8; protocol::KEY_LENGTH] {
        self.key_pair.public_bytes()
    }

    /// Current handshake phase with `peer`.
    pub fn phase(&self, peer: UserId) -> PeerPhase {
        self.peers()
            .get(&peer)
            .map(|state| state.phase)
            .unwrap_or_default()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<UserId, PeerState>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Outgoing transform body.
    fn seal_outgoing(
        &self,
        mut message: ChatMessage,
        ctx: &mut PipelineContext,
    ) -> Option<ChatMessage> {
        let Some(peer) = direct_peer(&message, ctx.local_user(), Direction::Outgoing) else {
            return Some(message);
        };
        let MessageContent::PlainText { text } = &message.content else {
            return Some(message);
        };

        let mut peers = self.peers();
        let state = peers.entry(peer).or_default();
        match state.phase {
            PeerPhase::SessionEstablished => {
                let key = state.session_key.as_ref()?;
                match key.encrypt(text.as_bytes()) {
                    Ok((nonce, data)) => {
                        message.content = MessageContent::Ciphertext { nonce, data };
                        Some(message)
                    }
                    Err(e) => {
                        tracing::warn!(peer, error = %e, "Encryption failed, message not sent");
                        None
                    }
                }
            }
            PeerPhase::NoKey => {
                state.phase = PeerPhase::KeyRequested;
                drop(peers);
                tracing::debug!(peer, "Requesting key exchange");
                let request = Handshake::KeyRequest {
                    public_key: self.public_key().to_vec(),
                };
                ctx.inject(handshake(ctx.local_user(), peer, request));
                Some(message)
            }
            PeerPhase::KeyRequested | PeerPhase::PublicKeyKnown => Some(message),
        }
    }

    /// Incoming transform body.
    fn open_incoming(
        &self,
        mut message: ChatMessage,
        ctx: &mut PipelineContext,
    ) -> Option<ChatMessage> {
        let peer = direct_peer(&message, ctx.local_user(), Direction::Incoming);

        let text = match (&message.content, peer) {
            (MessageContent::Handshake(frame), Some(peer)) => {
                self.on_handshake(peer, frame.clone(), ctx);
                return None;
            }
            // Handshakes outside a direct conversation are meaningless; hide them.
            (MessageContent::Handshake(_), None) => return None,
            (MessageContent::Ciphertext { nonce, data }, Some(peer)) => {
                self.decrypt_from(peer, nonce, data)
            }
            (MessageContent::Ciphertext { .. }, None) => KEY_UNAVAILABLE.to_string(),
            (MessageContent::PlainText { .. }, _) => return Some(message),
        };
        message.content = MessageContent::text(text);
        Some(message)
    }

    fn decrypt_from(&self, peer: UserId, nonce: &[u8], data: &[u8]) -> String {
        let peers = self.peers();
        let Some(state) = peers.get(&peer) else {
            return KEY_UNAVAILABLE.to_string();
        };
        if state.session_key.is_none() && state.fallback_key.is_none() {
            return KEY_UNAVAILABLE.to_string();
        }

        let plaintext = [&state.session_key, &state.fallback_key]
            .into_iter()
            .flatten()
            .find_map(|key| key.decrypt(nonce, data).ok());
        match plaintext.map(String::from_utf8) {
            Some(Ok(text)) => text,
            Some(Err(_)) | None => {
                tracing::warn!(peer, "Could not decrypt message");
                DECRYPT_FAILED.to_string()
            }
        }
    }

    /// Forget handshake progress with the recipient of a lost handshake frame.
    ///
    /// The peer never saw the frame, so whatever phase it implied is void.
    /// Going back to `NoKey` makes the next message to that peer start a
    /// fresh exchange. A session key already in place stays usable for
    /// decryption.
    fn handshake_lost(&self, frame: &ChatMessage) {
        let MessageContent::Handshake(_) = &frame.content else {
            return;
        };
        let Some(peer) = frame.recipient_id else {
            return;
        };
        let mut peers = self.peers();
        let Some(state) = peers.get_mut(&peer) else {
            return;
        };
        if state.phase == PeerPhase::NoKey {
            return;
        }
        if let Some(old) = state.session_key.take() {
            state.fallback_key = Some(old);
        }
        state.phase = PeerPhase::NoKey;
        state.initiated_by_me = false;
        tracing::debug!(peer, "Handshake frame not delivered, exchange reset");
    }

    fn on_handshake(&self, peer: UserId, frame: Handshake, ctx: &mut PipelineContext) {
        let me = ctx.local_user();
        match frame {
            Handshake::KeyRequest { public_key } => {
                {
                    let mut peers = self.peers();
                    let state = peers.entry(peer).or_default();
                    // A key request means the peer holds no session key for us.
                    if let Some(old) = state.session_key.take() {
                        state.fallback_key = Some(old);
                    }
                    state.peer_public = Some(public_key);
                    state.phase = PeerPhase::PublicKeyKnown;
                    state.initiated_by_me = false;
                }
                tracing::debug!(peer, "Answering key request");
                let reply = Handshake::PubKey {
                    public_key: self.public_key().to_vec(),
                };
                ctx.inject(handshake(me, peer, reply));
            }
            Handshake::PubKey { public_key } => {
                let key = SessionKey::generate();
                let sealed = match seal_session_key(&public_key, &key) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        tracing::warn!(peer, error = %e, "Rejected peer public key");
                        return;
                    }
                };
                {
                    let mut peers = self.peers();
                    let state = peers.entry(peer).or_default();
                    if let Some(old) = state.session_key.replace(key) {
                        state.fallback_key = Some(old);
                    }
                    state.peer_public = Some(public_key);
                    state.phase = PeerPhase::SessionEstablished;
                    state.initiated_by_me = true;
                }
                tracing::debug!(peer, "Session key sent");
                ctx.inject(handshake(me, peer, Handshake::Session { sealed_key: sealed }));
            }
            Handshake::Session { sealed_key } => {
                let key = match self.key_pair.open_session_key(&sealed_key) {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::warn!(peer, error = %e, "Could not open session key");
                        return;
                    }
                };
                let mut peers = self.peers();
                let state = peers.entry(peer).or_default();
                let keep_mine = state.phase == PeerPhase::SessionEstablished
                    && state.initiated_by_me
                    && me < peer;
                if keep_mine {
                    tracing::debug!(peer, "Simultaneous key exchange, keeping local key");
                    state.fallback_key = Some(key);
                } else {
                    if let Some(old) = state.session_key.replace(key) {
                        state.fallback_key = Some(old);
                    }
                    state.phase = PeerPhase::SessionEstablished;
                    state.initiated_by_me = false;
                    tracing::debug!(peer, "Session established");
                }
            }
        }
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("key_pair", &self.key_pair)
            .field("peers", &self.peers().len())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Outgoing,
    Incoming,
}

/// The other party of a direct message, if `me` is on the expected side.
fn direct_peer(message: &ChatMessage, me: UserId, direction: Direction) -> Option<UserId> {
    if message.chat_id.is_some() {
        return None;
    }
    let recipient = message.recipient_id?;
    match direction {
        Direction::Outgoing if message.sender_id == me && recipient != me => Some(recipient),
        Direction::Incoming if recipient == me && message.sender_id != me => Some(message.sender_id),
        _ => None,
    }
}

fn handshake(from: UserId, to: UserId, frame: Handshake) -> ChatMessage {
    let mut message = ChatMessage::direct(from, to, "");
    message.content = MessageContent::Handshake(frame);
    message
}

fn decode_key_pair(encoded: &str) -> Option<KeyPair> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    KeyPair::from_secret_slice(&bytes).ok()
}

struct SecureOutgoing(SecureChannel);

impl Transform for SecureOutgoing {
    fn name(&self) -> &str {
        "secure-channel-outgoing"
    }

    fn apply(
        &self,
        message: ChatMessage,
        ctx: &mut PipelineContext,
    ) -> anyhow::Result<Option<ChatMessage>> {
        Ok(self.0.seal_outgoing(message, ctx))
    }

    // Both transforms share state; one of them handles lost frames.
    fn undelivered(&self, frame: &ChatMessage) {
        self.0.handshake_lost(frame);
    }
}

struct SecureIncoming(SecureChannel);

impl Transform for SecureIncoming {
    fn name(&self) -> &str {
        "secure-channel-incoming"
    }

    fn apply(
        &self,
        message: ChatMessage,
        ctx: &mut PipelineContext,
    ) -> anyhow::Result<Option<ChatMessage>> {
        Ok(self.0.open_incoming(message, ctx))
    }
}

impl Plugin for SecureChannel {
    fn name(&self) -> &str {
        "secure-channel"
    }

    fn install(&self, pipeline: &Pipeline) {
        pipeline.register_outgoing(Arc::new(SecureOutgoing(self.clone())));
        pipeline.register_incoming(Arc::new(SecureIncoming(self.clone())));
    }
}
