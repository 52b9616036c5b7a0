//! # Chat Relay Protocol Library
//!
//! Wire-level definitions shared by the relay server and its clients.
//!
//! ## Overview
//!
//! - **Envelopes**: the discriminated packet exchanged on the relay port
//! - **Packet Codec**: 4-byte little-endian length prefix + MessagePack envelope
//! - **Transfer Commands**: the raw binary protocol spoken on the file port
//! - **Message Content**: plain text, handshake frames and ciphertext as one sum type
//! - **Crypto**: X25519 key pairs and ChaCha20-Poly1305 session keys for the
//!   secure channel
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Message Content (JSON payload)      │  text | handshake | ciphertext
//! ├─────────────────────────────────────────┤
//! │          Envelope (MessagePack)         │  kind, sequence id, token
//! ├─────────────────────────────────────────┤
//! │           Packet Codec                  │  u32 LE length prefix
//! ├─────────────────────────────────────────┤
//! │                 TCP                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, Kind, PacketCodec};
//! use protocol::messages::Credentials;
//!
//! let credentials = Credentials {
//!     username: "alice".to_string(),
//!     password: "secret".to_string(),
//! };
//! let envelope = Envelope::with_body(Kind::Login, &credentials).unwrap();
//!
//! let codec = PacketCodec::new();
//! let bytes = codec.encode(&envelope).unwrap();
//! let (decoded, _) = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod content;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;
pub mod transfer;

pub use content::{ChatMessage, Handshake, MessageContent};
pub use crypto::{KeyPair, SessionKey, KEY_LENGTH};
pub use error::{ProtocolError, Result};
pub use framing::{next_sequence_id, PacketCodec, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use messages::{ChatId, Envelope, ErrorBody, ErrorCode, Kind, TransferStatus, UserId};
pub use transfer::{DownloadHeader, TransferRequest, UploadHeader, CMD_DOWNLOAD, CMD_UPLOAD};
