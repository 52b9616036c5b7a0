//! # Chat Relay Client Library
//!
//! Client side of the chat relay: a packet connection with request/response
//! correlation, the message interception pipeline, the secure channel
//! plugin, and the bulk transfer client.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use client::{ChatClient, MemoryMessageStore, MemoryStorage, Pipeline, RelayConnection, SecureChannel};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (connection, mut pushes) = RelayConnection::connect("127.0.0.1:9000").await?;
//!     connection.login("alice", "secret").await?;
//!
//!     let pipeline = Pipeline::new();
//!     pipeline.load(&SecureChannel::load(&MemoryStorage::new())?);
//!
//!     let chat = ChatClient::new(
//!         Arc::new(connection),
//!         Arc::new(pipeline),
//!         Arc::new(MemoryMessageStore::new()),
//!     );
//!     chat.send_direct(2, "hi").await?;
//!
//!     while let Some(envelope) = pushes.recv().await {
//!         if let Some(event) = chat.process_incoming(&envelope).await? {
//!             println!("{:?}", event);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: Packet connection and reply correlation
//! - [`pipeline`]: Outgoing and incoming transform chains
//! - [`secure_channel`]: In-band key exchange and message encryption
//! - [`chat`]: Sending, receiving and chat management
//! - [`transfer`]: File port client

pub mod chat;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod secure_channel;
pub mod storage;
pub mod store;
pub mod transfer;

pub use protocol;

pub use chat::{ChatClient, ChatEvent, SendOutcome};
pub use connection::{ClientSession, RelayConnection, DEFAULT_REQUEST_TIMEOUT};
pub use error::{ClientError, Result};
pub use pipeline::{FnTransform, Pipeline, PipelineContext, Plugin, Transform};
pub use secure_channel::{PeerPhase, SecureChannel};
pub use storage::{JsonFileStorage, MemoryStorage, Storage, StorageError};
pub use store::{Conversation, MemoryMessageStore, MessageStore};
pub use transfer::{DownloadedFile, FileTarget, TransferClient};
