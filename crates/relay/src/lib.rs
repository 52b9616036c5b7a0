//! # Chat Relay Server Library
//!
//! This crate provides the server side of the chat relay: a store-and-forward
//! hub that routes chat messages, membership events and file notifications
//! between connected clients.
//!
//! ## Overview
//!
//! - **Packet port**: length-prefixed envelopes, one long-lived connection
//!   per logged-in user
//! - **File port**: one bulk upload or download per connection, staged on
//!   disk until the recipient fetches it once
//! - **Collaborators**: accounts and sessions ([`identity`]) and chat
//!   membership ([`chats`]) sit behind traits
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    Relay Orchestrator                     │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐                  ┌───────────────────┐  │
//! │  │ Relay Server │ ── envelopes ──▶ │  Message Router   │  │
//! │  │ (packet port)│                  └─────────┬─────────┘  │
//! │  └──────────────┘                            │            │
//! │  ┌──────────────┐   staged uploads  ┌────────▼────────┐   │
//! │  │   Transfer   │ ────────────────▶ │   Connection    │   │
//! │  │ Server (file)│                   │    Registry     │   │
//! │  └──────────────┘                   └─────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay::{Config, RelayOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = RelayOrchestrator::new(config);
//!     orchestrator.start().await?;
//!
//!     // Serve until told to stop...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`registry`]: Live connections keyed by user
//! - [`router`]: Envelope dispatch and membership notifications
//! - [`server`]: Packet listener and per-connection state machine
//! - [`files`]: Bulk transfer staging and listener
//! - [`orchestrator`]: Main relay coordinator

pub mod chats;
pub mod config;
pub mod files;
pub mod identity;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod server;

// Re-export protocol for convenience
pub use protocol;

pub use chats::{ChatError, ChatStore, MemoryChatStore};
pub use config::Config;
pub use files::{TransferError, TransferRecord, TransferServer, TransferStore};
pub use identity::{IdentityError, IdentityProvider, MemoryIdentityProvider};
pub use orchestrator::{OrchestratorState, RelayEvent, RelayOrchestrator};
pub use registry::{Connection, ConnectionRegistry, PacketWriter};
pub use router::{MessageRouter, RouterError, RouterResult, Session};
pub use server::{ConnectionHandler, ConnectionState, RelayServer};
