//! Bulk transfer channel.
//!
//! Files bypass the envelope format entirely: a second listener speaks the
//! raw command protocol from [`protocol::transfer`], stages uploads on disk
//! and serves each staged file to at most one successful download.
//!
//! - [`transfer`]: staging store, transfer bookkeeping and retention sweep
//! - [`server`]: the file-port listener

pub mod server;
pub mod transfer;

pub use server::{handle_transfer, TransferServer};
pub use transfer::{sanitize_file_name, TransferError, TransferRecord, TransferStore};
