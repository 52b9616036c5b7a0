//! Listener for the bulk transfer port.
//!
//! Each accepted connection carries exactly one command. Uploads are staged
//! through the [`TransferStore`] and announced on an event channel so the
//! relay can notify recipients over the packet port; downloads are served
//! straight from the store. No registry lock is held while bytes move.
//!
//! Every read and write on the port is bounded by the store's idle timeout.
//! A rejected upload gets its empty reply, then the remaining body is
//! discarded so the client can read the rejection.

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::transfer::{write_upload_reply, TransferRequest};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transfer::{within, TransferError, TransferRecord, TransferStore};

/// Listener serving the bulk transfer protocol.
pub struct TransferServer {
    listener: TcpListener,
    store: Arc<TransferStore>,
    staged_tx: mpsc::Sender<TransferRecord>,
}

impl TransferServer {
    /// Bind the file port.
    ///
    /// Every successfully staged upload is sent on `staged_tx`.
    pub async fn bind(
        addr: SocketAddr,
        store: Arc<TransferStore>,
        staged_tx: mpsc::Sender<TransferRecord>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            store,
            staged_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "Transfer server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Transfer server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let store = self.store.clone();
                            let staged_tx = self.staged_tx.clone();
                            tokio::spawn(async move {
                                handle_stream(stream, peer, store, staged_tx).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept transfer connection"),
                    }
                }
            }
        }
    }
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<TransferStore>,
    staged_tx: mpsc::Sender<TransferRecord>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    if let Err(e) = handle_transfer(&mut reader, &mut write_half, &store, &staged_tx).await {
        debug!(peer = %peer, error = %e, "Transfer connection ended with error");
    }
}

/// Serve one command read from `reader`, replying on `writer`.
pub async fn handle_transfer<R, W>(
    reader: &mut R,
    writer: &mut W,
    store: &TransferStore,
    staged_tx: &mpsc::Sender<TransferRecord>,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let idle = store.idle_timeout();
    match within(idle, TransferRequest::read_from(reader)).await? {
        TransferRequest::Upload(header) => {
            debug!(
                sender_id = header.sender_id,
                target = header.target_user_id,
                size = header.file_size,
                "Upload started"
            );
            match store.upload(&header, reader).await {
                Ok(record) => {
                    within(idle, write_upload_reply(writer, Some(&record.transfer_id))).await?;
                    if staged_tx.send(record).await.is_err() {
                        warn!("File-available channel closed, recipients will not be notified");
                    }
                    Ok(())
                }
                Err(e @ (TransferError::FileTooLarge { .. } | TransferError::InvalidName(_))) => {
                    within(idle, write_upload_reply(writer, None)).await?;
                    within(idle, writer.shutdown()).await?;
                    // Unread input at close resets the socket before the reply lands.
                    let mut body = reader.take(header.file_size);
                    let _ = within(idle, tokio::io::copy(&mut body, &mut tokio::io::sink())).await;
                    Err(e)
                }
                Err(e) => Err(e),
            }
        }
        TransferRequest::Download { transfer_id } => {
            store.download(&transfer_id, writer).await?;
            Ok(())
        }
    }
}
