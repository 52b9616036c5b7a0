//! Client for the relay's file port.
//!
//! Each upload or download opens its own connection and closes it when the
//! body has been copied.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use protocol::transfer::{copy_exact, read_download_header, read_upload_reply};
use protocol::{ChatId, ErrorCode, TransferRequest, UploadHeader, UserId};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ClientError, Result};

/// Who an upload is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTarget {
    User(UserId),
    Chat(ChatId),
}

/// A file fetched from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Uploads and downloads staged files.
#[derive(Debug, Clone)]
pub struct TransferClient {
    addr: SocketAddr,
}

impl TransferClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Upload `size` bytes from `body`. Returns the transfer id.
    ///
    /// A refusal (for example, a file over the size limit) is reported as
    /// [`ClientError::Rejected`], even when it arrives before the whole body
    /// was sent.
    pub async fn upload<R>(
        &self,
        sender_id: UserId,
        target: FileTarget,
        file_name: &str,
        size: u64,
        body: &mut R,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (target_user_id, chat_id) = match target {
            FileTarget::User(user) => (user, None),
            FileTarget::Chat(chat) => (0, Some(chat)),
        };
        let request = TransferRequest::Upload(UploadHeader {
            sender_id,
            target_user_id,
            chat_id,
            file_name: file_name.to_string(),
            file_size: size,
        });

        let mut stream = self.open().await?;
        let (mut read_half, mut write_half) = stream.split();
        let send = async {
            write_half.write_all(&request.encode()).await?;
            copy_exact(body, &mut write_half, size, |_| {}).await?;
            write_half.flush().await?;
            Ok::<_, ClientError>(())
        };
        let reply = read_upload_reply(&mut read_half);
        tokio::pin!(send, reply);

        // The relay may refuse before the body is through.
        let reply = tokio::select! {
            reply = &mut reply => reply?,
            sent = &mut send => match sent {
                Ok(()) => reply.await?,
                Err(e) => match reply.await {
                    Ok(None) => None,
                    _ => return Err(e),
                },
            },
        };

        match reply {
            Some(transfer_id) => {
                tracing::debug!(transfer_id = %transfer_id, size, "Upload staged");
                Ok(transfer_id)
            }
            None => Err(ClientError::Rejected {
                code: ErrorCode::InvalidRequest,
                message: format!("upload of {} refused by relay", file_name),
            }),
        }
    }

    /// Upload an in-memory buffer.
    pub async fn upload_bytes(
        &self,
        sender_id: UserId,
        target: FileTarget,
        file_name: &str,
        data: &[u8],
    ) -> Result<String> {
        let mut body = data;
        self.upload(sender_id, target, file_name, data.len() as u64, &mut body)
            .await
    }

    /// Upload a file from disk under its own name.
    pub async fn upload_file(
        &self,
        sender_id: UserId,
        target: FileTarget,
        path: &Path,
    ) -> Result<String> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        self.upload(sender_id, target, &file_name, size, &mut file)
            .await
    }

    /// Fetch a staged file into memory. `None` if the relay has no such transfer.
    pub async fn download(&self, transfer_id: &str) -> Result<Option<DownloadedFile>> {
        let mut stream = self.request_download(transfer_id).await?;
        let Some(header) = read_download_header(&mut stream).await? else {
            return Ok(None);
        };

        let mut data = Vec::with_capacity(header.file_size.min(1 << 20) as usize);
        copy_exact(&mut stream, &mut data, header.file_size, |_| {}).await?;
        Ok(Some(DownloadedFile {
            file_name: header.file_name,
            data,
        }))
    }

    /// Fetch a staged file into `dir`. Returns the written path.
    pub async fn download_to(&self, transfer_id: &str, dir: &Path) -> Result<Option<PathBuf>> {
        let mut stream = self.request_download(transfer_id).await?;
        let Some(header) = read_download_header(&mut stream).await? else {
            return Ok(None);
        };

        tokio::fs::create_dir_all(dir).await?;
        let name = Path::new(&header.file_name)
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| transfer_id.into());
        let path = dir.join(name);
        let mut file = tokio::fs::File::create(&path).await?;
        if let Err(e) = copy_exact(&mut stream, &mut file, header.file_size, |_| {}).await {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }
        Ok(Some(path))
    }

    async fn request_download(&self, transfer_id: &str) -> Result<TcpStream> {
        let mut stream = self.open().await?;
        let request = TransferRequest::Download {
            transfer_id: transfer_id.to_string(),
        };
        stream.write_all(&request.encode()).await?;
        stream.flush().await?;
        Ok(stream)
    }

    async fn open(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
