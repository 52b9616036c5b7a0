//! Bulk transfer wire commands.
//!
//! The file port speaks its own binary protocol, independent of the packet
//! codec. All integers are little-endian.
//!
//! ```text
//! upload:    [1][sender:i64][target:i64][chat:i64][name_len:u32][name][size:u64][bytes]
//!   reply:   [id_len:u32][id]                  (id_len = 0 means rejected)
//! download:  [2][id_len:u32][id]
//!   reply:   [found:u8] then, if found, [name_len:u32][name][size:u64][bytes]
//! ```
//!
//! A chat id of `0` on the wire means the upload is a direct transfer.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::messages::{ChatId, UserId};

/// Command byte for an upload.
pub const CMD_UPLOAD: u8 = 1;

/// Command byte for a download.
pub const CMD_DOWNLOAD: u8 = 2;

/// Longest accepted file name or transfer id, in bytes.
pub const MAX_NAME_LENGTH: usize = 4096;

/// Buffer size used when streaming file bodies.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Header sent ahead of an upload body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHeader {
    pub sender_id: UserId,
    pub target_user_id: UserId,
    pub chat_id: Option<ChatId>,
    pub file_name: String,
    pub file_size: u64,
}

/// Header sent ahead of a download body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadHeader {
    pub file_name: String,
    pub file_size: u64,
}

/// A request arriving on the file port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRequest {
    Upload(UploadHeader),
    Download { transfer_id: String },
}

impl TransferRequest {
    /// Encode the request header (without any upload body).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            TransferRequest::Upload(header) => {
                out.push(CMD_UPLOAD);
                out.extend_from_slice(&header.sender_id.to_le_bytes());
                out.extend_from_slice(&header.target_user_id.to_le_bytes());
                out.extend_from_slice(&header.chat_id.unwrap_or(0).to_le_bytes());
                put_string(&mut out, &header.file_name);
                out.extend_from_slice(&header.file_size.to_le_bytes());
            }
            TransferRequest::Download { transfer_id } => {
                out.push(CMD_DOWNLOAD);
                put_string(&mut out, transfer_id);
            }
        }
        out
    }

    /// Read one request header from the stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let command = reader.read_u8().await?;
        match command {
            CMD_UPLOAD => {
                let sender_id = reader.read_i64_le().await?;
                let target_user_id = reader.read_i64_le().await?;
                let chat_id = reader.read_i64_le().await?;
                let file_name = read_string(reader).await?;
                let file_size = reader.read_u64_le().await?;
                Ok(TransferRequest::Upload(UploadHeader {
                    sender_id,
                    target_user_id,
                    chat_id: (chat_id != 0).then_some(chat_id),
                    file_name,
                    file_size,
                }))
            }
            CMD_DOWNLOAD => {
                let transfer_id = read_string(reader).await?;
                Ok(TransferRequest::Download { transfer_id })
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Reply to an upload: the transfer id, or `None` if the upload was refused.
pub async fn write_upload_reply<W>(writer: &mut W, transfer_id: Option<&str>) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut out = Vec::new();
    put_string(&mut out, transfer_id.unwrap_or(""));
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Read an upload reply; an empty id means the upload was refused.
pub async fn read_upload_reply<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let id = read_string(reader).await?;
    Ok((!id.is_empty()).then_some(id))
}

/// Write the download reply header (`found` byte plus, if found, name and size).
pub async fn write_download_header<W>(writer: &mut W, header: Option<&DownloadHeader>) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut out = Vec::new();
    match header {
        Some(header) => {
            out.push(1);
            put_string(&mut out, &header.file_name);
            out.extend_from_slice(&header.file_size.to_le_bytes());
        }
        None => out.push(0),
    }
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the download reply header. `None` means `found = 0`.
pub async fn read_download_header<R>(reader: &mut R) -> Result<Option<DownloadHeader>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if reader.read_u8().await? == 0 {
        return Ok(None);
    }
    let file_name = read_string(reader).await?;
    let file_size = reader.read_u64_le().await?;
    Ok(Some(DownloadHeader {
        file_name,
        file_size,
    }))
}

/// Copy exactly `len` bytes from `reader` to `writer`.
///
/// A stream that ends early is a failed transfer, never a silent truncation.
/// `on_progress` sees the running total after each chunk.
pub async fn copy_exact<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    on_progress: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(u64),
{
    copy_bounded(reader, writer, len, None, on_progress).await
}

/// [`copy_exact`] where every single read or write must finish within `idle`.
///
/// A stalled peer fails the copy with [`ProtocolError::Timeout`].
pub async fn copy_exact_within<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    idle: Duration,
    on_progress: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(u64),
{
    copy_bounded(reader, writer, len, Some(idle), on_progress).await
}

async fn copy_bounded<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    idle: Option<Duration>,
    mut on_progress: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE.min(len.max(1) as usize)];
    let mut copied = 0u64;
    while copied < len {
        let want = buf.len().min((len - copied) as usize);
        let n = step(idle, reader.read(&mut buf[..want])).await?;
        if n == 0 {
            return Err(ProtocolError::TransferFailed(format!(
                "short read: got {} of {} bytes",
                copied, len
            )));
        }
        step(idle, writer.write_all(&buf[..n])).await?;
        copied += n as u64;
        on_progress(copied);
    }
    step(idle, writer.flush()).await?;
    Ok(copied)
}

async fn step<T>(idle: Option<Duration>, io: impl Future<Output = std::io::Result<T>>) -> Result<T> {
    let Some(idle) = idle else {
        return Ok(io.await?);
    };
    match tokio::time::timeout(idle, io).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProtocolError::Timeout(format!(
            "no transfer progress for {:?}",
            idle
        ))),
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

async fn read_string<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_NAME_LENGTH {
        return Err(ProtocolError::MalformedLength {
            declared: len as u64,
            limit: MAX_NAME_LENGTH as u64,
        });
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes)
        .map_err(|e| ProtocolError::MalformedPayload(format!("name is not UTF-8: {}", e)))
}
